mod initialization_service;
mod schedule_service;

pub use initialization_service::InitializationService;
pub use schedule_service::{ScheduleError, ScheduleRequest, ScheduleService};
