pub mod application;
pub mod cli;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod monitor;
pub mod services;
pub mod shutdown;
pub mod store;
pub mod types;
pub mod worker;

// Re-export main types
pub use types::*;

pub use application::{initialize, Application, InitBuilder, InitOptions};
pub use error::{MonitorError, PoolError, StoreError};
pub use monitor::{HeartbeatConfig, HeartbeatMonitor};
pub use store::{MemoryStore, PostgresStore, ScheduleStore};
pub use worker::{ActionExecutor, LoggingExecutor, WorkerPool};
