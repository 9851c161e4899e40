// Claim engine
//
// Every operation here is one atomic unit against the shared store:
// - Inserting jobs (with race-safe lazy queue creation)
// - Claiming the earliest due job on a ready queue
// - Finishing and renewing claimed jobs
// - Listing claims that have gone stale
//
// Nothing outside these operations mutates job or queue state.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{Job, JobListFilter, NewJob, Queue};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert a job in state `new`, creating its queue on first use.
    async fn insert_job(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Claim the earliest due job whose queue is ready.
    ///
    /// Returns `Ok(None)` when nothing is claimable. On success the job is
    /// `running` with a fresh `last_claimed_at` and its queue is `busy`.
    async fn take_job_into_work(&self) -> Result<Option<Job>, StoreError>;

    /// Mark a claimed job `done` and release its queue.
    async fn finish_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Return a claimed job to `new` and release its queue.
    async fn renew_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Running jobs claimed strictly before `cutoff`.
    async fn list_overdue_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError>;

    async fn get_queue(&self, queue_key: &str) -> Result<Option<Queue>, StoreError>;

    async fn list_jobs(&self, filter: JobListFilter) -> Result<Vec<Job>, StoreError>;
}
