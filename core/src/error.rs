use thiserror::Error;

use crate::types::JobState;

/// Failures of the claim engine.
///
/// An empty claim is not an error: `take_job_into_work` returns `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job {0} not found")]
    JobNotFound(i64),

    /// The job is no longer held by the claim the caller observed. Either it
    /// was renewed, finished, or re-claimed by someone else in the meantime.
    #[error("job {job_id} is no longer held by this claim (state={state})")]
    StaleClaim { job_id: i64, state: JobState },

    #[error("queue {0} vanished while resolving it")]
    QueueNotResolved(String),
}

/// Misuse of the worker pool lifecycle API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool already started with {0} workers")]
    AlreadyStarted(usize),

    #[error("current workers amount = {running} is less than requested = {requested} to stop")]
    NotEnoughWorkers { running: usize, requested: usize },

    #[error("worker pool has been stopped")]
    Stopped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("heartbeat monitor already started")]
    AlreadyStarted,
}
