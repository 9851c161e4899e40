//! Action execution
//!
//! The pool treats execution as an opaque call that eventually returns.
//! Implementations must tolerate running the same job more than once: a job
//! renewed by the heartbeat monitor is dispatched again.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::types::Job;

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<()>;
}

/// Executor that only records the action in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExecutor;

#[async_trait]
impl ActionExecutor for LoggingExecutor {
    async fn execute(&self, job: &Job) -> Result<()> {
        info!(
            job_id = job.id,
            queue_key = %job.queue_key,
            action = %job.action,
            "job is done"
        );
        Ok(())
    }
}
