use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::error::StoreError;
use crate::store::ScheduleStore;
use crate::types::{Job, NewJob};

/// A request to schedule one job, as received from a client.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    /// Due time in Unix seconds.
    pub timestamp: i64,
    #[serde(alias = "queue_id")]
    pub queue_key: String,
    pub action: String,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("failed to schedule job: {0}")]
    Store(#[from] StoreError),
}

impl ScheduleError {
    /// Whether the caller sent a bad request, as opposed to a server-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ScheduleError::Invalid(_))
    }
}

impl ScheduleRequest {
    fn into_new_job(self) -> Result<NewJob, ScheduleError> {
        if self.timestamp == 0 {
            return Err(ScheduleError::Invalid("missing timestamp field".to_string()));
        }
        if self.action.is_empty() {
            return Err(ScheduleError::Invalid("missing action field".to_string()));
        }
        let due_at = DateTime::<Utc>::from_timestamp(self.timestamp, 0).ok_or_else(|| {
            ScheduleError::Invalid(format!("timestamp {} is out of range", self.timestamp))
        })?;

        Ok(NewJob {
            queue_key: self.queue_key,
            due_at,
            action: self.action,
        })
    }
}

/// Service for scheduling jobs
#[derive(Clone)]
pub struct ScheduleService {
    store: Arc<dyn ScheduleStore>,
}

impl ScheduleService {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }

    /// Validate the request and persist the job.
    pub async fn schedule_job(&self, request: ScheduleRequest) -> Result<Job, ScheduleError> {
        let new_job = request.into_new_job()?;
        let job = self.store.insert_job(new_job).await?;

        info!(
            job_id = job.id,
            queue_key = %job.queue_key,
            due_at = %job.due_at,
            "job scheduled"
        );
        Ok(job)
    }
}
