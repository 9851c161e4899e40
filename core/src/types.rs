use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    New,
    Running,
    Done,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Running => "running",
            JobState::Done => "done",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "new" => Ok(JobState::New),
            "running" => Ok(JobState::Running),
            "done" => Ok(JobState::Done),
            other => Err(format!(
                "Invalid job state: {}. Must be one of: new, running, done",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Ready,
    Busy,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueState::Ready => f.write_str("ready"),
            QueueState::Busy => f.write_str("busy"),
        }
    }
}

/// A scheduled unit of work.
///
/// `queue_key` is carried alongside `queue_id` so loops can log the
/// serialization domain without another lookup.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Job {
    pub id: i64,
    pub queue_id: i64,
    pub queue_key: String,
    pub due_at: DateTime<Utc>,
    pub action: String,
    pub state: JobState,

    /// Stamped once per claim. Never refreshed while the job runs.
    pub last_claimed_at: Option<DateTime<Utc>>,
}

/// A serialization domain: at most one of its jobs runs at a time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Queue {
    pub id: i64,
    pub queue_key: String,
    pub state: QueueState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub queue_key: String,
    pub due_at: DateTime<Utc>,
    pub action: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobListFilter {
    pub queue_key: Option<String>,
    pub state: Option<JobState>,
    pub limit: Option<i64>,
}
