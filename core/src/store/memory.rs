//! In-process claim engine
//!
//! The whole state sits behind one mutex, so each operation is trivially a
//! single transaction. Contended claims serialize on the lock instead of
//! skipping locked rows; the observable outcome is the same.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::types::{Job, JobListFilter, JobState, NewJob, Queue, QueueState};

#[derive(Debug, Clone)]
struct JobRow {
    queue_id: i64,
    due_at: DateTime<Utc>,
    action: String,
    state: JobState,
    last_claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<i64, JobRow>,
    queues: BTreeMap<i64, Queue>,
    queue_ids: HashMap<String, i64>,
    next_job_id: i64,
    next_queue_id: i64,
}

impl State {
    fn resolve_queue(&mut self, queue_key: &str) -> i64 {
        if let Some(id) = self.queue_ids.get(queue_key) {
            return *id;
        }
        self.next_queue_id += 1;
        let id = self.next_queue_id;
        self.queues.insert(
            id,
            Queue {
                id,
                queue_key: queue_key.to_string(),
                state: QueueState::Ready,
            },
        );
        self.queue_ids.insert(queue_key.to_string(), id);
        id
    }

    fn to_job(&self, id: i64, row: &JobRow) -> Job {
        let queue_key = self
            .queues
            .get(&row.queue_id)
            .map(|q| q.queue_key.clone())
            .unwrap_or_default();
        Job {
            id,
            queue_id: row.queue_id,
            queue_key,
            due_at: row.due_at,
            action: row.action.clone(),
            state: row.state,
            last_claimed_at: row.last_claimed_at,
        }
    }

    /// Check that `job` still describes the live claim, then apply the joint
    /// job + queue transition.
    fn release_claim(
        &mut self,
        job: &Job,
        job_state: JobState,
    ) -> Result<(), StoreError> {
        let row = self
            .jobs
            .get_mut(&job.id)
            .ok_or(StoreError::JobNotFound(job.id))?;

        if row.state != JobState::Running || row.last_claimed_at != job.last_claimed_at {
            return Err(StoreError::StaleClaim {
                job_id: job.id,
                state: row.state,
            });
        }

        row.state = job_state;
        let queue_id = row.queue_id;
        if let Some(queue) = self.queues.get_mut(&queue_id) {
            queue.state = QueueState::Ready;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave a half-applied
        // transition: every mutation below completes before returning.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Verify the serialization invariant for every queue.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let state = self.lock();
        for queue in state.queues.values() {
            let running = state
                .jobs
                .values()
                .filter(|j| j.queue_id == queue.id && j.state == JobState::Running)
                .count();
            match queue.state {
                QueueState::Busy => assert_eq!(
                    running, 1,
                    "queue {} is busy with {} running jobs",
                    queue.queue_key, running
                ),
                QueueState::Ready => assert_eq!(
                    running, 0,
                    "queue {} is ready with {} running jobs",
                    queue.queue_key, running
                ),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::ScheduleStore for MemoryStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut state = self.lock();
        let queue_id = state.resolve_queue(&job.queue_key);

        state.next_job_id += 1;
        let id = state.next_job_id;
        let row = JobRow {
            queue_id,
            due_at: job.due_at,
            action: job.action,
            state: JobState::New,
            last_claimed_at: None,
        };
        let stored = state.to_job(id, &row);
        state.jobs.insert(id, row);
        Ok(stored)
    }

    async fn take_job_into_work(&self) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();

        let candidate = state
            .jobs
            .iter()
            .filter(|(_, row)| row.state == JobState::New && row.due_at <= now)
            .filter(|(_, row)| {
                state
                    .queues
                    .get(&row.queue_id)
                    .is_some_and(|q| q.state == QueueState::Ready)
            })
            .min_by_key(|(id, row)| (row.due_at, **id))
            .map(|(id, row)| (*id, row.queue_id));

        let Some((job_id, queue_id)) = candidate else {
            return Ok(None);
        };

        if let Some(queue) = state.queues.get_mut(&queue_id) {
            queue.state = QueueState::Busy;
        }
        let row = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        row.state = JobState::Running;
        row.last_claimed_at = Some(now);
        let row = row.clone();

        Ok(Some(state.to_job(job_id, &row)))
    }

    async fn finish_job(&self, job: &Job) -> Result<(), StoreError> {
        self.lock().release_claim(job, JobState::Done)
    }

    async fn renew_job(&self, job: &Job) -> Result<(), StoreError> {
        self.lock().release_claim(job, JobState::New)
    }

    async fn list_overdue_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let state = self.lock();
        Ok(state
            .jobs
            .iter()
            .filter(|(_, row)| row.state == JobState::Running)
            .filter(|(_, row)| row.last_claimed_at.is_some_and(|at| at < cutoff))
            .map(|(id, row)| state.to_job(*id, row))
            .collect())
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        let state = self.lock();
        Ok(state.jobs.get(&job_id).map(|row| state.to_job(job_id, row)))
    }

    async fn get_queue(&self, queue_key: &str) -> Result<Option<Queue>, StoreError> {
        let state = self.lock();
        Ok(state
            .queue_ids
            .get(queue_key)
            .and_then(|id| state.queues.get(id))
            .cloned())
    }

    async fn list_jobs(&self, filter: JobListFilter) -> Result<Vec<Job>, StoreError> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .iter()
            .map(|(id, row)| state.to_job(*id, row))
            .filter(|job| {
                filter
                    .queue_key
                    .as_deref()
                    .map_or(true, |key| job.queue_key == key)
            })
            .filter(|job| filter.state.map_or(true, |s| job.state == s))
            .collect();
        jobs.sort_by_key(|job| (job.due_at, job.id));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit.max(0) as usize);
        }
        Ok(jobs)
    }
}
