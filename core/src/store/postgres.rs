//! Postgres claim engine
//!
//! Each trait method opens one transaction and commits it only after both the
//! job row and the queue row have been written. Dropping an uncommitted
//! `sqlx::Transaction` rolls it back, so an early `?` never leaves a job
//! `running` on a `ready` queue or the reverse.
//!
//! Due checks and claim stamps use the store's `Clock`, never the database's
//! `NOW()`, so they share a time source with the heartbeat cutoff.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::db;
use crate::error::StoreError;
use crate::types::{Job, JobListFilter, JobState, NewJob, Queue, QueueState};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the joint job + queue release for `finish_job` and `renew_job`.
    async fn release(&self, job: &Job, next_state: JobState) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let queue_id =
            db::jobs::release_claim(&mut *tx, job.id, job.last_claimed_at, next_state).await?;

        let Some(queue_id) = queue_id else {
            // Nothing was written; the transaction is dropped and rolled back.
            return match db::jobs::get_job_state(&mut *tx, job.id).await? {
                Some(state) => Err(StoreError::StaleClaim {
                    job_id: job.id,
                    state,
                }),
                None => Err(StoreError::JobNotFound(job.id)),
            };
        };

        db::queues::set_queue_state(&mut *tx, queue_id, QueueState::Ready).await?;
        tx.commit().await?;

        Ok(())
    }
}

#[async_trait]
impl super::ScheduleStore for PostgresStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let queue = match db::queues::find_queue(&mut *tx, &job.queue_key).await? {
            Some(queue) => queue,
            None => match db::queues::create_queue(&mut *tx, &job.queue_key).await? {
                Some(queue) => queue,
                None => {
                    // Lost the creation race; the winner's row is committed
                    // and visible to this new statement.
                    debug!(queue_key = %job.queue_key, "queue created concurrently, re-reading");
                    db::queues::find_queue(&mut *tx, &job.queue_key)
                        .await?
                        .ok_or_else(|| StoreError::QueueNotResolved(job.queue_key.clone()))?
                }
            },
        };

        let stored =
            db::jobs::insert_job(&mut *tx, queue.id, &queue.queue_key, job.due_at, &job.action)
                .await?;
        tx.commit().await?;

        Ok(stored)
    }

    async fn take_job_into_work(&self) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let Some((job_id, queue_id)) = db::jobs::lock_next_claimable(&mut *tx, now).await? else {
            return Ok(None);
        };

        let job = db::jobs::mark_running(&mut *tx, job_id, now).await?;
        db::queues::set_queue_state(&mut *tx, queue_id, QueueState::Busy).await?;
        tx.commit().await?;

        Ok(Some(job))
    }

    async fn finish_job(&self, job: &Job) -> Result<(), StoreError> {
        self.release(job, JobState::Done).await
    }

    async fn renew_job(&self, job: &Job) -> Result<(), StoreError> {
        self.release(job, JobState::New).await
    }

    async fn list_overdue_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Ok(db::jobs::list_overdue_running(&self.pool, cutoff).await?)
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        Ok(db::jobs::get_job(&self.pool, job_id).await?)
    }

    async fn get_queue(&self, queue_key: &str) -> Result<Option<Queue>, StoreError> {
        Ok(db::queues::find_queue(&self.pool, queue_key).await?)
    }

    async fn list_jobs(&self, filter: JobListFilter) -> Result<Vec<Job>, StoreError> {
        Ok(db::jobs::list_jobs(&self.pool, &filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::test_helpers::with_test_db;
    use crate::store::ScheduleStore;

    fn due_now(queue: &str, action: &str) -> NewJob {
        NewJob {
            queue_key: queue.to_string(),
            due_at: Utc::now() - Duration::seconds(1),
            action: action.to_string(),
        }
    }

    async fn assert_consistent(pool: &PgPool) {
        let mismatched: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM queues q
            WHERE (q.state = 'busy') <> EXISTS (
                SELECT 1 FROM jobs j WHERE j.queue_id = q.id AND j.state = 'running'
            )
            "#,
        )
        .fetch_one(pool)
        .await
        .unwrap();
        assert_eq!(mismatched, 0, "queue state disagrees with running jobs");
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database to be running
    async fn test_claim_finish_cycle() {
        let db = with_test_db().await;
        let pool = db.pool.clone();
        let store = PostgresStore::new(pool.clone());

        let inserted = store.insert_job(due_now("q1", "a")).await.unwrap();
        assert_eq!(inserted.state, JobState::New);
        assert_eq!(inserted.queue_key, "q1");

        let claimed = store.take_job_into_work().await.unwrap().unwrap();
        assert_eq!(claimed.id, inserted.id);
        assert_eq!(claimed.state, JobState::Running);
        assert!(claimed.last_claimed_at.is_some());
        let queue = store.get_queue("q1").await.unwrap().unwrap();
        assert_eq!(queue.state, QueueState::Busy);

        assert!(store.take_job_into_work().await.unwrap().is_none());
        assert_consistent(&pool).await;

        store.finish_job(&claimed).await.unwrap();
        let queue = store.get_queue("q1").await.unwrap().unwrap();
        assert_eq!(queue.state, QueueState::Ready);
        let job = store.get_job(claimed.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_consistent(&pool).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database to be running
    async fn test_claim_uses_store_clock() {
        let db = with_test_db().await;
        let start = Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = PostgresStore::with_clock(db.pool.clone(), clock.clone());

        store
            .insert_job(NewJob {
                queue_key: "q1".to_string(),
                due_at: start + Duration::minutes(1),
                action: "later".to_string(),
            })
            .await
            .unwrap();

        // Due by the database's wall clock, but not by the store's.
        assert!(store.take_job_into_work().await.unwrap().is_none());

        clock.advance(Duration::minutes(2));
        let claimed = store.take_job_into_work().await.unwrap().unwrap();
        assert_eq!(claimed.last_claimed_at, Some(start + Duration::minutes(2)));

        let overdue = store
            .list_overdue_running(start + Duration::minutes(3))
            .await
            .unwrap();
        assert_eq!(overdue.len(), 1);
        assert!(store
            .list_overdue_running(start + Duration::minutes(2))
            .await
            .unwrap()
            .is_empty());

        store.finish_job(&claimed).await.unwrap();
        assert_consistent(&db).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database to be running
    async fn test_renew_and_reclaim() {
        let db = with_test_db().await;
        let pool = db.pool.clone();
        let store = PostgresStore::new(pool.clone());

        store.insert_job(due_now("q1", "a")).await.unwrap();
        let claimed = store.take_job_into_work().await.unwrap().unwrap();

        let overdue = store
            .list_overdue_running(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(overdue.len(), 1);

        store.renew_job(&overdue[0]).await.unwrap();
        assert_consistent(&pool).await;

        // The first holder's claim is now stale.
        let err = store.finish_job(&claimed).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::StaleClaim {
                state: JobState::New,
                ..
            }
        ));

        let reclaimed = store.take_job_into_work().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_consistent(&pool).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database to be running
    async fn test_concurrent_claims_single_holder() {
        let db = with_test_db().await;
        let pool = db.pool.clone();
        let store = PostgresStore::new(pool.clone());
        store.insert_job(due_now("q1", "a")).await.unwrap();
        store.insert_job(due_now("q1", "b")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.take_job_into_work().await.unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1, "only one job per queue may be running");
        assert_consistent(&pool).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database to be running
    async fn test_concurrent_inserts_share_queue() {
        let db = with_test_db().await;
        let pool = db.pool.clone();
        let store = PostgresStore::new(pool.clone());

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_job(due_now("fresh", &format!("a{i}")))
                    .await
                    .unwrap()
            }));
        }

        let mut queue_ids = HashSet::new();
        for handle in handles {
            queue_ids.insert(handle.await.unwrap().queue_id);
        }
        assert_eq!(queue_ids.len(), 1);

        let queues: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queues WHERE queue_key = 'fresh'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(queues, 1);
    }
}
