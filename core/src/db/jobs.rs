//! Job Database Operations
//!
//! Single statements over the `jobs` table. Callers that change job state also
//! change queue state, so these are always run inside one transaction by
//! `PostgresStore`.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};

use crate::types::{Job, JobListFilter, JobState};

/// Insert a job in state `new` and return it with its queue key.
pub async fn insert_job<'e, E>(
    executor: E,
    queue_id: i64,
    queue_key: &str,
    due_at: DateTime<Utc>,
    action: &str,
) -> Result<Job, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Job>(
        r#"
        INSERT INTO jobs (queue_id, due_at, action, state)
        VALUES ($1, $2, $3, $4)
        RETURNING id, queue_id, $5::text AS queue_key, due_at, action, state, last_claimed_at
        "#,
    )
    .bind(queue_id)
    .bind(due_at)
    .bind(action)
    .bind(JobState::New)
    .bind(queue_key)
    .fetch_one(executor)
    .await
}

/// Lock the earliest job due at `now` whose queue is ready, together with
/// that queue.
///
/// Rows locked by a concurrent claimant are skipped, never waited on. Both the
/// job and its queue are locked so a second claimant cannot pick a sibling
/// job of the same queue before this transaction commits.
pub async fn lock_next_claimable<'e, E>(
    executor: E,
    now: DateTime<Utc>,
) -> Result<Option<(i64, i64)>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, (i64, i64)>(
        r#"
        SELECT j.id, j.queue_id
        FROM jobs j
        JOIN queues q ON q.id = j.queue_id
        WHERE j.state = 'new'
          AND j.due_at <= $1
          AND q.state = 'ready'
        ORDER BY j.due_at ASC, j.id ASC
        LIMIT 1
        FOR UPDATE OF j, q SKIP LOCKED
        "#,
    )
    .bind(now)
    .fetch_optional(executor)
    .await
}

/// Move a locked job to `running` and stamp its claim time with `claimed_at`.
pub async fn mark_running<'e, E>(
    executor: E,
    job_id: i64,
    claimed_at: DateTime<Utc>,
) -> Result<Job, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Job>(
        r#"
        UPDATE jobs j
        SET state = $2,
            last_claimed_at = $3
        FROM queues q
        WHERE j.id = $1
          AND q.id = j.queue_id
        RETURNING j.id, j.queue_id, q.queue_key, j.due_at, j.action, j.state, j.last_claimed_at
        "#,
    )
    .bind(job_id)
    .bind(JobState::Running)
    .bind(claimed_at)
    .fetch_one(executor)
    .await
}

/// Leave `running` for `next_state`, but only if the claim stamped at
/// `claimed_at` is still the live one. Returns the job's queue id on success.
pub async fn release_claim<'e, E>(
    executor: E,
    job_id: i64,
    claimed_at: Option<DateTime<Utc>>,
    next_state: JobState,
) -> Result<Option<i64>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE jobs
        SET state = $3
        WHERE id = $1
          AND state = 'running'
          AND last_claimed_at IS NOT DISTINCT FROM $2
        RETURNING queue_id
        "#,
    )
    .bind(job_id)
    .bind(claimed_at)
    .bind(next_state)
    .fetch_optional(executor)
    .await
}

pub async fn get_job_state<'e, E>(executor: E, job_id: i64) -> Result<Option<JobState>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar::<_, JobState>("SELECT state FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(executor)
        .await
}

pub async fn list_overdue_running<'e, E>(
    executor: E,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Job>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Job>(
        r#"
        SELECT j.id, j.queue_id, q.queue_key, j.due_at, j.action, j.state, j.last_claimed_at
        FROM jobs j
        JOIN queues q ON q.id = j.queue_id
        WHERE j.state = 'running'
          AND j.last_claimed_at < $1
        ORDER BY j.last_claimed_at ASC
        "#,
    )
    .bind(cutoff)
    .fetch_all(executor)
    .await
}

pub async fn get_job<'e, E>(executor: E, job_id: i64) -> Result<Option<Job>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Job>(
        r#"
        SELECT j.id, j.queue_id, q.queue_key, j.due_at, j.action, j.state, j.last_claimed_at
        FROM jobs j
        JOIN queues q ON q.id = j.queue_id
        WHERE j.id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(executor)
    .await
}

pub async fn list_jobs<'e, E>(executor: E, filter: &JobListFilter) -> Result<Vec<Job>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT j.id, j.queue_id, q.queue_key, j.due_at, j.action, j.state, j.last_claimed_at \
         FROM jobs j JOIN queues q ON q.id = j.queue_id WHERE 1=1",
    );

    if let Some(queue_key) = &filter.queue_key {
        query.push(" AND q.queue_key = ").push_bind(queue_key.clone());
    }
    if let Some(state) = filter.state {
        query.push(" AND j.state = ").push_bind(state);
    }

    query.push(" ORDER BY j.due_at ASC, j.id ASC");

    if let Some(limit) = filter.limit {
        query.push(" LIMIT ").push_bind(limit);
    }

    query.build_query_as::<Job>().fetch_all(executor).await
}
