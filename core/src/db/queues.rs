//! Queue Database Operations
//!
//! Queues are created lazily by the first job that names them and are never
//! deleted. Their state flips only together with a job transition, inside the
//! caller's transaction.

use crate::types::{Queue, QueueState};

pub async fn find_queue<'e, E>(executor: E, queue_key: &str) -> Result<Option<Queue>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query_as::<_, Queue>(
        r#"
        SELECT id, queue_key, state
        FROM queues
        WHERE queue_key = $1
        "#,
    )
    .bind(queue_key)
    .fetch_optional(executor)
    .await
}

/// Try to create a queue in state `ready`.
///
/// Returns `None` when a concurrent creator won the unique constraint; the
/// caller re-reads to pick up the winner's row.
pub async fn create_queue<'e, E>(executor: E, queue_key: &str) -> Result<Option<Queue>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query_as::<_, Queue>(
        r#"
        INSERT INTO queues (queue_key, state)
        VALUES ($1, $2)
        ON CONFLICT (queue_key) DO NOTHING
        RETURNING id, queue_key, state
        "#,
    )
    .bind(queue_key)
    .bind(QueueState::Ready)
    .fetch_optional(executor)
    .await
}

pub async fn set_queue_state<'e, E>(
    executor: E,
    queue_id: i64,
    state: QueueState,
) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE queues
        SET state = $2
        WHERE id = $1
        "#,
    )
    .bind(queue_id)
    .bind(state)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
