//! Transactional outbox access
//!
//! Workers insert outbox rows in the same transaction as their findings;
//! the publisher drains pending rows in id order and marks them published
//! after the broker acknowledges the enqueue.

use crate::db::models::{OutboxEventRecord, OutboxStatus};
use crate::Result;
use chrono::Utc;
use sqlx::SqlitePool;

/// Insert an event inside the caller's transaction.
pub async fn insert_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event_type: &str,
    queue_name: &str,
    payload: &serde_json::Value,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO outbox (event_type, queue_name, payload, status, created_at)
        VALUES (?, ?, ?, 'pending', ?)
        RETURNING id
        "#,
    )
    .bind(event_type)
    .bind(queue_name)
    .bind(serde_json::to_string(payload)?)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;

    Ok(id)
}

/// Pending events in id order, up to `limit`. The per-queue publish order
/// guarantee rests on this ordering.
pub async fn fetch_pending(pool: &SqlitePool, limit: i64) -> Result<Vec<OutboxEventRecord>> {
    let rows: Vec<OutboxRow> = sqlx::query_as(
        "SELECT id, event_type, queue_name, payload, status, created_at, processed_at
         FROM outbox WHERE status = 'pending' ORDER BY id LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(OutboxRow::into_record).collect())
}

/// Mark a row published. Returns false when the row was not pending, which
/// means a concurrent publisher already claimed it.
pub async fn mark_published(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE outbox SET status = 'published', processed_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark a row permanently failed (malformed payload, unroutable queue).
pub async fn mark_failed(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE outbox SET status = 'failed', processed_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn pending_count(pool: &SqlitePool) -> Result<u64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE status = 'pending'")
            .fetch_one(pool)
            .await?;
    Ok(count as u64)
}

pub async fn count_by_status(pool: &SqlitePool, status: OutboxStatus) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

/// Published events for one queue, in publish (id) order. The graph round
/// trip replays `graph-builder` events from here.
pub async fn load_published_for_queue(
    pool: &SqlitePool,
    queue_name: &str,
) -> Result<Vec<OutboxEventRecord>> {
    let rows: Vec<OutboxRow> = sqlx::query_as(
        "SELECT id, event_type, queue_name, payload, status, created_at, processed_at
         FROM outbox WHERE queue_name = ? AND status = 'published' ORDER BY id",
    )
    .bind(queue_name)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(OutboxRow::into_record).collect())
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    event_type: String,
    queue_name: String,
    payload: String,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
    processed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl OutboxRow {
    fn into_record(self) -> OutboxEventRecord {
        OutboxEventRecord {
            id: self.id,
            event_type: self.event_type,
            queue_name: self.queue_name,
            payload: self.payload,
            status: self.status,
            created_at: self.created_at,
            processed_at: self.processed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::create_schema;
    use serde_json::json;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        pool
    }

    async fn insert_event(pool: &SqlitePool, queue: &str) -> i64 {
        let mut tx = pool.begin().await.unwrap();
        let id = insert_tx(&mut tx, "test-event", queue, &json!({"n": 1}))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_pending_fetch_in_id_order() {
        let pool = test_pool().await;
        let first = insert_event(&pool, "file-analysis-queue").await;
        let second = insert_event(&pool, "file-analysis-queue").await;

        let pending = fetch_pending(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[1].id, second);
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_mark_published_exactly_once() {
        let pool = test_pool().await;
        let id = insert_event(&pool, "file-analysis-queue").await;

        assert!(mark_published(&pool, id).await.unwrap());
        // Second claim must observe the row is no longer pending
        assert!(!mark_published(&pool, id).await.unwrap());

        assert_eq!(pending_count(&pool).await.unwrap(), 0);
        assert_eq!(
            count_by_status(&pool, OutboxStatus::Published).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_published_excluded_from_pending() {
        let pool = test_pool().await;
        let id = insert_event(&pool, "graph-builder").await;
        insert_event(&pool, "graph-builder").await;

        mark_published(&pool, id).await.unwrap();

        let pending = fetch_pending(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, id);
    }

    #[tokio::test]
    async fn test_replay_view_per_queue() {
        let pool = test_pool().await;
        let a = insert_event(&pool, "graph-builder").await;
        let b = insert_event(&pool, "reconciliation-queue").await;
        mark_published(&pool, a).await.unwrap();
        mark_published(&pool, b).await.unwrap();

        let replay = load_published_for_queue(&pool, "graph-builder").await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].id, a);
    }
}
