//! File row access
//!
//! Files are created by the discovery batcher and advance through a strictly
//! monotone lifecycle. Redelivered jobs may replay an insert or a status
//! move, so both are idempotent.

use crate::db::models::{FileRecord, FileStatus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// Insert a file row, or return the existing row's id when the path is
/// already tracked (batch redelivery).
pub async fn upsert_file(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    path: &str,
    content_hash: &str,
    last_modified: Option<DateTime<Utc>>,
    status: FileStatus,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO files (path, content_hash, last_modified, status)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET updated_at = CURRENT_TIMESTAMP
        RETURNING id
        "#,
    )
    .bind(path)
    .bind(content_hash)
    .bind(last_modified)
    .bind(status.as_str())
    .fetch_one(&mut **tx)
    .await?;

    Ok(id)
}

/// Advance a file's status, enforcing the monotone lifecycle.
///
/// Re-applying the current status is a no-op (handlers are idempotent under
/// redelivery); a backward move is an error.
pub async fn advance_status(pool: &SqlitePool, file_id: i64, new_status: FileStatus) -> Result<()> {
    let mut tx = pool.begin().await?;

    let current: Option<(String,)> = sqlx::query_as("SELECT status FROM files WHERE id = ?")
        .bind(file_id)
        .fetch_optional(&mut *tx)
        .await?;

    let current = match current {
        Some((raw,)) => FileStatus::parse(&raw)?,
        None => return Err(Error::MissingRecord(format!("file id {}", file_id))),
    };

    if current == new_status {
        return Ok(());
    }
    if new_status.rank() <= current.rank() {
        return Err(Error::Lifecycle(format!(
            "file {} cannot move {} -> {}",
            file_id,
            current.as_str(),
            new_status.as_str()
        )));
    }

    sqlx::query("UPDATE files SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(new_status.as_str())
        .bind(file_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Same monotonicity rules as [`advance_status`], inside a caller-owned
/// transaction so the move commits atomically with findings.
pub async fn advance_status_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    file_id: i64,
    new_status: FileStatus,
) -> Result<()> {
    let current: Option<(String,)> = sqlx::query_as("SELECT status FROM files WHERE id = ?")
        .bind(file_id)
        .fetch_optional(&mut **tx)
        .await?;

    let current = match current {
        Some((raw,)) => FileStatus::parse(&raw)?,
        None => return Err(Error::MissingRecord(format!("file id {}", file_id))),
    };

    if current == new_status {
        return Ok(());
    }
    if new_status.rank() <= current.rank() {
        return Err(Error::Lifecycle(format!(
            "file {} cannot move {} -> {}",
            file_id,
            current.as_str(),
            new_status.as_str()
        )));
    }

    sqlx::query("UPDATE files SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(new_status.as_str())
        .bind(file_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

pub async fn get_by_id(pool: &SqlitePool, file_id: i64) -> Result<Option<FileRecord>> {
    let row: Option<(i64, String, String, Option<DateTime<Utc>>, String)> = sqlx::query_as(
        "SELECT id, path, content_hash, last_modified, status FROM files WHERE id = ?",
    )
    .bind(file_id)
    .fetch_optional(pool)
    .await?;

    row.map(record_from_row).transpose()
}

pub async fn get_by_path(pool: &SqlitePool, path: &str) -> Result<Option<FileRecord>> {
    let row: Option<(i64, String, String, Option<DateTime<Utc>>, String)> = sqlx::query_as(
        "SELECT id, path, content_hash, last_modified, status FROM files WHERE path = ?",
    )
    .bind(path)
    .fetch_optional(pool)
    .await?;

    row.map(record_from_row).transpose()
}

pub async fn count_by_status(pool: &SqlitePool, status: FileStatus) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

pub async fn count_all(pool: &SqlitePool) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

fn record_from_row(
    row: (i64, String, String, Option<DateTime<Utc>>, String),
) -> Result<FileRecord> {
    Ok(FileRecord {
        id: row.0,
        path: row.1,
        content_hash: row.2,
        last_modified: row.3,
        status: FileStatus::parse(&row.4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::create_schema;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        pool
    }

    async fn insert_one(pool: &SqlitePool, path: &str, status: FileStatus) -> i64 {
        let mut tx = pool.begin().await.unwrap();
        let id = upsert_file(&mut tx, path, "hash", None, status).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let pool = test_pool().await;
        let first = insert_one(&pool, "src/a.js", FileStatus::Analyzing).await;
        let second = insert_one(&pool, "src/a.js", FileStatus::Analyzing).await;
        assert_eq!(first, second);
        assert_eq!(count_all(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_status_advances_forward() {
        let pool = test_pool().await;
        let id = insert_one(&pool, "src/a.js", FileStatus::Discovered).await;

        advance_status(&pool, id, FileStatus::Analyzing).await.unwrap();
        advance_status(&pool, id, FileStatus::Analyzed).await.unwrap();

        let record = get_by_id(&pool, id).await.unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Analyzed);
    }

    #[tokio::test]
    async fn test_backward_move_rejected() {
        let pool = test_pool().await;
        let id = insert_one(&pool, "src/a.js", FileStatus::Analyzing).await;

        advance_status(&pool, id, FileStatus::Analyzed).await.unwrap();
        let err = advance_status(&pool, id, FileStatus::Analyzing).await;
        assert!(err.is_err(), "analyzed -> analyzing must be rejected");

        // Terminal states do not cross over either
        let err = advance_status(&pool, id, FileStatus::Failed).await;
        assert!(err.is_err(), "analyzed -> failed must be rejected");
    }

    #[tokio::test]
    async fn test_same_status_is_noop() {
        let pool = test_pool().await;
        let id = insert_one(&pool, "src/a.js", FileStatus::Analyzing).await;
        advance_status(&pool, id, FileStatus::Analyzing).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        let pool = test_pool().await;
        let err = advance_status(&pool, 999, FileStatus::Analyzed).await;
        assert!(matches!(err, Err(Error::MissingRecord(_))));
    }
}
