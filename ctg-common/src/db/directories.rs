//! Directory summary access

use crate::Result;
use sqlx::SqlitePool;

/// Upsert a directory summary produced by directory-scope resolution.
pub async fn upsert_summary(
    pool: &SqlitePool,
    directory_path: &str,
    summary: &str,
    metadata: Option<&serde_json::Value>,
) -> Result<()> {
    let metadata = metadata.map(serde_json::to_string).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO directory_summaries (directory_path, summary, metadata)
        VALUES (?, ?, ?)
        ON CONFLICT(directory_path) DO UPDATE SET
            summary = excluded.summary,
            metadata = excluded.metadata,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(directory_path)
    .bind(summary)
    .bind(metadata)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_summary(pool: &SqlitePool, directory_path: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT summary FROM directory_summaries WHERE directory_path = ?")
            .bind(directory_path)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(summary,)| summary))
}

pub async fn count(pool: &SqlitePool) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM directory_summaries")
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::create_schema;

    #[tokio::test]
    async fn test_upsert_replaces_summary() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();

        upsert_summary(&pool, "src/db", "database access modules", None)
            .await
            .unwrap();
        upsert_summary(&pool, "src/db", "SQLite access layer", None)
            .await
            .unwrap();

        assert_eq!(count(&pool).await.unwrap(), 1);
        assert_eq!(
            get_summary(&pool, "src/db").await.unwrap().as_deref(),
            Some("SQLite access layer")
        );
    }
}
