//! POI row access

use crate::db::models::{directory_of, NewPoi, PoiRecord};
use crate::Result;
use sqlx::SqlitePool;

/// Upsert a batch of POIs inside the caller's transaction.
///
/// `poi_id` is the stable identity; a replayed batch rewrites the same rows.
pub async fn upsert_pois(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    pois: &[NewPoi],
) -> Result<usize> {
    for poi in pois {
        let metadata = poi
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO pois (poi_id, file_id, poi_type, name, file_path, directory_path,
                              start_line, end_line, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(poi_id) DO UPDATE SET
                end_line = excluded.end_line,
                metadata = excluded.metadata
            "#,
        )
        .bind(&poi.poi_id)
        .bind(poi.file_id)
        .bind(&poi.poi_type)
        .bind(&poi.name)
        .bind(&poi.file_path)
        .bind(directory_of(&poi.file_path))
        .bind(poi.start_line)
        .bind(poi.end_line)
        .bind(metadata)
        .execute(&mut **tx)
        .await?;
    }

    Ok(pois.len())
}

pub async fn get(pool: &SqlitePool, poi_id: &str) -> Result<Option<PoiRecord>> {
    let row: Option<PoiRow> = sqlx::query_as(
        r#"
        SELECT id, poi_id, file_id, poi_type, name, file_path, directory_path,
               start_line, end_line, metadata
        FROM pois WHERE poi_id = ?
        "#,
    )
    .bind(poi_id)
    .fetch_optional(pool)
    .await?;

    row.map(PoiRow::into_record).transpose()
}

pub async fn exists(pool: &SqlitePool, poi_id: &str) -> Result<bool> {
    let found: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pois WHERE poi_id = ?)")
        .bind(poi_id)
        .fetch_one(pool)
        .await?;
    Ok(found)
}

/// All POIs whose file sits directly in `directory_path`.
pub async fn load_by_directory(pool: &SqlitePool, directory_path: &str) -> Result<Vec<PoiRecord>> {
    let rows: Vec<PoiRow> = sqlx::query_as(
        r#"
        SELECT id, poi_id, file_id, poi_type, name, file_path, directory_path,
               start_line, end_line, metadata
        FROM pois WHERE directory_path = ?
        ORDER BY file_path, start_line
        "#,
    )
    .bind(directory_path)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(PoiRow::into_record).collect()
}

pub async fn load_all(pool: &SqlitePool) -> Result<Vec<PoiRecord>> {
    let rows: Vec<PoiRow> = sqlx::query_as(
        r#"
        SELECT id, poi_id, file_id, poi_type, name, file_path, directory_path,
               start_line, end_line, metadata
        FROM pois ORDER BY file_path, start_line
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(PoiRow::into_record).collect()
}

/// Distinct directory paths that currently hold POIs.
pub async fn distinct_directories(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT directory_path FROM pois ORDER BY directory_path")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}

pub async fn count(pool: &SqlitePool) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pois")
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

#[derive(sqlx::FromRow)]
struct PoiRow {
    id: i64,
    poi_id: String,
    file_id: i64,
    poi_type: String,
    name: String,
    file_path: String,
    directory_path: String,
    start_line: i64,
    end_line: i64,
    metadata: Option<String>,
}

impl PoiRow {
    fn into_record(self) -> Result<PoiRecord> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(PoiRecord {
            id: self.id,
            poi_id: self.poi_id,
            file_id: self.file_id,
            poi_type: self.poi_type,
            name: self.name,
            file_path: self.file_path,
            directory_path: self.directory_path,
            start_line: self.start_line,
            end_line: self.end_line,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::create_schema;
    use crate::db::models::{derive_poi_id, FileStatus};
    use crate::db::files;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        pool
    }

    fn poi(file_id: i64, file_path: &str, name: &str, line: i64) -> NewPoi {
        NewPoi {
            poi_id: derive_poi_id(file_path, "function", name, line),
            file_id,
            poi_type: "function".to_string(),
            name: name.to_string(),
            file_path: file_path.to_string(),
            start_line: line,
            end_line: line + 10,
            metadata: None,
        }
    }

    async fn seed_file(pool: &SqlitePool, path: &str) -> i64 {
        let mut tx = pool.begin().await.unwrap();
        let id = files::upsert_file(&mut tx, path, "hash", None, FileStatus::Analyzing)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_upsert_and_exists() {
        let pool = test_pool().await;
        let file_id = seed_file(&pool, "src/app.js").await;

        let new = poi(file_id, "src/app.js", "main", 1);
        let poi_id = new.poi_id.clone();

        let mut tx = pool.begin().await.unwrap();
        upsert_pois(&mut tx, &[new]).await.unwrap();
        tx.commit().await.unwrap();

        assert!(exists(&pool, &poi_id).await.unwrap());
        assert!(!exists(&pool, "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_replay_does_not_duplicate() {
        let pool = test_pool().await;
        let file_id = seed_file(&pool, "src/app.js").await;
        let new = poi(file_id, "src/app.js", "main", 1);

        for _ in 0..2 {
            let mut tx = pool.begin().await.unwrap();
            upsert_pois(&mut tx, &[new.clone()]).await.unwrap();
            tx.commit().await.unwrap();
        }

        assert_eq!(count(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_directory_scoping_excludes_subdirectories() {
        let pool = test_pool().await;
        let a = seed_file(&pool, "src/app.js").await;
        let b = seed_file(&pool, "src/util/helpers.js").await;

        let mut tx = pool.begin().await.unwrap();
        upsert_pois(
            &mut tx,
            &[
                poi(a, "src/app.js", "main", 1),
                poi(b, "src/util/helpers.js", "helper", 1),
            ],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let direct = load_by_directory(&pool, "src").await.unwrap();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].name, "main");

        let dirs = distinct_directories(&pool).await.unwrap();
        assert_eq!(dirs, vec!["src".to_string(), "src/util".to_string()]);
    }
}
