//! Database initialization
//!
//! Creates the SQLite schema on first run. All migrations are idempotent
//! `CREATE TABLE IF NOT EXISTS` statements so init is safe to call on every
//! startup.

use crate::Result;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePool::connect(&db_url).await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    configure_pool(&pool).await?;
    create_schema(&pool).await?;

    Ok(pool)
}

/// Apply connection PRAGMAs and create the full schema on an existing pool.
///
/// Tests use this directly against `sqlite::memory:` pools.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_files_table(pool).await?;
    create_pois_table(pool).await?;
    create_evidence_table(pool).await?;
    create_relationships_table(pool).await?;
    create_directory_summaries_table(pool).await?;
    create_outbox_table(pool).await?;
    create_pipeline_runs_table(pool).await?;
    Ok(())
}

async fn configure_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;
    // Writers contend during batch commits; give them time
    sqlx::query("PRAGMA busy_timeout = 5000").execute(pool).await?;
    Ok(())
}

async fn create_files_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL,
            last_modified TIMESTAMP,
            status TEXT NOT NULL DEFAULT 'discovered'
                CHECK (status IN ('discovered', 'analyzing', 'analyzed', 'failed')),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_path ON files(path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_status ON files(status)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_pois_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pois (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            poi_id TEXT NOT NULL UNIQUE,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            poi_type TEXT NOT NULL,
            name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            directory_path TEXT NOT NULL,
            start_line INTEGER NOT NULL CHECK (start_line >= 0),
            end_line INTEGER NOT NULL,
            metadata TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (end_line >= start_line)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pois_poi_id ON pois(poi_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pois_file_path ON pois(file_path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pois_directory ON pois(directory_path)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_evidence_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationship_evidence (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_poi_id TEXT NOT NULL,
            to_poi_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            evidence_source TEXT NOT NULL
                CHECK (evidence_source IN ('deterministic', 'intra_file', 'intra_directory', 'global')),
            confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
            metadata TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_evidence_endpoints
         ON relationship_evidence(from_poi_id, to_poi_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_relationships_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_poi_id TEXT NOT NULL,
            to_poi_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            confidence_score REAL NOT NULL CHECK (confidence_score >= 0.0 AND confidence_score <= 1.0),
            metadata TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (from_poi_id, to_poi_id, relationship_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_relationships_endpoints
         ON relationships(from_poi_id, to_poi_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_directory_summaries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS directory_summaries (
            directory_path TEXT PRIMARY KEY,
            summary TEXT NOT NULL,
            metadata TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_outbox_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            queue_name TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'published', 'failed')),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            processed_at TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_outbox_queue ON outbox(queue_name)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_pipeline_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_id TEXT PRIMARY KEY,
            target_directory TEXT NOT NULL,
            phase TEXT NOT NULL DEFAULT 'starting',
            status TEXT NOT NULL DEFAULT 'running'
                CHECK (status IN ('running', 'cancelling', 'cancelled', 'completed',
                                  'completed_with_failures', 'failed')),
            error TEXT,
            files_discovered INTEGER NOT NULL DEFAULT 0,
            files_analyzed INTEGER NOT NULL DEFAULT 0,
            files_failed INTEGER NOT NULL DEFAULT 0,
            pois_extracted INTEGER NOT NULL DEFAULT 0,
            evidence_rows INTEGER NOT NULL DEFAULT 0,
            relationships_accepted INTEGER NOT NULL DEFAULT 0,
            dead_letter_jobs INTEGER NOT NULL DEFAULT 0,
            started_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            finished_at TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
