//! Pipeline run records
//!
//! A run row is the authoritative status record for one whole-tree sweep.
//! The CLI `status` and `stop` commands operate on these rows, so a running
//! pipeline polls its own row to observe stop requests.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Cancelling,
    Cancelled,
    Completed,
    CompletedWithFailures,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithFailures => "completed_with_failures",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "running" => Ok(RunStatus::Running),
            "cancelling" => Ok(RunStatus::Cancelling),
            "cancelled" => Ok(RunStatus::Cancelled),
            "completed" => Ok(RunStatus::Completed),
            "completed_with_failures" => Ok(RunStatus::CompletedWithFailures),
            "failed" => Ok(RunStatus::Failed),
            other => Err(Error::Lifecycle(format!("unknown run status: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled
                | RunStatus::Completed
                | RunStatus::CompletedWithFailures
                | RunStatus::Failed
        )
    }
}

/// Per-run counters persisted alongside the status record.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunMetrics {
    pub files_discovered: u64,
    pub files_analyzed: u64,
    pub files_failed: u64,
    pub pois_extracted: u64,
    pub evidence_rows: u64,
    pub relationships_accepted: u64,
    pub dead_letter_jobs: u64,
}

/// One pipeline run record
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub target_directory: String,
    pub phase: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub metrics: RunMetrics,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub async fn create_run(pool: &SqlitePool, run_id: Uuid, target_directory: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO pipeline_runs (run_id, target_directory, phase, status, started_at)
         VALUES (?, ?, 'starting', 'running', ?)",
    )
    .bind(run_id.to_string())
    .bind(target_directory)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_phase(pool: &SqlitePool, run_id: Uuid, phase: &str) -> Result<()> {
    sqlx::query("UPDATE pipeline_runs SET phase = ? WHERE run_id = ?")
        .bind(phase)
        .bind(run_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Ask a running pipeline to stop. Returns false when the run is not in a
/// stoppable state (already terminal or unknown).
pub async fn request_stop(pool: &SqlitePool, run_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE pipeline_runs SET status = 'cancelling'
         WHERE run_id = ? AND status = 'running'",
    )
    .bind(run_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn stop_requested(pool: &SqlitePool, run_id: Uuid) -> Result<bool> {
    let status: Option<(String,)> =
        sqlx::query_as("SELECT status FROM pipeline_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(pool)
            .await?;
    Ok(matches!(status, Some((s,)) if s == "cancelling"))
}

pub async fn update_metrics(pool: &SqlitePool, run_id: Uuid, metrics: &RunMetrics) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE pipeline_runs SET
            files_discovered = ?,
            files_analyzed = ?,
            files_failed = ?,
            pois_extracted = ?,
            evidence_rows = ?,
            relationships_accepted = ?,
            dead_letter_jobs = ?
        WHERE run_id = ?
        "#,
    )
    .bind(metrics.files_discovered as i64)
    .bind(metrics.files_analyzed as i64)
    .bind(metrics.files_failed as i64)
    .bind(metrics.pois_extracted as i64)
    .bind(metrics.evidence_rows as i64)
    .bind(metrics.relationships_accepted as i64)
    .bind(metrics.dead_letter_jobs as i64)
    .bind(run_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finish_run(
    pool: &SqlitePool,
    run_id: Uuid,
    status: RunStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE pipeline_runs SET status = ?, error = ?, finished_at = ? WHERE run_id = ?",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(Utc::now())
    .bind(run_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_run(pool: &SqlitePool, run_id: Uuid) -> Result<Option<PipelineRun>> {
    let row: Option<RunRow> = sqlx::query_as(
        r#"
        SELECT run_id, target_directory, phase, status, error,
               files_discovered, files_analyzed, files_failed, pois_extracted,
               evidence_rows, relationships_accepted, dead_letter_jobs,
               started_at, finished_at
        FROM pipeline_runs WHERE run_id = ?
        "#,
    )
    .bind(run_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(RunRow::into_run).transpose()
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    target_directory: String,
    phase: String,
    status: String,
    error: Option<String>,
    files_discovered: i64,
    files_analyzed: i64,
    files_failed: i64,
    pois_extracted: i64,
    evidence_rows: i64,
    relationships_accepted: i64,
    dead_letter_jobs: i64,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn into_run(self) -> Result<PipelineRun> {
        Ok(PipelineRun {
            run_id: Uuid::parse_str(&self.run_id)
                .map_err(|e| Error::Corrupt(format!("undecodable run_id: {}", e)))?,
            target_directory: self.target_directory,
            phase: self.phase,
            status: RunStatus::parse(&self.status)?,
            error: self.error,
            metrics: RunMetrics {
                files_discovered: self.files_discovered as u64,
                files_analyzed: self.files_analyzed as u64,
                files_failed: self.files_failed as u64,
                pois_extracted: self.pois_extracted as u64,
                evidence_rows: self.evidence_rows as u64,
                relationships_accepted: self.relationships_accepted as u64,
                dead_letter_jobs: self.dead_letter_jobs as u64,
            },
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}
