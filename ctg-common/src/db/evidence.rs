//! Relationship evidence access
//!
//! Evidence is append-only: rows are inserted by analysis workers and read
//! by reconciliation, never updated or deleted within a run.

use crate::db::models::{EvidenceRecord, EvidenceSource, NewEvidence};
use crate::Result;
use chrono::Utc;
use sqlx::SqlitePool;

/// Insert an evidence row inside the caller's transaction.
pub async fn insert_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    evidence: &NewEvidence,
) -> Result<i64> {
    let metadata = evidence
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO relationship_evidence
            (from_poi_id, to_poi_id, relationship_type, evidence_source, confidence,
             metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&evidence.from_poi_id)
    .bind(&evidence.to_poi_id)
    .bind(&evidence.relationship_type)
    .bind(evidence.evidence_source.as_str())
    .bind(evidence.confidence)
    .bind(metadata)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;

    Ok(id)
}

/// All evidence for one (from, to, type) key, oldest first.
pub async fn load_for_key(
    pool: &SqlitePool,
    from_poi_id: &str,
    to_poi_id: &str,
    relationship_type: &str,
) -> Result<Vec<EvidenceRecord>> {
    let rows: Vec<EvidenceRow> = sqlx::query_as(
        r#"
        SELECT id, from_poi_id, to_poi_id, relationship_type, evidence_source,
               confidence, metadata, created_at
        FROM relationship_evidence
        WHERE from_poi_id = ? AND to_poi_id = ? AND relationship_type = ?
        ORDER BY id
        "#,
    )
    .bind(from_poi_id)
    .bind(to_poi_id)
    .bind(relationship_type)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(EvidenceRow::into_record).collect()
}

/// Count of evidence rows for a key; reconciliation uses this to assert
/// invariant coverage, tests use it for setup checks.
pub async fn count_for_key(
    pool: &SqlitePool,
    from_poi_id: &str,
    to_poi_id: &str,
    relationship_type: &str,
) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM relationship_evidence
         WHERE from_poi_id = ? AND to_poi_id = ? AND relationship_type = ?",
    )
    .bind(from_poi_id)
    .bind(to_poi_id)
    .bind(relationship_type)
    .fetch_one(pool)
    .await?;
    Ok(count as u64)
}

pub async fn count(pool: &SqlitePool) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM relationship_evidence")
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

#[derive(sqlx::FromRow)]
struct EvidenceRow {
    id: i64,
    from_poi_id: String,
    to_poi_id: String,
    relationship_type: String,
    evidence_source: String,
    confidence: f64,
    metadata: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl EvidenceRow {
    fn into_record(self) -> Result<EvidenceRecord> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(EvidenceRecord {
            id: self.id,
            from_poi_id: self.from_poi_id,
            to_poi_id: self.to_poi_id,
            relationship_type: self.relationship_type,
            evidence_source: EvidenceSource::parse(&self.evidence_source)?,
            confidence: self.confidence,
            metadata,
            created_at: self.created_at,
        })
    }
}
