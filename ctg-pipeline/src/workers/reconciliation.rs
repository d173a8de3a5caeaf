//! Reconciliation worker
//!
//! Triangulates all evidence for a (from, to, type) key into one
//! accept/reject decision. The combiner is a noisy-OR over distinct
//! sources: independent agreeing scopes reinforce monotonically while a
//! single weak source stays weak. Promotion upserts the accepted
//! relationship and emits the graph-builder event in the same transaction.

use crate::broker::{names, DeadLetterSink, JobEnvelope};
use crate::error::JobError;
use crate::workers::{CandidateKey, JobHandler};
use async_trait::async_trait;
use ctg_common::db::models::{EvidenceRecord, EvidenceSource};
use ctg_common::db::{evidence, outbox, relationships};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Evidence weight per analysis scope. Ordering is what matters;
/// the exact values are tuning constants.
pub fn source_weight(source: EvidenceSource) -> f64 {
    match source {
        EvidenceSource::Deterministic => 1.0,
        EvidenceSource::IntraFile => 0.7,
        EvidenceSource::IntraDirectory => 0.5,
        EvidenceSource::Global => 0.4,
    }
}

/// Minimum combined confidence that accepts a single-source relationship.
pub const ACCEPT_CONFIDENCE: f64 = 0.85;

/// Outcome of combining one key's evidence
#[derive(Debug, Clone)]
pub struct Triangulation {
    pub confidence: f64,
    pub distinct_sources: usize,
    pub has_deterministic: bool,
    pub sources: Vec<&'static str>,
}

impl Triangulation {
    /// Acceptance rule: two agreeing scopes, or deterministic evidence, or
    /// a high combined confidence.
    pub fn accepted(&self) -> bool {
        self.distinct_sources >= 2 || self.has_deterministic || self.confidence >= ACCEPT_CONFIDENCE
    }
}

/// Noisy-OR combination over the max confidence of each distinct source:
/// `C = 1 − Π_s (1 − w_s · c_s)`.
pub fn triangulate(rows: &[EvidenceRecord]) -> Triangulation {
    let mut best: HashMap<EvidenceSource, f64> = HashMap::new();
    for row in rows {
        let entry = best.entry(row.evidence_source).or_insert(0.0);
        if row.confidence > *entry {
            *entry = row.confidence;
        }
    }

    let mut miss_product = 1.0;
    for (source, confidence) in &best {
        miss_product *= 1.0 - source_weight(*source) * confidence;
    }

    let mut sources: Vec<&'static str> = best.keys().map(|s| s.as_str()).collect();
    sources.sort_unstable();

    Triangulation {
        confidence: 1.0 - miss_product,
        distinct_sources: best.len(),
        has_deterministic: best.contains_key(&EvidenceSource::Deterministic),
        sources,
    }
}

#[derive(Debug, Deserialize)]
struct ReconcileData {
    run_id: Uuid,
    keys: Vec<CandidateKey>,
}

/// Dependencies of the reconciliation worker
pub struct ReconciliationWorker {
    pub db: SqlitePool,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

#[async_trait]
impl JobHandler for ReconciliationWorker {
    async fn handle(&self, job: &JobEnvelope) -> Result<(), JobError> {
        let data: ReconcileData = serde_json::from_value(job.data().clone())?;

        for key in &data.keys {
            let rows = evidence::load_for_key(
                &self.db,
                &key.from_poi_id,
                &key.to_poi_id,
                &key.relationship_type,
            )
            .await?;

            if rows.is_empty() {
                // A reconciliation event without evidence breaks the write
                // ordering contract; record it, keep the worker alive
                warn!(
                    from = %key.from_poi_id,
                    to = %key.to_poi_id,
                    kind = %key.relationship_type,
                    "Reconciliation key has no evidence rows"
                );
                self.dead_letters
                    .push_dead_letter(
                        names::RECONCILIATION,
                        &json!({"run_id": data.run_id, "key": key}),
                        "missing_evidence",
                    )
                    .await
                    .map_err(|e| JobError::retryable(format!("dead-letter push: {}", e)))?;
                continue;
            }

            let verdict = triangulate(&rows);
            if !verdict.accepted() {
                debug!(
                    from = %key.from_poi_id,
                    to = %key.to_poi_id,
                    kind = %key.relationship_type,
                    confidence = verdict.confidence,
                    sources = verdict.distinct_sources,
                    "Evidence did not triangulate, relationship rejected"
                );
                continue;
            }

            let metadata = json!({"sources": verdict.sources});

            // Promotion and its graph event commit atomically; replays
            // re-upsert the same row and re-emit an idempotent MERGE
            let mut tx = self
                .db
                .begin()
                .await
                .map_err(|e| JobError::retryable(format!("begin tx: {}", e)))?;

            relationships::upsert_accepted_tx(
                &mut tx,
                &key.from_poi_id,
                &key.to_poi_id,
                &key.relationship_type,
                verdict.confidence,
                Some(metadata.clone()),
            )
            .await?;

            outbox::insert_tx(
                &mut tx,
                "relationship-accepted",
                names::GRAPH_BUILD,
                &json!({
                    "event_type": "relationship-accepted",
                    "data": {
                        "run_id": data.run_id,
                        "relationship": {
                            "from_poi_id": key.from_poi_id,
                            "to_poi_id": key.to_poi_id,
                            "relationship_type": key.relationship_type,
                            "confidence_score": verdict.confidence,
                            "metadata": metadata,
                        }
                    }
                }),
            )
            .await?;

            tx.commit()
                .await
                .map_err(|e| JobError::retryable(format!("commit: {}", e)))?;

            info!(
                from = %key.from_poi_id,
                to = %key.to_poi_id,
                kind = %key.relationship_type,
                confidence = verdict.confidence,
                sources = ?verdict.sources,
                "Relationship accepted"
            );
        }

        Ok(())
    }
}
