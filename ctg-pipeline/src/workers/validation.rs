//! Validation worker
//!
//! Consumes candidate relationship keys from both producer queues
//! (`analysis-findings-queue` and `relationship-validated-queue`),
//! normalizes relationship types, verifies both endpoints exist, drops
//! self-loops for non-reflexive types, and forwards surviving groups to
//! `reconciliation-queue`. Dropped rows are recorded on `failed-jobs`
//! while the surrounding job is still acknowledged.

use crate::broker::{names, DeadLetterSink, JobEnvelope};
use crate::error::JobError;
use crate::workers::{dedup_keys, CandidateKey, JobHandler};
use async_trait::async_trait;
use ctg_common::db::models::FileStatus;
use ctg_common::db::{files, outbox, pois};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lowercase and fold synonyms onto the canonical relationship vocabulary.
/// Evidence writers apply the same canonicalization, so validation here is
/// idempotent over already-normalized keys.
pub fn canonical_type(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    match lowered.as_str() {
        "call" | "calls" | "invoke" | "invokes" => "calls".to_string(),
        "import" | "imports" | "require" | "requires" => "imports".to_string(),
        "reference" | "references" | "use" | "uses" => "references".to_string(),
        "contain" | "contains" | "has" => "contains".to_string(),
        "extend" | "extends" | "inherit" | "inherits" => "extends".to_string(),
        "implement" | "implements" => "implements".to_string(),
        other => other.to_string(),
    }
}

/// Self-loops are dropped except for types where they are meaningful.
pub fn reflexive_permitted(relationship_type: &str) -> bool {
    relationship_type == "contains"
}

#[derive(Debug, Deserialize)]
struct CandidatesData {
    run_id: Uuid,
    candidates: Vec<CandidateKey>,
}

/// Dependencies of the validation worker
pub struct ValidationWorker {
    pub db: SqlitePool,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

#[async_trait]
impl JobHandler for ValidationWorker {
    async fn handle(&self, job: &JobEnvelope) -> Result<(), JobError> {
        let data: CandidatesData = serde_json::from_value(job.data().clone())?;

        let mut survivors: Vec<CandidateKey> = Vec::new();
        let mut missing: Vec<CandidateKey> = Vec::new();
        for raw in dedup_keys(data.candidates) {
            let key = CandidateKey {
                relationship_type: canonical_type(&raw.relationship_type),
                ..raw
            };

            if key.from_poi_id == key.to_poi_id && !reflexive_permitted(&key.relationship_type) {
                debug!(poi = %key.from_poi_id, kind = %key.relationship_type, "Dropping self-loop candidate");
                continue;
            }

            let from_exists = pois::exists(&self.db, &key.from_poi_id).await?;
            let to_exists = pois::exists(&self.db, &key.to_poi_id).await?;
            if from_exists && to_exists {
                survivors.push(key);
            } else {
                missing.push(key);
            }
        }

        if !missing.is_empty() {
            // An endpoint may simply not be analyzed yet; only once every
            // file has reached a terminal state is a missing POI genuinely
            // unknown. Retrying before any drop keeps the dead-letter queue
            // free of duplicates across attempts.
            let still_analyzing = files::count_by_status(&self.db, FileStatus::Discovered).await?
                + files::count_by_status(&self.db, FileStatus::Analyzing).await?;
            if still_analyzing > 0 {
                return Err(JobError::retryable(format!(
                    "{} candidate endpoints not yet present with {} files unprocessed",
                    missing.len(),
                    still_analyzing
                )));
            }

            for key in &missing {
                warn!(
                    from = %key.from_poi_id,
                    to = %key.to_poi_id,
                    kind = %key.relationship_type,
                    "Dropping candidate with unknown endpoint"
                );
                self.dead_letters
                    .push_dead_letter(
                        names::RELATIONSHIP_VALIDATED,
                        &json!({
                            "run_id": data.run_id,
                            "candidate": key,
                        }),
                        "unknown_endpoint",
                    )
                    .await
                    .map_err(|e| JobError::retryable(format!("dead-letter push: {}", e)))?;
            }
        }

        if survivors.is_empty() {
            return Ok(());
        }

        // The reconciliation event rides the outbox, so it is ordered after
        // every evidence write that produced these keys
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| JobError::retryable(format!("begin tx: {}", e)))?;
        outbox::insert_tx(
            &mut tx,
            "reconcile-keys",
            names::RECONCILIATION,
            &json!({
                "event_type": "reconcile-keys",
                "data": {"run_id": data.run_id, "keys": survivors}
            }),
        )
        .await?;
        tx.commit()
            .await
            .map_err(|e| JobError::retryable(format!("commit: {}", e)))?;

        info!(keys = survivors.len(), "Validated candidate group forwarded");
        Ok(())
    }
}
