//! Global resolution worker
//!
//! Judges hinted cross-directory pairs with the oracle and records
//! surviving relationships as global-scope evidence.

use crate::broker::{names, JobEnvelope};
use crate::error::JobError;
use crate::oracle::response;
use crate::oracle::{prompts, Oracle};
use crate::workers::file_analysis::map_oracle_error;
use crate::workers::validation::canonical_type;
use crate::workers::{dedup_keys, CandidateKey, JobHandler};
use async_trait::async_trait;
use ctg_common::db::models::{EvidenceSource, NewEvidence, PoiRecord};
use ctg_common::db::{evidence, outbox, pois};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct GlobalData {
    run_id: Uuid,
    pairs: Vec<PairRef>,
}

#[derive(Debug, Deserialize)]
struct PairRef {
    from_poi_id: String,
    to_poi_id: String,
}

/// Dependencies of the global resolution worker
pub struct GlobalResolutionWorker {
    pub db: SqlitePool,
    pub oracle: Arc<dyn Oracle>,
}

#[async_trait]
impl JobHandler for GlobalResolutionWorker {
    async fn handle(&self, job: &JobEnvelope) -> Result<(), JobError> {
        let data: GlobalData = serde_json::from_value(job.data().clone())?;

        let mut resolved: Vec<(PoiRecord, PoiRecord)> = Vec::new();
        for pair in &data.pairs {
            let from = pois::get(&self.db, &pair.from_poi_id).await?;
            let to = pois::get(&self.db, &pair.to_poi_id).await?;
            match (from, to) {
                (Some(from), Some(to)) => resolved.push((from, to)),
                _ => {
                    debug!(
                        from = %pair.from_poi_id,
                        to = %pair.to_poi_id,
                        "Skipping pair with missing POI"
                    );
                }
            }
        }

        if resolved.is_empty() {
            return Ok(());
        }

        let allowed: HashSet<&str> = resolved
            .iter()
            .flat_map(|(from, to)| [from.poi_id.as_str(), to.poi_id.as_str()])
            .collect();

        let request = prompts::global_resolution(&resolved);
        let body = self
            .oracle
            .call(&request)
            .await
            .map_err(map_oracle_error)?
            .body;

        let analysis = match response::parse_global_analysis(&body) {
            Ok(analysis) => analysis,
            Err(first_err) => {
                warn!(error = %first_err, "Global analysis failed schema, attempting corrective reparse");
                let corrected = prompts::with_corrective_suffix(&request);
                let body = self
                    .oracle
                    .call(&corrected)
                    .await
                    .map_err(map_oracle_error)?
                    .body;
                response::parse_global_analysis(&body).map_err(|err| {
                    JobError::fatal(format!("global analysis schema-invalid after reparse: {}", err))
                })?
            }
        };

        let mut rows: Vec<NewEvidence> = Vec::new();
        for relationship in &analysis.relationships {
            if !allowed.contains(relationship.from_poi_id.as_str())
                || !allowed.contains(relationship.to_poi_id.as_str())
            {
                continue;
            }
            rows.push(NewEvidence {
                from_poi_id: relationship.from_poi_id.clone(),
                to_poi_id: relationship.to_poi_id.clone(),
                relationship_type: canonical_type(&relationship.relationship_type),
                evidence_source: EvidenceSource::Global,
                confidence: relationship.confidence.clamp(0.0, 1.0),
                metadata: None,
            });
        }

        if rows.is_empty() {
            debug!(pairs = resolved.len(), "Oracle confirmed no global relationships");
            return Ok(());
        }

        let candidates = dedup_keys(
            rows.iter()
                .map(|row| CandidateKey {
                    from_poi_id: row.from_poi_id.clone(),
                    to_poi_id: row.to_poi_id.clone(),
                    relationship_type: row.relationship_type.clone(),
                })
                .collect(),
        );

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| JobError::retryable(format!("begin tx: {}", e)))?;
        for row in &rows {
            evidence::insert_tx(&mut tx, row).await?;
        }
        outbox::insert_tx(
            &mut tx,
            "relationship-candidates",
            names::RELATIONSHIP_VALIDATED,
            &json!({
                "event_type": "relationship-candidates",
                "data": {"run_id": data.run_id, "candidates": candidates}
            }),
        )
        .await?;
        tx.commit()
            .await
            .map_err(|e| JobError::retryable(format!("commit: {}", e)))?;

        info!(evidence = rows.len(), "Global relationships recorded");
        Ok(())
    }
}
