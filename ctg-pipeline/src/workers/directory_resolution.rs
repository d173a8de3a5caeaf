//! Directory resolution worker
//!
//! Sends a directory's aggregated POI set to the oracle for
//! directory-scope relationships and a summary. Idempotency is keyed on
//! the directory path: a summary row already present for this run means a
//! replayed event was already processed.

use crate::broker::{names, JobEnvelope};
use crate::error::JobError;
use crate::oracle::response;
use crate::oracle::{prompts, Oracle};
use crate::workers::file_analysis::map_oracle_error;
use crate::workers::validation::canonical_type;
use crate::workers::{dedup_keys, CandidateKey, JobHandler};
use async_trait::async_trait;
use ctg_common::db::models::{EvidenceSource, NewEvidence};
use ctg_common::db::{directories, evidence, outbox, pois};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct DirectoryData {
    run_id: Uuid,
    directory_path: String,
}

/// Dependencies of the directory resolution worker
pub struct DirectoryResolutionWorker {
    pub db: SqlitePool,
    pub oracle: Arc<dyn Oracle>,
}

#[async_trait]
impl JobHandler for DirectoryResolutionWorker {
    async fn handle(&self, job: &JobEnvelope) -> Result<(), JobError> {
        let data: DirectoryData = serde_json::from_value(job.data().clone())?;

        // Replay guard: runs start against cleared stores, so an existing
        // summary means this directory was already resolved
        if directories::get_summary(&self.db, &data.directory_path)
            .await?
            .is_some()
        {
            debug!(directory = %data.directory_path, "Directory already resolved, acknowledging replay");
            return Ok(());
        }

        let poi_set = pois::load_by_directory(&self.db, &data.directory_path).await?;
        if poi_set.is_empty() {
            debug!(directory = %data.directory_path, "Directory has no POIs, nothing to resolve");
            return Ok(());
        }

        let known_ids: HashSet<&str> = poi_set.iter().map(|p| p.poi_id.as_str()).collect();

        // Oracle call happens outside any transaction
        let request = prompts::directory_resolution(&data.directory_path, &poi_set);
        let body = self
            .oracle
            .call(&request)
            .await
            .map_err(map_oracle_error)?
            .body;

        let analysis = match response::parse_directory_analysis(&body) {
            Ok(analysis) => analysis,
            Err(first_err) => {
                warn!(error = %first_err, "Directory analysis failed schema, attempting corrective reparse");
                let corrected = prompts::with_corrective_suffix(&request);
                let body = self
                    .oracle
                    .call(&corrected)
                    .await
                    .map_err(map_oracle_error)?
                    .body;
                response::parse_directory_analysis(&body).map_err(|err| {
                    JobError::fatal(format!("directory analysis schema-invalid after reparse: {}", err))
                })?
            }
        };

        let mut rows: Vec<NewEvidence> = Vec::new();
        for relationship in &analysis.relationships {
            if !known_ids.contains(relationship.from_poi_id.as_str())
                || !known_ids.contains(relationship.to_poi_id.as_str())
            {
                debug!(
                    from = %relationship.from_poi_id,
                    to = %relationship.to_poi_id,
                    "Skipping directory relationship with invented poi id"
                );
                continue;
            }
            rows.push(NewEvidence {
                from_poi_id: relationship.from_poi_id.clone(),
                to_poi_id: relationship.to_poi_id.clone(),
                relationship_type: canonical_type(&relationship.relationship_type),
                evidence_source: EvidenceSource::IntraDirectory,
                confidence: relationship.confidence.clamp(0.0, 1.0),
                metadata: Some(json!({"directory_path": data.directory_path})),
            });
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

        let summary = if analysis.summary.is_empty() {
            format!("Directory {} ({} POIs)", data.directory_path, poi_set.len())
        } else {
            analysis.summary.clone()
        };

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| JobError::retryable(format!("begin tx: {}", e)))?;

        for row in &rows {
            evidence::insert_tx(&mut tx, row).await?;
        }

        // Summary row doubles as the idempotency marker
        sqlx::query(
            r#"
            INSERT INTO directory_summaries (directory_path, summary, metadata)
            VALUES (?, ?, ?)
            ON CONFLICT(directory_path) DO UPDATE SET
                summary = excluded.summary,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&data.directory_path)
        .bind(&summary)
        .bind(serde_json::to_string(&json!({"run_id": data.run_id})).ok())
        .execute(&mut *tx)
        .await
        .map_err(|e| JobError::retryable(format!("summary upsert: {}", e)))?;

        if !candidates.is_empty() {
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
        }

        // Seed global-scope inference for this directory's exports
        outbox::insert_tx(
            &mut tx,
            "relationship-resolution",
            names::RELATIONSHIP_RESOLUTION,
            &json!({
                "event_type": "relationship-resolution",
                "data": {"run_id": data.run_id, "directory_path": data.directory_path}
            }),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| JobError::retryable(format!("commit: {}", e)))?;

        info!(
            directory = %data.directory_path,
            evidence = rows.len(),
            "Directory resolved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{OracleError, OracleRequest, OracleResponse, OracleUsage};
    use ctg_common::db::init::create_schema;
    use ctg_common::db::models::{derive_poi_id, FileStatus, NewPoi};
    use ctg_common::db::files;
    use std::sync::Mutex;

    struct MockOracle {
        responses: Mutex<Vec<String>>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Oracle for MockOracle {
        async fn call(&self, _request: &OracleRequest) -> Result<OracleResponse, OracleError> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(OracleError::Network("no scripted response".into()));
            }
            Ok(OracleResponse {
                body: responses.remove(0),
                usage: OracleUsage::default(),
            })
        }
    }

    async fn seed_directory(pool: &SqlitePool) -> (String, String) {
        let mut tx = pool.begin().await.unwrap();
        let a_file = files::upsert_file(&mut tx, "src/a.js", "h", None, FileStatus::Analyzed)
            .await
            .unwrap();
        let b_file = files::upsert_file(&mut tx, "src/b.js", "h", None, FileStatus::Analyzed)
            .await
            .unwrap();
        let a = derive_poi_id("src/a.js", "function", "main", 1);
        let b = derive_poi_id("src/b.js", "function", "helper", 1);
        pois::upsert_pois(
            &mut tx,
            &[
                NewPoi {
                    poi_id: a.clone(),
                    file_id: a_file,
                    poi_type: "function".to_string(),
                    name: "main".to_string(),
                    file_path: "src/a.js".to_string(),
                    start_line: 1,
                    end_line: 2,
                    metadata: None,
                },
                NewPoi {
                    poi_id: b.clone(),
                    file_id: b_file,
                    poi_type: "function".to_string(),
                    name: "helper".to_string(),
                    file_path: "src/b.js".to_string(),
                    start_line: 1,
                    end_line: 2,
                    metadata: None,
                },
            ],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        (a, b)
    }

    fn envelope(directory: &str) -> JobEnvelope {
        JobEnvelope::new(json!({
            "event_type": "directory-resolution",
            "data": {"run_id": Uuid::new_v4(), "directory_path": directory}
        }))
    }

    #[tokio::test]
    async fn test_resolution_writes_evidence_summary_and_events() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        let (a, b) = seed_directory(&pool).await;

        let body = json!({
            "summary": "entry point and its helper",
            "relationships": [
                {"from_poi_id": a, "to_poi_id": b, "type": "calls", "confidence": 0.8},
                {"from_poi_id": a, "to_poi_id": "invented", "type": "calls", "confidence": 0.9}
            ]
        })
        .to_string();

        let worker = DirectoryResolutionWorker {
            db: pool.clone(),
            oracle: Arc::new(MockOracle {
                responses: Mutex::new(vec![body]),
                calls: Mutex::new(0),
            }),
        };

        worker.handle(&envelope("src")).await.unwrap();

        // Only the relationship between known ids is recorded
        assert_eq!(evidence::count(&pool).await.unwrap(), 1);
        assert_eq!(
            directories::get_summary(&pool, "src").await.unwrap().as_deref(),
            Some("entry point and its helper")
        );

        let pending = outbox::fetch_pending(&pool, 10).await.unwrap();
        let queues: Vec<&str> = pending.iter().map(|e| e.queue_name.as_str()).collect();
        assert!(queues.contains(&names::RELATIONSHIP_VALIDATED));
        assert!(queues.contains(&names::RELATIONSHIP_RESOLUTION));
    }

    #[tokio::test]
    async fn test_replay_skips_oracle() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        seed_directory(&pool).await;

        let oracle = Arc::new(MockOracle {
            responses: Mutex::new(vec![json!({"summary": "s", "relationships": []}).to_string()]),
            calls: Mutex::new(0),
        });
        let worker = DirectoryResolutionWorker {
            db: pool.clone(),
            oracle: oracle.clone(),
        };

        let event = envelope("src");
        worker.handle(&event).await.unwrap();
        worker.handle(&event).await.unwrap();

        assert_eq!(*oracle.calls.lock().unwrap(), 1, "replay must not re-call the oracle");
    }
}
