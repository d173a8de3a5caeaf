//! Relationship resolution worker (global-scope hint sampler)
//!
//! Surfaces cross-directory POI pairs worth asking the oracle about. Hints
//! are exact name matches between a directory's POIs and POIs elsewhere in
//! the tree; sampled pairs are handed to the global resolution worker,
//! which owns the oracle call.

use crate::broker::{names, JobEnvelope};
use crate::error::JobError;
use crate::workers::JobHandler;
use async_trait::async_trait;
use ctg_common::db::{outbox, pois};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

/// Cap on pairs per global job; keeps oracle prompts bounded.
const MAX_PAIRS_PER_JOB: usize = 40;

#[derive(Debug, Deserialize)]
struct ResolutionData {
    run_id: Uuid,
    directory_path: String,
}

/// Dependencies of the relationship resolution worker
pub struct RelationshipResolutionWorker {
    pub db: SqlitePool,
}

#[async_trait]
impl JobHandler for RelationshipResolutionWorker {
    async fn handle(&self, job: &JobEnvelope) -> Result<(), JobError> {
        let data: ResolutionData = serde_json::from_value(job.data().clone())?;

        let local = pois::load_by_directory(&self.db, &data.directory_path).await?;
        if local.is_empty() {
            return Ok(());
        }
        let all = pois::load_all(&self.db).await?;

        // Hint: identical names across directory boundaries suggest a
        // reference worth judging at global scope
        let mut pairs: Vec<(String, String)> = Vec::new();
        for poi in &local {
            if poi.poi_type == "file" {
                continue;
            }
            for other in &all {
                if other.directory_path == data.directory_path {
                    continue;
                }
                if other.name == poi.name && other.poi_id != poi.poi_id {
                    pairs.push((poi.poi_id.clone(), other.poi_id.clone()));
                    if pairs.len() >= MAX_PAIRS_PER_JOB {
                        break;
                    }
                }
            }
            if pairs.len() >= MAX_PAIRS_PER_JOB {
                break;
            }
        }

        if pairs.is_empty() {
            debug!(directory = %data.directory_path, "No cross-directory hints surfaced");
            return Ok(());
        }

        // Deterministic ordering keeps replayed events payload-identical
        pairs.sort();
        pairs.dedup();

        let pair_refs: Vec<serde_json::Value> = pairs
            .iter()
            .map(|(from, to)| json!({"from_poi_id": from, "to_poi_id": to}))
            .collect();

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| JobError::retryable(format!("begin tx: {}", e)))?;
        outbox::insert_tx(
            &mut tx,
            "global-resolution",
            names::GLOBAL_RESOLUTION,
            &json!({
                "event_type": "global-resolution",
                "data": {"run_id": data.run_id, "pairs": pair_refs}
            }),
        )
        .await?;
        tx.commit()
            .await
            .map_err(|e| JobError::retryable(format!("commit: {}", e)))?;

        info!(
            directory = %data.directory_path,
            pairs = pairs.len(),
            "Cross-directory hints scheduled for global resolution"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctg_common::db::init::create_schema;
    use ctg_common::db::models::{derive_poi_id, FileStatus, NewPoi};
    use ctg_common::db::files;

    async fn seed_poi(pool: &SqlitePool, path: &str, name: &str, poi_type: &str) -> String {
        let mut tx = pool.begin().await.unwrap();
        let file_id = files::upsert_file(&mut tx, path, "h", None, FileStatus::Analyzed)
            .await
            .unwrap();
        let poi_id = derive_poi_id(path, poi_type, name, 1);
        pois::upsert_pois(
            &mut tx,
            &[NewPoi {
                poi_id: poi_id.clone(),
                file_id,
                poi_type: poi_type.to_string(),
                name: name.to_string(),
                file_path: path.to_string(),
                start_line: 1,
                end_line: 2,
                metadata: None,
            }],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        poi_id
    }

    fn envelope(directory: &str) -> JobEnvelope {
        JobEnvelope::new(json!({
            "event_type": "relationship-resolution",
            "data": {"run_id": Uuid::new_v4(), "directory_path": directory}
        }))
    }

    #[tokio::test]
    async fn test_name_match_across_directories_surfaces_pair() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();

        let a = seed_poi(&pool, "src/api/handler.js", "process", "function").await;
        let b = seed_poi(&pool, "src/core/engine.js", "process", "function").await;
        seed_poi(&pool, "src/core/other.js", "unrelated", "function").await;

        let worker = RelationshipResolutionWorker { db: pool.clone() };
        worker.handle(&envelope("src/api")).await.unwrap();

        let pending = outbox::fetch_pending(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].queue_name, names::GLOBAL_RESOLUTION);
        let payload: serde_json::Value = serde_json::from_str(&pending[0].payload).unwrap();
        let pairs = payload["data"]["pairs"].as_array().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0]["from_poi_id"], a);
        assert_eq!(pairs[0]["to_poi_id"], b);
    }

    #[tokio::test]
    async fn test_no_hints_no_event() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();

        seed_poi(&pool, "src/api/handler.js", "alpha", "function").await;
        seed_poi(&pool, "src/core/engine.js", "beta", "function").await;

        let worker = RelationshipResolutionWorker { db: pool.clone() };
        worker.handle(&envelope("src/api")).await.unwrap();

        assert!(outbox::fetch_pending(&pool, 10).await.unwrap().is_empty());
    }
}
