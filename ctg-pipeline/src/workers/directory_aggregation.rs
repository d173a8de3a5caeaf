//! Directory aggregation worker
//!
//! Coalesces per-directory POI sets. File analysis emits one aggregation
//! event per touched directory; this worker confirms the directory has
//! POIs worth resolving and schedules the directory-scope oracle pass.

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

#[derive(Debug, Deserialize)]
struct DirectoryData {
    run_id: Uuid,
    directory_path: String,
}

/// Dependencies of the directory aggregation worker
pub struct DirectoryAggregationWorker {
    pub db: SqlitePool,
}

#[async_trait]
impl JobHandler for DirectoryAggregationWorker {
    async fn handle(&self, job: &JobEnvelope) -> Result<(), JobError> {
        let data: DirectoryData = serde_json::from_value(job.data().clone())?;

        let poi_count = pois::load_by_directory(&self.db, &data.directory_path)
            .await?
            .len();
        if poi_count == 0 {
            debug!(directory = %data.directory_path, "No POIs aggregated, skipping");
            return Ok(());
        }

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| JobError::retryable(format!("begin tx: {}", e)))?;
        outbox::insert_tx(
            &mut tx,
            "directory-resolution",
            names::DIRECTORY_RESOLUTION,
            &json!({
                "event_type": "directory-resolution",
                "data": {"run_id": data.run_id, "directory_path": data.directory_path}
            }),
        )
        .await?;
        tx.commit()
            .await
            .map_err(|e| JobError::retryable(format!("commit: {}", e)))?;

        info!(directory = %data.directory_path, pois = poi_count, "Directory aggregated");
        Ok(())
    }
}
