//! Analysis batcher (discovery Phase B)
//!
//! Consumes discovered-file rows, reads contents, counts tokens, and packs
//! size-bounded batches. Each flushed batch commits its File rows and one
//! outbox event in a single transaction, after re-proving lease ownership
//! (check-on-write). On ownership loss the batcher aborts without emitting;
//! unacknowledged claims are redelivered to the surviving owner.

use crate::broker::{names, Broker, BrokerError, ClaimedJob, Lease};
use chrono::{DateTime, Utc};
use ctg_common::db::models::FileStatus;
use ctg_common::db::{files, outbox};
use ctg_common::events::{EventBus, PipelineEvent};
use serde_json::json;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Batcher errors
#[derive(Debug, Error)]
pub enum BatcherError {
    /// Lease ownership lost; no further batches may be emitted
    #[error("Discovery lease lost")]
    LeaseLost,

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] ctg_common::Error),
}

/// One file staged for batching
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub path: String,
    pub content_hash: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub tokens: usize,
}

/// A packed analysis batch
#[derive(Debug, Clone)]
pub struct AnalysisBatch {
    pub entries: Vec<BatchEntry>,
    pub tokens: usize,
}

/// Greedy size-bounded packer.
///
/// A batch flushes as soon as adding the next file would exceed the token
/// or file-count limit; the final partial batch flushes at drain.
pub struct BatchPacker {
    max_tokens: usize,
    max_files: usize,
    current: Vec<BatchEntry>,
    current_tokens: usize,
}

impl BatchPacker {
    pub fn new(max_tokens: usize, max_files: usize) -> Self {
        Self {
            max_tokens,
            max_files,
            current: Vec::new(),
            current_tokens: 0,
        }
    }

    /// Stage a file. Returns the previous batch when this file would have
    /// pushed it over a limit.
    pub fn push(&mut self, entry: BatchEntry) -> Option<AnalysisBatch> {
        let would_exceed = !self.current.is_empty()
            && (self.current_tokens + entry.tokens > self.max_tokens
                || self.current.len() + 1 > self.max_files);

        let flushed = if would_exceed { self.take_current() } else { None };

        self.current_tokens += entry.tokens;
        self.current.push(entry);
        flushed
    }

    /// Flush whatever remains. Called once when the discovery queue drains.
    pub fn finish(&mut self) -> Option<AnalysisBatch> {
        self.take_current()
    }

    pub fn staged_len(&self) -> usize {
        self.current.len()
    }

    fn take_current(&mut self) -> Option<AnalysisBatch> {
        if self.current.is_empty() {
            return None;
        }
        let entries = std::mem::take(&mut self.current);
        let tokens = self.current_tokens;
        self.current_tokens = 0;
        Some(AnalysisBatch { entries, tokens })
    }
}

/// Token estimate from byte length (≈4 bytes per token).
pub fn estimate_tokens(bytes: usize) -> usize {
    (bytes + 3) / 4
}

pub fn hash_content(content: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Phase B worker
pub struct Batcher {
    pub db: SqlitePool,
    pub broker: Arc<Broker>,
    pub lease: Lease,
    pub target_root: PathBuf,
    pub run_id: Uuid,
    pub max_batch_tokens: usize,
    pub max_batch_files: usize,
    pub event_bus: EventBus,
}

impl Batcher {
    /// Consume the `files-to-batch` queue until it drains after the walker
    /// finishes, emitting batches along the way.
    pub async fn run(
        &self,
        walker_done: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Result<(), BatcherError> {
        let mut packer = BatchPacker::new(self.max_batch_tokens, self.max_batch_files);
        let mut pending_claims: Vec<ClaimedJob> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                // Claims stay unacknowledged and will be redelivered
                info!("Batcher cancelled with {} staged files", packer.staged_len());
                return Ok(());
            }

            let job = match self.broker.pop(names::FILES_TO_BATCH).await {
                Ok(job) => job,
                Err(BrokerError::CircuitOpen) => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "Batcher failed to poll discovery queue");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let job = match job {
                Some(job) => job,
                None => {
                    if *walker_done.borrow() {
                        if let Some(batch) = packer.finish() {
                            let claims = std::mem::take(&mut pending_claims);
                            self.emit_batch(batch, claims).await?;
                        }
                        debug!("Discovery queue drained, batcher exiting");
                        return Ok(());
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            };

            let path = match job.envelope.data().get("path").and_then(|v| v.as_str()) {
                Some(path) => path.to_string(),
                None => {
                    self.broker
                        .dead_letter(names::FILES_TO_BATCH, &job, "missing path in discovery payload")
                        .await?;
                    continue;
                }
            };

            let absolute = self.target_root.join(&path);
            let content = match tokio::fs::read(&absolute).await {
                Ok(content) => content,
                Err(err) => {
                    // File vanished between walk and read; not a batch failure
                    warn!(path = %path, error = %err, "Skipping unreadable file");
                    self.broker.ack(names::FILES_TO_BATCH, &job).await?;
                    continue;
                }
            };

            let last_modified = tokio::fs::metadata(&absolute)
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);

            let entry = BatchEntry {
                path,
                content_hash: hash_content(&content),
                last_modified,
                tokens: estimate_tokens(content.len()),
            };

            if let Some(batch) = packer.push(entry) {
                let claims = std::mem::take(&mut pending_claims);
                self.emit_batch(batch, claims).await?;
            }
            pending_claims.push(job);
        }
    }

    /// Commit one batch: File rows plus the outbox event, atomically, then
    /// acknowledge the claims it covers.
    async fn emit_batch(
        &self,
        batch: AnalysisBatch,
        claims: Vec<ClaimedJob>,
    ) -> Result<(), BatcherError> {
        // Check-on-write: prove ownership immediately before the emission
        if !self.broker.verify_lease(&self.lease).await? {
            warn!(lease = %self.lease.key, "Lease ownership lost, aborting batch emission");
            return Err(BatcherError::LeaseLost);
        }

        let batch_id = Uuid::new_v4();
        let mut tx = self.db.begin().await.map_err(ctg_common::Error::from)?;

        let mut file_refs = Vec::with_capacity(batch.entries.len());
        for entry in &batch.entries {
            let file_id = files::upsert_file(
                &mut tx,
                &entry.path,
                &entry.content_hash,
                entry.last_modified,
                FileStatus::Analyzing,
            )
            .await?;
            file_refs.push(json!({"file_id": file_id, "path": entry.path}));
        }

        outbox::insert_tx(
            &mut tx,
            "file-batch",
            names::FILE_ANALYSIS,
            &json!({
                "event_type": "file-batch",
                "data": {
                    "run_id": self.run_id,
                    "batch_id": batch_id,
                    "files": file_refs,
                }
            }),
        )
        .await?;

        tx.commit().await.map_err(ctg_common::Error::from)?;

        for claim in &claims {
            self.broker.ack(names::FILES_TO_BATCH, claim).await?;
        }

        info!(
            batch_id = %batch_id,
            files = batch.entries.len(),
            tokens = batch.tokens,
            "Emitted analysis batch"
        );
        self.event_bus.emit_lossy(PipelineEvent::BatchQueued {
            run_id: self.run_id,
            batch_id,
            file_count: batch.entries.len(),
            token_estimate: batch.tokens,
        });

        Ok(())
    }
}
