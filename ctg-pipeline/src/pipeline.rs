//! Pipeline orchestration
//!
//! Owns a whole-tree sweep end to end: clears run-scoped state, elects the
//! discovery lease, runs the two discovery phases, spawns the outbox
//! publisher and every worker pool, then waits for the queues to drain and
//! records the terminal run status. Active runs live in a single owned
//! registry actor; all mutations go through its command channel so status
//! snapshots observe consistent state.

use crate::broker::{names, Broker, BrokerError, Lease};
use crate::graph::GraphSink;
use crate::ingest::walker::ScanError;
use crate::ingest::{Batcher, SourceWalker};
use crate::ingest::batcher::BatcherError;
use crate::oracle::Oracle;
use crate::outbox_publisher::OutboxPublisher;
use crate::workers::directory_aggregation::DirectoryAggregationWorker;
use crate::workers::directory_resolution::DirectoryResolutionWorker;
use crate::workers::file_analysis::FileAnalysisWorker;
use crate::workers::global_resolution::GlobalResolutionWorker;
use crate::workers::graph_build::GraphBuildWorker;
use crate::workers::reconciliation::ReconciliationWorker;
use crate::workers::relationship_resolution::RelationshipResolutionWorker;
use crate::workers::validation::ValidationWorker;
use crate::workers::WorkerRegistry;
use crate::error::RetryPolicy;
use chrono::Utc;
use ctg_common::config::AppConfig;
use ctg_common::db::runs::{self, RunMetrics, RunStatus};
use ctg_common::db::{directories, evidence, files, outbox, pois, relationships};
use ctg_common::db::models::FileStatus;
use ctg_common::events::{EventBus, PipelineEvent};
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Queue depth above which upstream producers pause enqueues.
const QUEUE_HIGH_WATER: u64 = 1_000;
/// Discovery lease TTL; heartbeats renew at a third of this.
const DISCOVERY_LEASE_TTL_MS: u64 = 30_000;
/// Consecutive empty polls required before the run counts as drained.
const DRAIN_CONFIRMATIONS: u32 = 3;
const DRAIN_POLL: Duration = Duration::from_millis(500);
/// Redelivery window for jobs whose consumer died mid-claim.
const VISIBILITY_TIMEOUT_MS: u64 = 300_000;

/// Pipeline orchestration errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] ctg_common::Error),

    #[error("Discovery error: {0}")]
    Scan(#[from] ScanError),

    #[error("Batcher error: {0}")]
    Batcher(#[from] BatcherError),

    #[error("Discovery lease for {0} is held by another sweep")]
    LeaseUnavailable(String),
}

/// Shared collaborators of one pipeline process
pub struct PipelineDeps {
    pub config: AppConfig,
    pub db: SqlitePool,
    pub broker: Arc<Broker>,
    pub oracle: Arc<dyn Oracle>,
    pub graph: Arc<dyn GraphSink>,
    pub event_bus: EventBus,
}

/// Visibility timeout used when connecting the broker for pipeline work.
pub fn visibility_timeout_ms() -> u64 {
    VISIBILITY_TIMEOUT_MS
}

enum RegistryCommand {
    Register {
        run_id: Uuid,
        cancel: CancellationToken,
    },
    Deregister {
        run_id: Uuid,
    },
    Stop {
        run_id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Uuid>>,
    },
}

/// Handle to the single owned registry of active runs.
#[derive(Clone)]
pub struct PipelineRegistry {
    tx: mpsc::Sender<RegistryCommand>,
}

impl PipelineRegistry {
    /// Spawn the registry actor. All run bookkeeping lives inside the
    /// actor task; callers only hold the command channel.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<RegistryCommand>(32);
        tokio::spawn(async move {
            let mut active: HashMap<Uuid, CancellationToken> = HashMap::new();
            while let Some(command) = rx.recv().await {
                match command {
                    RegistryCommand::Register { run_id, cancel } => {
                        active.insert(run_id, cancel);
                    }
                    RegistryCommand::Deregister { run_id } => {
                        active.remove(&run_id);
                    }
                    RegistryCommand::Stop { run_id, reply } => {
                        let found = match active.get(&run_id) {
                            Some(cancel) => {
                                cancel.cancel();
                                true
                            }
                            None => false,
                        };
                        let _ = reply.send(found);
                    }
                    RegistryCommand::Snapshot { reply } => {
                        let _ = reply.send(active.keys().copied().collect());
                    }
                }
            }
        });
        Self { tx }
    }

    pub async fn register(&self, run_id: Uuid, cancel: CancellationToken) {
        let _ = self
            .tx
            .send(RegistryCommand::Register { run_id, cancel })
            .await;
    }

    pub async fn deregister(&self, run_id: Uuid) {
        let _ = self.tx.send(RegistryCommand::Deregister { run_id }).await;
    }

    /// Cancel a registered run. False when the run is not active in this
    /// process.
    pub async fn stop(&self, run_id: Uuid) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RegistryCommand::Stop { run_id, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn snapshot(&self) -> Vec<Uuid> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryCommand::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Delete all run-scoped relational state. The outbox goes too: a run is a
/// whole-tree sweep against cleared stores.
pub async fn clear_run_state(db: &SqlitePool) -> Result<(), ctg_common::Error> {
    for table in [
        "relationship_evidence",
        "relationships",
        "pois",
        "files",
        "directory_summaries",
        "outbox",
    ] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(db)
            .await?;
    }
    Ok(())
}

/// Execute one whole-tree sweep. Returns the terminal run status.
pub async fn run_pipeline(
    deps: &PipelineDeps,
    registry: &PipelineRegistry,
    run_id: Uuid,
) -> Result<RunStatus, PipelineError> {
    let target = deps.config.target_directory.clone();
    let target_display = target.display().to_string();

    // Fresh sweep: purge broker queues and run-scoped tables
    deps.broker.purge().await?;
    clear_run_state(&deps.db).await?;
    runs::create_run(&deps.db, run_id, &target_display).await?;

    let cancel = CancellationToken::new();
    registry.register(run_id, cancel.clone()).await;

    deps.event_bus.emit_lossy(PipelineEvent::RunStarted {
        run_id,
        target_directory: target_display.clone(),
        timestamp: Utc::now(),
    });

    let result = drive_run(deps, run_id, &cancel).await;

    let status = match result {
        Ok(status) => status,
        Err(err) => {
            warn!(run_id = %run_id, error = %err, "Pipeline run failed");
            runs::finish_run(&deps.db, run_id, RunStatus::Failed, Some(&err.to_string())).await?;
            cancel.cancel();
            registry.deregister(run_id).await;
            return Err(err);
        }
    };

    cancel.cancel();
    registry.deregister(run_id).await;
    Ok(status)
}

async fn drive_run(
    deps: &PipelineDeps,
    run_id: Uuid,
    cancel: &CancellationToken,
) -> Result<RunStatus, PipelineError> {
    let config = &deps.config;
    let target = config.target_directory.clone();

    // Single-sweep guarantee: the walker owns the discovery lease
    let lease = Lease::discovery(&target.display().to_string(), DISCOVERY_LEASE_TTL_MS);
    if !deps.broker.acquire_lease(&lease).await? {
        return Err(PipelineError::LeaseUnavailable(target.display().to_string()));
    }
    let heartbeat = spawn_lease_heartbeat(Arc::clone(&deps.broker), lease.clone(), cancel.clone());

    // Outbox publisher and worker pools run for the whole sweep
    let publisher = OutboxPublisher::new(
        deps.db.clone(),
        Arc::clone(&deps.broker),
        config.ingestor_batch_size,
        config.ingestor_interval_ms,
    );
    let publisher_handle = tokio::spawn(publisher.run(cancel.clone()));

    let worker_registry = build_worker_registry(deps);
    let policy = RetryPolicy::with_max_attempts(config.max_job_attempts);
    let worker_handles =
        worker_registry.spawn_all(Arc::clone(&deps.broker), policy, deps.event_bus.clone(), cancel.clone());

    // Phase A/B discovery, decoupled through the files-to-batch queue
    runs::set_phase(&deps.db, run_id, "discovery").await?;
    emit_phase(deps, run_id, "discovery");

    let (walker_done_tx, walker_done_rx) = watch::channel(false);
    let batcher_handles: Vec<_> = (0..2)
        .map(|_| {
            let batcher = Batcher {
                db: deps.db.clone(),
                broker: Arc::clone(&deps.broker),
                lease: lease.clone(),
                target_root: target.clone(),
                run_id,
                max_batch_tokens: config.max_batch_tokens,
                max_batch_files: config.max_batch_files,
                event_bus: deps.event_bus.clone(),
            };
            let walker_done = walker_done_rx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { batcher.run(walker_done, cancel).await })
        })
        .collect();

    let discovered = SourceWalker::new().walk(&target)?;
    let files_discovered = discovered.len() as u64;
    info!(run_id = %run_id, files = files_discovered, "Discovery walk complete");

    for file in &discovered {
        wait_for_capacity(&deps.broker, names::FILES_TO_BATCH, cancel).await?;
        deps.broker
            .enqueue_payload(
                names::FILES_TO_BATCH,
                &json!({
                    "event_type": "file-discovered",
                    "data": {"run_id": run_id, "path": file.path, "size": file.size}
                }),
            )
            .await?;
    }
    let _ = walker_done_tx.send(true);

    for handle in batcher_handles {
        match handle.await {
            Ok(result) => result?,
            Err(join_err) => {
                warn!(error = %join_err, "Batcher task panicked");
            }
        }
    }

    // Everything downstream of discovery is queue-driven; wait for drain
    runs::set_phase(&deps.db, run_id, "processing").await?;
    emit_phase(deps, run_id, "processing");

    let drained = wait_for_drain(deps, run_id, cancel).await?;

    let metrics = collect_metrics(deps, files_discovered).await?;
    runs::update_metrics(&deps.db, run_id, &metrics).await?;

    let status = if !drained {
        RunStatus::Cancelled
    } else if metrics.dead_letter_jobs > 0 {
        RunStatus::CompletedWithFailures
    } else {
        RunStatus::Completed
    };
    runs::finish_run(&deps.db, run_id, status, None).await?;

    deps.event_bus.emit_lossy(PipelineEvent::RunCompleted {
        run_id,
        status: status.as_str().to_string(),
        accepted_relationships: metrics.relationships_accepted,
        dead_letter_jobs: metrics.dead_letter_jobs,
        timestamp: Utc::now(),
    });
    info!(
        run_id = %run_id,
        status = status.as_str(),
        accepted = metrics.relationships_accepted,
        dead_letters = metrics.dead_letter_jobs,
        "Pipeline run finished"
    );

    // Wind down: workers finish their current job and exit
    cancel.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = publisher_handle.await;
    let _ = heartbeat.await;
    if let Err(err) = deps.broker.release_lease(&lease).await {
        warn!(error = %err, "Failed to release discovery lease");
    }

    Ok(status)
}

fn build_worker_registry(deps: &PipelineDeps) -> WorkerRegistry {
    let workers = &deps.config.workers;
    let mut registry = WorkerRegistry::new();

    registry.register(
        names::FILE_ANALYSIS,
        workers.file_analysis,
        Arc::new(FileAnalysisWorker {
            db: deps.db.clone(),
            oracle: Arc::clone(&deps.oracle),
            target_root: deps.config.target_directory.clone(),
        }),
    );
    registry.register(
        names::DIRECTORY_AGGREGATION,
        workers.directory,
        Arc::new(DirectoryAggregationWorker { db: deps.db.clone() }),
    );
    registry.register(
        names::DIRECTORY_RESOLUTION,
        workers.directory,
        Arc::new(DirectoryResolutionWorker {
            db: deps.db.clone(),
            oracle: Arc::clone(&deps.oracle),
        }),
    );
    registry.register(
        names::RELATIONSHIP_RESOLUTION,
        workers.relationship,
        Arc::new(RelationshipResolutionWorker { db: deps.db.clone() }),
    );
    registry.register(
        names::GLOBAL_RESOLUTION,
        workers.relationship,
        Arc::new(GlobalResolutionWorker {
            db: deps.db.clone(),
            oracle: Arc::clone(&deps.oracle),
        }),
    );

    let dead_letters: Arc<dyn crate::broker::DeadLetterSink> = deps.broker.clone();
    let validation = Arc::new(ValidationWorker {
        db: deps.db.clone(),
        dead_letters: Arc::clone(&dead_letters),
    });
    registry.register(names::ANALYSIS_FINDINGS, workers.validation, validation.clone());
    registry.register(names::RELATIONSHIP_VALIDATED, workers.validation, validation);

    registry.register(
        names::RECONCILIATION,
        workers.reconciliation,
        Arc::new(ReconciliationWorker {
            db: deps.db.clone(),
            dead_letters: Arc::clone(&dead_letters),
        }),
    );
    registry.register(
        names::GRAPH_BUILD,
        workers.graph_builder,
        Arc::new(GraphBuildWorker {
            db: deps.db.clone(),
            graph: Arc::clone(&deps.graph),
        }),
    );

    registry
}

fn spawn_lease_heartbeat(
    broker: Arc<Broker>,
    lease: Lease,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(lease.ttl_ms / 3);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {
                    match broker.renew_lease(&lease).await {
                        Ok(true) => {}
                        Ok(false) => {
                            // Check-on-write in the batcher stops emissions;
                            // the heartbeat just reports the preemption
                            warn!(lease = %lease.key, "Discovery lease ownership lost");
                            return;
                        }
                        Err(err) => warn!(error = %err, "Lease heartbeat failed"),
                    }
                }
            }
        }
    })
}

/// Back-pressure: producers poll ready depth against the high-water mark.
async fn wait_for_capacity(
    broker: &Broker,
    queue: &str,
    cancel: &CancellationToken,
) -> Result<(), BrokerError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        match broker.ready_depth(queue).await {
            Ok(depth) if depth < QUEUE_HIGH_WATER => return Ok(()),
            Ok(depth) => {
                tracing::debug!(queue, depth, "Queue above high-water mark, pausing producer");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(BrokerError::CircuitOpen) => {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// True when drained, false when the run was cancelled first.
async fn wait_for_drain(
    deps: &PipelineDeps,
    run_id: Uuid,
    cancel: &CancellationToken,
) -> Result<bool, PipelineError> {
    let mut consecutive_empty = 0u32;
    loop {
        if cancel.is_cancelled() {
            runs::finish_run(&deps.db, run_id, RunStatus::Cancelled, None).await?;
            return Ok(false);
        }
        if runs::stop_requested(&deps.db, run_id).await? {
            info!(run_id = %run_id, "Stop requested, cancelling run");
            cancel.cancel();
            continue;
        }

        let mut busy = outbox::pending_count(&deps.db).await?;
        for queue in names::ALL {
            if *queue == names::FAILED_JOBS {
                continue;
            }
            busy += deps.broker.queue_depth(queue).await?;
        }

        if busy == 0 {
            consecutive_empty += 1;
            if consecutive_empty >= DRAIN_CONFIRMATIONS {
                return Ok(true);
            }
        } else {
            consecutive_empty = 0;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

async fn collect_metrics(
    deps: &PipelineDeps,
    files_discovered: u64,
) -> Result<RunMetrics, PipelineError> {
    Ok(RunMetrics {
        files_discovered,
        files_analyzed: files::count_by_status(&deps.db, FileStatus::Analyzed).await?,
        files_failed: files::count_by_status(&deps.db, FileStatus::Failed).await?,
        pois_extracted: pois::count(&deps.db).await?,
        evidence_rows: evidence::count(&deps.db).await?,
        relationships_accepted: relationships::count(&deps.db).await?,
        dead_letter_jobs: deps.broker.dead_letter_count().await?,
    })
}

fn emit_phase(deps: &PipelineDeps, run_id: Uuid, phase: &str) {
    deps.event_bus.emit_lossy(PipelineEvent::PhaseChanged {
        run_id,
        phase: phase.to_string(),
        timestamp: Utc::now(),
    });
}

/// Count of directory summaries; used by the status command.
pub async fn summary_count(db: &SqlitePool) -> Result<u64, ctg_common::Error> {
    directories::count(db).await
}
