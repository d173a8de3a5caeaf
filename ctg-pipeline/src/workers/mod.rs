//! Worker framework and handlers
//!
//! Each queue is served by a handler that declares its dependencies as an
//! explicit struct and returns an explicit retryable/fatal verdict. The
//! registry maps queue names to handlers; the consumer loop owns claim,
//! retry, and dead-letter mechanics, so handlers contain only domain logic.
//!
//! Handlers MUST be idempotent keyed by payload identity: the outbox
//! publisher delivers at-least-once.

pub mod directory_aggregation;
pub mod directory_resolution;
pub mod file_analysis;
pub mod global_resolution;
pub mod graph_build;
pub mod reconciliation;
pub mod relationship_resolution;
pub mod validation;

use crate::broker::{Broker, BrokerError, JobEnvelope};
use crate::error::{JobError, RetryPolicy};
use async_trait::async_trait;
use ctg_common::events::{EventBus, PipelineEvent};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

const IDLE_POLL: Duration = Duration::from_millis(200);
const BROKER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A queue job handler
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobEnvelope) -> Result<(), JobError>;
}

/// Typed queue → handler registry
#[derive(Default)]
pub struct WorkerRegistry {
    entries: Vec<WorkerEntry>,
}

pub struct WorkerEntry {
    pub queue: &'static str,
    pub concurrency: usize,
    pub handler: Arc<dyn JobHandler>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a queue. A handler may serve more than one
    /// queue (validation consumes both candidate queues).
    pub fn register(&mut self, queue: &'static str, concurrency: usize, handler: Arc<dyn JobHandler>) {
        self.entries.push(WorkerEntry {
            queue,
            concurrency,
            handler,
        });
    }

    pub fn handler_for(&self, queue: &str) -> Option<Arc<dyn JobHandler>> {
        self.entries
            .iter()
            .find(|entry| entry.queue == queue)
            .map(|entry| Arc::clone(&entry.handler))
    }

    pub fn queues(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.queue).collect()
    }

    /// Spawn every consumer loop. Each entry gets `concurrency` parallel
    /// loops; all respond to the cancellation token by finishing their
    /// current job and exiting.
    pub fn spawn_all(
        &self,
        broker: Arc<Broker>,
        policy: RetryPolicy,
        event_bus: EventBus,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for entry in &self.entries {
            for worker_index in 0..entry.concurrency {
                let broker = Arc::clone(&broker);
                let handler = Arc::clone(&entry.handler);
                let event_bus = event_bus.clone();
                let cancel = cancel.clone();
                let queue = entry.queue;
                handles.push(tokio::spawn(async move {
                    consume_loop(broker, queue, worker_index, handler, policy, event_bus, cancel)
                        .await;
                }));
            }
        }
        handles
    }
}

/// Run id carried in every payload, for progress events.
fn run_id_of(job: &JobEnvelope) -> Uuid {
    job.data()
        .get("run_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::nil)
}

async fn consume_loop(
    broker: Arc<Broker>,
    queue: &'static str,
    worker_index: usize,
    handler: Arc<dyn JobHandler>,
    policy: RetryPolicy,
    event_bus: EventBus,
    cancel: CancellationToken,
) {
    debug!(queue, worker_index, "Worker loop started");

    loop {
        if cancel.is_cancelled() {
            debug!(queue, worker_index, "Worker loop shutting down");
            return;
        }

        let job = match broker.pop(queue).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                }
            }
            Err(BrokerError::CircuitOpen) => {
                // Consumers suspend while the circuit is open
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(BROKER_ERROR_BACKOFF) => continue,
                }
            }
            Err(err) => {
                warn!(queue, error = %err, "Worker failed to poll queue");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(BROKER_ERROR_BACKOFF) => continue,
                }
            }
        };

        // The current job always runs to completion, even mid-shutdown;
        // redelivery covers a hard kill via the visibility timeout.
        let run_id = run_id_of(&job.envelope);
        let job_id = job.envelope.job_id;

        match handler.handle(&job.envelope).await {
            Ok(()) => {
                if let Err(err) = broker.ack(queue, &job).await {
                    warn!(queue, %job_id, error = %err, "Failed to acknowledge job");
                }
                event_bus.emit_lossy(PipelineEvent::JobCompleted {
                    run_id,
                    queue: queue.to_string(),
                    job_id,
                });
            }
            Err(JobError::Retryable(reason)) => {
                let attempts_done = job.envelope.attempts + 1;
                if policy.exhausted(attempts_done) {
                    error!(queue, %job_id, attempts_done, reason, "Job exhausted retries");
                    if let Err(err) = broker.dead_letter(queue, &job, &reason).await {
                        error!(queue, %job_id, error = %err, "Failed to dead-letter job");
                    }
                    event_bus.emit_lossy(PipelineEvent::JobDeadLettered {
                        run_id,
                        queue: queue.to_string(),
                        job_id,
                        reason,
                    });
                } else {
                    let delay_ms = policy.delay_ms(attempts_done);
                    warn!(queue, %job_id, attempts_done, delay_ms, reason, "Job failed, retrying");
                    if let Err(err) = broker.retry_later(queue, &job, delay_ms).await {
                        error!(queue, %job_id, error = %err, "Failed to reschedule job");
                    }
                }
            }
            Err(JobError::Fatal(reason)) => {
                error!(queue, %job_id, reason, "Job failed fatally");
                if let Err(err) = broker.dead_letter(queue, &job, &reason).await {
                    error!(queue, %job_id, error = %err, "Failed to dead-letter job");
                }
                event_bus.emit_lossy(PipelineEvent::JobDeadLettered {
                    run_id,
                    queue: queue.to_string(),
                    job_id,
                    reason,
                });
            }
        }
    }
}

/// Candidate relationship key flowing from analysis to reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CandidateKey {
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: String,
}

/// Deduplicate candidate keys preserving first-seen order.
pub fn dedup_keys(keys: Vec<CandidateKey>) -> Vec<CandidateKey> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for key in keys {
        if seen.insert(key.clone()) {
            out.push(key);
        }
    }
    out
}
