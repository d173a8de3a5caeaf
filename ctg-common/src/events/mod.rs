//! Event types for the CTG pipeline
//!
//! Provides the shared event definitions and EventBus used for in-process
//! progress reporting. Events carry pipeline run progress; durable state
//! always lives in SQLite, so every event is safe to drop.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Pipeline progress events
///
/// Events are broadcast via [`EventBus`]. Subscribers observe a snapshot of
/// run progress; the authoritative record is the `pipeline_runs` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A pipeline run started against a target directory
    RunStarted {
        run_id: Uuid,
        target_directory: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The run advanced to a new phase
    PhaseChanged {
        run_id: Uuid,
        phase: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Discovery emitted an analysis batch
    BatchQueued {
        run_id: Uuid,
        batch_id: Uuid,
        file_count: usize,
        token_estimate: usize,
    },

    /// A worker finished a job successfully
    JobCompleted {
        run_id: Uuid,
        queue: String,
        job_id: Uuid,
    },

    /// A job exhausted its retry budget or failed fatally
    JobDeadLettered {
        run_id: Uuid,
        queue: String,
        job_id: Uuid,
        reason: String,
    },

    /// The run drained all queues and finished
    RunCompleted {
        run_id: Uuid,
        status: String,
        accepted_relationships: u64,
        dead_letter_jobs: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Broadcast bus for pipeline events
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// Progress events are advisory; a run with no observers proceeds
    /// identically.
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}
