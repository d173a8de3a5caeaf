//! Job envelope carried on every broker queue
//!
//! The payload is the outbox event body `{event_type, data}`; the envelope
//! adds delivery bookkeeping. Handlers key idempotency on payload identity,
//! never on job_id, because a crashed publisher may re-wrap the same payload
//! in a fresh envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: Uuid,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: Value,
}

impl JobEnvelope {
    pub fn new(payload: Value) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            attempts: 0,
            enqueued_at: Utc::now(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Copy for rescheduling with the attempt counter advanced.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self.clone()
        }
    }

    pub fn event_type(&self) -> Option<&str> {
        self.payload.get("event_type").and_then(Value::as_str)
    }

    /// Queue-specific body. Unknown fields inside are preserved and
    /// forwarded opaquely.
    pub fn data(&self) -> &Value {
        self.payload.get("data").unwrap_or(&Value::Null)
    }
}
