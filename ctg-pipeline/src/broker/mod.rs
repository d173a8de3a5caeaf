//! Queue broker adapter
//!
//! Redis-backed named durable queues with delayed retry, visibility-timeout
//! redelivery, and a dead-letter queue, plus the atomic compare-and-set and
//! lease primitives the discovery batcher and outbox publisher rely on.
//!
//! Layout per queue `ctg:q:{name}` (ready list), `ctg:delayed:{name}`
//! (retry zset scored by not-before), `ctg:inflight:{name}` (claimed zset
//! scored by visibility deadline). A consumer crash leaves the claim in the
//! inflight zset; the next pop reclaims entries past their deadline.
//!
//! Producer and consumer hold separate connection managers, both guarded by
//! one circuit breaker: while open, producers fail fast and consumers
//! suspend polling.

pub mod circuit;
pub mod envelope;
pub mod lease;

pub use envelope::JobEnvelope;
pub use lease::Lease;

use async_trait::async_trait;
use chrono::Utc;
use circuit::CircuitBreaker;
use ctg_common::config::RedisConfig;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::warn;

/// Queue names are part of the system contract.
pub mod names {
    pub const FILES_TO_BATCH: &str = "files-to-batch";
    pub const FILE_ANALYSIS: &str = "file-analysis-queue";
    pub const DIRECTORY_AGGREGATION: &str = "directory-aggregation-queue";
    pub const DIRECTORY_RESOLUTION: &str = "directory-resolution-queue";
    pub const RELATIONSHIP_RESOLUTION: &str = "relationship-resolution-queue";
    pub const RELATIONSHIP_VALIDATED: &str = "relationship-validated-queue";
    pub const RECONCILIATION: &str = "reconciliation-queue";
    pub const GLOBAL_RESOLUTION: &str = "global-resolution-queue";
    pub const ANALYSIS_FINDINGS: &str = "analysis-findings-queue";
    pub const GRAPH_BUILD: &str = "graph-builder";
    pub const FAILED_JOBS: &str = "failed-jobs";

    pub const ALL: &[&str] = &[
        FILES_TO_BATCH,
        FILE_ANALYSIS,
        DIRECTORY_AGGREGATION,
        DIRECTORY_RESOLUTION,
        RELATIONSHIP_RESOLUTION,
        RELATIONSHIP_VALIDATED,
        RECONCILIATION,
        GLOBAL_RESOLUTION,
        ANALYSIS_FINDINGS,
        GRAPH_BUILD,
        FAILED_JOBS,
    ];
}

/// Broker adapter errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Circuit breaker open")]
    CircuitOpen,

    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Codec(err.to_string())
    }
}

/// Entry on the dead-letter queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub origin_queue: String,
    pub reason: String,
    pub attempts: u32,
    pub payload: Value,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

/// A job claimed from a queue; `raw` is the exact member string held in the
/// inflight zset and is needed to acknowledge or reschedule the claim.
#[derive(Debug)]
pub struct ClaimedJob {
    pub envelope: JobEnvelope,
    raw: String,
}

/// Destination for per-row drops that acknowledge the surrounding job.
/// Validation uses this to dead-letter individual evidence candidates.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn push_dead_letter(
        &self,
        origin_queue: &str,
        payload: &Value,
        reason: &str,
    ) -> Result<(), BrokerError>;
}

/// Move due members from a zset (delayed or inflight) back to the ready list.
const PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('LPUSH', KEYS[2], member)
end
return #due
"#;

/// Atomic compare-and-set on a plain key.
const COMPARE_AND_SET: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

fn ready_key(queue: &str) -> String {
    format!("ctg:q:{}", queue)
}

fn delayed_key(queue: &str) -> String {
    format!("ctg:delayed:{}", queue)
}

fn inflight_key(queue: &str) -> String {
    format!("ctg:inflight:{}", queue)
}

/// Inject the configured password into a redis URL that lacks credentials.
fn build_redis_url(config: &RedisConfig) -> String {
    match &config.password {
        Some(password) if !config.url.contains('@') => {
            if let Some(rest) = config.url.strip_prefix("redis://") {
                format!("redis://:{}@{}", password, rest)
            } else if let Some(rest) = config.url.strip_prefix("rediss://") {
                format!("rediss://:{}@{}", password, rest)
            } else {
                config.url.clone()
            }
        }
        _ => config.url.clone(),
    }
}

/// Redis queue broker
pub struct Broker {
    producer: ConnectionManager,
    consumer: ConnectionManager,
    breaker: Arc<Mutex<CircuitBreaker>>,
    visibility_timeout_ms: i64,
}

impl Broker {
    pub async fn connect(config: &RedisConfig, visibility_timeout_ms: u64) -> Result<Self, BrokerError> {
        let url = build_redis_url(config);
        let client = redis::Client::open(url.as_str())?;

        // Separate connections so a slow consumer poll never blocks a
        // producer enqueue
        let producer = ConnectionManager::new(client.clone()).await?;
        let consumer = ConnectionManager::new(client).await?;

        Ok(Self {
            producer,
            consumer,
            breaker: Arc::new(Mutex::new(CircuitBreaker::default())),
            visibility_timeout_ms: visibility_timeout_ms as i64,
        })
    }

    fn guard(&self) -> Result<(), BrokerError> {
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        if breaker.allow(Instant::now()) {
            Ok(())
        } else {
            Err(BrokerError::CircuitOpen)
        }
    }

    fn record<T>(&self, result: &Result<T, BrokerError>) {
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        match result {
            Ok(_) => breaker.on_success(),
            Err(BrokerError::Connection(_)) => breaker.on_failure(Instant::now()),
            // Codec and circuit errors say nothing about broker health
            Err(_) => {}
        }
    }

    pub async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.producer.clone();
        let result: Result<String, BrokerError> = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(BrokerError::from);
        self.record(&result);
        result.map(|_| ())
    }

    pub async fn enqueue(&self, queue: &str, envelope: &JobEnvelope) -> Result<(), BrokerError> {
        self.guard()?;
        let encoded = envelope.encode()?;
        let mut conn = self.producer.clone();
        let result: Result<(), BrokerError> = conn
            .lpush::<_, _, ()>(ready_key(queue), encoded)
            .await
            .map_err(BrokerError::from);
        self.record(&result);
        result
    }

    /// Wrap a bare `{event_type, data}` payload in a fresh envelope.
    pub async fn enqueue_payload(&self, queue: &str, payload: &Value) -> Result<(), BrokerError> {
        self.enqueue(queue, &JobEnvelope::new(payload.clone())).await
    }

    /// Claim the next ready job. Promotes due retries and reclaims expired
    /// inflight entries first, so redelivery needs no background sweeper.
    pub async fn pop(&self, queue: &str) -> Result<Option<ClaimedJob>, BrokerError> {
        self.guard()?;
        let mut conn = self.consumer.clone();
        let now_ms = Utc::now().timestamp_millis();

        let result = self.pop_inner(&mut conn, queue, now_ms).await;
        self.record(&result);
        result
    }

    async fn pop_inner(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        now_ms: i64,
    ) -> Result<Option<ClaimedJob>, BrokerError> {
        let ready = ready_key(queue);

        let promote = redis::Script::new(PROMOTE_DUE);
        let _: i64 = promote
            .key(delayed_key(queue))
            .key(&ready)
            .arg(now_ms)
            .invoke_async(conn)
            .await?;
        let _: i64 = promote
            .key(inflight_key(queue))
            .key(&ready)
            .arg(now_ms)
            .invoke_async(conn)
            .await?;

        let raw: Option<String> = conn.rpop(&ready, None).await?;
        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let envelope = match JobEnvelope::decode(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Malformed member cannot be processed or retried; park it
                warn!(queue, error = %err, "Dead-lettering undecodable queue member");
                let record = DeadLetterRecord {
                    origin_queue: queue.to_string(),
                    reason: format!("undecodable envelope: {}", err),
                    attempts: 0,
                    payload: Value::String(raw),
                    failed_at: Utc::now(),
                };
                conn.lpush::<_, _, ()>(ready_key(names::FAILED_JOBS), serde_json::to_string(&record)?)
                    .await?;
                return Ok(None);
            }
        };

        let deadline = now_ms + self.visibility_timeout_ms;
        conn.zadd::<_, _, _, ()>(inflight_key(queue), &raw, deadline)
            .await?;

        Ok(Some(ClaimedJob { envelope, raw }))
    }

    /// Acknowledge a completed job.
    pub async fn ack(&self, queue: &str, job: &ClaimedJob) -> Result<(), BrokerError> {
        let mut conn = self.consumer.clone();
        let result: Result<(), BrokerError> = conn
            .zrem::<_, _, ()>(inflight_key(queue), &job.raw)
            .await
            .map_err(BrokerError::from);
        self.record(&result);
        result
    }

    /// Reschedule a failed job after `delay_ms` with its attempt counter
    /// advanced.
    pub async fn retry_later(
        &self,
        queue: &str,
        job: &ClaimedJob,
        delay_ms: u64,
    ) -> Result<(), BrokerError> {
        let retried = job.envelope.next_attempt().encode()?;
        let not_before = Utc::now().timestamp_millis() + delay_ms as i64;

        let mut conn = self.consumer.clone();
        let result: Result<(), BrokerError> = async {
            conn.zrem::<_, _, ()>(inflight_key(queue), &job.raw).await?;
            conn.zadd::<_, _, _, ()>(delayed_key(queue), retried, not_before)
                .await?;
            Ok(())
        }
        .await;
        self.record(&result);
        result
    }

    /// Move an exhausted or fatally failed job to the dead-letter queue.
    pub async fn dead_letter(
        &self,
        origin_queue: &str,
        job: &ClaimedJob,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let record = DeadLetterRecord {
            origin_queue: origin_queue.to_string(),
            reason: reason.to_string(),
            attempts: job.envelope.attempts,
            payload: job.envelope.payload.clone(),
            failed_at: Utc::now(),
        };

        let mut conn = self.consumer.clone();
        let result: Result<(), BrokerError> = async {
            conn.zrem::<_, _, ()>(inflight_key(origin_queue), &job.raw)
                .await?;
            conn.lpush::<_, _, ()>(
                ready_key(names::FAILED_JOBS),
                serde_json::to_string(&record)?,
            )
            .await?;
            Ok(())
        }
        .await;
        self.record(&result);
        result
    }

    /// Ready jobs only; back-pressure polls this against the high-water mark.
    pub async fn ready_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.producer.clone();
        let result: Result<u64, BrokerError> =
            conn.llen(ready_key(queue)).await.map_err(BrokerError::from);
        self.record(&result);
        result
    }

    /// Ready + delayed + inflight; drain detection needs all three.
    pub async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.producer.clone();
        let result: Result<u64, BrokerError> = async {
            let ready: u64 = conn.llen(ready_key(queue)).await?;
            let delayed: u64 = conn.zcard(delayed_key(queue)).await?;
            let inflight: u64 = conn.zcard(inflight_key(queue)).await?;
            Ok(ready + delayed + inflight)
        }
        .await;
        self.record(&result);
        result
    }

    pub async fn dead_letter_count(&self) -> Result<u64, BrokerError> {
        self.ready_depth(names::FAILED_JOBS).await
    }

    /// Delete every queue key. Used by `clear` and at the start of a run.
    pub async fn purge(&self) -> Result<(), BrokerError> {
        let mut conn = self.producer.clone();
        let mut keys = Vec::with_capacity(names::ALL.len() * 3);
        for queue in names::ALL {
            keys.push(ready_key(queue));
            keys.push(delayed_key(queue));
            keys.push(inflight_key(queue));
        }
        let result: Result<(), BrokerError> =
            conn.del::<_, ()>(keys).await.map_err(BrokerError::from);
        self.record(&result);
        result
    }

    // ------------------------------------------------------------------
    // CAS and lease primitives
    // ------------------------------------------------------------------

    /// SET key value NX PX ttl; true when the key was claimed.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, BrokerError> {
        self.guard()?;
        let mut conn = self.producer.clone();
        let result: Result<Option<String>, BrokerError> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(BrokerError::from);
        self.record(&result);
        Ok(result?.is_some())
    }

    /// Atomically replace `expected` with `new`; false when the stored
    /// value did not match.
    pub async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, BrokerError> {
        self.guard()?;
        let mut conn = self.producer.clone();
        let result: Result<i64, BrokerError> = redis::Script::new(COMPARE_AND_SET)
            .key(key)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await
            .map_err(BrokerError::from);
        self.record(&result);
        Ok(result? == 1)
    }

    pub async fn acquire_lease(&self, lease: &Lease) -> Result<bool, BrokerError> {
        self.set_nx_px(&lease.key, &lease.token, lease.ttl_ms).await
    }

    /// Heartbeat renewal; false means ownership was lost.
    pub async fn renew_lease(&self, lease: &Lease) -> Result<bool, BrokerError> {
        self.lease_script(lease::RENEW_IF_OWNER, lease, Some(lease.ttl_ms)).await
    }

    /// Check-on-write ownership probe; no TTL side effect.
    pub async fn verify_lease(&self, lease: &Lease) -> Result<bool, BrokerError> {
        self.lease_script(lease::VERIFY_OWNER, lease, None).await
    }

    pub async fn release_lease(&self, lease: &Lease) -> Result<bool, BrokerError> {
        self.lease_script(lease::RELEASE_IF_OWNER, lease, None).await
    }

    async fn lease_script(
        &self,
        script: &str,
        lease: &Lease,
        ttl_ms: Option<u64>,
    ) -> Result<bool, BrokerError> {
        self.guard()?;
        let mut conn = self.producer.clone();
        let script = redis::Script::new(script);
        let mut invocation = script.key(&lease.key);
        invocation.arg(&lease.token);
        if let Some(ttl) = ttl_ms {
            invocation.arg(ttl);
        }
        let result: Result<i64, BrokerError> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(BrokerError::from);
        self.record(&result);
        Ok(result? == 1)
    }
}

#[async_trait]
impl DeadLetterSink for Broker {
    async fn push_dead_letter(
        &self,
        origin_queue: &str,
        payload: &Value,
        reason: &str,
    ) -> Result<(), BrokerError> {
        self.guard()?;
        let record = DeadLetterRecord {
            origin_queue: origin_queue.to_string(),
            reason: reason.to_string(),
            attempts: 0,
            payload: payload.clone(),
            failed_at: Utc::now(),
        };
        let mut conn = self.producer.clone();
        let result: Result<(), BrokerError> = conn
            .lpush::<_, _, ()>(
                ready_key(names::FAILED_JOBS),
                serde_json::to_string(&record)?,
            )
            .await
            .map_err(BrokerError::from);
        self.record(&result);
        result
    }
}
