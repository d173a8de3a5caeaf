//! Job-level error taxonomy and retry policy
//!
//! Handlers return an explicit retryable/fatal verdict instead of letting
//! exceptions drive control flow; the consumer loop owns the retry policy
//! and applies it uniformly.

use rand::Rng;
use thiserror::Error;

/// Outcome of a failed job handler invocation
#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure; the job is rescheduled with backoff until the
    /// attempt budget runs out.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent failure; the job moves straight to the dead-letter queue.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(message: impl std::fmt::Display) -> Self {
        JobError::Retryable(message.to_string())
    }

    pub fn fatal(message: impl std::fmt::Display) -> Self {
        JobError::Fatal(message.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

impl From<ctg_common::Error> for JobError {
    fn from(err: ctg_common::Error) -> Self {
        match err {
            // Broken invariants and corrupt rows never heal on retry
            ctg_common::Error::Lifecycle(msg) => JobError::Fatal(msg),
            ctg_common::Error::MissingRecord(msg) => JobError::Fatal(msg),
            ctg_common::Error::Corrupt(msg) => JobError::Fatal(msg),
            other => JobError::Retryable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Fatal(format!("payload decode: {}", err))
    }
}

/// Exponential backoff with jitter, owned by each consumer loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// True when `attempts` completed tries have exhausted the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before the next try after `attempts` completed tries.
    ///
    /// Doubles per attempt from the base, capped at the ceiling, with up to
    /// 25% random jitter so synchronized failures do not retry in lockstep.
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.min(16);
        let raw = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        let jitter_span = raw / 4;
        if jitter_span == 0 {
            return raw;
        }
        raw - jitter_span / 2 + rand::thread_rng().gen_range(0..=jitter_span)
    }
}
