//! Circuit breaker for broker connections
//!
//! Opens after a run of consecutive connection failures; while open,
//! producers fail fast and consumers suspend polling. After the cooldown a
//! single probe is allowed through (half-open); its outcome closes or
//! re-opens the circuit.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: State,
    consecutive_failures: u32,
    failure_threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            failure_threshold,
            cooldown,
            opened_at: None,
        }
    }

    /// Whether a request may proceed at `now`. An open circuit flips to
    /// half-open once the cooldown has elapsed, admitting one probe.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            State::Closed => true,
            State::HalfOpen => false,
            State::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.cooldown {
                    self.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.state = State::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn on_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        match self.state {
            State::HalfOpen => {
                // Probe failed; back to open for a fresh cooldown
                self.state = State::Open;
                self.opened_at = Some(now);
            }
            State::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.state = State::Open;
                self.opened_at = Some(now);
            }
            _ => {}
        }
    }

    pub fn is_open(&self) -> bool {
        self.state != State::Closed
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(10))
    }
}
