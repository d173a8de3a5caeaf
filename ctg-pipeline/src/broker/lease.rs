//! Distributed leases with atomic ownership verification
//!
//! A lease is a TTL'd key holding a random owner token. Renewal and release
//! verify ownership atomically in a Lua script, and the same verification
//! script backs check-on-write: a worker re-proves ownership immediately
//! before any side-effecting emission, so a preempted owner cannot publish
//! a stale batch.
//!
//! [`LeaseState`] is the in-process model of the key these scripts act on:
//! acquire is `SET NX PX`, and renew/verify/release are the scripts below.
//! The broker executes the scripts; the model carries the transition rules
//! so contention between competing tokens can be exercised without a live
//! broker.

use uuid::Uuid;

/// Renew the TTL only while the stored token still matches ours.
pub const RENEW_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Check-on-write ownership probe.
pub const VERIFY_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return 1
else
    return 0
end
"#;

/// Delete the key only while we still own it.
pub const RELEASE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Lease identity: key, owner token, TTL. The broker executes the scripts;
/// this type only names what is being claimed.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub token: String,
    pub ttl_ms: u64,
}

impl Lease {
    pub fn new(key: impl Into<String>, ttl_ms: u64) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            ttl_ms,
        }
    }

    /// Lease key guarding single-sweep discovery of one target directory.
    pub fn discovery(target_dir: &str, ttl_ms: u64) -> Self {
        Self::new(format!("discovery-lock:{}", target_dir), ttl_ms)
    }

    /// Lease key electing the single active outbox publisher.
    pub fn outbox_leader(ttl_ms: u64) -> Self {
        Self::new("outbox-publisher-leader", ttl_ms)
    }
}

/// One live claim on a lease key
#[derive(Debug)]
struct Claim {
    token: String,
    expires_at_ms: i64,
}

/// Ownership state machine for one lease key.
///
/// Every transition is total over (stored token, expiry, caller token), so
/// the mutual-exclusion property — two tokens can never both pass the
/// check-on-write probe — is checkable directly against this model.
#[derive(Debug, Default)]
pub struct LeaseState {
    claim: Option<Claim>,
}

impl LeaseState {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_token(&self, now_ms: i64) -> Option<&str> {
        self.claim
            .as_ref()
            .filter(|claim| claim.expires_at_ms > now_ms)
            .map(|claim| claim.token.as_str())
    }

    /// `SET key token NX PX ttl`: claims the key only when no live claim
    /// exists. An expired claim is gone, exactly as an expired Redis key.
    pub fn acquire(&mut self, lease: &Lease, now_ms: i64) -> bool {
        if self.live_token(now_ms).is_some() {
            return false;
        }
        self.claim = Some(Claim {
            token: lease.token.clone(),
            expires_at_ms: now_ms + lease.ttl_ms as i64,
        });
        true
    }

    /// `RENEW_IF_OWNER`: extends the TTL only for the live owner.
    pub fn renew(&mut self, lease: &Lease, now_ms: i64) -> bool {
        if self.live_token(now_ms) != Some(lease.token.as_str()) {
            return false;
        }
        if let Some(claim) = self.claim.as_mut() {
            claim.expires_at_ms = now_ms + lease.ttl_ms as i64;
        }
        true
    }

    /// `VERIFY_OWNER`: the check-on-write probe. True only for the single
    /// live owner.
    pub fn verify(&self, lease: &Lease, now_ms: i64) -> bool {
        self.live_token(now_ms) == Some(lease.token.as_str())
    }

    /// `RELEASE_IF_OWNER`: drops the claim only for the live owner.
    pub fn release(&mut self, lease: &Lease, now_ms: i64) -> bool {
        if self.live_token(now_ms) != Some(lease.token.as_str()) {
            return false;
        }
        self.claim = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: u64 = 1_000;

    fn contenders(key: &str) -> (Lease, Lease) {
        (Lease::new(key, TTL), Lease::new(key, TTL))
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = Lease::discovery("/srv/project", 30_000);
        let b = Lease::discovery("/srv/project", 30_000);
        assert_eq!(a.key, b.key);
        assert_ne!(a.token, b.token, "two workers must hold distinct tokens");
    }

    #[test]
    fn test_key_shapes() {
        assert_eq!(
            Lease::discovery("/srv/project", 1000).key,
            "discovery-lock:/srv/project"
        );
        assert_eq!(Lease::outbox_leader(1000).key, "outbox-publisher-leader");
    }

    #[test]
    fn test_acquire_is_exclusive_while_live() {
        let (w1, w2) = contenders("discovery-lock:/srv/project");
        let mut state = LeaseState::new();

        assert!(state.acquire(&w1, 0));
        assert!(!state.acquire(&w2, 100), "live claim blocks a second owner");
        assert!(state.verify(&w1, 100));
        assert!(!state.verify(&w2, 100));
    }

    #[test]
    fn test_check_on_write_mutual_exclusion() {
        let (w1, w2) = contenders("discovery-lock:/srv/project");
        let mut state = LeaseState::new();

        assert!(state.acquire(&w1, 0));
        // W2 takes over once W1's claim expires
        assert!(state.acquire(&w2, TTL as i64 + 500));

        // At no sampled instant do both tokens pass the probe
        for now in [0, 200, 999, 1_000, 1_400, 1_500, 2_400, 3_000] {
            assert!(
                !(state.verify(&w1, now) && state.verify(&w2, now)),
                "both tokens passed check-on-write at t={}",
                now
            );
        }
    }

    #[test]
    fn test_frozen_owner_rejected_after_preemption() {
        let (w1, w2) = contenders("discovery-lock:/srv/project");
        let mut state = LeaseState::new();

        // W1 acquires, then freezes past its TTL; W2 takes the lease
        assert!(state.acquire(&w1, 0));
        let after_expiry = TTL as i64 + 1;
        assert!(state.acquire(&w2, after_expiry));

        // W1 wakes up: its next emission is rejected by check-on-write and
        // it cannot renew its way back in
        assert!(!state.verify(&w1, after_expiry + 10));
        assert!(!state.renew(&w1, after_expiry + 10));
        assert!(state.verify(&w2, after_expiry + 10));
    }

    #[test]
    fn test_expired_unrenewed_claim_fails_verify() {
        let (w1, _) = contenders("discovery-lock:/srv/project");
        let mut state = LeaseState::new();

        assert!(state.acquire(&w1, 0));
        assert!(state.verify(&w1, TTL as i64 - 1));
        // The key is gone at expiry even with no competitor
        assert!(!state.verify(&w1, TTL as i64 + 1));
    }

    #[test]
    fn test_renew_extends_ownership() {
        let (w1, w2) = contenders("outbox-publisher-leader");
        let mut state = LeaseState::new();

        assert!(state.acquire(&w1, 0));
        assert!(state.renew(&w1, 800));
        // Heartbeat moved the expiry; W1 is still the owner past the
        // original deadline and W2 stays locked out
        assert!(state.verify(&w1, 1_500));
        assert!(!state.acquire(&w2, 1_500));
        assert!(!state.renew(&w2, 1_500));
    }

    #[test]
    fn test_release_only_by_owner() {
        let (w1, w2) = contenders("discovery-lock:/srv/project");
        let mut state = LeaseState::new();

        assert!(state.acquire(&w1, 0));
        assert!(!state.release(&w2, 100), "non-owner release is a no-op");
        assert!(state.verify(&w1, 100));

        assert!(state.release(&w1, 100));
        // Key deleted: W2 may now claim it immediately
        assert!(state.acquire(&w2, 101));
        assert!(state.verify(&w2, 102));
    }
}
