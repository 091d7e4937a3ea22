use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Best-effort duplicate-submission guard keyed by a client-supplied
/// idempotency token.
///
/// This is an in-process, time-boxed cache: it stops double-clicks and
/// webhook-speed retries hitting the same instance. Cross-instance
/// duplicates are stopped by the database itself (unique constraints,
/// cart and payment status guards), which stays authoritative.
#[derive(Clone)]
pub struct IdempotencyGuard {
    seen: Arc<DashMap<String, Instant>>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Claims a key. Returns `false` when it was already claimed within
    /// the TTL (a duplicate request).
    pub fn claim(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.seen.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.ttl {
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Releases a key so a retry after a failure is not treated as a
    /// duplicate.
    pub fn release(&self, key: &str) {
        self.seen.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_claim_wins_second_loses() {
        let guard = IdempotencyGuard::new(Duration::from_secs(60));
        assert!(guard.claim("checkout-1"));
        assert!(!guard.claim("checkout-1"));
        assert!(guard.claim("checkout-2"));
    }

    #[test]
    fn released_keys_can_be_claimed_again() {
        let guard = IdempotencyGuard::new(Duration::from_secs(60));
        assert!(guard.claim("checkout-1"));
        guard.release("checkout-1");
        assert!(guard.claim("checkout-1"));
    }

    #[test]
    fn expired_claims_are_reusable() {
        let guard = IdempotencyGuard::new(Duration::from_millis(0));
        assert!(guard.claim("checkout-1"));
        assert!(guard.claim("checkout-1"));
    }
}
