//! Sub-second memoization of engine denials.
//!
//! Per-process and unsynchronized across processes. Only denials are kept:
//! every admission is charged to the engine before it is granted, so the cache
//! can make a caller wait slightly longer but never lets one through early.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::ratelimit::Decision;

const PURGE_EVERY: u64 = 1024;

#[derive(Debug)]
struct Entry {
    decision: Decision,
    stored_at: Instant,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct DecisionCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
    inserts: AtomicU64,
}

impl DecisionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            inserts: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A still-valid denial for `key`, with `retry_after` counted down.
    pub fn lookup(&self, key: &str, now: Instant) -> Option<Decision> {
        if !self.is_enabled() {
            return None;
        }

        let entry = self.entries.get(key)?;
        if now >= entry.expires_at {
            drop(entry);
            self.entries.remove_if(key, |_, entry| now >= entry.expires_at);
            return None;
        }

        let mut decision = entry.decision.clone();
        if let Some(retry_after) = decision.retry_after {
            let elapsed = now.duration_since(entry.stored_at).as_secs();
            decision.retry_after = Some(retry_after.saturating_sub(elapsed).max(1));
        }
        Some(decision)
    }

    /// Remember a fresh engine decision.
    ///
    /// Denials are kept for `min(ttl, retry_after)`. An allow clears any
    /// stale denial. Degraded decisions are never cached.
    pub fn store(&self, key: &str, decision: &Decision, now: Instant) {
        if !self.is_enabled() || decision.degraded {
            return;
        }
        if decision.allowed {
            self.entries.remove(key);
            return;
        }

        let lifetime = decision
            .retry_after
            .map_or(self.ttl, |secs| self.ttl.min(Duration::from_secs(secs)));

        self.entries.insert(
            key.to_string(),
            Entry {
                decision: decision.clone(),
                stored_at: now,
                expires_at: now + lifetime,
            },
        );

        if self.inserts.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired(now);
        }
    }

    /// Drop expired entries.
    pub fn purge_expired(&self, now: Instant) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(allowed: bool, remaining: u64) -> Decision {
        Decision {
            allowed,
            limit: 5,
            remaining,
            reset_at: 1_700_000_060,
            retry_after: if allowed { None } else { Some(50) },
            unlimited: false,
            degraded: false,
            policy_scope: "/api/auth/login".to_string(),
            policy_version: 1,
        }
    }

    const KEY: &str = "ip:203.0.113.5@/api/auth/login";

    #[test]
    fn test_miss_when_empty() {
        let cache = DecisionCache::new(Duration::from_millis(250));
        assert_eq!(cache.lookup(KEY, Instant::now()), None);
    }

    #[test]
    fn test_allows_are_never_served() {
        let cache = DecisionCache::new(Duration::from_millis(250));
        let now = Instant::now();
        cache.store(KEY, &decision(true, 4), now);
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(KEY, now), None);
    }

    #[test]
    fn test_allow_clears_stale_denial() {
        let cache = DecisionCache::new(Duration::from_millis(250));
        let now = Instant::now();
        cache.store(KEY, &decision(false, 0), now);
        assert_eq!(cache.len(), 1);

        cache.store(KEY, &decision(true, 4), now);
        assert_eq!(cache.lookup(KEY, now), None);
    }

    #[test]
    fn test_denial_served_until_ttl() {
        let cache = DecisionCache::new(Duration::from_millis(250));
        let now = Instant::now();
        cache.store(KEY, &decision(false, 0), now);

        for _ in 0..10 {
            let hit = cache.lookup(KEY, now).expect("cached denial");
            assert!(!hit.allowed);
            assert_eq!(hit.retry_after, Some(50));
        }
        assert_eq!(cache.lookup(KEY, now + Duration::from_millis(300)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_denial_lifetime_capped_by_retry_after() {
        let cache = DecisionCache::new(Duration::from_secs(5));
        let now = Instant::now();
        let mut denied = decision(false, 0);
        denied.retry_after = Some(2);
        cache.store(KEY, &denied, now);

        let later = cache.lookup(KEY, now + Duration::from_secs(1)).expect("cached denial");
        assert_eq!(later.retry_after, Some(1));
        assert_eq!(cache.lookup(KEY, now + Duration::from_secs(2)), None);
    }

    #[test]
    fn test_degraded_and_disabled_never_cached() {
        let cache = DecisionCache::new(Duration::from_millis(250));
        let now = Instant::now();
        let mut degraded = decision(false, 0);
        degraded.degraded = true;
        cache.store(KEY, &degraded, now);
        assert!(cache.is_empty());

        let disabled = DecisionCache::new(Duration::ZERO);
        disabled.store(KEY, &decision(false, 0), now);
        assert!(disabled.is_empty());
        assert_eq!(disabled.lookup(KEY, now), None);
    }

    #[test]
    fn test_purge_expired() {
        let cache = DecisionCache::new(Duration::from_millis(100));
        let now = Instant::now();
        cache.store("a", &decision(false, 0), now);
        cache.store("b", &decision(false, 0), now + Duration::from_millis(80));

        cache.purge_expired(now + Duration::from_millis(120));
        assert_eq!(cache.len(), 1);
    }
}
