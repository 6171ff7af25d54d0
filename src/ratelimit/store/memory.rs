//! In-process quota store.
//!
//! Each operation holds the dashmap shard lock for its key for the whole
//! check-and-update, which gives the same atomicity a scripted remote store
//! provides. Expiry is emulated from the caller-supplied clock: expired slots
//! read as absent and are purged periodically as operations run.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use super::{
    BucketOutcome, BucketSpec, BucketState, QuotaStore, WindowOutcome, WindowState, TOKEN_EPSILON,
};
use crate::error::Result;

/// Operations between opportunistic purges of expired slots.
const PURGE_EVERY: u64 = 1024;

#[derive(Debug, Clone)]
enum Slot {
    Window {
        count: u64,
        expires_at_ms: u64,
    },
    Log {
        entries: VecDeque<u64>,
        expires_at_ms: u64,
    },
    Bucket {
        tokens: f64,
        updated_ms: u64,
        expires_at_ms: u64,
    },
}

impl Slot {
    fn expires_at_ms(&self) -> u64 {
        match self {
            Slot::Window { expires_at_ms, .. }
            | Slot::Log { expires_at_ms, .. }
            | Slot::Bucket { expires_at_ms, .. } => *expires_at_ms,
        }
    }

    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms() > now_ms
    }
}

/// A [`QuotaStore`] held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    ops: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots currently held, live or not yet purged.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every slot that has expired by `now_ms`.
    pub fn purge_expired(&self, now_ms: u64) {
        self.slots.retain(|_, slot| slot.is_live(now_ms));
    }

    /// Must be called with no shard guard held.
    fn after_op(&self, now_ms: u64) {
        if self.ops.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired(now_ms);
        }
    }

    fn live_slot(&self, key: &str, now_ms: u64) -> Option<Slot> {
        self.slots
            .get(key)
            .map(|slot| slot.clone())
            .filter(|slot| slot.is_live(now_ms))
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn fixed_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        hits: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        let outcome = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                Slot::Window {
                    count,
                    expires_at_ms,
                } if *expires_at_ms > now_ms => {
                    let ttl_ms = *expires_at_ms - now_ms;
                    if *count + hits > limit {
                        WindowOutcome {
                            allowed: false,
                            count: *count,
                            ttl_ms,
                        }
                    } else {
                        *count += hits;
                        WindowOutcome {
                            allowed: true,
                            count: *count,
                            ttl_ms,
                        }
                    }
                }
                slot => start_window(slot, limit, window_ms, hits, now_ms),
            },
            Entry::Vacant(vacant) => {
                if hits > limit {
                    WindowOutcome {
                        allowed: false,
                        count: 0,
                        ttl_ms: window_ms,
                    }
                } else {
                    vacant.insert(Slot::Window {
                        count: hits,
                        expires_at_ms: now_ms.saturating_add(window_ms),
                    });
                    WindowOutcome {
                        allowed: true,
                        count: hits,
                        ttl_ms: window_ms,
                    }
                }
            }
        };

        trace!(key, allowed = outcome.allowed, count = outcome.count, "Fixed window hit");
        self.after_op(now_ms);
        Ok(outcome)
    }

    async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        hits: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        let outcome = {
            let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot::Log {
                entries: VecDeque::new(),
                expires_at_ms: 0,
            });
            if !matches!(*slot, Slot::Log { .. }) {
                *slot = Slot::Log {
                    entries: VecDeque::new(),
                    expires_at_ms: 0,
                };
            }

            let Slot::Log {
                entries,
                expires_at_ms,
            } = &mut *slot
            else {
                unreachable!("slot was just normalized to a log");
            };

            let horizon = now_ms.saturating_sub(window_ms);
            while entries.front().is_some_and(|ts| *ts <= horizon) {
                entries.pop_front();
            }

            let count = entries.len() as u64;
            let allowed = count + hits <= limit;
            if allowed {
                entries.extend(std::iter::repeat(now_ms).take(hits as usize));
                *expires_at_ms = now_ms.saturating_add(window_ms);
            }

            let ttl_ms = entries
                .front()
                .map(|oldest| (oldest + window_ms).saturating_sub(now_ms))
                .unwrap_or(window_ms);

            WindowOutcome {
                allowed,
                count: entries.len() as u64,
                ttl_ms,
            }
        };

        trace!(key, allowed = outcome.allowed, count = outcome.count, "Sliding window hit");
        self.after_op(now_ms);
        Ok(outcome)
    }

    async fn token_bucket(
        &self,
        key: &str,
        spec: BucketSpec,
        hits: u64,
        now_ms: u64,
    ) -> Result<BucketOutcome> {
        let outcome = {
            let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot::Bucket {
                tokens: spec.capacity as f64,
                updated_ms: now_ms,
                expires_at_ms: 0,
            });

            let (stored, updated) = match &*slot {
                Slot::Bucket {
                    tokens,
                    updated_ms,
                    expires_at_ms,
                } if *expires_at_ms > now_ms || *expires_at_ms == 0 => (*tokens, *updated_ms),
                _ => (spec.capacity as f64, now_ms),
            };

            let mut tokens = spec.refill(stored, updated, now_ms);
            let allowed = tokens + TOKEN_EPSILON >= hits as f64;
            if allowed {
                tokens = (tokens - hits as f64).max(0.0);
            }

            let full_in_ms = spec.full_in_ms(tokens);
            *slot = Slot::Bucket {
                tokens,
                updated_ms: now_ms.max(updated),
                expires_at_ms: now_ms.saturating_add(full_in_ms).saturating_add(1_000),
            };

            BucketOutcome {
                allowed,
                tokens,
                retry_after_ms: if allowed { 0 } else { spec.retry_after_ms(tokens, hits) },
                full_in_ms,
            }
        };

        trace!(key, allowed = outcome.allowed, tokens = outcome.tokens, "Token bucket hit");
        self.after_op(now_ms);
        Ok(outcome)
    }

    async fn peek_fixed_window(&self, key: &str, now_ms: u64) -> Result<WindowState> {
        Ok(match self.live_slot(key, now_ms) {
            Some(Slot::Window {
                count,
                expires_at_ms,
            }) => WindowState {
                count,
                ttl_ms: expires_at_ms - now_ms,
            },
            _ => WindowState::default(),
        })
    }

    async fn peek_sliding_window(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowState> {
        Ok(match self.live_slot(key, now_ms) {
            Some(Slot::Log { entries, .. }) => {
                let horizon = now_ms.saturating_sub(window_ms);
                let mut live = entries.iter().filter(|ts| **ts > horizon);
                let oldest = live.next();
                WindowState {
                    count: oldest.map(|_| 1 + live.count() as u64).unwrap_or(0),
                    ttl_ms: oldest
                        .map(|ts| (ts + window_ms).saturating_sub(now_ms))
                        .unwrap_or(0),
                }
            }
            _ => WindowState::default(),
        })
    }

    async fn peek_token_bucket(
        &self,
        key: &str,
        spec: BucketSpec,
        now_ms: u64,
    ) -> Result<BucketState> {
        let tokens = match self.live_slot(key, now_ms) {
            Some(Slot::Bucket {
                tokens, updated_ms, ..
            }) => spec.refill(tokens, updated_ms, now_ms),
            _ => spec.capacity as f64,
        };
        Ok(BucketState {
            tokens,
            full_in_ms: spec.full_in_ms(tokens),
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<u32> {
        let removed = keys
            .iter()
            .filter(|key| self.slots.remove(key.as_str()).is_some())
            .count();
        Ok(removed as u32)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Replace an expired or foreign slot with a fresh window.
fn start_window(slot: &mut Slot, limit: u64, window_ms: u64, hits: u64, now_ms: u64) -> WindowOutcome {
    if hits > limit {
        // Leave nothing behind: an oversized request never opens a window.
        *slot = Slot::Window {
            count: 0,
            expires_at_ms: now_ms,
        };
        return WindowOutcome {
            allowed: false,
            count: 0,
            ttl_ms: window_ms,
        };
    }
    *slot = Slot::Window {
        count: hits,
        expires_at_ms: now_ms.saturating_add(window_ms),
    };
    WindowOutcome {
        allowed: true,
        count: hits,
        ttl_ms: window_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW_MS: u64 = 60_000;

    #[tokio::test]
    async fn test_fixed_window_counts_up_to_limit() {
        let store = MemoryStore::new();

        for expected in 1..=5 {
            let outcome = store.fixed_window("k", 5, WINDOW_MS, 1, 0).await.unwrap();
            assert!(outcome.allowed);
            assert_eq!(outcome.count, expected);
        }

        let outcome = store.fixed_window("k", 5, WINDOW_MS, 1, 10_000).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.count, 5);
        assert_eq!(outcome.ttl_ms, 50_000);
    }

    #[tokio::test]
    async fn test_fixed_window_denial_does_not_increment() {
        let store = MemoryStore::new();
        store.fixed_window("k", 1, WINDOW_MS, 1, 0).await.unwrap();
        for _ in 0..3 {
            store.fixed_window("k", 1, WINDOW_MS, 1, 1).await.unwrap();
        }
        let state = store.peek_fixed_window("k", 2).await.unwrap();
        assert_eq!(state.count, 1);
    }

    #[tokio::test]
    async fn test_fixed_window_expires() {
        let store = MemoryStore::new();
        store.fixed_window("k", 1, WINDOW_MS, 1, 0).await.unwrap();
        assert!(!store.fixed_window("k", 1, WINDOW_MS, 1, 59_999).await.unwrap().allowed);

        let outcome = store.fixed_window("k", 1, WINDOW_MS, 1, 60_000).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.ttl_ms, WINDOW_MS);
    }

    #[tokio::test]
    async fn test_fixed_window_oversized_hits() {
        let store = MemoryStore::new();
        let outcome = store.fixed_window("k", 3, WINDOW_MS, 4, 0).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(store.peek_fixed_window("k", 0).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_fixed_window_concurrent_callers_never_over_admit() {
        let store = Arc::new(MemoryStore::new());
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.fixed_window("shared", 10, WINDOW_MS, 1, 0).await.unwrap().allowed
                })
            })
            .collect();

        let mut admitted = 0;
        for task in futures::future::join_all(tasks).await {
            if task.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_sliding_window_prunes_old_entries() {
        let store = MemoryStore::new();
        assert!(store.sliding_window("k", 2, 10_000, 1, 0).await.unwrap().allowed);
        assert!(store.sliding_window("k", 2, 10_000, 1, 4_000).await.unwrap().allowed);

        let denied = store.sliding_window("k", 2, 10_000, 1, 6_000).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.ttl_ms, 4_000);

        // First entry leaves the window at t = 10s.
        let outcome = store.sliding_window("k", 2, 10_000, 1, 10_000).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 2);
        assert_eq!(outcome.ttl_ms, 4_000);
    }

    #[tokio::test]
    async fn test_sliding_window_peek() {
        let store = MemoryStore::new();
        store.sliding_window("k", 5, 10_000, 2, 1_000).await.unwrap();
        let state = store.peek_sliding_window("k", 10_000, 5_000).await.unwrap();
        assert_eq!(state.count, 2);
        assert_eq!(state.ttl_ms, 6_000);

        let state = store.peek_sliding_window("k", 10_000, 11_000).await.unwrap();
        assert_eq!(state.count, 0);
    }

    #[tokio::test]
    async fn test_token_bucket_burst_then_refill() {
        let store = MemoryStore::new();
        let spec = BucketSpec::new(4, 1.0);

        for _ in 0..4 {
            assert!(store.token_bucket("k", spec, 1, 0).await.unwrap().allowed);
        }
        let denied = store.token_bucket("k", spec, 1, 0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, 1_000);

        assert!(store.token_bucket("k", spec, 1, 1_000).await.unwrap().allowed);
        assert!(!store.token_bucket("k", spec, 1, 1_000).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_peek_does_not_debit() {
        let store = MemoryStore::new();
        let spec = BucketSpec::new(4, 1.0);
        store.token_bucket("k", spec, 3, 0).await.unwrap();

        let state = store.peek_token_bucket("k", spec, 0).await.unwrap();
        assert_eq!(state.tokens, 1.0);
        let state = store.peek_token_bucket("k", spec, 0).await.unwrap();
        assert_eq!(state.tokens, 1.0);
        assert_eq!(state.full_in_ms, 3_000);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.fixed_window("a", 1, WINDOW_MS, 1, 0).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string()];
        assert_eq!(store.delete(&keys).await.unwrap(), 1);
        assert_eq!(store.delete(&keys).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.fixed_window("a", 1, 1_000, 1, 0).await.unwrap();
        store.fixed_window("b", 1, 5_000, 1, 0).await.unwrap();

        store.purge_expired(2_000);
        assert_eq!(store.len(), 1);
    }
}
