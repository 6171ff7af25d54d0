//! Shared quota store abstraction.
//!
//! Every mutating operation is one atomic check-and-update against the backing
//! store: the verdict and the counter change happen together or not at all, so
//! concurrent callers never need client-side locking.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;

use crate::error::Result;

/// Result of a counting (fixed or sliding window) operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    /// Requests counted in the current window after this operation
    pub count: u64,
    /// Milliseconds until capacity frees up (window expiry, or the oldest
    /// logged request leaving a sliding window)
    pub ttl_ms: u64,
}

/// Read-only view of a counting key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowState {
    pub count: u64,
    pub ttl_ms: u64,
}

/// Token bucket shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    pub capacity: u64,
    pub refill_per_sec: f64,
}

impl BucketSpec {
    pub fn new(capacity: u64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// Tokens available at `now_ms` given the last stored level.
    pub fn refill(&self, tokens: f64, updated_ms: u64, now_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(updated_ms) as f64;
        (tokens + elapsed * self.refill_per_sec / 1000.0).min(self.capacity as f64)
    }

    /// Milliseconds until `hits` tokens are available.
    pub fn retry_after_ms(&self, tokens: f64, hits: u64) -> u64 {
        let missing = hits as f64 - tokens;
        if missing <= TOKEN_EPSILON {
            return 0;
        }
        (missing * 1000.0 / self.refill_per_sec).ceil() as u64
    }

    /// Milliseconds until the bucket is full again.
    pub fn full_in_ms(&self, tokens: f64) -> u64 {
        let missing = self.capacity as f64 - tokens;
        if missing <= TOKEN_EPSILON {
            return 0;
        }
        (missing * 1000.0 / self.refill_per_sec).ceil() as u64
    }
}

/// Absorbs float drift in refill arithmetic.
pub(crate) const TOKEN_EPSILON: f64 = 1e-9;

/// Result of a token bucket debit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// Tokens left after this operation
    pub tokens: f64,
    /// Milliseconds until the requested hits could be admitted (0 if allowed)
    pub retry_after_ms: u64,
    /// Milliseconds until the bucket is full
    pub full_in_ms: u64,
}

/// Read-only view of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub full_in_ms: u64,
}

/// Atomic quota primitives over a key-value store with expiry.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Short name used in logs and health reports.
    fn backend_name(&self) -> &'static str;

    /// Fixed window: create at `hits` with TTL = window when absent, increment
    /// while within `limit`, otherwise deny without incrementing.
    async fn fixed_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        hits: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome>;

    /// Sliding window log: prune entries at or before `now - window`, then
    /// append `hits` entries if the remaining count allows it.
    async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        hits: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome>;

    /// Token bucket: refill by elapsed time up to capacity, then debit `hits`.
    async fn token_bucket(
        &self,
        key: &str,
        spec: BucketSpec,
        hits: u64,
        now_ms: u64,
    ) -> Result<BucketOutcome>;

    async fn peek_fixed_window(&self, key: &str, now_ms: u64) -> Result<WindowState>;

    async fn peek_sliding_window(&self, key: &str, window_ms: u64, now_ms: u64)
        -> Result<WindowState>;

    async fn peek_token_bucket(&self, key: &str, spec: BucketSpec, now_ms: u64)
        -> Result<BucketState>;

    /// Remove keys; returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u32>;

    /// Connectivity check.
    async fn ping(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_refill_caps_at_capacity() {
        let spec = BucketSpec::new(10, 2.0);
        assert_eq!(spec.refill(0.0, 0, 1_000), 2.0);
        assert_eq!(spec.refill(9.0, 0, 10_000), 10.0);
        // Clock moving backwards never removes tokens.
        assert_eq!(spec.refill(3.0, 5_000, 1_000), 3.0);
    }

    #[test]
    fn test_bucket_timings() {
        let spec = BucketSpec::new(4, 1.0);
        assert_eq!(spec.retry_after_ms(0.0, 1), 1_000);
        assert_eq!(spec.retry_after_ms(0.5, 1), 500);
        assert_eq!(spec.retry_after_ms(2.0, 1), 0);
        assert_eq!(spec.full_in_ms(0.0), 4_000);
        assert_eq!(spec.full_in_ms(4.0), 0);
    }
}
