//! The decision engine.
//!
//! Resolves the effective policy for a [`CheckContext`], derives its identity
//! key, and performs exactly one atomic store operation for the policy's
//! algorithm. Store failures never surface to the caller of [`DecisionEngine::check`]:
//! the policy's failure mode turns them into a degraded verdict.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::clock::{ceil_secs, Clock, SystemClock};
use super::identity::{CheckContext, IdentityKey};
use super::policy::{Algorithm, FailureMode, Policy};
use super::registry::PolicyRegistry;
use super::store::{BucketSpec, QuotaStore};
use crate::error::{GatekeeperError, Result};

/// Default prefix for every store key.
pub const DEFAULT_KEY_PREFIX: &str = "gatekeeper";

/// Default bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(25);

/// A verdict plus the quota metadata callers surface to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix timestamp (seconds) at which quota is restored
    pub reset_at: i64,
    /// Seconds to wait before retrying; only set on denial
    pub retry_after: Option<u64>,
    /// The policy is the `limit = 0` sentinel
    pub unlimited: bool,
    /// The store could not be consulted and the failure mode decided
    pub degraded: bool,
    pub policy_scope: String,
    pub policy_version: u64,
}

/// Current consumption of one bucket, read without mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: i64,
    pub unlimited: bool,
    pub algorithm: Algorithm,
}

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub key_prefix: String,
    pub store_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// Atomic check-and-increment core shared by every calling service.
pub struct DecisionEngine {
    store: Arc<dyn QuotaStore>,
    registry: Arc<PolicyRegistry>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    instance_id: Uuid,
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("store", &self.store.backend_name())
            .field("policy_version", &self.registry.version())
            .field("settings", &self.settings)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl DecisionEngine {
    /// Create an engine on the system clock with default settings.
    pub fn new(store: Arc<dyn QuotaStore>, registry: Arc<PolicyRegistry>) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            settings: EngineSettings::default(),
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Resolve the policy that applies to a context right now.
    pub fn effective_policy(&self, ctx: &CheckContext) -> (Policy, u64) {
        let snapshot = self.registry.snapshot();
        let policy = snapshot
            .table
            .effective_policy(&ctx.endpoint, ctx.role(), ctx.overrides());
        (policy, snapshot.version)
    }

    /// Admit or deny one request.
    ///
    /// Only an invalid context is an error; store trouble yields a degraded
    /// decision according to the policy's failure mode.
    pub async fn check(&self, ctx: &CheckContext) -> Result<Decision> {
        ctx.validate()?;

        let (policy, version) = self.effective_policy(ctx);
        let now_ms = self.clock.now_ms();

        if policy.is_unlimited() {
            trace!(endpoint = %ctx.endpoint, scope = %policy.scope, "Unlimited policy");
            return Ok(Decision {
                allowed: true,
                limit: 0,
                remaining: 0,
                reset_at: (now_ms / 1000) as i64,
                retry_after: None,
                unlimited: true,
                degraded: false,
                policy_scope: policy.scope,
                policy_version: version,
            });
        }

        let key = ctx.identity_key();
        let hits = u64::from(ctx.hits());

        trace!(
            key = %key,
            scope = %policy.scope,
            algorithm = ?policy.algorithm,
            limit = policy.limit,
            window_secs = policy.window_secs,
            hits,
            "Checking rate limit"
        );

        let decision = match self.apply(&key, &policy, hits, now_ms).await {
            Ok(verdict) => verdict.into_decision(&policy, version),
            Err(err) => self.degraded(&key, &policy, version, now_ms, &err),
        };

        if !decision.allowed && !decision.degraded {
            debug!(
                key = %key,
                limit = decision.limit,
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }

    async fn apply(&self, key: &IdentityKey, policy: &Policy, hits: u64, now_ms: u64) -> Result<Verdict> {
        let store_key = key.storage_key(&self.settings.key_prefix, policy.algorithm);
        let window_ms = policy.window_ms();

        match policy.algorithm {
            Algorithm::FixedWindow => {
                let outcome = self
                    .bounded(self.store.fixed_window(&store_key, policy.limit, window_ms, hits, now_ms))
                    .await?;
                Ok(Verdict {
                    allowed: outcome.allowed,
                    limit: policy.limit,
                    remaining: policy.limit.saturating_sub(outcome.count),
                    reset_in_ms: outcome.ttl_ms,
                    retry_after_ms: outcome.ttl_ms,
                    now_ms,
                })
            }
            Algorithm::SlidingWindow => {
                let outcome = self
                    .bounded(self.store.sliding_window(&store_key, policy.limit, window_ms, hits, now_ms))
                    .await?;
                Ok(Verdict {
                    allowed: outcome.allowed,
                    limit: policy.limit,
                    remaining: policy.limit.saturating_sub(outcome.count),
                    reset_in_ms: outcome.ttl_ms,
                    retry_after_ms: outcome.ttl_ms,
                    now_ms,
                })
            }
            Algorithm::TokenBucket => {
                let spec = BucketSpec::new(policy.capacity(), policy.refill_per_sec());
                let outcome = self
                    .bounded(self.store.token_bucket(&store_key, spec, hits, now_ms))
                    .await?;
                Ok(Verdict {
                    allowed: outcome.allowed,
                    limit: spec.capacity,
                    remaining: whole_tokens(outcome.tokens),
                    reset_in_ms: outcome.full_in_ms,
                    retry_after_ms: outcome.retry_after_ms,
                    now_ms,
                })
            }
        }
    }

    fn degraded(
        &self,
        key: &IdentityKey,
        policy: &Policy,
        version: u64,
        now_ms: u64,
        err: &GatekeeperError,
    ) -> Decision {
        let allowed = policy.failure_mode == FailureMode::Open;
        warn!(
            key = %key,
            scope = %policy.scope,
            backend = self.store.backend_name(),
            error = %err,
            fail_open = allowed,
            "Quota store unavailable, deciding by failure mode"
        );

        Decision {
            allowed,
            limit: policy.limit,
            remaining: if allowed { policy.limit } else { 0 },
            reset_at: (now_ms.saturating_add(policy.window_ms()) / 1000) as i64,
            retry_after: if allowed { None } else { Some(1) },
            unlimited: false,
            degraded: true,
            policy_scope: policy.scope.clone(),
            policy_version: version,
        }
    }

    /// Read the current usage for a context without charging it.
    pub async fn usage(&self, ctx: &CheckContext) -> Result<Usage> {
        ctx.validate()?;
        let (policy, _) = self.effective_policy(ctx);
        let now_ms = self.clock.now_ms();

        if policy.is_unlimited() {
            return Ok(Usage {
                used: 0,
                limit: 0,
                remaining: 0,
                reset_at: (now_ms / 1000) as i64,
                unlimited: true,
                algorithm: policy.algorithm,
            });
        }

        let store_key = ctx
            .identity_key()
            .storage_key(&self.settings.key_prefix, policy.algorithm);
        let window_ms = policy.window_ms();

        let (used, limit, reset_in_ms) = match policy.algorithm {
            Algorithm::FixedWindow => {
                let state = self.bounded(self.store.peek_fixed_window(&store_key, now_ms)).await?;
                (state.count, policy.limit, state.ttl_ms)
            }
            Algorithm::SlidingWindow => {
                let state = self
                    .bounded(self.store.peek_sliding_window(&store_key, window_ms, now_ms))
                    .await?;
                (state.count, policy.limit, state.ttl_ms)
            }
            Algorithm::TokenBucket => {
                let spec = BucketSpec::new(policy.capacity(), policy.refill_per_sec());
                let state = self
                    .bounded(self.store.peek_token_bucket(&store_key, spec, now_ms))
                    .await?;
                let available = whole_tokens(state.tokens);
                (spec.capacity.saturating_sub(available), spec.capacity, state.full_in_ms)
            }
        };

        Ok(Usage {
            used,
            limit,
            remaining: limit.saturating_sub(used),
            reset_at: unix_secs_ceil(now_ms.saturating_add(reset_in_ms)),
            unlimited: false,
            algorithm: policy.algorithm,
        })
    }

    /// Drop every counter for an identity/endpoint pair. Idempotent.
    pub async fn reset(&self, key: &IdentityKey) -> Result<u32> {
        let keys = key.all_storage_keys(&self.settings.key_prefix);
        let removed = self.bounded(self.store.delete(&keys)).await?;
        debug!(key = %key, removed, "Reset quota counters");
        Ok(removed)
    }

    /// Verify the store answers within the store timeout.
    pub async fn health(&self) -> Result<()> {
        self.bounded(self.store.ping()).await
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.settings.store_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(GatekeeperError::Timeout(
                self.settings.store_timeout.as_millis() as u64,
            )),
        }
    }
}

/// Algorithm-neutral store result.
struct Verdict {
    allowed: bool,
    limit: u64,
    remaining: u64,
    reset_in_ms: u64,
    retry_after_ms: u64,
    now_ms: u64,
}

impl Verdict {
    fn into_decision(self, policy: &Policy, version: u64) -> Decision {
        let retry_after = if self.allowed {
            None
        } else {
            Some(ceil_secs(self.retry_after_ms).max(1))
        };
        Decision {
            allowed: self.allowed,
            limit: self.limit,
            remaining: if self.allowed { self.remaining } else { 0 },
            reset_at: unix_secs_ceil(self.now_ms.saturating_add(self.reset_in_ms)),
            retry_after,
            unlimited: false,
            degraded: false,
            policy_scope: policy.scope.clone(),
            policy_version: version,
        }
    }
}

fn whole_tokens(tokens: f64) -> u64 {
    (tokens + super::store::TOKEN_EPSILON).floor().max(0.0) as u64
}

fn unix_secs_ceil(ms: u64) -> i64 {
    ceil_secs(ms) as i64
}
