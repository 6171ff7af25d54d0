//! Local degradation mode.
//!
//! A process-local fixed window with one conservative limit for every
//! endpoint. It shares nothing across replicas, so it bounds abuse during an
//! engine outage rather than enforcing the global quota.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::FallbackConfig;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::clock::Clock;
use crate::ratelimit::store::MemoryStore;
use crate::ratelimit::{
    CheckContext, Decision, DecisionEngine, EngineSettings, Policy, PolicyRegistry, PolicyTable,
    DEFAULT_SCOPE,
};

/// Key prefix keeping local counters apart from anything the engine writes.
const LOCAL_KEY_PREFIX: &str = "gatekeeper-local";

#[derive(Debug)]
pub struct FallbackLimiter {
    engine: DecisionEngine,
}

impl FallbackLimiter {
    /// Create a limiter admitting `limit` requests per `window_secs` for each
    /// identity and endpoint.
    pub fn new(limit: u64, window_secs: u64) -> Result<Self> {
        if limit == 0 {
            return Err(GatekeeperError::Config("fallback limit must be positive".into()));
        }
        let table = PolicyTable::new(Policy::new(DEFAULT_SCOPE, limit, window_secs), HashMap::new())?;
        let engine = DecisionEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(PolicyRegistry::new(table)),
        )
        .with_settings(EngineSettings {
            key_prefix: LOCAL_KEY_PREFIX.to_string(),
            ..EngineSettings::default()
        });
        Ok(Self { engine })
    }

    pub fn from_config(config: &FallbackConfig) -> Result<Self> {
        Self::new(config.limit, config.window_secs)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.engine = self.engine.with_clock(clock);
        self
    }

    /// Decide locally. Roles and overrides are ignored; the result is always
    /// marked degraded.
    pub async fn check(&self, ctx: &CheckContext) -> Result<Decision> {
        let local = CheckContext {
            custom_limit: None,
            custom_window: None,
            ..ctx.clone()
        };

        let mut decision = self.engine.check(&local).await?;
        decision.degraded = true;
        if !decision.allowed {
            warn!(
                key = %local.identity_key(),
                limit = decision.limit,
                "Local fallback limit exceeded"
            );
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::time::Duration;

    #[tokio::test]
    async fn test_default_budget() {
        let limiter = FallbackLimiter::from_config(&FallbackConfig::default()).unwrap();
        let ctx = CheckContext::new("10.0.0.1", "/api/orders").with_role("admin");

        for _ in 0..60 {
            let decision = limiter.check(&ctx).await.unwrap();
            assert!(decision.allowed);
            assert!(decision.degraded);
            assert_eq!(decision.limit, 60);
        }
        assert!(!limiter.check(&ctx).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_overrides_ignored_and_window_resets() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let limiter = FallbackLimiter::new(2, 10).unwrap().with_clock(clock.clone());
        let ctx = CheckContext::new("10.0.0.2", "/api/orders").with_overrides(Some(100), Some(1));

        assert!(limiter.check(&ctx).await.unwrap().allowed);
        assert!(limiter.check(&ctx).await.unwrap().allowed);
        let denied = limiter.check(&ctx).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(10));

        clock.advance(Duration::from_secs(10));
        assert!(limiter.check(&ctx).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_identities_counted_separately() {
        let limiter = FallbackLimiter::new(1, 60).unwrap();
        let alice = CheckContext::new("10.0.0.3", "/a").with_user("alice");
        let bob = CheckContext::new("10.0.0.3", "/a").with_user("bob");

        assert!(limiter.check(&alice).await.unwrap().allowed);
        assert!(!limiter.check(&alice).await.unwrap().allowed);
        assert!(limiter.check(&bob).await.unwrap().allowed);
    }

    #[test]
    fn test_zero_window_or_limit_rejected() {
        assert!(FallbackLimiter::new(10, 0).is_err());
        assert!(matches!(
            FallbackLimiter::new(0, 60),
            Err(GatekeeperError::Config(_))
        ));
    }
}
