//! Per-request enforcement.
//!
//! Every guarded request runs the same state machine:
//!
//! ```text
//! Unchecked -> Central -> Allowed | Denied
//!                      -> CentralUnavailable -> Local -> Allowed | Denied
//! ```
//!
//! The central call is bounded by a short timeout, so every path resolves to
//! a verdict without waiting on the engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::cache::DecisionCache;
use super::fallback::FallbackLimiter;
use super::transport::DecisionTransport;
use crate::config::ClientConfig;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{CheckContext, Decision};

/// Where a verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPath {
    /// The endpoint is on the skip list; nothing was checked.
    Skipped,
    /// Served from the memoization cache.
    Cache,
    /// Decided by the central engine.
    Central,
    /// The engine was unavailable; decided by the fallback limiter.
    Local,
}

/// Terminal state of a guarded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardOutcome {
    pub path: CheckPath,
    /// Absent only when the request was skipped
    pub decision: Option<Decision>,
}

impl GuardOutcome {
    fn skipped() -> Self {
        Self {
            path: CheckPath::Skipped,
            decision: None,
        }
    }

    pub fn allowed(&self) -> bool {
        self.decision.as_ref().map_or(true, |d| d.allowed)
    }
}

/// Paths exempt from rate limiting. Entries ending in `/` match as prefixes.
#[derive(Debug, Clone, Default)]
pub struct SkipList {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl SkipList {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::default();
        for path in paths {
            let path = path.into();
            if path.ends_with('/') {
                list.prefixes.push(path);
            } else {
                list.exact.insert(path);
            }
        }
        list
    }

    pub fn contains(&self, path: &str) -> bool {
        self.exact.contains(path) || self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

enum Central {
    Decided(Decision),
    Unavailable(GatekeeperError),
}

/// Client-side enforcement in front of a [`DecisionTransport`].
pub struct RateLimitGuard {
    transport: Arc<dyn DecisionTransport>,
    cache: DecisionCache,
    fallback: FallbackLimiter,
    skip: SkipList,
    timeout: Duration,
    trust_forwarded: bool,
}

impl std::fmt::Debug for RateLimitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitGuard")
            .field("transport", &self.transport.name())
            .field("skip", &self.skip)
            .field("timeout", &self.timeout)
            .field("trust_forwarded", &self.trust_forwarded)
            .finish()
    }
}

impl RateLimitGuard {
    pub fn new(transport: Arc<dyn DecisionTransport>, config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            transport,
            cache: DecisionCache::new(config.cache_ttl()),
            fallback: FallbackLimiter::from_config(&config.fallback)?,
            skip: SkipList::new(config.skip_paths.iter().cloned()),
            timeout: config.timeout(),
            trust_forwarded: config.trust_forwarded_headers,
        })
    }

    /// Replace the fallback limiter.
    pub fn with_fallback(mut self, fallback: FallbackLimiter) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn is_skipped(&self, path: &str) -> bool {
        self.skip.contains(path)
    }

    /// Whether the client IP may be read from forwarding headers.
    pub fn trusts_forwarded_headers(&self) -> bool {
        self.trust_forwarded
    }

    /// Resolve a request to a verdict.
    ///
    /// Only `InvalidContext` is returned as an error; engine trouble of any
    /// kind is absorbed by the fallback limiter.
    pub async fn check(&self, ctx: &CheckContext) -> Result<GuardOutcome> {
        if self.is_skipped(&ctx.endpoint) {
            return Ok(GuardOutcome::skipped());
        }
        ctx.validate()?;

        let cache_key = ctx.identity_key().to_string_key();
        if let Some(decision) = self.cache.lookup(&cache_key, Instant::now()) {
            debug!(key = %cache_key, retry_after = ?decision.retry_after, "Serving cached denial");
            return Ok(GuardOutcome {
                path: CheckPath::Cache,
                decision: Some(decision),
            });
        }

        match self.central(ctx).await? {
            Central::Decided(decision) => {
                self.cache.store(&cache_key, &decision, Instant::now());
                Ok(GuardOutcome {
                    path: CheckPath::Central,
                    decision: Some(decision),
                })
            }
            Central::Unavailable(err) => {
                warn!(
                    endpoint = %ctx.endpoint,
                    transport = self.transport.name(),
                    error = %err,
                    "Decision engine unavailable, using local fallback"
                );
                let decision = self.fallback.check(ctx).await?;
                Ok(GuardOutcome {
                    path: CheckPath::Local,
                    decision: Some(decision),
                })
            }
        }
    }

    async fn central(&self, ctx: &CheckContext) -> Result<Central> {
        let result = tokio::time::timeout(self.timeout, self.transport.check(ctx)).await;
        match result {
            Ok(Ok(decision)) if decision.degraded => Ok(Central::Unavailable(
                GatekeeperError::StoreUnavailable("engine answered degraded".into()),
            )),
            Ok(Ok(decision)) => Ok(Central::Decided(decision)),
            Ok(Err(err @ GatekeeperError::InvalidContext(_))) => Err(err),
            Ok(Err(err)) => Ok(Central::Unavailable(err)),
            Err(_) => Ok(Central::Unavailable(GatekeeperError::Timeout(
                self.timeout.as_millis() as u64,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InProcessTransport;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::store::MemoryStore;
    use crate::ratelimit::{DecisionEngine, PolicyRegistry, PolicyTable};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::assert_err;

    const TABLE: &str = r#"
endpoints:
  - scope: /api/auth/login
    limit: 5
    window_secs: 60
role_multipliers:
  anonymous: 1
"#;

    fn config(cache_ttl_ms: u64) -> ClientConfig {
        ClientConfig {
            cache_ttl_ms,
            ..ClientConfig::default()
        }
    }

    fn in_process() -> Arc<dyn DecisionTransport> {
        let registry = Arc::new(PolicyRegistry::new(PolicyTable::from_yaml(TABLE).unwrap()));
        let engine = DecisionEngine::new(Arc::new(MemoryStore::new()), registry)
            .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)));
        Arc::new(InProcessTransport::new(Arc::new(engine)))
    }

    fn login() -> CheckContext {
        CheckContext::new("203.0.113.5", "/api/auth/login")
    }

    /// Transport that records calls and fails, hangs or answers degraded.
    struct Unavailable {
        mode: &'static str,
        calls: AtomicU32,
    }

    impl Unavailable {
        fn new(mode: &'static str) -> Arc<Self> {
            Arc::new(Self {
                mode,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl DecisionTransport for Unavailable {
        fn name(&self) -> &'static str {
            "unavailable"
        }

        async fn check(&self, ctx: &CheckContext) -> Result<Decision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Err(GatekeeperError::StoreUnavailable("late".into()))
                }
                "degraded" => Ok(Decision {
                    allowed: true,
                    limit: 5,
                    remaining: 5,
                    reset_at: 0,
                    retry_after: None,
                    unlimited: false,
                    degraded: true,
                    policy_scope: ctx.endpoint.clone(),
                    policy_version: 1,
                }),
                _ => Err(GatekeeperError::StoreUnavailable("connection refused".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_central_path_counts_down_and_denies() {
        let guard = RateLimitGuard::new(in_process(), &config(0)).unwrap();

        for expected in [4, 3, 2, 1, 0] {
            let outcome = guard.check(&login()).await.unwrap();
            assert_eq!(outcome.path, CheckPath::Central);
            assert_eq!(outcome.decision.unwrap().remaining, expected);
        }
        let denied = guard.check(&login()).await.unwrap();
        assert!(!denied.allowed());
        assert_eq!(denied.decision.unwrap().retry_after, Some(60));
    }

    #[tokio::test]
    async fn test_skip_list_bypasses_everything() {
        let transport = Unavailable::new("error");
        let guard = RateLimitGuard::new(transport.clone(), &ClientConfig::default()).unwrap();

        let outcome = guard.check(&CheckContext::new("", "/health")).await.unwrap();
        assert_eq!(outcome.path, CheckPath::Skipped);
        assert!(outcome.allowed());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_skip_list_prefixes() {
        let skip = SkipList::new(["/health", "/static/"]);
        assert!(skip.contains("/health"));
        assert!(!skip.contains("/healthz"));
        assert!(skip.contains("/static/app.js"));
        assert!(!skip.contains("/api"));
    }

    #[tokio::test]
    async fn test_invalid_context_is_an_error() {
        let guard = RateLimitGuard::new(in_process(), &config(0)).unwrap();
        let err = assert_err!(guard.check(&CheckContext::new("  ", "/api/auth/login")).await);
        assert!(matches!(err, GatekeeperError::InvalidContext(_)));
    }

    #[tokio::test]
    async fn test_cache_serves_denials_only() {
        let guard = RateLimitGuard::new(in_process(), &config(60_000)).unwrap();

        for expected in [4, 3, 2, 1, 0] {
            let outcome = guard.check(&login()).await.unwrap();
            assert_eq!(outcome.path, CheckPath::Central);
            assert_eq!(outcome.decision.unwrap().remaining, expected);
        }

        let denied = guard.check(&login()).await.unwrap();
        assert_eq!(denied.path, CheckPath::Central);
        assert!(!denied.allowed());

        let cached_denial = guard.check(&login()).await.unwrap();
        assert_eq!(cached_denial.path, CheckPath::Cache);
        assert!(!cached_denial.allowed());
        assert_eq!(cached_denial.decision.unwrap().retry_after, Some(60));
    }

    #[tokio::test]
    async fn test_cache_expiry_never_admits_past_the_limit() {
        let guard = RateLimitGuard::new(in_process(), &config(5)).unwrap();

        let mut admitted = 0;
        for _ in 0..50 {
            for _ in 0..10 {
                if guard.check(&login()).await.unwrap().allowed() {
                    admitted += 1;
                }
            }
            tokio::time::sleep(Duration::from_millis(8)).await;
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_engine_error_uses_fallback() {
        let guard = RateLimitGuard::new(Unavailable::new("error"), &config(0))
            .unwrap()
            .with_fallback(FallbackLimiter::new(3, 60).unwrap());

        for _ in 0..3 {
            let outcome = guard.check(&login()).await.unwrap();
            assert_eq!(outcome.path, CheckPath::Local);
            assert!(outcome.allowed());
        }
        let denied = guard.check(&login()).await.unwrap();
        assert_eq!(denied.path, CheckPath::Local);
        assert!(!denied.allowed());
    }

    #[tokio::test]
    async fn test_timeout_resolves_within_budget() {
        let config = ClientConfig {
            timeout_ms: 20,
            ..config(0)
        };
        let guard = RateLimitGuard::new(Unavailable::new("hang"), &config).unwrap();

        let started = Instant::now();
        let outcome = guard.check(&login()).await.unwrap();
        assert_eq!(outcome.path, CheckPath::Local);
        assert!(outcome.allowed());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_degraded_answer_counts_as_unavailable() {
        let transport = Unavailable::new("degraded");
        let guard = RateLimitGuard::new(transport.clone(), &config(60_000))
            .unwrap()
            .with_fallback(FallbackLimiter::new(1, 60).unwrap());

        assert_eq!(guard.check(&login()).await.unwrap().path, CheckPath::Local);
        let denied = guard.check(&login()).await.unwrap();
        assert_eq!(denied.path, CheckPath::Local);
        assert!(!denied.allowed());
        // Degraded answers are never memoized.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }
}
