//! Client integration layer embedded in calling services.
//!
//! A [`RateLimitGuard`] asks the decision engine through a pluggable
//! [`DecisionTransport`], memoizes recent answers and falls back to a local
//! limiter when the engine cannot answer in time. [`middleware::rate_limit`]
//! wires the guard into an axum router.

mod cache;
mod fallback;
mod guard;
pub mod middleware;
mod transport;

pub use cache::DecisionCache;
pub use fallback::FallbackLimiter;
pub use guard::{CheckPath, GuardOutcome, RateLimitGuard, SkipList};
pub use middleware::{rate_limit, CallerIdentity};
pub use transport::{DecisionTransport, GrpcTransport, InProcessTransport};
