//! Rate limiting logic and state management.

pub mod clock;
mod engine;
mod identity;
mod policy;
mod registry;
pub mod store;

pub use engine::{DecisionEngine, Decision, EngineSettings, Usage, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT};
pub use identity::{CheckContext, Identity, IdentityKey, DEFAULT_METHOD, MAX_HITS};
pub use policy::{
    Algorithm, FailureMode, MatchKind, Overrides, Policy, PolicyFile, PolicyTable, ANONYMOUS_ROLE,
    DEFAULT_SCOPE, MAX_WINDOW_SECS,
};
pub use registry::{spawn_reloader, PolicyRegistry, PolicySnapshot};
