//! Rate limit policies and endpoint matching.
//!
//! A [`PolicyTable`] maps endpoints to a [`Policy`] by exact match first, then
//! by the longest registered prefix, then the global default. Role multipliers
//! and trusted per-request overrides are layered on top by
//! [`PolicyTable::effective_policy`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};

/// Scope label carried by the global default policy.
pub const DEFAULT_SCOPE: &str = "*";

/// Role assumed when the caller supplies none.
pub const ANONYMOUS_ROLE: &str = "anonymous";

/// Longest accepted window (one year). Keeps millisecond arithmetic in range.
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Counting strategy for a policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// One counter per window, created on first hit and expired by TTL.
    #[default]
    FixedWindow,
    /// Timestamp log pruned to the trailing window.
    SlidingWindow,
    /// Replenishing token bucket that tolerates bounded bursts.
    TokenBucket,
}

impl Algorithm {
    /// Short tag used in store keys so data shapes never collide.
    pub fn tag(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fw",
            Algorithm::SlidingWindow => "sw",
            Algorithm::TokenBucket => "tb",
        }
    }

    /// Every algorithm, in tag order.
    pub fn all() -> [Algorithm; 3] {
        [
            Algorithm::FixedWindow,
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
        ]
    }
}

/// What the engine does when the shared store cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Admit the request and report degradation.
    #[default]
    Open,
    /// Deny the request.
    Closed,
}

/// A resolved limit/window/burst configuration for an endpoint scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Endpoint path or path prefix this policy applies to
    pub scope: String,
    /// Requests allowed per window; `0` means unlimited
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Token bucket capacity; `0` means "same as limit"
    #[serde(default)]
    pub burst: u64,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl Policy {
    /// Create a fixed-window, fail-open policy.
    pub fn new(scope: impl Into<String>, limit: u64, window_secs: u64) -> Self {
        Self {
            scope: scope.into(),
            limit,
            window_secs,
            burst: 0,
            algorithm: Algorithm::default(),
            failure_mode: FailureMode::default(),
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    /// Whether this is the `limit = 0` sentinel.
    pub fn is_unlimited(&self) -> bool {
        self.limit == 0
    }

    /// Window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }

    /// Token bucket ceiling.
    pub fn capacity(&self) -> u64 {
        if self.burst > 0 {
            self.burst
        } else {
            self.limit
        }
    }

    /// Tokens replenished per second.
    pub fn refill_per_sec(&self) -> f64 {
        self.limit as f64 / self.window_secs.max(1) as f64
    }

    /// Check structural validity.
    pub fn validate(&self) -> Result<()> {
        if self.scope.is_empty() {
            return Err(GatekeeperError::Config("policy scope must not be empty".into()));
        }
        if self.scope != DEFAULT_SCOPE && !self.scope.starts_with('/') {
            return Err(GatekeeperError::Config(format!(
                "policy scope {} must start with '/'",
                self.scope
            )));
        }
        if self.window_secs == 0 {
            return Err(GatekeeperError::Config(format!(
                "policy {} has a zero window",
                self.scope
            )));
        }
        if self.window_secs > MAX_WINDOW_SECS {
            return Err(GatekeeperError::Config(format!(
                "policy {} window of {}s exceeds the maximum of {}s",
                self.scope, self.window_secs, MAX_WINDOW_SECS
            )));
        }
        Ok(())
    }

    /// Apply a role multiplier to limit and burst.
    ///
    /// Results are floored, but a non-zero value never drops below 1 so a small
    /// multiplier cannot turn a policy into the unlimited sentinel.
    pub fn scaled(&self, multiplier: f64) -> Policy {
        let scale = |value: u64| -> u64 {
            if value == 0 {
                0
            } else {
                ((value as f64 * multiplier).floor() as u64).max(1)
            }
        };
        Policy {
            limit: scale(self.limit),
            burst: scale(self.burst),
            ..self.clone()
        }
    }
}

/// How a policy was selected for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Prefix,
    Default,
}

/// Per-request overrides a trusted caller may supply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Overrides {
    pub limit: Option<u64>,
    pub window_secs: Option<u64>,
}

/// On-disk policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default = "default_policy")]
    pub default_policy: Policy,
    #[serde(default)]
    pub endpoints: Vec<Policy>,
    #[serde(default = "default_role_multipliers")]
    pub role_multipliers: HashMap<String, f64>,
}

impl Default for PolicyFile {
    fn default() -> Self {
        Self {
            default_policy: default_policy(),
            endpoints: Vec::new(),
            role_multipliers: default_role_multipliers(),
        }
    }
}

fn default_policy() -> Policy {
    Policy::new(DEFAULT_SCOPE, 100, 60)
}

fn default_role_multipliers() -> HashMap<String, f64> {
    HashMap::from([
        ("admin".to_string(), 10.0),
        ("premium".to_string(), 2.0),
        ("basic".to_string(), 1.0),
        (ANONYMOUS_ROLE.to_string(), 0.5),
    ])
}

/// Validated, indexed set of policies.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyTable {
    default_policy: Policy,
    endpoints: BTreeMap<String, Policy>,
    role_multipliers: HashMap<String, f64>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        // The built-in document is always valid.
        Self {
            default_policy: default_policy(),
            endpoints: BTreeMap::new(),
            role_multipliers: default_role_multipliers(),
        }
    }
}

impl TryFrom<PolicyFile> for PolicyTable {
    type Error = GatekeeperError;

    fn try_from(file: PolicyFile) -> Result<Self> {
        let mut default_policy = file.default_policy;
        default_policy.scope = DEFAULT_SCOPE.to_string();
        default_policy.validate()?;

        let mut endpoints = BTreeMap::new();
        for policy in file.endpoints {
            policy.validate()?;
            if policy.scope == DEFAULT_SCOPE {
                return Err(GatekeeperError::Config(
                    "endpoint policies may not use the default scope".into(),
                ));
            }
            if endpoints.insert(policy.scope.clone(), policy).is_some() {
                return Err(GatekeeperError::Config("duplicate policy scope".into()));
            }
        }

        for (role, multiplier) in &file.role_multipliers {
            validate_multiplier(role, *multiplier)?;
        }

        Ok(Self {
            default_policy,
            endpoints,
            role_multipliers: file.role_multipliers,
        })
    }
}

impl From<&PolicyTable> for PolicyFile {
    fn from(table: &PolicyTable) -> Self {
        Self {
            default_policy: table.default_policy.clone(),
            endpoints: table.endpoints.values().cloned().collect(),
            role_multipliers: table.role_multipliers.clone(),
        }
    }
}

fn validate_multiplier(role: &str, multiplier: f64) -> Result<()> {
    if role.is_empty() {
        return Err(GatekeeperError::Config("role name must not be empty".into()));
    }
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return Err(GatekeeperError::Config(format!(
            "multiplier for role {role} must be positive, got {multiplier}"
        )));
    }
    Ok(())
}

impl PolicyTable {
    /// Create a table with only a default policy and the given multipliers.
    pub fn new(default_policy: Policy, role_multipliers: HashMap<String, f64>) -> Result<Self> {
        PolicyFile {
            default_policy,
            endpoints: Vec::new(),
            role_multipliers,
        }
        .try_into()
    }

    /// Load a policy table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse policy table: {}", e)))?;
        file.try_into()
    }

    pub fn default_policy(&self) -> &Policy {
        &self.default_policy
    }

    /// Endpoint policies ordered by scope.
    pub fn policies(&self) -> impl Iterator<Item = &Policy> {
        self.endpoints.values()
    }

    pub fn role_multipliers(&self) -> &HashMap<String, f64> {
        &self.role_multipliers
    }

    /// Look up a registered endpoint policy by its exact scope.
    pub fn get(&self, scope: &str) -> Result<&Policy> {
        if scope == DEFAULT_SCOPE {
            return Ok(&self.default_policy);
        }
        self.endpoints
            .get(scope)
            .ok_or_else(|| GatekeeperError::PolicyNotFound(scope.to_string()))
    }

    /// Resolve the policy for an endpoint: exact, longest prefix, default.
    pub fn resolve(&self, endpoint: &str) -> (&Policy, MatchKind) {
        if let Some(policy) = self.endpoints.get(endpoint) {
            return (policy, MatchKind::Exact);
        }

        let longest = self
            .endpoints
            .values()
            .filter(|p| is_path_prefix(&p.scope, endpoint))
            .max_by_key(|p| p.scope.len());

        match longest {
            Some(policy) => (policy, MatchKind::Prefix),
            None => (&self.default_policy, MatchKind::Default),
        }
    }

    /// Multiplier for a role; unknown roles count as 1.0.
    pub fn multiplier_for(&self, role: &str) -> f64 {
        self.role_multipliers.get(role).copied().unwrap_or(1.0)
    }

    /// Resolve, scale by role, then apply trusted overrides.
    pub fn effective_policy(&self, endpoint: &str, role: &str, overrides: Overrides) -> Policy {
        let (base, _) = self.resolve(endpoint);
        let mut policy = base.scaled(self.multiplier_for(role));

        if let Some(limit) = overrides.limit {
            policy.limit = limit;
        }
        if let Some(window_secs) = overrides.window_secs {
            policy.window_secs = window_secs;
        }
        policy
    }

    /// Insert or replace an endpoint policy. Returns whether anything changed.
    pub fn upsert(&mut self, policy: Policy) -> Result<bool> {
        policy.validate()?;
        if policy.scope == DEFAULT_SCOPE {
            return self.set_default(policy);
        }
        if self.endpoints.get(&policy.scope) == Some(&policy) {
            return Ok(false);
        }
        self.endpoints.insert(policy.scope.clone(), policy);
        Ok(true)
    }

    /// Replace the global default policy.
    pub fn set_default(&mut self, mut policy: Policy) -> Result<bool> {
        policy.scope = DEFAULT_SCOPE.to_string();
        policy.validate()?;
        if self.default_policy == policy {
            return Ok(false);
        }
        self.default_policy = policy;
        Ok(true)
    }

    /// Remove an endpoint policy.
    pub fn remove(&mut self, scope: &str) -> Result<Policy> {
        self.endpoints
            .remove(scope)
            .ok_or_else(|| GatekeeperError::PolicyNotFound(scope.to_string()))
    }

    /// Set the multiplier for a role.
    pub fn set_role_multiplier(&mut self, role: &str, multiplier: f64) -> Result<bool> {
        validate_multiplier(role, multiplier)?;
        let previous = self.role_multipliers.insert(role.to_string(), multiplier);
        Ok(previous != Some(multiplier))
    }
}

/// Segment-aware prefix test: `/api/auth` covers `/api/auth/login` but not
/// `/api/authz`.
fn is_path_prefix(scope: &str, endpoint: &str) -> bool {
    if !endpoint.starts_with(scope) || scope.len() == endpoint.len() {
        return false;
    }
    scope.ends_with('/') || endpoint.as_bytes()[scope.len()] == b'/'
}
