//! Check contexts and identity key derivation.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use super::policy::{Algorithm, Overrides, ANONYMOUS_ROLE, MAX_WINDOW_SECS};
use crate::error::{GatekeeperError, Result};

/// Method assumed when the caller supplies none.
pub const DEFAULT_METHOD: &str = "GET";

/// Most units a single check may charge.
pub const MAX_HITS: u32 = 1000;

/// Request-scoped attributes the engine decides on. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckContext {
    pub client_ip: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_role")]
    pub user_role: String,
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub custom_limit: Option<u64>,
    #[serde(default)]
    pub custom_window: Option<u64>,
    /// Units charged by this check
    #[serde(default = "default_hits")]
    pub hits: u32,
}

fn default_role() -> String {
    ANONYMOUS_ROLE.to_string()
}

fn default_method() -> String {
    DEFAULT_METHOD.to_string()
}

fn default_hits() -> u32 {
    1
}

impl CheckContext {
    /// Create a context for an anonymous `GET` from `client_ip`.
    pub fn new(client_ip: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            user_id: None,
            user_role: default_role(),
            endpoint: endpoint.into(),
            method: default_method(),
            api_key: None,
            custom_limit: None,
            custom_window: None,
            hits: 1,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.user_role = role.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_overrides(mut self, limit: Option<u64>, window_secs: Option<u64>) -> Self {
        self.custom_limit = limit;
        self.custom_window = window_secs;
        self
    }

    pub fn with_hits(mut self, hits: u32) -> Self {
        self.hits = hits;
        self
    }

    /// Reject contexts that indicate a broken integration.
    pub fn validate(&self) -> Result<()> {
        if self.client_ip.trim().is_empty() {
            return Err(GatekeeperError::InvalidContext("client_ip is required".into()));
        }
        if self.endpoint.is_empty() {
            return Err(GatekeeperError::InvalidContext("endpoint is required".into()));
        }
        if !self.endpoint.starts_with('/') {
            return Err(GatekeeperError::InvalidContext(format!(
                "endpoint {} must start with '/'",
                self.endpoint
            )));
        }
        if self.custom_limit == Some(0) {
            return Err(GatekeeperError::InvalidContext(
                "custom_limit must be positive".into(),
            ));
        }
        match self.custom_window {
            Some(0) => {
                return Err(GatekeeperError::InvalidContext(
                    "custom_window must be positive".into(),
                ))
            }
            Some(window) if window > MAX_WINDOW_SECS => {
                return Err(GatekeeperError::InvalidContext(format!(
                    "custom_window must not exceed {MAX_WINDOW_SECS}s"
                )))
            }
            _ => {}
        }
        if self.hits > MAX_HITS {
            return Err(GatekeeperError::InvalidContext(format!(
                "hits must not exceed {MAX_HITS}"
            )));
        }
        Ok(())
    }

    /// Role, treating an empty string as anonymous.
    pub fn role(&self) -> &str {
        if self.user_role.is_empty() {
            ANONYMOUS_ROLE
        } else {
            &self.user_role
        }
    }

    /// Units to charge; zero counts as one.
    pub fn hits(&self) -> u32 {
        self.hits.max(1)
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            limit: self.custom_limit,
            window_secs: self.custom_window,
        }
    }

    /// Most specific identity available: api key, then user id, then IP.
    pub fn identity(&self) -> Identity {
        if let Some(key) = non_empty(&self.api_key) {
            return Identity::ApiKey(key.to_string());
        }
        if let Some(user) = non_empty(&self.user_id) {
            return Identity::User(user.to_string());
        }
        Identity::Ip(self.client_ip.trim().to_string())
    }

    /// Quota bucket address for this request.
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(self.identity(), &self.endpoint)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// The caller attribute a quota is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    ApiKey(String),
    User(String),
    Ip(String),
}

impl Identity {
    pub fn kind(&self) -> &'static str {
        match self {
            Identity::ApiKey(_) => "key",
            Identity::User(_) => "user",
            Identity::Ip(_) => "ip",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Identity::ApiKey(v) | Identity::User(v) | Identity::Ip(v) => v,
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

/// Deterministic address of one quota bucket: identity scoped to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub identity: Identity,
    pub endpoint: String,
}

impl IdentityKey {
    pub fn new(identity: Identity, endpoint: &str) -> Self {
        Self {
            identity,
            endpoint: endpoint.to_string(),
        }
    }

    /// Key string for the given algorithm's state in the shared store.
    ///
    /// Format: `{prefix}:{algorithm}:{endpoint}:{kind}:{value}`, with `%`, `:`
    /// and `@` percent-encoded in the endpoint and value.
    pub fn storage_key(&self, prefix: &str, algorithm: Algorithm) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            prefix,
            algorithm.tag(),
            escape(&self.endpoint),
            self.identity.kind(),
            escape(self.identity.value())
        )
    }

    /// Keys for every algorithm, used when resetting a bucket.
    pub fn all_storage_keys(&self, prefix: &str) -> Vec<String> {
        Algorithm::all()
            .iter()
            .map(|algorithm| self.storage_key(prefix, *algorithm))
            .collect()
    }

    pub fn to_string_key(&self) -> String {
        format!(
            "{}:{}@{}",
            self.identity.kind(),
            escape(self.identity.value()),
            escape(&self.endpoint)
        )
    }
}

/// Percent-encode the characters used as key separators.
fn escape(component: &str) -> Cow<'_, str> {
    if !component.contains(|c: char| matches!(c, '%' | ':' | '@')) {
        return Cow::Borrowed(component);
    }
    let mut escaped = String::with_capacity(component.len() + 8);
    for c in component.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            '@' => escaped.push_str("%40"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
