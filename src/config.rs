//! Configuration management for Gatekeeper.
//!
//! Values are layered with the `config` crate: an optional YAML file, then
//! environment variables of the form `GATEKEEPER__SECTION__FIELD`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{EngineSettings, PolicyFile, PolicyTable, DEFAULT_KEY_PREFIX};

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared quota store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Client integration layer configuration
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address (check, admin and health services)
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Which shared store backs the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; only for single-instance deployments and tests
    Memory,
    #[default]
    Redis,
}

/// Shared quota store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every quota key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on a single store round trip, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            key_prefix: self.key_prefix.clone(),
            store_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_store_timeout() -> u64 {
    25
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a policy file; takes precedence over inline `policies`
    pub config_path: Option<String>,

    /// Policy file reload interval in seconds (0 disables reloading)
    #[serde(default = "default_reload_interval")]
    pub config_reload_interval_secs: u64,

    /// Inline policy table
    #[serde(default)]
    pub policies: PolicyFile,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            config_reload_interval_secs: default_reload_interval(),
            policies: PolicyFile::default(),
        }
    }
}

impl RateLimitingConfig {
    /// Build the initial policy table.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        match &self.config_path {
            Some(path) => PolicyTable::from_file(path),
            None => self.policies.clone().try_into(),
        }
    }

    pub fn reload_interval(&self) -> Option<Duration> {
        match (self.config_path.as_ref(), self.config_reload_interval_secs) {
            (Some(_), secs) if secs > 0 => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }
}

fn default_reload_interval() -> u64 {
    60
}

/// Client integration layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Decision engine endpoint for the gRPC transport
    #[serde(default = "default_engine_url")]
    pub engine_url: String,

    /// Budget for one central check, in milliseconds
    #[serde(default = "default_client_timeout")]
    pub timeout_ms: u64,

    /// Memoization window, in milliseconds (0 disables the cache)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,

    /// Paths never rate limited; entries ending in `/` match as prefixes
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,

    /// Take the client IP from `X-Forwarded-For` / `X-Real-IP`. Enable only
    /// behind a proxy that overwrites these headers.
    #[serde(default)]
    pub trust_forwarded_headers: bool,

    #[serde(default)]
    pub fallback: FallbackConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            engine_url: default_engine_url(),
            timeout_ms: default_client_timeout(),
            cache_ttl_ms: default_cache_ttl(),
            skip_paths: default_skip_paths(),
            trust_forwarded_headers: false,
            fallback: FallbackConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

fn default_engine_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_client_timeout() -> u64 {
    50
}

fn default_cache_ttl() -> u64 {
    250
}

fn default_skip_paths() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

/// Local limiter used while the central engine is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_limit")]
    pub limit: u64,

    #[serde(default = "default_fallback_window")]
    pub window_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            limit: default_fallback_limit(),
            window_secs: default_fallback_window(),
        }
    }
}

fn default_fallback_limit() -> u64 {
    60
}

fn default_fallback_window() -> u64 {
    60
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GATEKEEPER")
                .separator("__")
                .try_parsing(true),
        );
        Self::build(builder)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml));
        Self::build(builder)
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: GatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.client.fallback.window_secs == 0 {
            return Err(GatekeeperError::Config("fallback window must be positive".into()));
        }
        if self.client.fallback.limit == 0 {
            return Err(GatekeeperError::Config("fallback limit must be positive".into()));
        }
        if self.store.timeout_ms == 0 || self.client.timeout_ms == 0 {
            return Err(GatekeeperError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Algorithm;

    #[test]
    fn test_defaults() {
        let config = GatekeeperConfig::default();
        assert_eq!(config.server.grpc_addr.port(), 8081);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.client.timeout_ms, 50);
        assert_eq!(config.client.fallback.limit, 60);
        assert!(!config.client.trust_forwarded_headers);
        assert!(config.rate_limiting.reload_interval().is_none());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  grpc_addr: "0.0.0.0:9000"
store:
  backend: memory
  timeout_ms: 10
rate_limiting:
  policies:
    default_policy:
      limit: 50
      window_secs: 60
    endpoints:
      - scope: /api/search
        limit: 10
        window_secs: 1
        algorithm: token_bucket
client:
  skip_paths: ["/health", "/static/"]
logging:
  format: json
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.grpc_addr.port(), 9000);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.engine_settings().store_timeout, Duration::from_millis(10));
        assert_eq!(config.client.skip_paths.len(), 2);
        assert_eq!(config.logging.format, LogFormat::Json);

        let table = config.rate_limiting.policy_table().unwrap();
        assert_eq!(table.default_policy().limit, 50);
        assert_eq!(table.get("/api/search").unwrap().algorithm, Algorithm::TokenBucket);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let yaml = r#"
client:
  fallback:
    window_secs: 0
"#;
        assert!(GatekeeperConfig::from_yaml(yaml).is_err());

        let unlimited_fallback = r#"
client:
  fallback:
    limit: 0
"#;
        assert!(matches!(
            GatekeeperConfig::from_yaml(unlimited_fallback),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_reload_interval_requires_path() {
        let mut config = RateLimitingConfig::default();
        assert!(config.reload_interval().is_none());

        config.config_path = Some("/etc/gatekeeper/policies.yaml".into());
        assert_eq!(config.reload_interval(), Some(Duration::from_secs(60)));

        config.config_reload_interval_secs = 0;
        assert!(config.reload_interval().is_none());
    }
}
