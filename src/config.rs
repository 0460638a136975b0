//! Configuration management for Gatekeeper.
//!
//! These are the settings of the service process itself. The rate limit
//! policy it enforces is a separate, hot-reloadable document
//! ([`GlobalConfig`]).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::options::DEFAULT_OPTIONS_KEY;
use crate::ratelimit::{
    AlgorithmBackend, EngineOptions, FailurePolicy, GlobalConfig, PipelineCacheSettings,
};

/// Prefix of environment overrides, e.g. `GATEKEEPER__REDIS__URL`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Shared store configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Evaluation engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Policy refresh configuration
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Policy sync worker configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Initial policy configuration
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL. No store is used when unset.
    #[serde(default)]
    pub url: Option<String>,

    /// Key the policy document is stored under
    #[serde(default = "default_options_key")]
    pub options_key: String,

    /// Channel notified after the policy document changes
    #[serde(default = "default_update_channel")]
    pub update_channel: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            options_key: default_options_key(),
            update_channel: default_update_channel(),
        }
    }
}

fn default_options_key() -> String {
    DEFAULT_OPTIONS_KEY.to_string()
}

fn default_update_channel() -> String {
    "rate-limiting:updates".to_string()
}

/// Evaluation engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where algorithm state lives
    #[serde(default)]
    pub algorithm_backend: AlgorithmBackend,

    /// Maximum cached client pipelines per node
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    /// Seconds an unused client pipeline is kept
    #[serde(default = "default_cache_idle_secs")]
    pub cache_idle_secs: u64,

    /// Per-call shared store timeout in milliseconds
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// Answer used when the shared store fails
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            algorithm_backend: AlgorithmBackend::default(),
            cache_capacity: default_cache_capacity(),
            cache_idle_secs: default_cache_idle_secs(),
            backend_timeout_ms: default_backend_timeout_ms(),
            failure_policy: default_failure_policy(),
        }
    }
}

fn default_cache_capacity() -> u64 {
    10000
}

fn default_cache_idle_secs() -> u64 {
    600
}

fn default_backend_timeout_ms() -> u64 {
    250
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::FailOpen
}

impl EngineConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// Options for [`DistributedRateLimiter`](crate::ratelimit::DistributedRateLimiter).
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            cache: PipelineCacheSettings {
                max_capacity: self.cache_capacity,
                time_to_idle: Duration::from_secs(self.cache_idle_secs),
            },
            fail_closed_retry_after: self.backend_timeout(),
        }
    }
}

/// Policy refresh configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Seconds between policy reads
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            poll_secs: default_poll_secs(),
        }
    }
}

fn default_poll_secs() -> u64 {
    10
}

impl RefreshConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }
}

/// Policy sync worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Endpoint serving the policy envelope
    #[serde(default = "default_sync_url")]
    pub url: String,

    /// HTTP request timeout in milliseconds
    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,

    /// Seconds between sync cycles
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,

    /// Fetch attempts per cycle
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the retry delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: default_sync_url(),
            timeout_ms: default_sync_timeout_ms(),
            interval_secs: default_sync_interval_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_sync_url() -> String {
    "http://127.0.0.1:2379/v2/keys/rl/policies.json".to_string()
}

fn default_sync_timeout_ms() -> u64 {
    5000
}

fn default_sync_interval_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2000
}

/// Initial policy configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy file served until the store provides one
    #[serde(default)]
    pub path: Option<String>,
}

impl PolicyConfig {
    /// Load the configured policy file, or the built-in defaults.
    pub fn load(&self) -> Result<GlobalConfig> {
        let policy = match &self.path {
            Some(path) => GlobalConfig::from_file(path)?,
            None => GlobalConfig::default(),
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl GatekeeperConfig {
    /// Load configuration from an optional file plus `GATEKEEPER__` overrides.
    ///
    /// A missing file is an error only when `path` is given explicitly.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }
        let config: GatekeeperConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| crate::error::GatekeeperError::Config(e.to_string()))
    }
}
