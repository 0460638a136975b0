//! Cluster-wide rate limit policy and its validation.
//!
//! A [`GlobalConfig`] is the document published by the policy store. It is
//! validated once when it is built or received, then resolved into a list of
//! [`ResolvedAlgorithm`] entries that algorithm instances are created from.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{GatekeeperError, Result};

/// Name given to the algorithm synthesized from the global defaults.
pub const DEFAULT_ALGORITHM_NAME: &str = "sliding-window";

/// Document keys in their canonical spelling. Incoming keys are matched
/// against these ignoring ASCII case.
const DOCUMENT_KEYS: &[&str] = &[
    "clusterNodeCount",
    "clientIdHeader",
    "defaultWindowSeconds",
    "defaultMaxRequests",
    "algorithms",
    "name",
    "type",
    "maxRequests",
    "windowSeconds",
    "capacity",
    "refillRatePerSecond",
    "enabled",
];

/// Rewrite object keys to their canonical spelling, at every depth.
fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let key = DOCUMENT_KEYS
                        .iter()
                        .find(|known| known.eq_ignore_ascii_case(&key))
                        .map_or(key, |known| known.to_string());
                    (key, normalize_keys(value))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

/// The rate limiting algorithm an entry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum AlgorithmType {
    FixedWindow,
    #[default]
    SlidingWindow,
    TokenBucket,
}

impl FromStr for AlgorithmType {
    type Err = GatekeeperError;

    /// Case-insensitive; `_` and `-` separators are ignored.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "fixedwindow" => Ok(AlgorithmType::FixedWindow),
            "slidingwindow" => Ok(AlgorithmType::SlidingWindow),
            "tokenbucket" => Ok(AlgorithmType::TokenBucket),
            _ => Err(GatekeeperError::Config(format!(
                "unknown algorithm type '{}'",
                s
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for AlgorithmType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for AlgorithmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlgorithmType::FixedWindow => "FixedWindow",
            AlgorithmType::SlidingWindow => "SlidingWindow",
            AlgorithmType::TokenBucket => "TokenBucket",
        };
        f.write_str(name)
    }
}

/// One configured algorithm.
///
/// Absent or zero numeric fields fall back to the global defaults when
/// resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub algorithm_type: AlgorithmType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<u32>,
    /// Stored tokens for token buckets. Defaults to `max_requests`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    /// Tokens per second for token buckets. Defaults to `max_requests / window`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_rate_per_second: Option<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AlgorithmConfig {
    pub fn new(name: impl Into<String>, algorithm_type: AlgorithmType) -> Self {
        Self {
            name: name.into(),
            algorithm_type,
            max_requests: None,
            window_seconds: None,
            capacity: None,
            refill_rate_per_second: None,
            enabled: true,
        }
    }

    pub fn with_limit(mut self, max_requests: u32, window_seconds: u32) -> Self {
        self.max_requests = Some(max_requests);
        self.window_seconds = Some(window_seconds);
        self
    }

    pub fn with_bucket(mut self, capacity: u32, refill_rate_per_second: f64) -> Self {
        self.capacity = Some(capacity);
        self.refill_rate_per_second = Some(refill_rate_per_second);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Fill in defaults and check every value is usable.
    pub fn resolve(&self, defaults: &GlobalConfig) -> Result<ResolvedAlgorithm> {
        if self.name.trim().is_empty() {
            return Err(GatekeeperError::invalid_algorithm(
                &self.name,
                "name must not be empty",
            ));
        }

        let max_requests = positive(self.max_requests).unwrap_or(defaults.default_max_requests);
        let window_seconds =
            positive(self.window_seconds).unwrap_or(defaults.default_window_seconds);
        if max_requests == 0 {
            return Err(GatekeeperError::invalid_algorithm(
                &self.name,
                "maxRequests must be greater than zero",
            ));
        }
        if window_seconds == 0 {
            return Err(GatekeeperError::invalid_algorithm(
                &self.name,
                "windowSeconds must be greater than zero",
            ));
        }

        let capacity = positive(self.capacity).unwrap_or(max_requests);
        let refill_rate_per_second = self
            .refill_rate_per_second
            .filter(|rate| *rate > 0.0)
            .unwrap_or(max_requests as f64 / window_seconds as f64);
        if !refill_rate_per_second.is_finite() || refill_rate_per_second <= 0.0 {
            return Err(GatekeeperError::invalid_algorithm(
                &self.name,
                "refillRatePerSecond must be a positive number",
            ));
        }

        Ok(ResolvedAlgorithm {
            name: self.name.clone(),
            algorithm_type: self.algorithm_type,
            max_requests,
            window: Duration::from_secs(window_seconds as u64),
            capacity,
            refill_rate_per_second,
        })
    }
}

fn positive(value: Option<u32>) -> Option<u32> {
    value.filter(|v| *v > 0)
}

/// A validated algorithm entry with every default applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAlgorithm {
    pub name: String,
    pub algorithm_type: AlgorithmType,
    pub max_requests: u32,
    pub window: Duration,
    pub capacity: u32,
    pub refill_rate_per_second: f64,
}

impl ResolvedAlgorithm {
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// Cluster-wide policy snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Number of logical nodes requests are spread over
    #[serde(default = "default_cluster_node_count")]
    pub cluster_node_count: u32,

    /// Header carrying the client id at the transport boundary
    #[serde(default = "default_client_id_header")]
    pub client_id_header: String,

    #[serde(default = "default_window_seconds")]
    pub default_window_seconds: u32,

    #[serde(default = "default_max_requests")]
    pub default_max_requests: u32,

    /// Algorithms in evaluation order
    #[serde(default)]
    pub algorithms: Vec<AlgorithmConfig>,
}

fn default_cluster_node_count() -> u32 {
    2
}

fn default_client_id_header() -> String {
    "X-Client-Id".to_string()
}

fn default_window_seconds() -> u32 {
    60
}

fn default_max_requests() -> u32 {
    20
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            cluster_node_count: default_cluster_node_count(),
            client_id_header: default_client_id_header(),
            default_window_seconds: default_window_seconds(),
            default_max_requests: default_max_requests(),
            algorithms: Vec::new(),
        }
    }
}

impl GlobalConfig {
    /// Parse a policy document from JSON. Keys are case-insensitive.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(json)?;
        Ok(serde_json::from_value(normalize_keys(raw))?)
    }

    /// Parse a policy document from YAML. Keys are case-insensitive.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse policy: {}", e)))?;
        serde_json::from_value(normalize_keys(raw))
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse policy: {}", e)))
    }

    /// Load a policy file. `.json` files are read as JSON, anything else as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policy");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Node count actually built by the dispatcher. Zero is treated as one.
    pub fn effective_node_count(&self) -> usize {
        self.cluster_node_count.max(1) as usize
    }

    /// Check the whole document. Run before a snapshot is published.
    pub fn validate(&self) -> Result<()> {
        if self.client_id_header.trim().is_empty() {
            return Err(GatekeeperError::Config(
                "clientIdHeader must not be empty".to_string(),
            ));
        }
        self.resolved_algorithms().map(|_| ())
    }

    /// The enabled algorithms in order, with defaults applied.
    ///
    /// Falls back to a single sliding window built from the defaults when no
    /// entry is enabled. Fails on any invalid entry or duplicate name.
    pub fn resolved_algorithms(&self) -> Result<Vec<ResolvedAlgorithm>> {
        let enabled: Vec<&AlgorithmConfig> =
            self.algorithms.iter().filter(|a| a.enabled).collect();

        if enabled.is_empty() {
            let fallback = self.default_algorithm().resolve(self).map_err(|e| {
                GatekeeperError::Config(format!(
                    "no enabled algorithms and defaults are unusable: {}",
                    e
                ))
            })?;
            return Ok(vec![fallback]);
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(enabled.len());
        for algorithm in enabled {
            if !seen.insert(algorithm.name.as_str()) {
                return Err(GatekeeperError::invalid_algorithm(
                    &algorithm.name,
                    "duplicate algorithm name",
                ));
            }
            resolved.push(algorithm.resolve(self)?);
        }
        Ok(resolved)
    }

    /// The synthetic sliding window used when nothing is enabled.
    pub fn default_algorithm(&self) -> AlgorithmConfig {
        AlgorithmConfig::new(DEFAULT_ALGORITHM_NAME, AlgorithmType::SlidingWindow)
            .with_limit(self.default_max_requests, self.default_window_seconds)
    }
}
