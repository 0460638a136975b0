//! Error types for Gatekeeper.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single algorithm entry failed validation
    #[error("Invalid algorithm '{name}': {reason}")]
    InvalidAlgorithm { name: String, reason: String },

    /// Shared store errors
    #[error("Backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// A shared store round trip did not finish in time
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    /// Policy document could not be fetched
    #[error("Policy fetch error: {0}")]
    PolicyFetch(String),

    /// Policy document could not be parsed
    #[error("Policy parse error: {0}")]
    PolicyParse(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    /// Whether this error came from the shared store rather than from policy.
    ///
    /// Callers use this to apply their fail-open / fail-closed choice.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout(_))
    }

    pub(crate) fn invalid_algorithm(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAlgorithm {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for GatekeeperError {
    fn from(e: reqwest::Error) -> Self {
        Self::PolicyFetch(e.to_string())
    }
}

impl From<config::ConfigError> for GatekeeperError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
