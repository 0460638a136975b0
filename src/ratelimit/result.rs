//! Evaluation outcomes.

use std::time::Duration;

/// Node id reported when the dispatcher has no nodes to route to.
pub const LOCAL_NODE_ID: &str = "local";

/// Outcome of a single algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
    /// Zero iff allowed.
    pub retry_after: Duration,
    pub algorithm: String,
}

impl CheckResult {
    pub fn allow(algorithm: impl Into<String>) -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            algorithm: algorithm.into(),
        }
    }

    pub fn deny(retry_after: Duration, algorithm: impl Into<String>) -> Self {
        Self {
            allowed: false,
            retry_after,
            algorithm: algorithm.into(),
        }
    }

    /// Deny with a retry in milliseconds.
    pub fn deny_ms(retry_after_ms: u64, algorithm: impl Into<String>) -> Self {
        Self::deny(Duration::from_millis(retry_after_ms), algorithm)
    }
}

/// Final verdict returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after: Duration,
    /// Algorithm responsible for a deny. Empty on allow.
    pub algorithm: String,
    pub node_id: String,
}

impl Decision {
    pub fn allowed(node_id: impl Into<String>) -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            algorithm: String::new(),
            node_id: node_id.into(),
        }
    }

    pub fn denied(
        retry_after: Duration,
        algorithm: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            retry_after,
            algorithm: algorithm.into(),
            node_id: node_id.into(),
        }
    }

    /// Wrap a pipeline result into a decision made by `node_id`.
    pub fn from_check(result: CheckResult, node_id: &str) -> Self {
        if result.allowed {
            Self::allowed(node_id)
        } else {
            Self::denied(result.retry_after, result.algorithm, node_id)
        }
    }

    /// Retry-after in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let millis = self.retry_after.as_millis() as u64;
        millis.div_ceil(1000)
    }

    /// Diagnostic header pairs for a "too many requests" response.
    ///
    /// Empty for an allowed decision. The algorithm header is omitted when no
    /// algorithm is attributed.
    pub fn rejection_headers(&self) -> Vec<(&'static str, String)> {
        if self.allowed {
            return Vec::new();
        }

        let mut headers = vec![
            ("Retry-After", self.retry_after_secs().to_string()),
            ("X-RateLimit-Node", self.node_id.clone()),
        ];
        if !self.algorithm.is_empty() {
            headers.push(("X-RateLimit-Algorithm", self.algorithm.clone()));
        }
        headers
    }
}
