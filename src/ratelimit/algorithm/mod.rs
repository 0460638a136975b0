//! Rate limiting algorithms and the factory that builds them from policy.
//!
//! Every algorithm comes in two flavours:
//! - *local*: state in process memory behind a per-instance mutex, timed by
//!   the request's monotonic timestamp;
//! - *shared*: state in an [`AtomicStore`], updated by one atomic server-side
//!   operation and timed by wall-clock milliseconds so that every process
//!   agrees on window boundaries.

mod fixed_window;
mod sliding_window;
mod token_bucket;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::policy::{AlgorithmType, ResolvedAlgorithm};
use super::request::RequestInfo;
use super::result::CheckResult;
use crate::clock::{Clock, SystemClock};
use crate::error::{GatekeeperError, Result};
use crate::store::AtomicStore;

pub use fixed_window::{FixedWindowLimiter, SharedFixedWindowLimiter};
pub use sliding_window::{SharedSlidingWindowLimiter, SlidingWindowLimiter};
pub use token_bucket::{SharedTokenBucketLimiter, TokenBucketLimiter};

/// A stateful rate limit evaluator for one client and one configured algorithm.
///
/// Implementations must be safe to call concurrently on the same instance.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    /// The configured algorithm name, used to attribute decisions.
    fn name(&self) -> &str;

    /// Decide whether `request` may proceed and record it if so.
    ///
    /// Errors only come from a shared store; local algorithms always return `Ok`.
    async fn evaluate(&self, request: &RequestInfo) -> Result<CheckResult>;
}

/// Builds algorithm instances from resolved policy entries.
pub trait AlgorithmFactory: Send + Sync {
    fn create(&self, algorithm: &ResolvedAlgorithm) -> Result<Arc<dyn RateLimitAlgorithm>>;
}

/// Where algorithm state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmBackend {
    /// Process memory. Consistent only within one node of one process.
    #[default]
    Local,
    /// The shared atomic store. Consistent across nodes and processes.
    Shared,
}

/// Factory for the built-in algorithms.
#[derive(Clone)]
pub struct DefaultAlgorithmFactory {
    backend: AlgorithmBackend,
    store: Option<Arc<dyn AtomicStore>>,
    clock: Arc<dyn Clock>,
}

impl DefaultAlgorithmFactory {
    /// Build in-memory algorithms.
    pub fn local() -> Self {
        Self {
            backend: AlgorithmBackend::Local,
            store: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Build store-backed algorithms.
    pub fn shared(store: Arc<dyn AtomicStore>) -> Self {
        Self {
            backend: AlgorithmBackend::Shared,
            store: Some(store),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the wall clock used by shared algorithms.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend(&self) -> AlgorithmBackend {
        self.backend
    }
}

impl std::fmt::Debug for DefaultAlgorithmFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultAlgorithmFactory")
            .field("backend", &self.backend)
            .finish()
    }
}

impl AlgorithmFactory for DefaultAlgorithmFactory {
    fn create(&self, algorithm: &ResolvedAlgorithm) -> Result<Arc<dyn RateLimitAlgorithm>> {
        let name = algorithm.name.as_str();
        let window_ms = algorithm.window_ms();

        if self.backend == AlgorithmBackend::Local {
            let limiter: Arc<dyn RateLimitAlgorithm> = match algorithm.algorithm_type {
                AlgorithmType::FixedWindow => Arc::new(FixedWindowLimiter::new(
                    name,
                    algorithm.max_requests,
                    window_ms,
                )?),
                AlgorithmType::SlidingWindow => Arc::new(SlidingWindowLimiter::new(
                    name,
                    algorithm.max_requests,
                    window_ms,
                )?),
                AlgorithmType::TokenBucket => Arc::new(TokenBucketLimiter::new(
                    name,
                    algorithm.capacity,
                    algorithm.refill_rate_per_second,
                )?),
            };
            return Ok(limiter);
        }

        let store = self.store.clone().ok_or_else(|| {
            GatekeeperError::invalid_algorithm(name, "shared backend requires a store")
        })?;
        let clock = self.clock.clone();
        let limiter: Arc<dyn RateLimitAlgorithm> = match algorithm.algorithm_type {
            AlgorithmType::FixedWindow => Arc::new(SharedFixedWindowLimiter::new(
                name,
                algorithm.max_requests,
                window_ms,
                store,
                clock,
            )?),
            AlgorithmType::SlidingWindow => Arc::new(SharedSlidingWindowLimiter::new(
                name,
                algorithm.max_requests,
                window_ms,
                store,
                clock,
            )?),
            AlgorithmType::TokenBucket => Arc::new(SharedTokenBucketLimiter::new(
                name,
                algorithm.capacity,
                algorithm.refill_rate_per_second,
                store,
                clock,
            )?),
        };
        Ok(limiter)
    }
}

/// Store key shared by the sliding window and token bucket variants.
pub(crate) fn store_key(name: &str, request: &RequestInfo) -> String {
    format!("rl:{}:{}", name, request.client_key())
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(GatekeeperError::invalid_algorithm(name, "name must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_limit(name: &str, max_requests: u32, window_ms: u64) -> Result<()> {
    validate_name(name)?;
    if max_requests == 0 {
        return Err(GatekeeperError::invalid_algorithm(name, "max requests must be > 0"));
    }
    if window_ms == 0 {
        return Err(GatekeeperError::invalid_algorithm(name, "window must be > 0"));
    }
    Ok(())
}

pub(crate) fn validate_bucket(name: &str, capacity: u32, refill_rate_per_second: f64) -> Result<()> {
    validate_name(name)?;
    if capacity == 0 {
        return Err(GatekeeperError::invalid_algorithm(name, "capacity must be > 0"));
    }
    if !refill_rate_per_second.is_finite() || refill_rate_per_second <= 0.0 {
        return Err(GatekeeperError::invalid_algorithm(name, "refill rate must be > 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::{AlgorithmConfig, GlobalConfig};
    use crate::store::MemoryStore;

    fn resolved(algorithm_type: AlgorithmType) -> ResolvedAlgorithm {
        AlgorithmConfig::new("algo", algorithm_type)
            .with_limit(5, 1)
            .resolve(&GlobalConfig::default())
            .unwrap()
    }

    #[test]
    fn test_local_factory_builds_every_type() {
        let factory = DefaultAlgorithmFactory::local();
        for algorithm_type in [
            AlgorithmType::FixedWindow,
            AlgorithmType::SlidingWindow,
            AlgorithmType::TokenBucket,
        ] {
            let limiter = factory.create(&resolved(algorithm_type)).unwrap();
            assert_eq!(limiter.name(), "algo");
        }
    }

    #[test]
    fn test_shared_factory_builds_every_type() {
        let factory = DefaultAlgorithmFactory::shared(Arc::new(MemoryStore::new()));
        assert_eq!(factory.backend(), AlgorithmBackend::Shared);
        for algorithm_type in [
            AlgorithmType::FixedWindow,
            AlgorithmType::SlidingWindow,
            AlgorithmType::TokenBucket,
        ] {
            assert!(factory.create(&resolved(algorithm_type)).is_ok());
        }
    }

    #[test]
    fn test_store_key_uses_client_key() {
        let request = RequestInfo::at("r1", 0).with_user_id("bob");
        assert_eq!(store_key("sw", &request), "rl:sw:user:bob");
    }

    #[test]
    fn test_validation_helpers() {
        assert!(validate_limit("a", 1, 1).is_ok());
        assert!(validate_limit("", 1, 1).is_err());
        assert!(validate_limit("a", 0, 1).is_err());
        assert!(validate_limit("a", 1, 0).is_err());
        assert!(validate_bucket("a", 1, 0.5).is_ok());
        assert!(validate_bucket("a", 0, 0.5).is_err());
        assert!(validate_bucket("a", 1, f64::NAN).is_err());
    }

    #[test]
    fn test_backend_deserialization() {
        let backend: AlgorithmBackend = serde_json::from_str("\"shared\"").unwrap();
        assert_eq!(backend, AlgorithmBackend::Shared);
        assert_eq!(AlgorithmBackend::default(), AlgorithmBackend::Local);
    }
}
