//! Token buckets.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{store_key, validate_bucket, RateLimitAlgorithm};
use crate::clock::Clock;
use crate::error::Result;
use crate::ratelimit::{CheckResult, RequestInfo};
use crate::store::AtomicStore;

/// Lower bound on the shared bucket expiry.
const MIN_SHARED_TTL_MS: u64 = 1000;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    /// `None` until the first request; the bucket starts full.
    last_refill: Option<u64>,
}

/// A bucket of `capacity` tokens refilled continuously at a fixed rate.
/// Each admitted request takes one token.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    name: String,
    capacity: f64,
    refill_rate_per_ms: f64,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    pub fn new(name: impl Into<String>, capacity: u32, refill_rate_per_second: f64) -> Result<Self> {
        let name = name.into();
        validate_bucket(&name, capacity, refill_rate_per_second)?;
        Ok(Self {
            name,
            capacity: capacity as f64,
            refill_rate_per_ms: refill_rate_per_second / 1000.0,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: None,
            }),
        })
    }

    /// Refill to `now_ms`, then try to take a token.
    pub fn check(&self, now_ms: u64) -> CheckResult {
        let mut state = self.state.lock();

        match state.last_refill {
            None => state.last_refill = Some(now_ms),
            Some(last) if now_ms > last => {
                let refill = (now_ms - last) as f64 * self.refill_rate_per_ms;
                state.tokens = self.capacity.min(state.tokens + refill);
                state.last_refill = Some(now_ms);
            }
            Some(_) => {}
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return CheckResult::allow(&self.name);
        }

        let retry_ms = ((1.0 - state.tokens) / self.refill_rate_per_ms).ceil();
        CheckResult::deny_ms(retry_ms as u64, &self.name)
    }

    /// Tokens left as of the last check.
    pub fn available_tokens(&self) -> f64 {
        self.state.lock().tokens
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, request: &RequestInfo) -> Result<CheckResult> {
        Ok(self.check(request.timestamp_ms))
    }
}

/// Token bucket kept in a shared hash of `{tokens, ts}`.
///
/// Idle buckets expire after twice the time needed to refill from empty.
pub struct SharedTokenBucketLimiter {
    name: String,
    capacity: u32,
    refill_rate_per_second: f64,
    ttl_ms: u64,
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
}

impl SharedTokenBucketLimiter {
    pub fn new(
        name: impl Into<String>,
        capacity: u32,
        refill_rate_per_second: f64,
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let name = name.into();
        validate_bucket(&name, capacity, refill_rate_per_second)?;
        Ok(Self {
            name,
            capacity,
            refill_rate_per_second,
            ttl_ms: shared_ttl_ms(capacity, refill_rate_per_second),
            store,
            clock,
        })
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }
}

fn shared_ttl_ms(capacity: u32, refill_rate_per_second: f64) -> u64 {
    let full_refill_ms = (capacity as f64 / refill_rate_per_second * 1000.0 * 2.0).ceil();
    (full_refill_ms as u64).max(MIN_SHARED_TTL_MS)
}

#[async_trait]
impl RateLimitAlgorithm for SharedTokenBucketLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, request: &RequestInfo) -> Result<CheckResult> {
        let now = self.clock.now_ms();
        let key = store_key(&self.name, request);

        trace!(key = %key, "Evaluating shared token bucket");
        let reply = self
            .store
            .token_bucket_take(
                &key,
                self.capacity,
                self.refill_rate_per_second,
                now,
                self.ttl_ms,
            )
            .await?;

        Ok(if reply.allowed {
            CheckResult::allow(&self.name)
        } else {
            CheckResult::deny_ms(reply.retry_ms, &self.name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[test]
    fn test_rejects_invalid_bucket() {
        assert!(TokenBucketLimiter::new("tb", 0, 1.0).is_err());
        assert!(TokenBucketLimiter::new("tb", 5, 0.0).is_err());
        assert!(TokenBucketLimiter::new("tb", 5, -1.0).is_err());
    }

    #[test]
    fn test_burst_then_refill() {
        let limiter = TokenBucketLimiter::new("tb", 5, 1.0).unwrap();

        for _ in 0..5 {
            assert!(limiter.check(0).allowed);
        }

        let denied = limiter.check(0);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_millis(1000));

        assert!(limiter.check(1000).allowed);
        assert!(!limiter.check(1000).allowed);
    }

    #[tokio::test]
    async fn test_concurrent_evaluation_never_exceeds_max() {
        let limiter = Arc::new(TokenBucketLimiter::new("tb", 50, 1.0).unwrap());

        let mut handles = Vec::new();
        for i in 0..200u64 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let request = RequestInfo::at(format!("r{}", i), 5);
                limiter.evaluate(&request).await.unwrap().allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 50);
    }

    #[test]
    fn test_partial_refill_shortens_retry() {
        let limiter = TokenBucketLimiter::new("tb", 1, 2.0).unwrap();

        assert!(limiter.check(0).allowed);
        let denied = limiter.check(200);
        assert!(!denied.allowed);
        // 0.4 tokens refilled, 0.6 missing at 2 tokens/s.
        assert_eq!(denied.retry_after, Duration::from_millis(300));
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let limiter = TokenBucketLimiter::new("tb", 3, 10.0).unwrap();

        assert!(limiter.check(0).allowed);
        assert!(limiter.check(60_000).allowed);
        assert!((limiter.available_tokens() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_going_backwards_does_not_refill() {
        let limiter = TokenBucketLimiter::new("tb", 1, 1.0).unwrap();

        assert!(limiter.check(5000).allowed);
        assert!(!limiter.check(4000).allowed);
        assert!(limiter.check(6000).allowed);
    }

    #[test]
    fn test_shared_ttl() {
        assert_eq!(shared_ttl_ms(5, 1.0), 10_000);
        assert_eq!(shared_ttl_ms(1, 100.0), MIN_SHARED_TTL_MS);
        assert_eq!(shared_ttl_ms(3, 0.7), 8572);
    }

    #[tokio::test]
    async fn test_shared_token_bucket() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter =
            SharedTokenBucketLimiter::new("tb", 5, 1.0, store, clock.clone()).unwrap();
        let request = RequestInfo::at("r", 0).with_user_id("u");

        for _ in 0..5 {
            assert!(limiter.evaluate(&request).await.unwrap().allowed);
        }
        let denied = limiter.evaluate(&request).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_millis(1000));

        clock.advance(1000);
        assert!(limiter.evaluate(&request).await.unwrap().allowed);
        assert!(!limiter.evaluate(&request).await.unwrap().allowed);
    }
}
