//! Sliding window logs.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{store_key, validate_limit, RateLimitAlgorithm};
use crate::clock::Clock;
use crate::error::Result;
use crate::ratelimit::{CheckResult, RequestInfo};
use crate::store::AtomicStore;

/// Keeps the timestamps of admitted requests and allows at most
/// `max_requests` within any trailing window.
///
/// An entry expires once it is a full window old.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    name: String,
    max_requests: u32,
    window_ms: u64,
    events: Mutex<VecDeque<u64>>,
}

impl SlidingWindowLimiter {
    pub fn new(name: impl Into<String>, max_requests: u32, window_ms: u64) -> Result<Self> {
        let name = name.into();
        validate_limit(&name, max_requests, window_ms)?;
        Ok(Self {
            name,
            max_requests,
            window_ms,
            events: Mutex::new(VecDeque::with_capacity(max_requests.min(1024) as usize)),
        })
    }

    /// Record a request at `now_ms` and decide it.
    pub fn check(&self, now_ms: u64) -> CheckResult {
        let mut events = self.events.lock();

        while let Some(&oldest) = events.front() {
            if now_ms.saturating_sub(oldest) >= self.window_ms {
                events.pop_front();
            } else {
                break;
            }
        }

        if events.len() < self.max_requests as usize {
            events.push_back(now_ms);
            return CheckResult::allow(&self.name);
        }

        let oldest = events.front().copied().unwrap_or(now_ms);
        let retry_ms = (oldest + self.window_ms).saturating_sub(now_ms);
        CheckResult::deny_ms(retry_ms, &self.name)
    }

    /// Admitted requests still inside the window as of the last check.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, request: &RequestInfo) -> Result<CheckResult> {
        Ok(self.check(request.timestamp_ms))
    }
}

/// Sliding window log kept in a shared sorted set scored by timestamp.
pub struct SharedSlidingWindowLimiter {
    name: String,
    max_requests: u32,
    window_ms: u64,
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
}

impl SharedSlidingWindowLimiter {
    pub fn new(
        name: impl Into<String>,
        max_requests: u32,
        window_ms: u64,
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let name = name.into();
        validate_limit(&name, max_requests, window_ms)?;
        Ok(Self {
            name,
            max_requests,
            window_ms,
            store,
            clock,
        })
    }

    /// Set member, unique per request even when two land on the same millisecond.
    fn member(request: &RequestInfo, now_ms: u64) -> String {
        if request.request_id.trim().is_empty() {
            format!("{}:{}", now_ms, uuid::Uuid::new_v4().simple())
        } else {
            format!("{}:{}", now_ms, request.request_id)
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for SharedSlidingWindowLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, request: &RequestInfo) -> Result<CheckResult> {
        let now = self.clock.now_ms();
        let key = store_key(&self.name, request);
        let member = Self::member(request, now);

        trace!(key = %key, member = %member, "Evaluating shared sliding window");
        let reply = self
            .store
            .sliding_window_hit(&key, self.window_ms, self.max_requests, now, &member)
            .await?;

        Ok(if reply.allowed {
            CheckResult::allow(&self.name)
        } else {
            CheckResult::deny_ms(reply.retry_ms, &self.name)
        })
    }
}
