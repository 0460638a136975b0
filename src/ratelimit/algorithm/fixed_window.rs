//! Fixed window counters.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{validate_limit, RateLimitAlgorithm};
use crate::clock::Clock;
use crate::error::Result;
use crate::ratelimit::{CheckResult, RequestInfo};
use crate::store::AtomicStore;

#[derive(Debug, Default)]
struct WindowState {
    /// Start of the current window. `None` until the first request.
    window_start: Option<u64>,
    count: u32,
}

/// Counts requests per fixed window in process memory.
///
/// The window opens on the first request and restarts on the first request
/// at least one window length later.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    name: String,
    max_requests: u32,
    window_ms: u64,
    state: Mutex<WindowState>,
}

impl FixedWindowLimiter {
    pub fn new(name: impl Into<String>, max_requests: u32, window_ms: u64) -> Result<Self> {
        let name = name.into();
        validate_limit(&name, max_requests, window_ms)?;
        Ok(Self {
            name,
            max_requests,
            window_ms,
            state: Mutex::new(WindowState::default()),
        })
    }

    /// Record a request at `now_ms` and decide it.
    pub fn check(&self, now_ms: u64) -> CheckResult {
        let mut state = self.state.lock();

        let window_start = *state.window_start.get_or_insert(now_ms);
        let mut elapsed = now_ms.saturating_sub(window_start);
        if elapsed >= self.window_ms {
            state.window_start = Some(now_ms);
            state.count = 0;
            elapsed = 0;
        }

        if state.count < self.max_requests {
            state.count += 1;
            return CheckResult::allow(&self.name);
        }

        CheckResult::deny_ms(self.window_ms.saturating_sub(elapsed), &self.name)
    }

    /// Requests counted in the current window.
    pub fn current_count(&self) -> u32 {
        self.state.lock().count
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, request: &RequestInfo) -> Result<CheckResult> {
        Ok(self.check(request.timestamp_ms))
    }
}

/// Fixed window counter kept in the shared store.
///
/// Keys are `rl:<name>:<client>:<bucket>` with `bucket = now / window`, so
/// every process agrees on window boundaries.
pub struct SharedFixedWindowLimiter {
    name: String,
    max_requests: u32,
    window_ms: u64,
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
}

impl SharedFixedWindowLimiter {
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

    fn key(&self, request: &RequestInfo, bucket: u64) -> String {
        format!("rl:{}:{}:{}", self.name, request.client_key(), bucket)
    }
}

#[async_trait]
impl RateLimitAlgorithm for SharedFixedWindowLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, request: &RequestInfo) -> Result<CheckResult> {
        let now = self.clock.now_ms();
        let key = self.key(request, now / self.window_ms);

        trace!(key = %key, "Evaluating shared fixed window");
        let reply = self
            .store
            .fixed_window_hit(&key, self.window_ms, self.max_requests, now)
            .await?;

        Ok(if reply.allowed {
            CheckResult::allow(&self.name)
        } else {
            CheckResult::deny_ms(reply.retry_ms, &self.name)
        })
    }
}
