//! Shared atomic store used by the shared algorithm variants and the policy
//! refresher.
//!
//! Every rate decision is a single atomic operation on the store: either one
//! Lua script on Redis ([`RedisStore`]) or one locked map entry in process
//! ([`MemoryStore`]). A cancelled caller never leaves partial state behind.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Reply of an atomic rate decision: `(allowed, retry_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReply {
    pub allowed: bool,
    pub retry_ms: u64,
}

impl ScriptReply {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_ms: 0,
        }
    }

    pub fn deny(retry_ms: u64) -> Self {
        Self {
            allowed: false,
            retry_ms,
        }
    }

    pub(crate) fn from_tuple((allowed, retry_ms): (i64, i64)) -> Self {
        Self {
            allowed: allowed == 1,
            retry_ms: retry_ms.max(0) as u64,
        }
    }
}

/// Key-value store with atomic rate limit operations.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Increment a fixed window counter, expiring it after `window_ms` on first
    /// write. Denies once the count exceeds `max_requests`.
    async fn fixed_window_hit(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u32,
        now_ms: u64,
    ) -> Result<ScriptReply>;

    /// Drop entries scored at or below `now_ms - window_ms`, then add `member`
    /// scored `now_ms` if fewer than `max_requests` remain.
    async fn sliding_window_hit(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u32,
        now_ms: u64,
        member: &str,
    ) -> Result<ScriptReply>;

    /// Refill a token bucket hash to `now_ms` and try to take one token.
    async fn token_bucket_take(
        &self,
        key: &str,
        capacity: u32,
        refill_rate_per_second: f64,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<ScriptReply>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
}
