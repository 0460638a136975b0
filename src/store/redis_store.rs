//! Redis-backed [`AtomicStore`].
//!
//! Each rate decision runs as one Lua script (`EVALSHA`, falling back to
//! `EVAL`), so the read-modify-write sequence is atomic on the server.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::{AtomicStore, ScriptReply};
use crate::error::{GatekeeperError, Result};

const FIXED_WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
if current <= tonumber(ARGV[2]) then
  return {1, 0}
end
local now = tonumber(ARGV[3])
local window = tonumber(ARGV[1])
local reset_at = (math.floor(now / window) + 1) * window
local retry = reset_at - now
if retry < 0 then retry = 0 end
return {0, retry}
"#;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[3]) then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  redis.call('PEXPIRE', KEYS[1], window)
  return {1, 0}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if oldest[2] then
  local retry = (tonumber(oldest[2]) + window) - now
  if retry < 0 then retry = 0 end
  return {0, retry}
end
return {0, window}
"#;

const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local data = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(data[1])
local ts = tonumber(data[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end
if now > ts then
  local delta = (now - ts) / 1000.0
  tokens = math.min(capacity, tokens + (delta * refill))
  ts = now
end
local allowed = 0
local retry = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
else
  retry = math.ceil(((1 - tokens) / refill) * 1000)
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(ts))
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, retry}
"#;

/// Redis connection plus the pre-hashed rate limit scripts.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    timeout: Option<Duration>,
    fixed_window: Script,
    sliding_window: Script,
    token_bucket: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to `url` and build the store.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Redis");
        let client = Client::open(url)?;
        let connection_manager = client.get_connection_manager().await?;
        info!("Redis connection established");
        Ok(Self::new(connection_manager))
    }

    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            timeout: None,
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }

    /// Bound every round trip. The script either ran atomically or not at
    /// all, so abandoning the wait is safe.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| GatekeeperError::Timeout(limit))?
                .map_err(GatekeeperError::from),
            None => fut.await.map_err(GatekeeperError::from),
        }
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn fixed_window_hit(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u32,
        now_ms: u64,
    ) -> Result<ScriptReply> {
        let mut connection = self.connection_manager.clone();
        let mut invocation = self.fixed_window.key(key);
        invocation.arg(window_ms).arg(max_requests).arg(now_ms);

        let reply: (i64, i64) = self.run(invocation.invoke_async(&mut connection)).await?;
        debug!(key = %key, allowed = reply.0, retry_ms = reply.1, "Fixed window script");
        Ok(ScriptReply::from_tuple(reply))
    }

    async fn sliding_window_hit(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u32,
        now_ms: u64,
        member: &str,
    ) -> Result<ScriptReply> {
        let mut connection = self.connection_manager.clone();
        let mut invocation = self.sliding_window.key(key);
        invocation
            .arg(now_ms)
            .arg(window_ms)
            .arg(max_requests)
            .arg(member);

        let reply: (i64, i64) = self.run(invocation.invoke_async(&mut connection)).await?;
        debug!(key = %key, allowed = reply.0, retry_ms = reply.1, "Sliding window script");
        Ok(ScriptReply::from_tuple(reply))
    }

    async fn token_bucket_take(
        &self,
        key: &str,
        capacity: u32,
        refill_rate_per_second: f64,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<ScriptReply> {
        let mut connection = self.connection_manager.clone();
        let mut invocation = self.token_bucket.key(key);
        invocation
            .arg(capacity)
            .arg(refill_rate_per_second)
            .arg(now_ms)
            .arg(ttl_ms);

        let reply: (i64, i64) = self.run(invocation.invoke_async(&mut connection)).await?;
        debug!(key = %key, allowed = reply.0, retry_ms = reply.1, "Token bucket script");
        Ok(ScriptReply::from_tuple(reply))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection_manager.clone();
        self.run(connection.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut connection = self.connection_manager.clone();
        match ttl {
            Some(ttl) => {
                let ttl_ms = (ttl.as_millis() as u64).max(1);
                self.run(connection.pset_ex::<_, _, ()>(key, value, ttl_ms))
                    .await
            }
            None => self.run(connection.set::<_, _, ()>(key, value)).await,
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut connection = self.connection_manager.clone();
        let receivers: i64 = self.run(connection.publish(channel, message)).await?;
        debug!(channel = %channel, receivers, "Published message");
        Ok(())
    }
}
