//! In-process [`AtomicStore`].
//!
//! Every operation runs under the map shard lock of its key, which gives the
//! same all-or-nothing behaviour as a Redis script for single-process
//! deployments and tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{AtomicStore, ScriptReply};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// Capacity of the publish channel.
const PUBLISH_BUFFER: usize = 64;

/// Expired keys are swept once every this many writes.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Text(String),
    /// `(score, member)` pairs ordered by score.
    SortedSet(BTreeSet<(u64, String)>),
    Bucket { tokens: f64, ts: u64 },
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<u64>,
}

impl Slot {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory store with key expiry and a local publish channel.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    publisher: broadcast::Sender<(String, String)>,
    writes: AtomicU64,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for key expiry.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (publisher, _) = broadcast::channel(PUBLISH_BUFFER);
        Self {
            entries: DashMap::new(),
            clock,
            publisher,
            writes: AtomicU64::new(0),
        }
    }

    /// Receive every `(channel, message)` published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.publisher.subscribe()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    ///
    /// Keys that are never touched again (old fixed-window buckets,
    /// anonymous clients) are only reclaimed here.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Count a write and sweep when due. Must run before any shard lock is
    /// taken by the caller.
    fn note_write(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired();
        }
    }

    /// Take the live slot for `key`, dropping it first if expired.
    fn live_entry(&self, key: &str) -> Entry<'_, String, Slot> {
        self.note_write();
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_expired(now) => {
                occupied.remove();
                self.entries.entry(key.to_string())
            }
            entry => entry,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn fixed_window_hit(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u32,
        now_ms: u64,
    ) -> Result<ScriptReply> {
        let expires_at = self.clock.now_ms() + window_ms;
        let mut slot = self.live_entry(key).or_insert_with(|| Slot {
            value: Value::Counter(0),
            expires_at: Some(expires_at),
        });

        let current = match &mut slot.value {
            Value::Counter(count) => {
                *count += 1;
                *count
            }
            other => {
                *other = Value::Counter(1);
                1
            }
        };

        if current <= max_requests as i64 {
            return Ok(ScriptReply::allow());
        }
        let reset_at = (now_ms / window_ms + 1) * window_ms;
        Ok(ScriptReply::deny(reset_at.saturating_sub(now_ms)))
    }

    async fn sliding_window_hit(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u32,
        now_ms: u64,
        member: &str,
    ) -> Result<ScriptReply> {
        let mut slot = self.live_entry(key).or_insert_with(|| Slot {
            value: Value::SortedSet(BTreeSet::new()),
            expires_at: None,
        });

        if !matches!(slot.value, Value::SortedSet(_)) {
            slot.value = Value::SortedSet(BTreeSet::new());
        }
        let expires_at = self.clock.now_ms() + window_ms;
        let Slot { value, expires_at: slot_expiry } = &mut *slot;
        let Value::SortedSet(events) = value else {
            unreachable!("slot was just normalized to a sorted set");
        };

        let cutoff = now_ms.saturating_sub(window_ms);
        if now_ms >= window_ms {
            events.retain(|(score, _)| *score > cutoff);
        }

        if events.len() < max_requests as usize {
            events.insert((now_ms, member.to_string()));
            *slot_expiry = Some(expires_at);
            return Ok(ScriptReply::allow());
        }

        let retry = match events.iter().next() {
            Some((oldest, _)) => (oldest + window_ms).saturating_sub(now_ms),
            None => window_ms,
        };
        Ok(ScriptReply::deny(retry))
    }

    async fn token_bucket_take(
        &self,
        key: &str,
        capacity: u32,
        refill_rate_per_second: f64,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<ScriptReply> {
        let capacity = capacity as f64;
        let mut slot = self.live_entry(key).or_insert_with(|| Slot {
            value: Value::Bucket {
                tokens: capacity,
                ts: now_ms,
            },
            expires_at: None,
        });

        let (mut tokens, mut ts) = match slot.value {
            Value::Bucket { tokens, ts } => (tokens, ts),
            _ => (capacity, now_ms),
        };

        if now_ms > ts {
            let delta = (now_ms - ts) as f64 / 1000.0;
            tokens = capacity.min(tokens + delta * refill_rate_per_second);
            ts = now_ms;
        }

        let reply = if tokens >= 1.0 {
            tokens -= 1.0;
            ScriptReply::allow()
        } else {
            let retry = ((1.0 - tokens) / refill_rate_per_second * 1000.0).ceil();
            ScriptReply::deny(retry as u64)
        };

        slot.value = Value::Bucket { tokens, ts };
        slot.expires_at = Some(self.clock.now_ms() + ttl_ms);
        Ok(reply)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now_ms();
        let value = self.entries.get(key).and_then(|slot| {
            if slot.is_expired(now) {
                return None;
            }
            match &slot.value {
                Value::Text(text) => Some(text.clone()),
                Value::Counter(count) => Some(count.to_string()),
                _ => None,
            }
        });
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.note_write();
        let expires_at = ttl.map(|ttl| self.clock.now_ms() + ttl.as_millis() as u64);
        self.entries.insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // No subscribers is not an error, same as Redis.
        let _ = self
            .publisher
            .send((channel.to_string(), message.to_string()));
        Ok(())
    }
}
