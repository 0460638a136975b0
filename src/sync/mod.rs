//! Policy sync worker.
//!
//! Pulls the policy document from an etcd-v2 style HTTP endpoint, whose
//! response wraps the document as a string in `{"node": {"value": "..."}}`,
//! and republishes it to the shared store: a SET on the options key, then a
//! PUBLISH on the update channel. Every [`StoreOptionsProvider`] polling that
//! key picks it up.
//!
//! [`StoreOptionsProvider`]: crate::options::StoreOptionsProvider

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::GlobalConfig;
use crate::store::AtomicStore;

#[derive(Debug, Deserialize)]
struct Envelope {
    node: Option<EnvelopeNode>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeNode {
    value: Option<String>,
}

/// Extract and validate the policy carried by an envelope body.
pub fn parse_envelope(body: &str) -> Result<GlobalConfig> {
    let envelope: Envelope = serde_json::from_str(body)?;
    let value = envelope
        .node
        .and_then(|node| node.value)
        .ok_or_else(|| GatekeeperError::PolicyFetch("response missing node/value".to_string()))?;

    let policy = GlobalConfig::from_json(&value)?;
    policy.validate()?;
    Ok(policy)
}

/// Copies the upstream policy document into the shared store.
pub struct PolicySyncWorker {
    client: reqwest::Client,
    settings: SyncConfig,
    store: Arc<dyn AtomicStore>,
    options_key: String,
    update_channel: String,
    /// Last document announced, to skip redundant PUBLISHes.
    last_published: Mutex<Option<String>>,
}

impl PolicySyncWorker {
    pub fn new(
        settings: SyncConfig,
        store: Arc<dyn AtomicStore>,
        options_key: impl Into<String>,
        update_channel: impl Into<String>,
    ) -> Result<Self> {
        if settings.max_attempts == 0 {
            return Err(GatekeeperError::Config(
                "sync.max_attempts must be at least 1".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            settings,
            store,
            options_key: options_key.into(),
            update_channel: update_channel.into(),
            last_published: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.settings.url)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }

    /// Fetch with bounded exponential backoff. Returns the last error once
    /// every attempt has failed.
    async fn fetch_with_retry(&self) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.fetch().await {
                Ok(body) => return Ok(body),
                Err(e) if attempt + 1 < self.settings.max_attempts => {
                    let delay = self.retry_delay(attempt);
                    debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Policy fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Backoff before retry number `attempt + 1`, without jitter.
    fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.settings.initial_backoff_ms;
        let delay = initial.saturating_mul(1u64 << attempt.min(20));
        Duration::from_millis(delay.min(self.settings.max_backoff_ms))
    }

    /// Base delay plus up to 20% random jitter.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = (base.as_millis() as u64) / 5;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Run one cycle. The options key is written every cycle so a store
    /// that lost it is repaired; the update is only announced when the
    /// document changed. Returns whether it changed.
    pub async fn sync_once(&self) -> Result<bool> {
        let body = self.fetch_with_retry().await?;
        let policy = parse_envelope(&body)?;
        let document = policy.to_json()?;

        self.store.set(&self.options_key, &document, None).await?;

        let unchanged = self.last_published.lock().as_deref() == Some(document.as_str());
        if unchanged {
            debug!(key = %self.options_key, "Policy unchanged");
            return Ok(false);
        }

        self.store.publish(&self.update_channel, &document).await?;
        *self.last_published.lock() = Some(document);

        info!(
            key = %self.options_key,
            channel = %self.update_channel,
            algorithms = policy.algorithms.len(),
            "Synced rate limit policy"
        );
        Ok(true)
    }

    /// Sync every interval until `shutdown` turns true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.settings.interval_secs.max(1));
        info!(url = %self.settings.url, "Starting policy sync worker");

        loop {
            if let Err(e) = self.sync_once().await {
                warn!(error = %e, "Policy sync failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Policy sync worker stopped");
    }
}

impl std::fmt::Debug for PolicySyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicySyncWorker")
            .field("url", &self.settings.url)
            .field("options_key", &self.options_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    fn envelope(policy: &str) -> String {
        serde_json::json!({ "action": "get", "node": { "key": "/rl/policies.json", "value": policy } })
            .to_string()
    }

    /// Serve `responses` in order, one per connection, then stop.
    async fn serve(responses: Vec<(u16, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {} X\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        format!("http://{}/v2/keys/rl/policies.json", addr)
    }

    fn settings(url: String) -> SyncConfig {
        SyncConfig {
            url,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_parse_envelope() {
        let policy = parse_envelope(&envelope(r#"{"clusterNodeCount": 4}"#)).unwrap();
        assert_eq!(policy.cluster_node_count, 4);
    }

    #[test]
    fn test_parse_envelope_rejects_bad_input() {
        assert_err!(parse_envelope(r#"{"action": "get"}"#));
        assert_err!(parse_envelope(r#"{"node": {}}"#));
        assert_err!(parse_envelope(&envelope("not json")));
        assert_err!(parse_envelope(&envelope(r#"{"defaultMaxRequests": 0}"#)));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let worker = PolicySyncWorker::new(
            SyncConfig {
                initial_backoff_ms: 100,
                max_backoff_ms: 1000,
                ..SyncConfig::default()
            },
            Arc::new(MemoryStore::new()),
            "k",
            "c",
        )
        .unwrap();

        assert_eq!(worker.base_delay(0), Duration::from_millis(100));
        assert_eq!(worker.base_delay(1), Duration::from_millis(200));
        assert_eq!(worker.base_delay(3), Duration::from_millis(800));
        assert_eq!(worker.base_delay(4), Duration::from_millis(1000));
        assert_eq!(worker.base_delay(40), Duration::from_millis(1000));

        let delay = worker.retry_delay(1);
        assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(240));
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        let result = PolicySyncWorker::new(
            SyncConfig {
                max_attempts: 0,
                ..SyncConfig::default()
            },
            Arc::new(MemoryStore::new()),
            "k",
            "c",
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sync_writes_and_publishes() {
        let body = envelope(r#"{"clusterNodeCount": 3, "defaultMaxRequests": 50}"#);
        let url = serve(vec![(200, body.clone()), (200, body)]).await;
        let store = Arc::new(MemoryStore::new());
        let mut updates = store.subscribe();
        let worker =
            PolicySyncWorker::new(settings(url), store.clone(), "rate-limiting:options", "updates")
                .unwrap();

        assert!(worker.sync_once().await.unwrap());

        let stored = store.get("rate-limiting:options").await.unwrap().unwrap();
        let policy = GlobalConfig::from_json(&stored).unwrap();
        assert_eq!(policy.cluster_node_count, 3);
        assert_eq!(policy.default_max_requests, 50);

        let (channel, message) = updates.recv().await.unwrap();
        assert_eq!(channel, "updates");
        assert_eq!(message, stored);

        // Same document again: rewritten but not announced.
        assert!(!worker.sync_once().await.unwrap());
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_restores_lost_options_key() {
        let body = envelope(r#"{"clusterNodeCount": 3}"#);
        let url = serve(vec![(200, body.clone()), (200, body)]).await;
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let worker = PolicySyncWorker::new(settings(url), store.clone(), "k", "c").unwrap();

        assert!(worker.sync_once().await.unwrap());
        let written = store.get("k").await.unwrap().unwrap();

        // Simulate the store dropping the key.
        store.set("k", &written, Some(Duration::from_millis(1))).await.unwrap();
        clock.advance(1);
        assert_eq!(store.get("k").await.unwrap(), None);

        assert!(!worker.sync_once().await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(written));
    }

    #[tokio::test]
    async fn test_sync_retries_failed_fetch() {
        let body = envelope(r#"{"clusterNodeCount": 1}"#);
        let url = serve(vec![
            (503, String::new()),
            (500, String::new()),
            (200, body),
        ])
        .await;
        let store = Arc::new(MemoryStore::new());
        let worker = PolicySyncWorker::new(settings(url), store.clone(), "k", "c").unwrap();

        assert!(assert_ok!(worker.sync_once().await));
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_gives_up_after_max_attempts() {
        let url = serve(vec![
            (503, String::new()),
            (503, String::new()),
            (503, String::new()),
        ])
        .await;
        let store = Arc::new(MemoryStore::new());
        let worker = PolicySyncWorker::new(settings(url), store.clone(), "k", "c").unwrap();

        let err = worker.sync_once().await.unwrap_err();
        assert!(matches!(err, GatekeeperError::PolicyFetch(_)));
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
