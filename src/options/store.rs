//! Provider that polls a policy document from the shared store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{OptionsCell, OptionsProvider};
use crate::error::Result;
use crate::ratelimit::GlobalConfig;
use crate::store::AtomicStore;

/// Key the policy document is published under.
pub const DEFAULT_OPTIONS_KEY: &str = "rate-limiting:options";

/// Shortest accepted poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Keeps the last good policy read from `key` and re-reads it on an interval.
///
/// Missing, unparsable or invalid documents are logged and skipped; the
/// previous snapshot stays active.
pub struct StoreOptionsProvider {
    cell: OptionsCell,
    store: Arc<dyn AtomicStore>,
    key: String,
    poll_interval: Duration,
}

impl StoreOptionsProvider {
    /// `initial` is served until the first good document is read.
    pub fn new(
        store: Arc<dyn AtomicStore>,
        key: impl Into<String>,
        initial: GlobalConfig,
        poll_interval: Duration,
    ) -> Result<Self> {
        initial.validate()?;
        Ok(Self {
            cell: OptionsCell::new(initial),
            store,
            key: key.into(),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Read the document once. Returns whether a new snapshot was published.
    ///
    /// Only store errors are returned; bad documents are not errors.
    pub async fn refresh(&self) -> Result<bool> {
        let Some(raw) = self.store.get(&self.key).await? else {
            debug!(key = %self.key, "No rate limit policy in store");
            return Ok(false);
        };

        let config = match GlobalConfig::from_json(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to parse rate limit policy");
                return Ok(false);
            }
        };
        if let Err(e) = config.validate() {
            warn!(key = %self.key, error = %e, "Ignoring invalid rate limit policy");
            return Ok(false);
        }

        match self.cell.publish(config) {
            Some(version) => {
                info!(key = %self.key, version = version, "Loaded new rate limit policy");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Refresh now and then every poll interval until `shutdown` turns true
    /// or its sender is dropped.
    pub fn spawn_refresher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                key = %self.key,
                interval_secs = self.poll_interval.as_secs(),
                "Starting policy refresher"
            );
            loop {
                if let Err(e) = self.refresh().await {
                    warn!(key = %self.key, error = %e, "Policy refresh failed");
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(key = %self.key, "Policy refresher stopped");
        })
    }
}

impl OptionsProvider for StoreOptionsProvider {
    fn current_options(&self) -> Arc<GlobalConfig> {
        self.cell.current()
    }

    fn version(&self) -> u64 {
        self.cell.version()
    }
}

impl std::fmt::Debug for StoreOptionsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptionsProvider")
            .field("key", &self.key)
            .field("poll_interval", &self.poll_interval)
            .field("version", &self.cell.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio_test::assert_ok;

    fn provider(store: Arc<MemoryStore>) -> StoreOptionsProvider {
        StoreOptionsProvider::new(
            store,
            DEFAULT_OPTIONS_KEY,
            GlobalConfig::default(),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_missing_document_keeps_initial() {
        let provider = provider(Arc::new(MemoryStore::new()));

        assert!(!provider.refresh().await.unwrap());
        assert_eq!(provider.version(), 0);
        assert_eq!(*provider.current_options(), GlobalConfig::default());
    }

    #[tokio::test]
    async fn test_new_document_is_published_once() {
        let store = Arc::new(MemoryStore::new());
        let provider = provider(store.clone());

        store
            .set(DEFAULT_OPTIONS_KEY, r#"{"clusterNodeCount": 5}"#, None)
            .await
            .unwrap();
        assert!(provider.refresh().await.unwrap());
        assert_eq!(provider.version(), 1);
        assert_eq!(provider.current_options().cluster_node_count, 5);

        // Unchanged content must not bump the version.
        assert!(!provider.refresh().await.unwrap());
        assert_eq!(provider.version(), 1);
    }

    #[tokio::test]
    async fn test_bad_documents_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let provider = provider(store.clone());

        store.set(DEFAULT_OPTIONS_KEY, "{not json", None).await.unwrap();
        assert!(!assert_ok!(provider.refresh().await));

        store
            .set(DEFAULT_OPTIONS_KEY, r#"{"defaultWindowSeconds": 0}"#, None)
            .await
            .unwrap();
        assert!(!assert_ok!(provider.refresh().await));

        assert_eq!(provider.version(), 0);
        assert_eq!(provider.current_options().cluster_node_count, 2);
    }

    #[test]
    fn test_poll_interval_has_floor() {
        let provider = StoreOptionsProvider::new(
            Arc::new(MemoryStore::new()),
            "k",
            GlobalConfig::default(),
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(provider.poll_interval(), MIN_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_picks_up_changes_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider(store.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = provider.clone().spawn_refresher(shutdown_rx);
        tokio::task::yield_now().await;
        assert_eq!(provider.version(), 0);

        store
            .set(DEFAULT_OPTIONS_KEY, r#"{"defaultMaxRequests": 7}"#, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(provider.version(), 1);
        assert_eq!(provider.current_options().default_max_requests, 7);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
