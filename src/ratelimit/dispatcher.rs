//! Distributed rate limiter that fans requests out over logical nodes.
//!
//! The limiter owns one set of [`Node`]s per policy version. Every call first
//! compares the provider version with the last one it built for; the fast
//! path is a single atomic load. On a change the node set is rebuilt under a
//! lock and swapped in whole.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::algorithm::AlgorithmFactory;
use super::node::{Node, PipelineCacheSettings};
use super::policy::{GlobalConfig, ResolvedAlgorithm};
use super::request::RequestInfo;
use super::result::{Decision, LOCAL_NODE_ID};
use crate::error::Result;
use crate::options::OptionsProvider;

/// What to answer when an algorithm cannot reach its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through.
    FailOpen,
    /// Deny the request.
    FailClosed,
}

/// Tuning for [`DistributedRateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Pipeline cache bounds for every node
    pub cache: PipelineCacheSettings,
    /// Retry-after reported by [`FailurePolicy::FailClosed`] denials
    pub fail_closed_retry_after: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache: PipelineCacheSettings::default(),
            fail_closed_retry_after: Duration::from_secs(1),
        }
    }
}

/// Entry point for admission decisions.
pub struct DistributedRateLimiter {
    provider: Arc<dyn OptionsProvider>,
    factory: Arc<dyn AlgorithmFactory>,
    options: EngineOptions,
    nodes: ArcSwap<Vec<Arc<Node>>>,
    /// Provider version the current nodes were built for.
    observed_version: AtomicU64,
    rebuild_lock: Mutex<()>,
    next_node: AtomicUsize,
    rebuilds: AtomicU64,
    rebuild_failures: AtomicU64,
}

impl DistributedRateLimiter {
    /// Build nodes for the provider's current policy. Fails if that policy
    /// cannot be turned into algorithms.
    pub fn new(
        provider: Arc<dyn OptionsProvider>,
        factory: Arc<dyn AlgorithmFactory>,
        options: EngineOptions,
    ) -> Result<Self> {
        let version = provider.version();
        let config = provider.current_options();
        let nodes = build_nodes(&config, &factory, options.cache)?;

        info!(
            version = version,
            nodes = nodes.len(),
            "Rate limiter initialized"
        );

        Ok(Self {
            provider,
            factory,
            options,
            nodes: ArcSwap::from_pointee(nodes),
            observed_version: AtomicU64::new(version),
            rebuild_lock: Mutex::new(()),
            next_node: AtomicUsize::new(0),
            rebuilds: AtomicU64::new(0),
            rebuild_failures: AtomicU64::new(0),
        })
    }

    /// Decide `request`. Store failures are returned as errors.
    pub async fn should_allow(&self, request: &RequestInfo) -> Result<Decision> {
        let Some(node) = self.select_node() else {
            return Ok(Decision::allowed(LOCAL_NODE_ID));
        };
        let result = node.evaluate(request).await?;
        Ok(Decision::from_check(result, node.id()))
    }

    /// Decide `request`, resolving store failures with `policy`.
    pub async fn should_allow_with_policy(
        &self,
        request: &RequestInfo,
        policy: FailurePolicy,
    ) -> Decision {
        let Some(node) = self.select_node() else {
            return Decision::allowed(LOCAL_NODE_ID);
        };

        match node.evaluate(request).await {
            Ok(result) => Decision::from_check(result, node.id()),
            Err(e) => {
                warn!(
                    node = %node.id(),
                    request_id = %request.request_id,
                    error = %e,
                    policy = ?policy,
                    "Rate limit evaluation failed"
                );
                match policy {
                    FailurePolicy::FailOpen => Decision::allowed(node.id()),
                    FailurePolicy::FailClosed => {
                        Decision::denied(self.options.fail_closed_retry_after, "", node.id())
                    }
                }
            }
        }
    }

    /// Refresh the node set if needed and pick the next node.
    fn select_node(&self) -> Option<Arc<Node>> {
        self.ensure_current();

        let nodes = self.nodes.load();
        if nodes.is_empty() {
            return None;
        }
        let index = self.next_node.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Some(nodes[index].clone())
    }

    /// Rebuild the nodes if the provider published a new version.
    fn ensure_current(&self) {
        if self.provider.version() == self.observed_version.load(Ordering::Acquire) {
            return;
        }

        let _guard = self.rebuild_lock.lock();
        let version = self.provider.version();
        if version == self.observed_version.load(Ordering::Acquire) {
            return;
        }

        let config = self.provider.current_options();
        match build_nodes(&config, &self.factory, self.options.cache) {
            Ok(nodes) => {
                let count = nodes.len();
                self.nodes.store(Arc::new(nodes));
                self.next_node.store(0, Ordering::Relaxed);
                self.rebuilds.fetch_add(1, Ordering::Relaxed);
                info!(version = version, nodes = count, "Rebuilt rate limit nodes");
            }
            Err(e) => {
                self.rebuild_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    version = version,
                    error = %e,
                    "Rejected rate limit policy, keeping previous nodes"
                );
            }
        }
        // Recorded on failure too so a bad version is not retried per request.
        self.observed_version.store(version, Ordering::Release);
    }

    /// Ids of the active nodes.
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes
            .load()
            .iter()
            .map(|node| node.id().to_string())
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.load().len()
    }

    /// Active nodes, for inspection.
    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.load_full()
    }

    /// Provider version the active nodes were built for.
    pub fn observed_version(&self) -> u64 {
        self.observed_version.load(Ordering::Acquire)
    }

    /// Successful rebuilds since construction.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    /// Rebuilds rejected since construction.
    pub fn rebuild_failure_count(&self) -> u64 {
        self.rebuild_failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("nodes", &self.node_ids())
            .field("observed_version", &self.observed_version())
            .finish()
    }
}

fn build_nodes(
    config: &GlobalConfig,
    factory: &Arc<dyn AlgorithmFactory>,
    cache: PipelineCacheSettings,
) -> Result<Vec<Arc<Node>>> {
    let algorithms: Arc<[ResolvedAlgorithm]> = config.resolved_algorithms()?.into();

    // Create every algorithm once so a policy the factory cannot handle is
    // rejected here rather than on the first request.
    for algorithm in algorithms.iter() {
        factory.create(algorithm)?;
    }

    let nodes = (1..=config.effective_node_count())
        .map(|i| {
            Arc::new(Node::new(
                format!("node-{}", i),
                algorithms.clone(),
                factory.clone(),
                cache,
            ))
        })
        .collect::<Vec<_>>();

    debug!(
        nodes = nodes.len(),
        algorithms = algorithms.len(),
        "Built rate limit nodes"
    );
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatekeeperError;
    use crate::options::StaticOptionsProvider;
    use crate::ratelimit::algorithm::{DefaultAlgorithmFactory, RateLimitAlgorithm};
    use crate::ratelimit::pipeline::tests::Scripted;
    use crate::ratelimit::policy::{AlgorithmConfig, AlgorithmType};
    use std::collections::HashMap;

    fn policy(nodes: u32, algorithms: Vec<AlgorithmConfig>) -> GlobalConfig {
        GlobalConfig {
            cluster_node_count: nodes,
            algorithms,
            ..GlobalConfig::default()
        }
    }

    fn limiter_with(
        provider: Arc<StaticOptionsProvider>,
        factory: Arc<dyn AlgorithmFactory>,
    ) -> DistributedRateLimiter {
        DistributedRateLimiter::new(provider, factory, EngineOptions::default()).unwrap()
    }

    /// Fails for algorithms named `broken` and counts pipeline builds.
    struct TestFactory {
        inner: DefaultAlgorithmFactory,
        creates: AtomicUsize,
    }

    impl TestFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: DefaultAlgorithmFactory::local(),
                creates: AtomicUsize::new(0),
            })
        }
    }

    impl AlgorithmFactory for TestFactory {
        fn create(&self, algorithm: &ResolvedAlgorithm) -> Result<Arc<dyn RateLimitAlgorithm>> {
            if algorithm.name == "broken" {
                return Err(GatekeeperError::invalid_algorithm(&algorithm.name, "unsupported"));
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner.create(algorithm)
        }
    }

    #[tokio::test]
    async fn test_nodes_follow_policy() {
        let provider = Arc::new(StaticOptionsProvider::new(policy(3, Vec::new())).unwrap());
        let limiter = limiter_with(provider, Arc::new(DefaultAlgorithmFactory::local()));

        assert_eq!(limiter.node_ids(), vec!["node-1", "node-2", "node-3"]);
    }

    #[tokio::test]
    async fn test_zero_node_count_builds_one_node() {
        let provider = Arc::new(StaticOptionsProvider::new(policy(0, Vec::new())).unwrap());
        let limiter = limiter_with(provider, Arc::new(DefaultAlgorithmFactory::local()));

        assert_eq!(limiter.node_ids(), vec!["node-1"]);
        let decision = limiter.should_allow(&RequestInfo::at("r", 0)).await.unwrap();
        assert_eq!(decision.node_id, "node-1");
    }

    #[tokio::test]
    async fn test_round_robin_is_fair() {
        let provider = Arc::new(StaticOptionsProvider::new(policy(3, Vec::new())).unwrap());
        let limiter = limiter_with(provider, Arc::new(DefaultAlgorithmFactory::local()));

        let mut per_node: HashMap<String, usize> = HashMap::new();
        for i in 0..10 {
            let request = RequestInfo::at(format!("r{}", i), 0);
            let decision = limiter.should_allow(&request).await.unwrap();
            *per_node.entry(decision.node_id).or_default() += 1;
        }

        assert_eq!(per_node.len(), 3);
        for count in per_node.values() {
            assert!(*count == 3 || *count == 4, "unfair split: {:?}", per_node);
        }
    }

    #[tokio::test]
    async fn test_deny_carries_algorithm_and_node() {
        let provider = Arc::new(
            StaticOptionsProvider::new(policy(
                1,
                vec![AlgorithmConfig::new("per-minute", AlgorithmType::FixedWindow).with_limit(1, 60)],
            ))
            .unwrap(),
        );
        let limiter = limiter_with(provider, Arc::new(DefaultAlgorithmFactory::local()));
        let request = RequestInfo::at("r", 1_000).with_api_key("k");

        let first = limiter.should_allow(&request).await.unwrap();
        assert!(first.allowed);
        assert!(first.algorithm.is_empty());
        assert_eq!(first.node_id, "node-1");

        let second = limiter.should_allow(&request).await.unwrap();
        assert!(!second.allowed);
        assert_eq!(second.algorithm, "per-minute");
        assert_eq!(second.node_id, "node-1");
        assert_eq!(second.retry_after_secs(), 60);
    }

    #[tokio::test]
    async fn test_no_rebuild_without_version_change() {
        let provider = Arc::new(StaticOptionsProvider::new(policy(2, Vec::new())).unwrap());
        let factory = TestFactory::new();
        let limiter = limiter_with(provider.clone(), factory.clone());
        let before = limiter.nodes();

        for i in 0..20 {
            let request = RequestInfo::at(format!("r{}", i), 0).with_user_id("same");
            limiter.should_allow(&request).await.unwrap();
        }

        assert!(Arc::ptr_eq(&before, &limiter.nodes()));
        assert_eq!(limiter.rebuild_count(), 0);
        // One trial build at construction plus one pipeline per node for the client.
        assert_eq!(factory.creates.load(Ordering::SeqCst), 3);

        // Republishing identical content does not change the version either.
        assert!(!provider.publish(policy(2, Vec::new())).unwrap());
        limiter.should_allow(&RequestInfo::at("x", 0)).await.unwrap();
        assert!(Arc::ptr_eq(&before, &limiter.nodes()));
    }

    #[tokio::test]
    async fn test_hot_reload_rebuilds_pipelines() {
        let strict = vec![AlgorithmConfig::new("fw", AlgorithmType::FixedWindow).with_limit(1, 60)];
        let provider = Arc::new(StaticOptionsProvider::new(policy(1, strict)).unwrap());
        let limiter = limiter_with(provider.clone(), Arc::new(DefaultAlgorithmFactory::local()));
        let request = RequestInfo::at("r", 0).with_user_id("u");

        assert!(limiter.should_allow(&request).await.unwrap().allowed);
        assert!(!limiter.should_allow(&request).await.unwrap().allowed);

        let relaxed = vec![AlgorithmConfig::new("fw", AlgorithmType::FixedWindow).with_limit(2, 60)];
        assert!(provider.publish(policy(2, relaxed)).unwrap());

        // Fresh state after the reload: the old counter is gone.
        let decision = limiter.should_allow(&request).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(limiter.node_count(), 2);
        assert_eq!(limiter.rebuild_count(), 1);
        assert_eq!(limiter.observed_version(), provider.version());
        assert_eq!(decision.node_id, "node-1");
    }

    #[tokio::test]
    async fn test_rejected_rebuild_keeps_previous_nodes() {
        let provider = Arc::new(StaticOptionsProvider::new(policy(2, Vec::new())).unwrap());
        let limiter = limiter_with(provider.clone(), TestFactory::new());
        let before = limiter.nodes();

        let broken = vec![AlgorithmConfig::new("broken", AlgorithmType::SlidingWindow)];
        assert!(provider.publish(policy(4, broken)).unwrap());

        let decision = limiter.should_allow(&RequestInfo::at("r", 0)).await.unwrap();
        assert!(decision.allowed);
        assert!(Arc::ptr_eq(&before, &limiter.nodes()));
        assert_eq!(limiter.rebuild_failure_count(), 1);

        // The bad version is recorded and not retried on every call.
        limiter.should_allow(&RequestInfo::at("r2", 0)).await.unwrap();
        assert_eq!(limiter.rebuild_failure_count(), 1);
        assert_eq!(limiter.observed_version(), provider.version());
    }

    #[test]
    fn test_new_fails_fast_on_unusable_policy() {
        let provider = Arc::new(StaticOptionsProvider::default());
        let broken = vec![AlgorithmConfig::new("broken", AlgorithmType::FixedWindow)];
        provider.publish(policy(1, broken)).unwrap();

        let result = DistributedRateLimiter::new(provider, TestFactory::new(), EngineOptions::default());
        assert!(result.is_err());
    }

    struct FixedFactory(Arc<Scripted>);

    impl AlgorithmFactory for FixedFactory {
        fn create(&self, _algorithm: &ResolvedAlgorithm) -> Result<Arc<dyn RateLimitAlgorithm>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_failure_policy() {
        let provider = Arc::new(StaticOptionsProvider::new(policy(1, Vec::new())).unwrap());
        let options = EngineOptions {
            fail_closed_retry_after: Duration::from_millis(1500),
            ..EngineOptions::default()
        };
        let limiter = DistributedRateLimiter::new(
            provider,
            Arc::new(FixedFactory(Scripted::failing("shared"))),
            options,
        )
        .unwrap();
        let request = RequestInfo::at("r", 0);

        let err = limiter.should_allow(&request).await.unwrap_err();
        assert!(err.is_backend());

        let open = limiter
            .should_allow_with_policy(&request, FailurePolicy::FailOpen)
            .await;
        assert!(open.allowed);

        let closed = limiter
            .should_allow_with_policy(&request, FailurePolicy::FailClosed)
            .await;
        assert!(!closed.allowed);
        assert_eq!(closed.node_id, "node-1");
        assert_eq!(closed.retry_after, Duration::from_millis(1500));
        assert_eq!(closed.retry_after_secs(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_reload_rebuilds_once() {
        let provider = Arc::new(StaticOptionsProvider::new(policy(2, Vec::new())).unwrap());
        let limiter = Arc::new(limiter_with(
            provider.clone(),
            Arc::new(DefaultAlgorithmFactory::local()),
        ));
        provider.publish(policy(5, Vec::new())).unwrap();

        let handles = (0..32).map(|i| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .should_allow(&RequestInfo::at(format!("r{}", i), 0))
                    .await
                    .unwrap()
            })
        });
        for result in futures::future::join_all(handles).await {
            result.unwrap();
        }

        assert_eq!(limiter.rebuild_count(), 1);
        assert_eq!(limiter.node_count(), 5);
    }
}
