//! Logical shards holding per-client pipelines.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use tracing::trace;

use super::algorithm::AlgorithmFactory;
use super::pipeline::Pipeline;
use super::policy::ResolvedAlgorithm;
use super::request::RequestInfo;
use super::result::CheckResult;
use crate::error::{GatekeeperError, Result};

/// Bounds on a node's pipeline cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineCacheSettings {
    /// Maximum cached client pipelines per node
    pub max_capacity: u64,
    /// Pipelines unused for this long are dropped
    pub time_to_idle: Duration,
}

impl Default for PipelineCacheSettings {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            time_to_idle: Duration::from_secs(600),
        }
    }
}

/// One logical node. Owns a lazily populated client key → [`Pipeline`] cache
/// for a single policy version.
pub struct Node {
    id: String,
    algorithms: Arc<[ResolvedAlgorithm]>,
    factory: Arc<dyn AlgorithmFactory>,
    pipelines: Cache<String, Arc<Pipeline>>,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        algorithms: Arc<[ResolvedAlgorithm]>,
        factory: Arc<dyn AlgorithmFactory>,
        settings: PipelineCacheSettings,
    ) -> Self {
        let pipelines = Cache::builder()
            .max_capacity(settings.max_capacity)
            .time_to_idle(settings.time_to_idle)
            .build();
        Self {
            id: id.into(),
            algorithms,
            factory,
            pipelines,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Evaluate `request` against its client's pipeline, building it first if
    /// this node has not seen the client yet.
    pub async fn evaluate(&self, request: &RequestInfo) -> Result<CheckResult> {
        let key = request.client_key().to_string_key();
        let pipeline = self.pipeline_for(&key)?;
        pipeline.evaluate(request).await
    }

    /// Get or build the pipeline for `key`. Concurrent callers for the same
    /// key share one build.
    pub fn pipeline_for(&self, key: &str) -> Result<Arc<Pipeline>> {
        self.pipelines
            .try_get_with_by_ref(key, || {
                trace!(node = %self.id, client = %key, "Building pipeline");
                Pipeline::build(self.factory.as_ref(), &self.algorithms).map(Arc::new)
            })
            .map_err(|shared| {
                Arc::try_unwrap(shared)
                    .unwrap_or_else(|shared| GatekeeperError::Config(shared.to_string()))
            })
    }

    /// Whether a live pipeline is cached for `key`.
    pub fn has_pipeline(&self, key: &str) -> bool {
        self.pipelines.get(key).is_some()
    }

    /// Approximate number of cached pipelines.
    pub fn cached_pipelines(&self) -> u64 {
        self.pipelines.run_pending_tasks();
        self.pipelines.entry_count()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("algorithms", &self.algorithms.len())
            .finish()
    }
}
