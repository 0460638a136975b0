//! Ordered algorithm chains.

use std::sync::Arc;

use tracing::debug;

use super::algorithm::{AlgorithmFactory, RateLimitAlgorithm};
use super::policy::ResolvedAlgorithm;
use super::request::RequestInfo;
use super::result::CheckResult;
use crate::error::Result;

/// The algorithms guarding one client key, evaluated in order.
///
/// The list is fixed at construction. The first deny wins and later
/// algorithms are not consulted, so they record nothing for that request.
pub struct Pipeline {
    algorithms: Vec<Arc<dyn RateLimitAlgorithm>>,
}

impl Pipeline {
    pub fn new(algorithms: Vec<Arc<dyn RateLimitAlgorithm>>) -> Self {
        Self { algorithms }
    }

    /// Build one fresh instance of every resolved algorithm.
    pub fn build(factory: &dyn AlgorithmFactory, algorithms: &[ResolvedAlgorithm]) -> Result<Self> {
        let instances = algorithms
            .iter()
            .map(|algorithm| factory.create(algorithm))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(instances))
    }

    pub async fn evaluate(&self, request: &RequestInfo) -> Result<CheckResult> {
        let mut last = CheckResult::allow("");
        for algorithm in &self.algorithms {
            let result = algorithm.evaluate(request).await?;
            if !result.allowed {
                debug!(
                    algorithm = %result.algorithm,
                    request_id = %request.request_id,
                    retry_after_ms = result.retry_after.as_millis() as u64,
                    "Request denied"
                );
                return Ok(result);
            }
            last = result;
        }
        Ok(last)
    }

    /// Algorithm names in evaluation order.
    pub fn names(&self) -> Vec<&str> {
        self.algorithms.iter().map(|a| a.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.algorithms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.algorithms.is_empty()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("algorithms", &self.names())
            .finish()
    }
}
