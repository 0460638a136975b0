//! Rate limiting logic and state management.

pub mod algorithm;
mod dispatcher;
mod node;
mod pipeline;
mod policy;
mod request;
mod result;

pub use algorithm::{AlgorithmBackend, AlgorithmFactory, DefaultAlgorithmFactory, RateLimitAlgorithm};
pub use dispatcher::{DistributedRateLimiter, EngineOptions, FailurePolicy};
pub use node::{Node, PipelineCacheSettings};
pub use pipeline::Pipeline;
pub use policy::{
    AlgorithmConfig, AlgorithmType, GlobalConfig, ResolvedAlgorithm, DEFAULT_ALGORITHM_NAME,
};
pub use request::{ClientKey, RequestInfo, API_KEY_HEADER, CORRELATION_ID_HEADER};
pub use result::{CheckResult, Decision, LOCAL_NODE_ID};
