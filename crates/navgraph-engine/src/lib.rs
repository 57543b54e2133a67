pub mod exec_log;
pub mod executor;
pub mod graph;
pub mod metrics;
pub mod orchestrator;
pub mod request;

pub use exec_log::ExecutionLogger;
pub use executor::StepExecutor;
pub use graph::{GraphStore, PathHop, Pathfinder, TreeHandle, MAX_NESTING_DEPTH};
pub use metrics::MetricsAggregator;
pub use orchestrator::{
    ExecutionFailure, ExecutionOrchestrator, ExecutionRecord, ExecutionSummary, Progress,
};
pub use request::{ActionBatch, BlockStep, ExecutionRequest, NavigateRequest, VerifyRequest};
