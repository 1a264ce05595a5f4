//! conductor - CI pipeline orchestration engine

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use core::{
    EventKind, InstanceId, JobResult, JobSpec, LoadError, PipelineDefinition, PipelineGraph,
    Predicate, RunContext, RunId, RunStatus,
};
pub use execution::{
    ConcurrencyCoordinator, ExecutionDescriptor, ExecutionEngine, ExecutionEvent, ExecutorError,
    JobExecutor, JobOutcome, RunReport, SimulatedExecutor,
};
