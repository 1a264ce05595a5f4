//! Pipeline execution: concurrency groups, scheduling and the engine

pub mod coordinator;
pub mod engine;
pub mod executor;
pub mod scheduler;
pub mod signal;

pub use coordinator::{ConcurrencyCoordinator, GroupKey, Registration};
pub use engine::{
    plan, EventHandler, ExecutionEngine, ExecutionEvent, JobReport, PlanEntry, RunPlan, RunReport,
    EXIT_FAILURE, EXIT_LOAD_ERROR, EXIT_SUCCESS,
};
pub use executor::{ExecutionDescriptor, ExecutorError, JobExecutor, JobOutcome, SimulatedExecutor};
pub use scheduler::{ExecutionScheduler, ScheduleOutcome, SchedulerConfig};
pub use signal::CancellationSignal;
