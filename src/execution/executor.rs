//! Job executor - the seam between the scheduler and whatever actually
//! builds, tests or deploys

use crate::core::{
    context::{RunContext, RunId},
    environment::Bindings,
    job::InstanceId,
};
use crate::execution::signal::CancellationSignal;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Everything an executor receives for one job instance
#[derive(Debug, Clone)]
pub struct ExecutionDescriptor {
    pub run_id: RunId,
    pub instance: InstanceId,
    pub job: String,
    pub matrix: Vec<(String, String)>,

    /// Bindings of the instance's own environment scope, if it declares one
    pub bindings: Option<Arc<Bindings>>,

    /// Fired when the run or this instance is cancelled
    pub cancel: CancellationSignal,

    pub context: Arc<RunContext>,
}

impl ExecutionDescriptor {
    pub fn matrix_value(&self, axis: &str) -> Option<&str> {
        self.matrix
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }
}

/// What a finished job reports back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub success: bool,

    /// Structured outputs readable by dependents' conditions
    pub outputs: BTreeMap<String, String>,
}

impl JobOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            outputs: BTreeMap::new(),
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("job was cancelled")]
    Cancelled,

    #[error("executor error: {0}")]
    Failed(String),
}

/// Runs a single job instance
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Execute an instance. Implementations should watch `descriptor.cancel`
    /// and return promptly once it fires.
    async fn execute(&self, descriptor: ExecutionDescriptor) -> Result<JobOutcome, ExecutorError>;
}

#[async_trait]
impl<E: JobExecutor + ?Sized> JobExecutor for Arc<E> {
    async fn execute(&self, descriptor: ExecutionDescriptor) -> Result<JobOutcome, ExecutorError> {
        (**self).execute(descriptor).await
    }
}

/// Executor that pretends to run jobs: everything succeeds unless told otherwise
#[derive(Debug, Clone, Default)]
pub struct SimulatedExecutor {
    /// Job names or instance ids that should fail
    failures: HashSet<String>,
    outputs: HashMap<String, BTreeMap<String, String>>,
    delay: Option<Duration>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing<I, S>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failures.extend(jobs.into_iter().map(Into::into));
        self
    }

    pub fn with_output(
        mut self,
        job: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.outputs
            .entry(job.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl JobExecutor for SimulatedExecutor {
    async fn execute(&self, descriptor: ExecutionDescriptor) -> Result<JobOutcome, ExecutorError> {
        info!("Simulating {}", descriptor.instance);
        if let Some(bindings) = &descriptor.bindings {
            debug!(
                "{} sees environment '{}' with keys {:?}",
                descriptor.instance,
                bindings.scope(),
                bindings.keys().collect::<Vec<_>>()
            );
        }

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = descriptor.cancel.cancelled() => return Err(ExecutorError::Cancelled),
            }
        }

        if self.failures.contains(&descriptor.job)
            || self.failures.contains(descriptor.instance.as_str())
        {
            return Ok(JobOutcome::failure());
        }

        let mut outcome = JobOutcome::success();
        if let Some(outputs) = self.outputs.get(&descriptor.job) {
            outcome.outputs = outputs.clone();
        }
        Ok(outcome)
    }
}
