//! Main execution engine - orchestrates a pipeline run from trigger to report

use crate::core::{
    condition::{ConditionCache, EvalScope},
    config::PipelineDefinition,
    context::{RunContext, RunId},
    environment::EnvironmentProvisioner,
    error::LoadError,
    job::InstanceId,
    state::{JobResult, JobState, RunState, RunStatus},
};
use crate::execution::{
    coordinator::ConcurrencyCoordinator,
    executor::JobExecutor,
    scheduler::{ExecutionScheduler, SchedulerConfig},
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Exit code of a successful run
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code of a run with a failed or cancelled required job, or a superseded run
pub const EXIT_FAILURE: i32 = 1;
/// Exit code when the pipeline definition could not be loaded
pub const EXIT_LOAD_ERROR: i32 = 2;

/// Events that can occur during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        run_id: RunId,
        pipeline_name: String,
        group: String,
        instances: usize,
    },
    /// This run displaced an older run of the same concurrency group
    RunSuperseded {
        run_id: RunId,
        superseded: RunId,
        group: String,
    },
    JobStarted {
        run_id: RunId,
        instance: InstanceId,
    },
    JobFinished {
        run_id: RunId,
        instance: InstanceId,
        result: JobResult,
        reason: Option<String>,
    },
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Outcome of one job instance
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: InstanceId,
    pub job: String,
    pub result: JobResult,
    pub reason: Option<String>,
    pub best_effort: bool,
    pub outputs: BTreeMap<String, String>,
}

/// Outcome of a run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub context: Arc<RunContext>,
    pub pipeline_name: String,
    pub group: String,
    pub status: RunStatus,
    pub state: RunState,
    /// Instances in topological order
    pub jobs: Vec<JobReport>,
    /// Older runs this run displaced
    pub superseded: Vec<RunId>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => EXIT_SUCCESS,
            _ => EXIT_FAILURE,
        }
    }

    pub fn job(&self, id: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.id.as_str() == id)
    }

    pub fn result(&self, id: &str) -> Option<JobResult> {
        self.job(id).map(|j| j.result)
    }
}

/// What a run would do, without running anything
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub pipeline_name: String,
    pub group: String,
    pub entries: Vec<PlanEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub id: InstanceId,
    pub needs: Vec<InstanceId>,
    /// `None` when the condition waits on dependency outputs
    pub condition: Option<bool>,
    pub environment: Option<String>,
    /// Why the environment would be refused, if it would be
    pub environment_error: Option<String>,
    pub best_effort: bool,
}

/// Main pipeline execution engine
pub struct ExecutionEngine<E> {
    executor: Arc<E>,
    coordinator: ConcurrencyCoordinator,
    config: SchedulerConfig,
    max_parallel: Option<usize>,
    event_handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl<E: JobExecutor + 'static> ExecutionEngine<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor: Arc::new(executor),
            coordinator: ConcurrencyCoordinator::new(),
            config: SchedulerConfig::default(),
            max_parallel: None,
            event_handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Share a coordinator with other engines in the process
    pub fn with_coordinator(mut self, coordinator: ConcurrencyCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Worker slots, overriding the pipeline's own `max_parallel`
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = Some(max.max(1));
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.config.cancel_grace = grace;
        self
    }

    pub fn coordinator(&self) -> &ConcurrencyCoordinator {
        &self.coordinator
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Run a pipeline for one trigger.
    ///
    /// Load errors surface before the run is registered with its
    /// concurrency group, so a broken definition never cancels a healthy
    /// run.
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        context: RunContext,
    ) -> Result<RunReport, LoadError> {
        let graph = definition.build_graph()?;
        let context = Arc::new(with_workflow(context, definition));
        let run_id = context.run_id;
        let group = definition.concurrency_key(&context);

        info!(
            "Starting pipeline run: {} ({}) in group '{}'",
            definition.name, run_id, group
        );
        let registration = self.coordinator.register(group.clone(), run_id).await;

        self.emit_event(ExecutionEvent::RunStarted {
            run_id,
            pipeline_name: definition.name.clone(),
            group: group.clone(),
            instances: graph.len(),
        })
        .await;
        for superseded in &registration.superseded {
            self.emit_event(ExecutionEvent::RunSuperseded {
                run_id,
                superseded: *superseded,
                group: group.clone(),
            })
            .await;
        }

        let mut config = self.config.clone().with_policy(definition.policy.clone());
        if let Some(max) = self.max_parallel.or(definition.max_parallel) {
            config = config.with_max_parallel(max);
        }

        let provisioner = Arc::new(EnvironmentProvisioner::new(
            Arc::clone(&context),
            definition.environments.clone(),
            definition.policy.empty_paths,
        ));
        let executor: Arc<dyn JobExecutor> = self.executor.clone();
        let handlers = self.event_handlers.lock().await.clone();

        let outcome = ExecutionScheduler::new(graph, Arc::clone(&context), executor, provisioner, config)
            .with_coordinator(self.coordinator.clone())
            .with_cancellation(registration.signal.clone())
            .with_event_handlers(handlers)
            .run()
            .await;

        self.coordinator.release(run_id).await;

        match outcome.status {
            RunStatus::Succeeded => info!("Pipeline run finished: {} - succeeded", definition.name),
            status => warn!("Pipeline run finished: {} - {:?}", definition.name, status),
        }
        self.emit_event(ExecutionEvent::RunCompleted {
            run_id,
            status: outcome.status,
        })
        .await;

        let graph = &outcome.graph;
        let jobs = graph
            .topological_order()
            .into_iter()
            .map(|idx| {
                let instance = graph.instance(idx);
                JobReport {
                    id: instance.id.clone(),
                    job: instance.job.clone(),
                    result: instance.state.result().unwrap_or(JobResult::Skipped),
                    reason: state_reason(&instance.state),
                    best_effort: graph.spec(idx).best_effort,
                    outputs: instance.outputs.clone(),
                }
            })
            .collect();

        Ok(RunReport {
            run_id,
            context,
            pipeline_name: definition.name.clone(),
            group,
            status: outcome.status,
            state: outcome.state,
            jobs,
            superseded: registration.superseded,
        })
    }
}

/// Work out which instances a trigger would run, without running them
pub fn plan(definition: &PipelineDefinition, context: RunContext) -> Result<RunPlan, LoadError> {
    let graph = definition.build_graph()?;
    let context = Arc::new(with_workflow(context, definition));
    let scope = EvalScope::new(&context, definition.policy.empty_paths);
    let conditions = ConditionCache::precompute(
        graph
            .specs()
            .iter()
            .map(|s| (s.name.as_str(), s.condition.as_ref())),
        &scope,
    );
    let provisioner = EnvironmentProvisioner::new(
        Arc::clone(&context),
        definition.environments.clone(),
        definition.policy.empty_paths,
    );

    let entries = graph
        .topological_order()
        .into_iter()
        .map(|idx| {
            let spec = graph.spec(idx);
            PlanEntry {
                id: graph.instance(idx).id.clone(),
                needs: graph
                    .dependencies(idx)
                    .iter()
                    .map(|&d| graph.instance(d).id.clone())
                    .collect(),
                condition: conditions.get(&spec.name),
                environment: spec.environment.clone(),
                environment_error: spec
                    .environment
                    .as_deref()
                    .and_then(|s| provisioner.check(s).err())
                    .map(|e| e.to_string()),
                best_effort: spec.best_effort,
            }
        })
        .collect();

    Ok(RunPlan {
        pipeline_name: definition.name.clone(),
        group: definition.concurrency_key(&context),
        entries,
    })
}

fn with_workflow(context: RunContext, definition: &PipelineDefinition) -> RunContext {
    if context.workflow.is_empty() {
        context.with_workflow(definition.name.clone())
    } else {
        context
    }
}

fn state_reason(state: &JobState) -> Option<String> {
    match state {
        JobState::Failed { error, .. } => Some(error.clone()),
        JobState::Skipped { reason } | JobState::Cancelled { reason, .. } => Some(reason.clone()),
        _ => None,
    }
}
