//! Execution scheduler - drives every job instance of a run to a terminal state
//!
//! Instances move `Pending -> Blocked -> Ready -> Running -> {Succeeded,
//! Failed, Skipped, Cancelled}`. The scheduler owns all instance state; each
//! running instance is a tokio task in the scheduler's `JoinSet`.

use crate::core::{
    condition::{ConditionCache, EvalScope, OutputMap},
    context::RunContext,
    environment::EnvironmentProvisioner,
    error::EnvironmentError,
    graph::{NodeIndex, PipelineGraph},
    policy::EnginePolicy,
    state::{JobResult, JobState, RunState, RunStatus},
};
use crate::execution::{
    coordinator::ConcurrencyCoordinator,
    engine::{EventHandler, ExecutionEvent},
    executor::{ExecutionDescriptor, ExecutorError, JobExecutor, JobOutcome},
    signal::CancellationSignal,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, Id as TaskId, JoinError, JoinSet};
use tracing::{debug, info, warn};

/// Scheduling limits
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker slots: upper bound on concurrently running instances
    pub max_parallel: usize,

    /// How long a cancelled job may take to stop before it is abandoned
    pub cancel_grace: Duration,

    pub policy: EnginePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            cancel_grace: Duration::from_secs(10),
            policy: EnginePolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_policy(mut self, policy: EnginePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Final state of a scheduled run
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub status: RunStatus,
    pub state: RunState,
    pub graph: PipelineGraph,
}

/// How a worker task ended
#[derive(Debug)]
enum TaskResult {
    Finished(JobOutcome),
    Error(String),
    TimedOut(Duration),
    /// The executor acknowledged cancellation
    Cancelled,
    /// Cancelled, and the executor did not stop within the grace period
    Abandoned,
    Environment(EnvironmentError),
    /// The worker task panicked
    Panicked(String),
}

impl From<Result<JobOutcome, ExecutorError>> for TaskResult {
    fn from(result: Result<JobOutcome, ExecutorError>) -> Self {
        match result {
            Ok(outcome) => TaskResult::Finished(outcome),
            Err(ExecutorError::Cancelled) => TaskResult::Cancelled,
            Err(ExecutorError::Failed(message)) => TaskResult::Error(message),
        }
    }
}

#[derive(Debug)]
struct Completion {
    idx: NodeIndex,
    result: TaskResult,
}

struct RunningJob {
    handle: AbortHandle,
    signal: CancellationSignal,
    concurrency: Option<String>,
}

enum Decision {
    Wait,
    Ready,
    Skip(String),
}

/// One instance handed to a worker task
struct Dispatch {
    descriptor: ExecutionDescriptor,
    scope: Option<String>,
    timeout: Option<Duration>,
    grace: Duration,
}

impl Dispatch {
    async fn run(
        mut self,
        executor: Arc<dyn JobExecutor>,
        provisioner: Arc<EnvironmentProvisioner>,
    ) -> TaskResult {
        let signal = self.descriptor.cancel.clone();
        if signal.is_cancelled() {
            return TaskResult::Cancelled;
        }

        if let Some(scope) = &self.scope {
            match provisioner.resolve(scope).await {
                Ok(bindings) => self.descriptor.bindings = Some(bindings),
                Err(e) => return TaskResult::Environment(e),
            }
        }

        let descriptor = self.descriptor;
        let timeout = self.timeout;
        let grace = self.grace;

        let work = async move {
            let execution = executor.execute(descriptor);
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, execution).await {
                    Ok(result) => TaskResult::from(result),
                    Err(_) => TaskResult::TimedOut(limit),
                },
                None => TaskResult::from(execution.await),
            }
        };

        tokio::select! {
            result = work => result,
            _ = async {
                signal.cancelled().await;
                tokio::time::sleep(grace).await;
            } => TaskResult::Abandoned,
        }
    }
}

/// Runs the instances of one pipeline run
pub struct ExecutionScheduler {
    graph: PipelineGraph,
    order: Vec<NodeIndex>,
    context: Arc<RunContext>,
    executor: Arc<dyn JobExecutor>,
    provisioner: Arc<EnvironmentProvisioner>,
    coordinator: Option<ConcurrencyCoordinator>,
    config: SchedulerConfig,
    conditions: ConditionCache,
    run_signal: CancellationSignal,
    handlers: Vec<EventHandler>,

    running: HashMap<NodeIndex, RunningJob>,
    running_per_job: HashMap<String, usize>,
    /// Non-terminal instances per environment scope
    scope_users: HashMap<String, usize>,
    outputs: OutputMap,
    workers: JoinSet<Completion>,
    /// Worker task -> the instance it runs, for tasks that end without a result
    tasks: HashMap<TaskId, NodeIndex>,
}

impl ExecutionScheduler {
    pub fn new(
        graph: PipelineGraph,
        context: Arc<RunContext>,
        executor: Arc<dyn JobExecutor>,
        provisioner: Arc<EnvironmentProvisioner>,
        config: SchedulerConfig,
    ) -> Self {
        let scope = EvalScope::new(&context, config.policy.empty_paths);
        let conditions = ConditionCache::precompute(
            graph
                .specs()
                .iter()
                .map(|s| (s.name.as_str(), s.condition.as_ref())),
            &scope,
        );

        let mut scope_users: HashMap<String, usize> = HashMap::new();
        for idx in graph.indices() {
            if let Some(env) = &graph.spec(idx).environment {
                *scope_users.entry(env.clone()).or_default() += 1;
            }
        }

        let order = graph.topological_order();

        Self {
            graph,
            order,
            context,
            executor,
            provisioner,
            coordinator: None,
            config,
            conditions,
            run_signal: CancellationSignal::new(),
            handlers: Vec::new(),
            running: HashMap::new(),
            running_per_job: HashMap::new(),
            scope_users,
            outputs: OutputMap::new(),
            workers: JoinSet::new(),
            tasks: HashMap::new(),
        }
    }

    /// Use a coordinator for job-level concurrency groups
    pub fn with_coordinator(mut self, coordinator: ConcurrencyCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Signal that cancels the whole run
    pub fn with_cancellation(mut self, signal: CancellationSignal) -> Self {
        self.run_signal = signal;
        self
    }

    pub fn with_event_handlers(mut self, handlers: Vec<EventHandler>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Drive every instance to a terminal state
    pub async fn run(mut self) -> ScheduleOutcome {
        let mut state = RunState::new(self.context.run_id);
        state.start(self.graph.len());
        info!(
            "Scheduling {} job instances with {} worker slots",
            self.graph.len(),
            self.config.max_parallel
        );

        let mut cancelled = false;
        loop {
            if self.run_signal.is_cancelled() {
                self.cancel_run().await;
                cancelled = true;
                break;
            }

            self.advance().await;

            if self.running.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.run_signal.cancelled() => {
                    self.cancel_run().await;
                    cancelled = true;
                    break;
                }
                Some(joined) = self.workers.join_next_with_id() => {
                    if let Some(completion) = self.completion_of(joined) {
                        self.complete(completion).await;
                    }
                }
            }
        }

        // Anything left can no longer make progress
        let stuck: Vec<NodeIndex> = self
            .graph
            .indices()
            .filter(|&i| !self.graph.instance(i).state.is_terminal())
            .collect();
        for idx in stuck {
            warn!("{} never became runnable", self.graph.instance(idx).id);
            self.finish(idx, JobResult::Skipped, "never became runnable".to_string())
                .await;
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            self.overall_status()
        };
        state.update_counts(self.graph.instances().map(|i| i.state.result()));
        state.finish(status);

        ScheduleOutcome {
            status,
            state,
            graph: self.graph,
        }
    }

    /// Failed if any required instance failed or was cancelled
    fn overall_status(&self) -> RunStatus {
        let failed = self.graph.indices().any(|idx| {
            !self.graph.spec(idx).best_effort
                && matches!(
                    self.graph.instance(idx).state.result(),
                    Some(JobResult::Failed | JobResult::Cancelled)
                )
        });
        if failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    /// Promote and dispatch until no instance changes terminal state.
    /// Dispatch can fail an instance outright, which may unblock skips.
    async fn advance(&mut self) {
        loop {
            let before = self.terminal_count();
            self.promote().await;
            self.dispatch().await;
            if self.terminal_count() == before {
                break;
            }
        }
    }

    fn terminal_count(&self) -> usize {
        self.graph
            .instances()
            .filter(|i| i.state.is_terminal())
            .count()
    }

    /// Move Pending and Blocked instances forward. Walks in topological
    /// order so skips cascade through the whole graph in one pass.
    async fn promote(&mut self) {
        for i in 0..self.order.len() {
            let idx = self.order[i];
            let pending = match self.graph.instance(idx).state {
                JobState::Pending => true,
                JobState::Blocked => false,
                _ => continue,
            };

            match self.decide(idx, pending) {
                Decision::Wait => {
                    if pending {
                        self.graph.instance_mut(idx).state = JobState::Blocked;
                    }
                }
                Decision::Ready => {
                    debug!("{} is ready", self.graph.instance(idx).id);
                    self.graph.instance_mut(idx).state = JobState::Ready;
                }
                Decision::Skip(reason) => self.finish(idx, JobResult::Skipped, reason).await,
            }
        }
    }

    fn decide(&self, idx: NodeIndex, pending: bool) -> Decision {
        let spec = self.graph.spec(idx);
        let precomputed = self.conditions.get(&spec.name);

        if pending && precomputed == Some(false) {
            return Decision::Skip("condition evaluated to false".to_string());
        }

        let mut waiting = false;
        for &dep in self.graph.dependencies(idx) {
            match self.graph.instance(dep).state.result() {
                None => waiting = true,
                Some(JobResult::Succeeded) => {}
                Some(result)
                    if self.graph.spec(dep).best_effort
                        && self.config.policy.best_effort.tolerates(result) => {}
                Some(result) => {
                    return Decision::Skip(format!(
                        "dependency '{}' {}",
                        self.graph.instance(dep).id,
                        result
                    ))
                }
            }
        }
        if waiting {
            return Decision::Wait;
        }

        // Deferred condition: dependencies are done, their outputs are known
        if precomputed.is_none() {
            if let Some(predicate) = &spec.condition {
                let scope = EvalScope::new(&self.context, self.config.policy.empty_paths)
                    .with_outputs(&self.outputs);
                if !predicate.evaluate(&scope) {
                    return Decision::Skip("condition evaluated to false".to_string());
                }
            }
        }

        Decision::Ready
    }

    /// Start Ready instances while worker slots are free
    async fn dispatch(&mut self) {
        for i in 0..self.order.len() {
            if self.running.len() >= self.config.max_parallel {
                break;
            }
            let idx = self.order[i];
            if !matches!(self.graph.instance(idx).state, JobState::Ready) {
                continue;
            }

            let spec = self.graph.spec(idx).clone();
            if let Some(limit) = spec.strategy.as_ref().and_then(|s| s.max_parallel) {
                if self.running_per_job.get(&spec.name).copied().unwrap_or(0) >= limit {
                    continue;
                }
            }

            if let Some(scope) = &spec.environment {
                if let Err(e) = self.provisioner.check(scope) {
                    warn!("{}: {}", self.graph.instance(idx).id, e);
                    self.finish(idx, JobResult::Failed, e.to_string()).await;
                    continue;
                }
            }

            let signal = CancellationSignal::new();
            if let (Some(key), Some(coordinator)) = (&spec.concurrency, &self.coordinator) {
                coordinator
                    .register_job(key, self.context.run_id, signal.clone())
                    .await;
            }

            let instance = self.graph.instance_mut(idx);
            instance.state = JobState::Running {
                started_at: Utc::now(),
            };
            let descriptor = ExecutionDescriptor {
                run_id: self.context.run_id,
                instance: instance.id.clone(),
                job: instance.job.clone(),
                matrix: instance.matrix.clone(),
                bindings: None,
                cancel: signal.clone(),
                context: Arc::clone(&self.context),
            };
            let id = instance.id.clone();

            info!("Starting {}", id);
            self.emit(ExecutionEvent::JobStarted {
                run_id: self.context.run_id,
                instance: id,
            });

            let dispatch = Dispatch {
                descriptor,
                scope: spec.environment.clone(),
                timeout: spec.timeout,
                grace: self.config.cancel_grace,
            };
            let executor = Arc::clone(&self.executor);
            let provisioner = Arc::clone(&self.provisioner);
            let handle = self.workers.spawn(async move {
                let result = dispatch.run(executor, provisioner).await;
                Completion { idx, result }
            });
            self.tasks.insert(handle.id(), idx);

            *self.running_per_job.entry(spec.name.clone()).or_default() += 1;
            self.running.insert(
                idx,
                RunningJob {
                    handle,
                    signal,
                    concurrency: spec.concurrency.clone(),
                },
            );
        }
    }

    /// Turn a joined worker task into a completion. A panicking executor
    /// still completes its instance, as a failure.
    fn completion_of(
        &mut self,
        joined: Result<(TaskId, Completion), JoinError>,
    ) -> Option<Completion> {
        match joined {
            Ok((id, completion)) => {
                self.tasks.remove(&id);
                Some(completion)
            }
            Err(e) => {
                let idx = self.tasks.remove(&e.id())?;
                if !e.is_panic() {
                    // Aborted by us; the instance is already terminal
                    return None;
                }
                Some(Completion {
                    idx,
                    result: TaskResult::Panicked(panic_message(e)),
                })
            }
        }
    }

    async fn complete(&mut self, completion: Completion) {
        let idx = completion.idx;
        let Some(job) = self.running.remove(&idx) else {
            return;
        };
        self.release_slot(idx, &job).await;

        // Late result for an instance already marked terminal
        if self.graph.instance(idx).state.is_terminal() {
            return;
        }

        // Superseded in a job-level group: whatever the executor returned
        // afterwards is ignored
        let result = match completion.result {
            TaskResult::Abandoned => TaskResult::Abandoned,
            _ if job.signal.is_cancelled() => TaskResult::Cancelled,
            result => result,
        };

        match result {
            TaskResult::Finished(outcome) if outcome.success => {
                let name = self.graph.instance(idx).job.clone();
                self.outputs
                    .entry(name)
                    .or_default()
                    .extend(outcome.outputs.clone());
                self.graph.instance_mut(idx).outputs = outcome.outputs;
                self.finish(idx, JobResult::Succeeded, String::new()).await;
            }
            TaskResult::Finished(_) => {
                self.finish(idx, JobResult::Failed, "job reported failure".to_string())
                    .await;
            }
            TaskResult::Error(message) => self.finish(idx, JobResult::Failed, message).await,
            TaskResult::TimedOut(limit) => {
                self.finish(
                    idx,
                    JobResult::Failed,
                    format!("timed out after {}s", limit.as_secs_f64()),
                )
                .await;
            }
            TaskResult::Cancelled => {
                self.finish(idx, JobResult::Cancelled, "cancelled".to_string())
                    .await;
            }
            TaskResult::Abandoned => {
                self.finish(
                    idx,
                    JobResult::Cancelled,
                    "cancelled; did not stop within grace period".to_string(),
                )
                .await;
            }
            TaskResult::Environment(e) => {
                self.finish(idx, JobResult::Failed, e.to_string()).await;
            }
            TaskResult::Panicked(message) => {
                self.finish(idx, JobResult::Failed, format!("job panicked: {}", message))
                    .await;
            }
        }
    }

    async fn release_slot(&mut self, idx: NodeIndex, job: &RunningJob) {
        let name = &self.graph.instance(idx).job;
        if let Some(count) = self.running_per_job.get_mut(name) {
            *count = count.saturating_sub(1);
        }
        if let (Some(key), Some(coordinator)) = (&job.concurrency, &self.coordinator) {
            coordinator.release_job(key, &job.signal).await;
        }
        if let Some(scope) = self.graph.spec(idx).environment.clone() {
            self.revoke_if_idle(&scope).await;
        }
    }

    /// Revoke a scope once no instance needs it and no worker can still be
    /// resolving it
    async fn revoke_if_idle(&mut self, scope: &str) {
        if self.scope_users.get(scope).copied().unwrap_or(0) > 0 {
            return;
        }
        let busy = self
            .running
            .keys()
            .any(|&i| self.graph.spec(i).environment.as_deref() == Some(scope));
        if !busy {
            self.provisioner.revoke(scope).await;
        }
    }

    /// Cancel every non-terminal instance, then give running jobs the grace
    /// period to stop before aborting them
    async fn cancel_run(&mut self) {
        warn!("Run {} cancelled", self.context.run_id.short());

        for idx in self.graph.indices().collect::<Vec<_>>() {
            if !self.graph.instance(idx).state.is_terminal() {
                self.finish(idx, JobResult::Cancelled, "run cancelled".to_string())
                    .await;
            }
        }
        for job in self.running.values() {
            job.signal.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.config.cancel_grace;
        while !self.running.is_empty() {
            match tokio::time::timeout_at(deadline, self.workers.join_next_with_id()).await {
                Ok(Some(joined)) => {
                    if let Some(completion) = self.completion_of(joined) {
                        if let Some(job) = self.running.remove(&completion.idx) {
                            self.release_slot(completion.idx, &job).await;
                        }
                    }
                }
                _ => break,
            }
        }

        let leftovers: Vec<(NodeIndex, RunningJob)> = self.running.drain().collect();
        for (idx, job) in leftovers {
            warn!(
                "{} did not stop within {:?}; aborting",
                self.graph.instance(idx).id,
                self.config.cancel_grace
            );
            job.handle.abort();
            self.release_slot(idx, &job).await;
        }
    }

    /// Record a terminal state, notify handlers and revoke environments
    /// nobody needs any more
    async fn finish(&mut self, idx: NodeIndex, result: JobResult, reason: String) {
        let now = Utc::now();
        let instance = self.graph.instance_mut(idx);
        if instance.state.is_terminal() {
            return;
        }
        let started_at = instance.state.started_at();
        instance.state = match result {
            JobResult::Succeeded => JobState::Succeeded {
                started_at: started_at.unwrap_or(now),
                finished_at: now,
            },
            JobResult::Failed => JobState::Failed {
                error: reason.clone(),
                started_at,
                failed_at: now,
            },
            JobResult::Skipped => JobState::Skipped {
                reason: reason.clone(),
            },
            JobResult::Cancelled => JobState::Cancelled {
                reason: reason.clone(),
                cancelled_at: now,
            },
        };
        let id = instance.id.clone();

        match result {
            JobResult::Succeeded => info!("{} succeeded", id),
            JobResult::Failed => warn!("{} failed: {}", id, reason),
            JobResult::Skipped => info!("{} skipped: {}", id, reason),
            JobResult::Cancelled => info!("{} cancelled: {}", id, reason),
        }

        self.emit(ExecutionEvent::JobFinished {
            run_id: self.context.run_id,
            instance: id,
            result,
            reason: (!reason.is_empty()).then_some(reason),
        });

        if let Some(scope) = self.graph.spec(idx).environment.clone() {
            if let Some(users) = self.scope_users.get_mut(&scope) {
                *users = users.saturating_sub(1);
            }
            self.revoke_if_idle(&scope).await;
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        for handler in &self.handlers {
            handler(event.clone());
        }
    }
}

fn panic_message(error: JoinError) -> String {
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
