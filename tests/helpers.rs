//! Test utilities for conductor scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use conductor::core::{
    BindingSource, EnvironmentError, EventKind, JobResult, JobState, PipelineDefinition,
    RunContext, Secret,
};
use conductor::execution::{
    ConcurrencyCoordinator, ExecutionDescriptor, ExecutionEngine, ExecutorError, JobExecutor,
    JobOutcome, RunReport,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// When an instance started and (if it returned) finished
#[derive(Debug, Clone)]
pub struct Span {
    pub instance: String,
    pub job: String,
    pub started: Instant,
    pub finished: Option<Instant>,
    pub cancelled: bool,
}

/// Mock executor that records every call.
///
/// Jobs sleep for their configured delay (cooperatively: a cancellation
/// signal ends the sleep), then succeed unless listed as failures.
#[derive(Default)]
pub struct MockExecutor {
    failures: HashSet<String>,
    delays: HashMap<String, Duration>,
    default_delay: Option<Duration>,
    outputs: HashMap<String, BTreeMap<String, String>>,

    spans: Mutex<Vec<Span>>,
    bindings: Mutex<HashMap<String, BTreeMap<String, String>>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every instance of a job, or one instance by id
    pub fn failing(mut self, job: &str) -> Self {
        self.failures.insert(job.to_string());
        self
    }

    pub fn with_delay(mut self, job: &str, delay: Duration) -> Self {
        self.delays.insert(job.to_string(), delay);
        self
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    pub fn with_output(mut self, job: &str, key: &str, value: &str) -> Self {
        self.outputs
            .entry(job.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap().clone()
    }

    pub fn span(&self, instance: &str) -> Option<Span> {
        self.spans().into_iter().find(|s| s.instance == instance)
    }

    /// Instances in the order they started
    pub fn started(&self) -> Vec<String> {
        self.spans().into_iter().map(|s| s.instance).collect()
    }

    pub fn was_started(&self, instance: &str) -> bool {
        self.span(instance).is_some()
    }

    /// Bindings an instance saw, exposed to plain strings
    pub fn bindings_of(&self, instance: &str) -> Option<BTreeMap<String, String>> {
        self.bindings.lock().unwrap().get(instance).cloned()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn finish(&self, instance: &str, cancelled: bool) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        let mut spans = self.spans.lock().unwrap();
        if let Some(span) = spans.iter_mut().find(|s| s.instance == instance) {
            span.finished = Some(Instant::now());
            span.cancelled = cancelled;
        }
    }
}

#[async_trait]
impl JobExecutor for MockExecutor {
    async fn execute(&self, d: ExecutionDescriptor) -> Result<JobOutcome, ExecutorError> {
        let instance = d.instance.to_string();
        self.spans.lock().unwrap().push(Span {
            instance: instance.clone(),
            job: d.job.clone(),
            started: Instant::now(),
            finished: None,
            cancelled: false,
        });
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(bindings) = &d.bindings {
            let exposed = bindings
                .keys()
                .filter_map(|k| bindings.get(k).map(|v| (k.to_string(), v.expose().to_string())))
                .collect();
            self.bindings.lock().unwrap().insert(instance.clone(), exposed);
        }

        let delay = self.delays.get(&d.job).copied().or(self.default_delay);
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = d.cancel.cancelled() => {
                    self.finish(&instance, true);
                    return Err(ExecutorError::Cancelled);
                }
            }
        }
        self.finish(&instance, false);

        if self.failures.contains(&d.job) || self.failures.contains(&instance) {
            return Ok(JobOutcome::failure());
        }
        let mut outcome = JobOutcome::success();
        if let Some(outputs) = self.outputs.get(&d.job) {
            outcome.outputs = outputs.clone();
        }
        Ok(outcome)
    }
}

/// Executor that ignores cancellation entirely
#[derive(Default)]
pub struct StubbornExecutor {
    pub duration: Duration,
    pub started: AtomicUsize,
    pub completed: AtomicBool,
}

impl StubbornExecutor {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::default()
        }
    }
}

#[async_trait]
impl JobExecutor for StubbornExecutor {
    async fn execute(&self, _d: ExecutionDescriptor) -> Result<JobOutcome, ExecutorError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        self.completed.store(true, Ordering::SeqCst);
        Ok(JobOutcome::success())
    }
}

/// Binding source that counts how often it was asked to load
#[derive(Debug, Default)]
pub struct CountingSource {
    pub values: BTreeMap<String, String>,
    pub loads: AtomicUsize,
}

impl CountingSource {
    pub fn new(pairs: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            loads: AtomicUsize::new(0),
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BindingSource for CountingSource {
    async fn load(&self, _scope: &str) -> Result<BTreeMap<String, Secret>, EnvironmentError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), Secret::new(v.clone())))
            .collect())
    }
}

/// Shares one counting source between a scope declaration and the test
#[derive(Debug, Clone)]
pub struct SharedSource(pub Arc<CountingSource>);

#[async_trait]
impl BindingSource for SharedSource {
    async fn load(&self, scope: &str) -> Result<BTreeMap<String, Secret>, EnvironmentError> {
        self.0.load(scope).await
    }
}

pub fn push_context() -> RunContext {
    RunContext::new(EventKind::Push, "refs/heads/main").with_repository("acme/app")
}

pub fn release_context() -> RunContext {
    RunContext::new(EventKind::ReleasePublished, "refs/tags/v1.0.0")
        .with_repository("acme/app")
        .with_release_tag("v1.0.0")
}

/// Run a definition once with a fresh engine
pub async fn run_with(
    definition: &PipelineDefinition,
    context: RunContext,
    executor: Arc<MockExecutor>,
) -> RunReport {
    ExecutionEngine::new(executor)
        .run(definition, context)
        .await
        .expect("definition should load")
}

/// Run with an engine sharing the given coordinator
pub async fn run_in_group(
    definition: &PipelineDefinition,
    context: RunContext,
    executor: Arc<MockExecutor>,
    coordinator: ConcurrencyCoordinator,
) -> RunReport {
    ExecutionEngine::new(executor)
        .with_coordinator(coordinator)
        .with_cancel_grace(Duration::from_millis(200))
        .run(definition, context)
        .await
        .expect("definition should load")
}

pub fn assert_result(report: &RunReport, id: &str, expected: JobResult) {
    let actual = report.result(id);
    assert_eq!(
        actual,
        Some(expected),
        "expected {} to be {:?}, got {:?} (reason: {:?})",
        id,
        expected,
        actual,
        report.job(id).and_then(|j| j.reason.clone())
    );
}

pub fn assert_reason(report: &RunReport, id: &str, expected: &str) {
    let reason = report.job(id).and_then(|j| j.reason.clone());
    assert_eq!(reason.as_deref(), Some(expected), "reason of {}", id);
}

/// Every instance reached a terminal state
pub fn assert_all_terminal(report: &RunReport) {
    for job in &report.jobs {
        assert!(
            !matches!(job.result, JobResult::Skipped)
                || job.reason.as_deref() != Some("never became runnable"),
            "{} never became runnable",
            job.id
        );
    }
    assert_eq!(report.jobs.len(), report.state.total_jobs);
}

/// No executed instance started before all of its executed dependencies finished
pub fn assert_dependencies_respected(
    definition: &PipelineDefinition,
    executor: &MockExecutor,
) {
    let spans = executor.spans();
    for span in &spans {
        let spec = definition
            .jobs
            .iter()
            .find(|j| j.name == span.job)
            .expect("span of a declared job");
        for dep in &spec.needs {
            for dep_span in spans.iter().filter(|s| &s.job == dep) {
                let finished = dep_span
                    .finished
                    .unwrap_or_else(|| panic!("{} started while {} never finished", span.instance, dep_span.instance));
                assert!(
                    finished <= span.started,
                    "{} started before {} finished",
                    span.instance,
                    dep_span.instance
                );
            }
        }
    }
}

pub fn is_cancelled(state: &JobState) -> bool {
    matches!(state, JobState::Cancelled { .. })
}

/// Poll until `check` holds, panicking after a few seconds
pub async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
