//! Test: dependency ordering, termination, load-time validation and conditions

use crate::helpers::*;
use conductor::core::{
    EvalScope, JobResult, JobSpec, LoadError, PathFilterPolicy, PipelineDefinition, PipelineGraph,
    Predicate,
};
use conductor::{EventKind, RunContext, RunStatus};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_dependencies_finish_before_dependents_start() {
    let definition = PipelineDefinition::new("ci")
        .with_job(JobSpec::new("checkout"))
        .with_job(JobSpec::new("build").needs(["checkout"]))
        .with_job(JobSpec::new("lint").needs(["checkout"]))
        .with_job(JobSpec::new("test").needs(["build"]))
        .with_job(JobSpec::new("package").needs(["build", "lint", "test"]));
    let executor = Arc::new(
        MockExecutor::new()
            .with_default_delay(Duration::from_millis(5))
            .with_delay("lint", Duration::from_millis(40)),
    );

    let report = run_with(&definition, push_context(), executor.clone()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_all_terminal(&report);
    assert_dependencies_respected(&definition, &executor);
    assert_eq!(executor.started().first().map(String::as_str), Some("checkout"));
    assert_eq!(executor.started().last().map(String::as_str), Some("package"));
}

#[tokio::test]
async fn test_wide_random_dags_always_terminate() {
    // A handful of deterministic pseudo-random DAGs: edges only point backwards
    for seed in 1u64..=6 {
        let mut state = seed;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as usize
        };

        let mut definition = PipelineDefinition::new(format!("dag-{}", seed));
        for i in 0..12 {
            let needs: Vec<String> = (0..i)
                .filter(|_| next() % 4 == 0)
                .map(|j| format!("j{}", j))
                .collect();
            let mut job = JobSpec::new(format!("j{}", i)).needs(needs);
            if next() % 5 == 0 {
                job = job.best_effort();
            }
            definition = definition.with_job(job);
        }
        let failing = format!("j{}", next() % 12);
        let executor = Arc::new(MockExecutor::new().failing(&failing));

        let report = run_with(&definition, push_context(), executor.clone()).await;

        assert_all_terminal(&report);
        assert_dependencies_respected(&definition, &executor);
    }
}

#[tokio::test]
async fn test_worker_limit_never_exceeded() {
    let mut definition = PipelineDefinition::new("fanout").with_max_parallel(2);
    definition = definition.with_job(JobSpec::new("setup"));
    for i in 0..10 {
        definition = definition.with_job(JobSpec::new(format!("shard{}", i)).needs(["setup"]));
    }
    let executor = Arc::new(MockExecutor::new().with_default_delay(Duration::from_millis(15)));

    let report = run_with(&definition, push_context(), executor.clone()).await;

    assert_eq!(report.state.succeeded_jobs, 11);
    assert!(executor.peak_concurrency() <= 2);
    assert!(executor.peak_concurrency() >= 1);
}

#[test]
fn test_cycles_rejected_for_every_length() {
    for len in 2..=6 {
        let specs: Vec<JobSpec> = (0..len)
            .map(|i| JobSpec::new(format!("j{}", i)).needs([format!("j{}", (i + 1) % len)]))
            .collect();
        match PipelineGraph::build(specs) {
            Err(LoadError::CyclicDependency { cycle }) => {
                assert_eq!(cycle.len(), len + 1, "cycle of length {}", len);
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected a cycle error for length {}, got {:?}", len, other.map(|g| g.len())),
        }
    }
}

#[tokio::test]
async fn test_cyclic_definition_never_starts() {
    let definition = PipelineDefinition::new("broken")
        .with_job(JobSpec::new("ok"))
        .with_job(JobSpec::new("a").needs(["b"]))
        .with_job(JobSpec::new("b").needs(["a"]));
    let executor = Arc::new(MockExecutor::new());

    let result = conductor::ExecutionEngine::new(executor.clone())
        .run(&definition, push_context())
        .await;

    assert!(matches!(result, Err(LoadError::CyclicDependency { .. })));
    assert!(executor.started().is_empty());
}

#[tokio::test]
async fn test_deferred_condition_sees_dependency_outputs() {
    let definition = PipelineDefinition::new("release")
        .with_job(JobSpec::new("version"))
        .with_job(
            JobSpec::new("publish")
                .needs(["version"])
                .with_condition("outputs.version.changed == 'true' && event == push")
                .unwrap(),
        )
        .with_job(
            JobSpec::new("rollback")
                .needs(["version"])
                .with_condition("outputs.version.changed == 'false'")
                .unwrap(),
        );
    let executor = Arc::new(MockExecutor::new().with_output("version", "changed", "true"));

    let report = run_with(&definition, push_context(), executor.clone()).await;

    assert_result(&report, "publish", JobResult::Succeeded);
    assert_result(&report, "rollback", JobResult::Skipped);
    assert_eq!(
        report.job("version").unwrap().outputs.get("changed").map(String::as_str),
        Some("true")
    );
    assert!(!executor.was_started("rollback"));
}

#[tokio::test]
async fn test_path_filters_gate_jobs() {
    let definition = PipelineDefinition::new("ci")
        .with_job(
            JobSpec::new("build")
                .with_condition("!paths.only('docs/**', '*.md')")
                .unwrap(),
        )
        .with_job(
            JobSpec::new("docs")
                .with_condition("paths.any('docs/**')")
                .unwrap(),
        );

    let docs_only = push_context().with_changed_paths(["docs/guide.md", "README.md"]);
    let report = run_with(&definition, docs_only, Arc::new(MockExecutor::new())).await;
    assert_result(&report, "build", JobResult::Skipped);
    assert_result(&report, "docs", JobResult::Succeeded);

    let code_change = push_context().with_changed_paths(["src/main.rs"]);
    let report = run_with(&definition, code_change, Arc::new(MockExecutor::new())).await;
    assert_result(&report, "build", JobResult::Succeeded);
    assert_result(&report, "docs", JobResult::Skipped);
}

#[test]
fn test_condition_evaluation_is_idempotent() {
    let expressions = [
        "event == push && ref == refs/heads/main",
        "!paths.only('docs/**')",
        "(event == pull-request || event == merge-queue) && repository != acme/fork",
        "paths.any('src/**') || event == release-published",
    ];
    let contexts = [
        RunContext::new(EventKind::Push, "refs/heads/main").with_changed_paths(["src/a.rs"]),
        RunContext::new(EventKind::PullRequest, "refs/pull/7/merge").with_repository("acme/fork"),
        RunContext::new(EventKind::ManualDispatch, "refs/heads/dev"),
    ];

    for source in expressions {
        let predicate = Predicate::parse(source).unwrap();
        for context in &contexts {
            for policy in [PathFilterPolicy::AssumeAllChanged, PathFilterPolicy::AssumeNoneChanged] {
                let scope = EvalScope::new(context, policy);
                let first = predicate.evaluate(&scope);
                for _ in 0..5 {
                    assert_eq!(predicate.evaluate(&scope), first, "{}", source);
                }
            }
        }
    }
}
