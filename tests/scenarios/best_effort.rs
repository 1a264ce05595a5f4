//! Test: best-effort dependencies and skip propagation

use crate::helpers::*;
use conductor::core::{BestEffortPolicy, EnginePolicy, JobResult, JobSpec, PipelineDefinition};
use conductor::RunStatus;
use std::sync::Arc;

/// A (no deps), B (needs A, best-effort), C (needs A), D (needs B and C)
fn diamond() -> PipelineDefinition {
    PipelineDefinition::new("diamond")
        .with_job(JobSpec::new("a"))
        .with_job(JobSpec::new("b").needs(["a"]).best_effort())
        .with_job(JobSpec::new("c").needs(["a"]))
        .with_job(JobSpec::new("d").needs(["b", "c"]))
}

#[tokio::test]
async fn test_root_failure_skips_everything_downstream() {
    let executor = Arc::new(MockExecutor::new().failing("a"));
    let report = run_with(&diamond(), push_context(), executor.clone()).await;

    assert_result(&report, "a", JobResult::Failed);
    assert_result(&report, "b", JobResult::Skipped);
    assert_result(&report, "c", JobResult::Skipped);
    assert_result(&report, "d", JobResult::Skipped);
    assert_reason(&report, "b", "dependency 'a' failed");
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(executor.started(), vec!["a"]);
}

#[tokio::test]
async fn test_required_failure_skips_join_even_if_best_effort_succeeds() {
    let executor = Arc::new(MockExecutor::new().failing("c"));
    let report = run_with(&diamond(), push_context(), executor.clone()).await;

    assert_result(&report, "b", JobResult::Succeeded);
    assert_result(&report, "c", JobResult::Failed);
    assert_result(&report, "d", JobResult::Skipped);
    assert_reason(&report, "d", "dependency 'c' failed");
    assert!(!executor.was_started("d"));
}

#[tokio::test]
async fn test_required_failure_skips_join_when_best_effort_also_fails() {
    let executor = Arc::new(MockExecutor::new().failing("b").failing("c"));
    let report = run_with(&diamond(), push_context(), executor).await;

    assert_result(&report, "d", JobResult::Skipped);
    assert_eq!(report.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_best_effort_failure_does_not_block_or_fail_run() {
    let executor = Arc::new(MockExecutor::new().failing("b"));
    let report = run_with(&diamond(), push_context(), executor).await;

    assert_result(&report, "b", JobResult::Failed);
    assert_result(&report, "d", JobResult::Succeeded);
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn test_stricter_policy_blocks_on_best_effort_failure() {
    let definition = diamond().with_policy(EnginePolicy {
        best_effort: BestEffortPolicy { tolerates: vec![] },
        ..EnginePolicy::default()
    });
    let executor = Arc::new(MockExecutor::new().failing("b"));
    let report = run_with(&definition, push_context(), executor).await;

    assert_result(&report, "d", JobResult::Skipped);
    assert_reason(&report, "d", "dependency 'b' failed");
    // The failure itself is still only best-effort
    assert_eq!(report.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_skipped_job_does_not_fail_run() {
    let definition = PipelineDefinition::new("ci")
        .with_job(JobSpec::new("build"))
        .with_job(
            JobSpec::new("publish")
                .needs(["build"])
                .with_condition("event == release-published")
                .unwrap(),
        )
        .with_job(JobSpec::new("announce").needs(["publish"]));

    let report = run_with(&definition, push_context(), Arc::new(MockExecutor::new())).await;

    assert_result(&report, "publish", JobResult::Skipped);
    assert_result(&report, "announce", JobResult::Skipped);
    assert_reason(&report, "publish", "condition evaluated to false");
    assert_eq!(report.status, RunStatus::Succeeded);
}
