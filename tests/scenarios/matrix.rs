//! Test: build matrices end to end

use crate::helpers::*;
use conductor::core::{JobResult, JobSpec, MatrixAxis, PipelineDefinition};
use conductor::execution::plan;
use conductor::RunStatus;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn matrix_pipeline() -> PipelineDefinition {
    PipelineDefinition::new("matrix")
        .with_job(
            JobSpec::new("test")
                .with_axis(MatrixAxis::new("os", ["a", "b"]))
                .with_axis(MatrixAxis::new("version", ["1", "2"])),
        )
        .with_job(JobSpec::new("report").needs(["test"]))
}

#[tokio::test]
async fn test_two_by_two_matrix_runs_four_instances() {
    let executor = Arc::new(MockExecutor::new().with_default_delay(Duration::from_millis(5)));
    let report = run_with(&matrix_pipeline(), push_context(), executor.clone()).await;

    let ids: Vec<&str> = report
        .jobs
        .iter()
        .filter(|j| j.job == "test")
        .map(|j| j.id.as_str())
        .collect();
    assert_eq!(ids, vec!["test (a, 1)", "test (a, 2)", "test (b, 1)", "test (b, 2)"]);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 4);

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.state.total_jobs, 5);
    assert_dependencies_respected(&matrix_pipeline(), &executor);
    assert_eq!(executor.started().last().map(String::as_str), Some("report"));
}

#[tokio::test]
async fn test_executor_sees_matrix_values() {
    let executor = Arc::new(MockExecutor::new());
    run_with(&matrix_pipeline(), push_context(), executor.clone()).await;

    let spans = executor.spans();
    let span = spans.iter().find(|s| s.instance == "test (b, 2)").unwrap();
    assert_eq!(span.job, "test");
}

#[tokio::test]
async fn test_one_failing_instance_skips_dependent() {
    let executor = Arc::new(MockExecutor::new().failing("test (b, 2)"));
    let report = run_with(&matrix_pipeline(), push_context(), executor).await;

    assert_result(&report, "test (a, 1)", JobResult::Succeeded);
    assert_result(&report, "test (b, 2)", JobResult::Failed);
    assert_result(&report, "report", JobResult::Skipped);
    assert_reason(&report, "report", "dependency 'test (b, 2)' failed");
    assert_eq!(report.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_matrix_from_yaml_respects_max_parallel() {
    let yaml = r#"
name: matrix
max_parallel: 8
jobs:
  build:
    strategy:
      matrix: { os: [linux, mac, windows], toolchain: [stable, nightly] }
      max_parallel: 2
  publish:
    needs: [build]
    if: "event == push"
"#;
    let definition = PipelineDefinition::from_yaml(yaml).unwrap();
    let executor = Arc::new(MockExecutor::new().with_default_delay(Duration::from_millis(10)));
    let report = run_with(&definition, push_context(), executor.clone()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.state.succeeded_jobs, 7);
    assert!(executor.peak_concurrency() <= 2);
    assert!(report.job("build (windows, nightly)").is_some());
}

#[test]
fn test_plan_lists_every_instance() {
    let plan = plan(&matrix_pipeline(), push_context()).unwrap();
    assert_eq!(plan.entries.len(), 5);
    let report = plan.entries.last().unwrap();
    assert_eq!(report.id.as_str(), "report");
    assert_eq!(report.needs.len(), 4);
    assert!(plan.entries.iter().all(|e| e.condition == Some(true)));
}
