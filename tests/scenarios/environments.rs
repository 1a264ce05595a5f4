//! Test: environment scopes, admission and lazy provisioning

use crate::helpers::*;
use conductor::core::{
    EnvironmentScope, JobResult, JobSpec, MatrixAxis, PipelineDefinition, Predicate,
    StaticBindings,
};
use conductor::RunStatus;
use std::sync::Arc;

fn release_pipeline() -> PipelineDefinition {
    PipelineDefinition::new("release")
        .with_environment(
            EnvironmentScope::new("staging").with_source(StaticBindings::new([
                ("URL", "https://staging.example.com"),
                ("STAGING_TOKEN", "s-123"),
            ])),
        )
        .with_environment(
            EnvironmentScope::new("production")
                .with_source(StaticBindings::new([("PROD_TOKEN", "p-456")])),
        )
        .with_job(JobSpec::new("build"))
        .with_job(JobSpec::new("deploy-staging").needs(["build"]).in_environment("staging"))
        .with_job(JobSpec::new("deploy-prod").needs(["deploy-staging"]).in_environment("production"))
        .with_job(JobSpec::new("announce").needs(["deploy-prod"]))
}

#[tokio::test]
async fn test_production_rejected_outside_release() {
    let executor = Arc::new(MockExecutor::new());
    let report = run_with(&release_pipeline(), push_context(), executor.clone()).await;

    assert_result(&report, "deploy-staging", JobResult::Succeeded);
    assert_result(&report, "deploy-prod", JobResult::Failed);
    let reason = report.job("deploy-prod").unwrap().reason.clone().unwrap();
    assert!(reason.contains("unknown environment 'production'"), "{}", reason);
    assert_result(&report, "announce", JobResult::Skipped);
    assert!(!executor.was_started("deploy-prod"));
    assert_eq!(report.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_production_resolves_inside_release() {
    let executor = Arc::new(MockExecutor::new());
    let report = run_with(&release_pipeline(), release_context(), executor.clone()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    let prod = executor.bindings_of("deploy-prod").unwrap();
    assert_eq!(prod.get("PROD_TOKEN").map(String::as_str), Some("p-456"));
}

#[tokio::test]
async fn test_scopes_never_leak_into_each_other() {
    let executor = Arc::new(MockExecutor::new());
    run_with(&release_pipeline(), release_context(), executor.clone()).await;

    let staging = executor.bindings_of("deploy-staging").unwrap();
    let prod = executor.bindings_of("deploy-prod").unwrap();
    assert!(staging.contains_key("STAGING_TOKEN"));
    assert!(!staging.contains_key("PROD_TOKEN"));
    assert!(prod.contains_key("PROD_TOKEN"));
    assert!(!prod.contains_key("STAGING_TOKEN"));
    assert!(!prod.contains_key("URL"));
    assert_eq!(executor.bindings_of("build"), None);
    assert_eq!(executor.bindings_of("announce"), None);
}

#[tokio::test]
async fn test_undeclared_scope_fails_only_that_job() {
    let definition = PipelineDefinition::new("ci")
        .with_job(JobSpec::new("deploy").in_environment("qa"))
        .with_job(JobSpec::new("lint"));
    let report = run_with(&definition, push_context(), Arc::new(MockExecutor::new())).await;

    assert_result(&report, "deploy", JobResult::Failed);
    assert_result(&report, "lint", JobResult::Succeeded);
}

#[tokio::test]
async fn test_admission_predicate_restricts_scope() {
    let definition = PipelineDefinition::new("ci")
        .with_environment(
            EnvironmentScope::new("staging")
                .admit_when(Predicate::parse("ref == refs/heads/main").unwrap()),
        )
        .with_job(JobSpec::new("deploy").in_environment("staging"));

    let report = run_with(&definition, push_context(), Arc::new(MockExecutor::new())).await;
    assert_result(&report, "deploy", JobResult::Succeeded);

    let feature = conductor::RunContext::new(conductor::EventKind::Push, "refs/heads/feature");
    let report = run_with(&definition, feature, Arc::new(MockExecutor::new())).await;
    assert_result(&report, "deploy", JobResult::Failed);
}

#[tokio::test]
async fn test_bindings_loaded_lazily_and_once() {
    let source = CountingSource::new(&[("TOKEN", "t")]);
    let definition = PipelineDefinition::new("ci")
        .with_max_parallel(1)
        .with_environment(EnvironmentScope::new("staging").with_source(SharedSource(source.clone())))
        .with_job(JobSpec::new("build"))
        .with_job(
            JobSpec::new("deploy")
                .needs(["build"])
                .with_axis(MatrixAxis::new("region", ["eu", "us", "ap"]))
                .in_environment("staging"),
        );

    // The scoped job never runs: nothing is loaded
    let executor = Arc::new(MockExecutor::new().failing("build"));
    let report = run_with(&definition, push_context(), executor).await;
    assert_result(&report, "deploy (eu)", JobResult::Skipped);
    assert_eq!(source.loads(), 0);

    // Three instances share one resolution
    let executor = Arc::new(MockExecutor::new());
    let report = run_with(&definition, push_context(), executor.clone()).await;
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(source.loads(), 1);
    for region in ["eu", "us", "ap"] {
        let seen = executor.bindings_of(&format!("deploy ({})", region)).unwrap();
        assert_eq!(seen.get("TOKEN").map(String::as_str), Some("t"));
    }
}

#[tokio::test]
async fn test_environments_from_yaml() {
    std::env::set_var("CONDUCTOR_TEST_STAGING_TOKEN", "from-env");
    let yaml = r#"
name: envs
environments:
  staging:
    variables: { URL: "https://staging" }
    secrets_from_env: [CONDUCTOR_TEST_STAGING_TOKEN]
  production:
    when: "ref == 'refs/tags/v1.0.0'"
jobs:
  deploy: { environment: staging }
  release: { environment: production, needs: [deploy] }
"#;
    let definition = PipelineDefinition::from_yaml(yaml).unwrap();

    let executor = Arc::new(MockExecutor::new());
    let report = run_with(&definition, release_context(), executor.clone()).await;
    assert_eq!(report.status, RunStatus::Succeeded);
    let staging = executor.bindings_of("deploy").unwrap();
    assert_eq!(staging.get("URL").map(String::as_str), Some("https://staging"));
    assert_eq!(
        staging.get("CONDUCTOR_TEST_STAGING_TOKEN").map(String::as_str),
        Some("from-env")
    );

    // A push to main is neither a release nor the tagged ref
    let report = run_with(&definition, push_context(), Arc::new(MockExecutor::new())).await;
    assert_result(&report, "release", JobResult::Failed);
}

#[tokio::test]
async fn test_missing_secret_fails_job_at_resolution() {
    let yaml = r#"
name: envs
environments:
  staging:
    secrets_from_env: [CONDUCTOR_TEST_SURELY_UNSET_VARIABLE]
jobs:
  deploy: { environment: staging }
"#;
    let definition = PipelineDefinition::from_yaml(yaml).unwrap();
    let executor = Arc::new(MockExecutor::new());
    let report = run_with(&definition, push_context(), executor.clone()).await;

    assert_result(&report, "deploy", JobResult::Failed);
    let reason = report.job("deploy").unwrap().reason.clone().unwrap();
    assert!(reason.contains("CONDUCTOR_TEST_SURELY_UNSET_VARIABLE"), "{}", reason);
    assert!(!executor.was_started("deploy"));
}
