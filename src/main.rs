use anyhow::{Context, Result};
use conductor::cli::commands::{HistoryCommand, PlanCommand, SimulateCommand, ValidateCommand};
use conductor::cli::output::*;
use conductor::cli::{Cli, Command};
use conductor::core::{LoadError, PipelineDefinition};
use conductor::execution::{
    plan, ExecutionEngine, ExecutionEvent, SimulatedExecutor, EXIT_LOAD_ERROR, EXIT_SUCCESS,
};
use conductor::persistence::{InMemoryPersistence, PersistenceBackend, RunSummary};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("CONDUCTOR_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    let code = match &cli.command {
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Plan(cmd) => plan_pipeline(cmd)?,
        Command::Simulate(cmd) => simulate_pipeline(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    };

    std::process::exit(code);
}

/// Loading validates the graph too (cycles, dependencies, matrices)
fn load_definition(file: &str) -> Result<PipelineDefinition, LoadError> {
    PipelineDefinition::from_file(file)
}

fn report_load_error(error: &LoadError) -> i32 {
    println!("{} Failed to load pipeline:", CROSS);
    println!("  {}", style(error).red());
    error!("{}", error);
    EXIT_LOAD_ERROR
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<i32> {
    println!("{} Validating pipeline...", INFO);

    let definition = match load_definition(&cmd.file) {
        Ok(definition) => definition,
        Err(e) => return Ok(report_load_error(&e)),
    };

    let graph = definition.build_graph()?;
    println!("{} Pipeline definition is valid!", CHECK);
    println!("  Name: {}", style(&definition.name).bold());
    println!("  Jobs: {}", style(definition.jobs.len()).cyan());
    println!("  Instances: {}", style(graph.len()).cyan());
    println!("  Environments: {}", style(definition.environments.len()).cyan());

    if cmd.json {
        let order: Vec<&str> = graph
            .topological_order()
            .into_iter()
            .map(|idx| graph.instance(idx).id.as_str())
            .collect();
        let data = serde_json::json!({
            "name": definition.name,
            "jobs": definition.jobs.len(),
            "instances": order,
        });
        println!("\n{}", serde_json::to_string_pretty(&data)?);
    }

    Ok(EXIT_SUCCESS)
}

fn plan_pipeline(cmd: &PlanCommand) -> Result<i32> {
    let definition = match load_definition(&cmd.file) {
        Ok(definition) => definition,
        Err(e) => return Ok(report_load_error(&e)),
    };

    let plan = match plan(&definition, cmd.trigger.to_context()) {
        Ok(plan) => plan,
        Err(e) => return Ok(report_load_error(&e)),
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(EXIT_SUCCESS);
    }

    println!(
        "{} Plan for {} in group {}",
        INFO,
        style(&plan.pipeline_name).bold(),
        style(&plan.group).cyan()
    );
    for entry in &plan.entries {
        println!("  {}", format_plan_entry(entry));
    }

    Ok(EXIT_SUCCESS)
}

async fn simulate_pipeline(cmd: &SimulateCommand) -> Result<i32> {
    let definition = match load_definition(&cmd.file) {
        Ok(definition) => definition,
        Err(e) => return Ok(report_load_error(&e)),
    };

    println!("{} Loaded pipeline: {}", INFO, style(&definition.name).bold());

    // Set up persistence
    let store: Arc<dyn PersistenceBackend> = if cmd.no_history {
        Arc::new(InMemoryPersistence::new())
    } else {
        open_store().await?
    };

    let mut executor = SimulatedExecutor::new().failing(cmd.fail.iter().cloned());
    if cmd.delay_ms > 0 {
        executor = executor.with_delay(Duration::from_millis(cmd.delay_ms));
    }

    let mut engine = ExecutionEngine::new(executor);
    if let Some(parallel) = cmd.parallel {
        engine = engine.with_max_parallel(parallel);
    }

    // Progress bar plus one line per event
    let progress = create_progress_bar(0);
    {
        let progress = progress.clone();
        engine
            .add_event_handler(move |event| {
                match &event {
                    ExecutionEvent::RunStarted { instances, .. } => {
                        progress.set_length(*instances as u64)
                    }
                    ExecutionEvent::JobStarted { instance, .. } => {
                        progress.set_message(instance.to_string())
                    }
                    ExecutionEvent::JobFinished { .. } => progress.inc(1),
                    _ => {}
                }
                progress.suspend(|| println!("{}", format_execution_event(&event)));
            })
            .await;
    }

    let report = match engine.run(&definition, cmd.trigger.to_context()).await {
        Ok(report) => report,
        Err(e) => {
            progress.finish_and_clear();
            return Ok(report_load_error(&e));
        }
    };
    progress.finish_and_clear();

    // Save to history
    if !cmd.no_history {
        let summary = RunSummary::from_report(&report);
        store.save_run(&summary).await?;
        println!(
            "\n{} Run saved to history (ID: {})",
            INFO,
            style(summary.run_id.short()).dim()
        );
    }

    println!();
    for job in &report.jobs {
        let mut line = format!("  {} {}", style(job.id.as_str()).bold(), format_result(job.result));
        if let Some(reason) = &job.reason {
            line.push_str(&format!(" {}", style(reason).dim()));
        }
        if job.best_effort {
            line.push_str(&format!(" {}", style("(best-effort)").dim()));
        }
        println!("{}", line);
    }

    let code = report.exit_code();
    if code == EXIT_SUCCESS {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&report.pipeline_name).bold(),
            style("successfully").green()
        );
    } else {
        println!(
            "\n{} {} {}",
            CROSS,
            style(&report.pipeline_name).bold(),
            format_status(report.status)
        );
    }

    Ok(code)
}

async fn show_history(cmd: &HistoryCommand) -> Result<i32> {
    let store = open_store().await?;

    let runs = if let Some(pipeline_name) = &cmd.pipeline {
        store.list_runs(pipeline_name, cmd.limit).await?
    } else {
        let pipelines = store.list_pipelines().await?;
        let mut all_runs = Vec::new();
        for pipeline in &pipelines {
            all_runs.extend(store.list_runs(pipeline, cmd.limit).await?);
        }
        all_runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all_runs.truncate(cmd.limit);
        all_runs
    };

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(EXIT_SUCCESS);
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(EXIT_SUCCESS);
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for summary in &runs {
        println!("  {}", format_run_summary(summary));
    }

    Ok(EXIT_SUCCESS)
}

#[cfg(feature = "sqlite")]
async fn open_store() -> Result<Arc<dyn PersistenceBackend>> {
    let store = conductor::persistence::SqliteRunStore::with_default_path()
        .await
        .context("Failed to open run history")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store() -> Result<Arc<dyn PersistenceBackend>> {
    tracing::warn!("Built without the sqlite feature; history is not kept between runs");
    Ok(Arc::new(InMemoryPersistence::new()))
}
