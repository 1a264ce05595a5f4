//! CLI output formatting

use crate::core::{JobResult, RunStatus};
use crate::execution::{ExecutionEvent, PlanEntry};
use crate::persistence::RunSummary;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a progress bar over job instances
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

pub fn format_result(result: JobResult) -> String {
    match result {
        JobResult::Succeeded => style("SUCCEEDED").green().to_string(),
        JobResult::Failed => style("FAILED").red().to_string(),
        JobResult::Skipped => style("SKIPPED").dim().to_string(),
        JobResult::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Pending => style("PENDING").dim().to_string(),
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        RunStatus::Failed => style("FAILED").red().to_string(),
        RunStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

fn result_icon(result: JobResult) -> &'static Emoji<'static, 'static> {
    match result {
        JobResult::Succeeded => &CHECK,
        JobResult::Failed => &CROSS,
        JobResult::Skipped => &SKIP,
        JobResult::Cancelled => &WARN,
    }
}

/// Format run summary for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        RunStatus::Succeeded => CHECK,
        RunStatus::Failed => CROSS,
        RunStatus::Cancelled => WARN,
        RunStatus::Running => SPINNER,
        RunStatus::Pending => INFO,
    };

    let duration = summary
        .completed_at
        .and_then(|done| done.signed_duration_since(summary.started_at).to_std().ok())
        .map(format_duration)
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{} {} - {} - {} ({} {}) - {} ok, {} failed, {} skipped, {} cancelled - {}",
        status_icon,
        style(summary.run_id.short()).dim(),
        style(&summary.pipeline_name).bold(),
        format_status(summary.status),
        summary.event,
        style(&summary.git_ref).cyan(),
        summary.succeeded_jobs,
        summary.failed_jobs,
        summary.skipped_jobs,
        summary.cancelled_jobs,
        style(duration).dim()
    )
}

/// Format one line of a run plan
pub fn format_plan_entry(entry: &PlanEntry) -> String {
    let verdict = match (entry.condition, &entry.environment_error) {
        (_, Some(error)) => style(format!("would fail: {}", error)).red().to_string(),
        (Some(false), None) => style("skip").dim().to_string(),
        (None, None) => style("decided after dependencies").yellow().to_string(),
        (Some(true), None) => style("run").green().to_string(),
    };

    let mut line = format!("{} {}", style(entry.id.as_str()).bold(), verdict);
    if !entry.needs.is_empty() {
        let needs: Vec<&str> = entry.needs.iter().map(|n| n.as_str()).collect();
        line.push_str(&format!(" {}", style(format!("needs [{}]", needs.join(", "))).dim()));
    }
    if let Some(scope) = &entry.environment {
        line.push_str(&format!(" {}", style(format!("env {}", scope)).cyan()));
    }
    if entry.best_effort {
        line.push_str(&format!(" {}", style("best-effort").dim()));
    }
    line
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::RunStarted {
            run_id,
            pipeline_name,
            group,
            instances,
        } => format!(
            "{} Starting pipeline {} ({}) with {} jobs in group {}",
            ROCKET,
            style(pipeline_name).bold(),
            style(run_id.short()).dim(),
            instances,
            style(group).cyan()
        ),
        ExecutionEvent::RunSuperseded { superseded, group, .. } => format!(
            "{} Superseded run {} in group {}",
            WARN,
            style(superseded.short()).dim(),
            style(group).cyan()
        ),
        ExecutionEvent::JobStarted { instance, .. } => {
            format!("{} {}", SPINNER, style(instance.as_str()).cyan())
        }
        ExecutionEvent::JobFinished {
            instance,
            result,
            reason,
            ..
        } => {
            let mut line = format!(
                "{} {} {}",
                result_icon(*result),
                style(instance.as_str()).bold(),
                format_result(*result)
            );
            if let Some(reason) = reason {
                line.push_str(&format!(": {}", style(reason).dim()));
            }
            line
        }
        ExecutionEvent::RunCompleted { run_id, status } => format!(
            "{} Pipeline ({}) {}",
            INFO,
            style(run_id.short()).dim(),
            format_status(*status)
        ),
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
