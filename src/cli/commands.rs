//! CLI command definitions

use crate::core::{EventKind, RunContext};
use clap::Args;

/// Trigger attributes shared by `plan` and `simulate`
#[derive(Debug, Args, Clone)]
pub struct TriggerArgs {
    /// Triggering event (push, pull-request, merge-queue, release, manual-dispatch)
    #[arg(long, default_value = "push", value_parser = parse_event)]
    pub event: EventKind,

    /// Git ref the run is for
    #[arg(long = "ref", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Repository identifier
    #[arg(long, default_value = "")]
    pub repository: String,

    /// Release tag, for release events
    #[arg(long)]
    pub tag: Option<String>,

    /// Changed path (repeatable)
    #[arg(long = "changed")]
    pub changed: Vec<String>,
}

impl TriggerArgs {
    pub fn to_context(&self) -> RunContext {
        let mut context = RunContext::new(self.event, self.git_ref.clone())
            .with_repository(self.repository.clone())
            .with_changed_paths(self.changed.iter().cloned());
        if let Some(tag) = &self.tag {
            context = context.with_release_tag(tag.clone());
        }
        context
    }
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show what a trigger would run
#[derive(Debug, Args, Clone)]
pub struct PlanCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    #[command(flatten)]
    pub trigger: TriggerArgs,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Run a pipeline against the simulated executor
#[derive(Debug, Args, Clone)]
pub struct SimulateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    #[command(flatten)]
    pub trigger: TriggerArgs,

    /// Job name or instance id that should fail (repeatable)
    #[arg(long = "fail")]
    pub fail: Vec<String>,

    /// Worker slots, overriding the pipeline's max_parallel
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Simulated duration of each job in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

fn parse_event(s: &str) -> Result<EventKind, String> {
    s.parse()
}
