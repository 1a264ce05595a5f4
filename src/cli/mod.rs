//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, PlanCommand, SimulateCommand, ValidateCommand};
use std::ffi::OsString;

/// CI pipeline orchestration engine
#[derive(Debug, Parser, Clone)]
#[command(name = "conductor")]
#[command(version)]
#[command(about = "Validate, plan and simulate CI pipeline runs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Validate a pipeline definition
    Validate(ValidateCommand),

    /// Show which jobs a trigger would run
    Plan(PlanCommand),

    /// Run a pipeline with simulated jobs
    Simulate(SimulateCommand),

    /// Show run history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
