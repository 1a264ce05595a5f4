//! Execution state models

use crate::core::context::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Run has not started
    Pending,
    /// Run is currently executing
    Running,
    /// Every required job succeeded (skips do not count against it)
    Succeeded,
    /// A required job failed or was cancelled
    Failed,
    /// The run was superseded by a newer run in its concurrency group
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Terminal outcome of a job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobResult::Succeeded => "succeeded",
            JobResult::Failed => "failed",
            JobResult::Skipped => "skipped",
            JobResult::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// State of a single job instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobState {
    /// Not yet looked at by the scheduler
    Pending,
    /// Waiting for dependencies to reach a terminal state
    Blocked,
    /// Dependencies satisfied, waiting for a worker slot
    Ready,
    /// Dispatched to the executor
    Running {
        started_at: DateTime<Utc>,
    },
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        started_at: Option<DateTime<Utc>>,
        failed_at: DateTime<Utc>,
    },
    /// Condition false, or a required dependency did not succeed
    Skipped {
        reason: String,
    },
    Cancelled {
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobState {
    /// Check if the instance has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.result().is_some()
    }

    pub fn result(&self) -> Option<JobResult> {
        match self {
            JobState::Succeeded { .. } => Some(JobResult::Succeeded),
            JobState::Failed { .. } => Some(JobResult::Failed),
            JobState::Skipped { .. } => Some(JobResult::Skipped),
            JobState::Cancelled { .. } => Some(JobResult::Cancelled),
            JobState::Pending | JobState::Blocked | JobState::Ready | JobState::Running { .. } => None,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Running { started_at } | JobState::Succeeded { started_at, .. } => {
                Some(*started_at)
            }
            JobState::Failed { started_at, .. } => *started_at,
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Blocked => "blocked",
            JobState::Ready => "ready",
            JobState::Running { .. } => "running",
            JobState::Succeeded { .. } => "succeeded",
            JobState::Failed { .. } => "failed",
            JobState::Skipped { .. } => "skipped",
            JobState::Cancelled { .. } => "cancelled",
        }
    }
}

/// Overall run state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_jobs: usize,
    pub succeeded_jobs: usize,
    pub failed_jobs: usize,
    pub skipped_jobs: usize,
    pub cancelled_jobs: usize,
}

impl RunState {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            total_jobs: 0,
            succeeded_jobs: 0,
            failed_jobs: 0,
            skipped_jobs: 0,
            cancelled_jobs: 0,
        }
    }

    pub fn start(&mut self, total_jobs: usize) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        self.total_jobs = total_jobs;
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Recount terminal results
    pub fn update_counts(&mut self, results: impl Iterator<Item = Option<JobResult>>) {
        self.succeeded_jobs = 0;
        self.failed_jobs = 0;
        self.skipped_jobs = 0;
        self.cancelled_jobs = 0;
        for result in results.flatten() {
            match result {
                JobResult::Succeeded => self.succeeded_jobs += 1,
                JobResult::Failed => self.failed_jobs += 1,
                JobResult::Skipped => self.skipped_jobs += 1,
                JobResult::Cancelled => self.cancelled_jobs += 1,
            }
        }
    }

    /// Fraction of instances in a terminal state (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.0;
        }
        let done = self.succeeded_jobs + self.failed_jobs + self.skipped_jobs + self.cancelled_jobs;
        done as f64 / self.total_jobs as f64
    }
}
