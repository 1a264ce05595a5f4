//! Persistence layer for run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{EventKind, RunId, RunStatus};
use crate::execution::RunReport;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,

    pub pipeline_name: String,

    pub status: RunStatus,

    /// Trigger event and ref
    pub event: EventKind,
    pub git_ref: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    pub total_jobs: usize,
    pub succeeded_jobs: usize,
    pub failed_jobs: usize,
    pub skipped_jobs: usize,
    pub cancelled_jobs: usize,
}

impl RunSummary {
    pub fn from_report(report: &RunReport) -> Self {
        let state = &report.state;
        Self {
            run_id: report.run_id,
            pipeline_name: report.pipeline_name.clone(),
            status: report.status,
            event: report.context.event,
            git_ref: report.context.git_ref.clone(),
            started_at: state.started_at.unwrap_or_else(Utc::now),
            completed_at: state.completed_at,
            total_jobs: state.total_jobs,
            succeeded_jobs: state.succeeded_jobs,
            failed_jobs: state.failed_jobs,
            skipped_jobs: state.skipped_jobs,
            cancelled_jobs: state.cancelled_jobs,
        }
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a run summary, replacing any earlier one for the same run
    async fn save_run(&self, run: &RunSummary) -> Result<()>;

    async fn load_run(&self, run_id: RunId) -> Result<Option<RunSummary>>;

    /// Runs of a pipeline, newest first
    async fn list_runs(&self, pipeline_name: &str, limit: usize) -> Result<Vec<RunSummary>>;

    /// List all pipeline names
    async fn list_pipelines(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryPersistence {
    runs: RwLock<HashMap<RunId, RunSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> Result<Option<RunSummary>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, pipeline_name: &str, limit: usize) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let mut result: Vec<RunSummary> = runs
            .values()
            .filter(|r| r.pipeline_name == pipeline_name)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.values().map(|r| r.pipeline_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
pub(crate) fn sample_summary(pipeline: &str, status: RunStatus) -> RunSummary {
    RunSummary {
        run_id: RunId::new(),
        pipeline_name: pipeline.to_string(),
        status,
        event: EventKind::Push,
        git_ref: "refs/heads/main".to_string(),
        started_at: Utc::now(),
        completed_at: Some(Utc::now()),
        total_jobs: 3,
        succeeded_jobs: 2,
        failed_jobs: 1,
        skipped_jobs: 0,
        cancelled_jobs: 0,
    }
}
