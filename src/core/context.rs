//! Run context - the immutable description of the event that triggered a run

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex characters, for display
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of trigger event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Push,
    PullRequest,
    MergeQueue,
    ReleasePublished,
    ManualDispatch,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull-request",
            EventKind::MergeQueue => "merge-queue",
            EventKind::ReleasePublished => "release-published",
            EventKind::ManualDispatch => "manual-dispatch",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "push" => Ok(EventKind::Push),
            "pull-request" => Ok(EventKind::PullRequest),
            "merge-queue" | "merge-group" => Ok(EventKind::MergeQueue),
            "release-published" | "release" => Ok(EventKind::ReleasePublished),
            "manual-dispatch" | "workflow-dispatch" | "manual" => Ok(EventKind::ManualDispatch),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

/// Everything a run knows about its trigger.
///
/// Built once at trigger time and shared read-only (behind an `Arc`) for
/// the lifetime of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: RunId,
    pub event: EventKind,
    pub repository: String,
    pub workflow: String,
    pub git_ref: String,
    pub changed_paths: BTreeSet<String>,
    pub release_tag: Option<String>,
}

impl RunContext {
    pub fn new(event: EventKind, git_ref: impl Into<String>) -> Self {
        Self {
            run_id: RunId::new(),
            event,
            repository: String::new(),
            workflow: String::new(),
            git_ref: git_ref.into(),
            changed_paths: BTreeSet::new(),
            release_tag: None,
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = workflow.into();
        self
    }

    pub fn with_changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_release_tag(mut self, tag: impl Into<String>) -> Self {
        self.release_tag = Some(tag.into());
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    /// Default concurrency group: one active run per repository, workflow and ref
    pub fn concurrency_key(&self) -> String {
        format!("{}/{}/{}", self.repository, self.workflow, self.git_ref)
    }

    pub fn is_release(&self) -> bool {
        self.event == EventKind::ReleasePublished
    }
}
