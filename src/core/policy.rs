//! Tunable scheduling conventions
//!
//! Best-effort dependencies and path filters follow common CI conventions
//! by default, but both are plain data so a pipeline can opt into stricter
//! or looser behaviour.

use crate::core::state::JobResult;
use serde::{Deserialize, Serialize};

/// How `paths.*` atoms behave when the trigger carried no changed paths
/// (manual dispatch, releases, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathFilterPolicy {
    /// Treat the run as if everything changed: `paths.any` is true, `paths.only` is false
    #[default]
    AssumeAllChanged,
    /// Treat the run as if nothing changed: `paths.any` is false, `paths.only` is true
    AssumeNoneChanged,
}

/// Which terminal results of a best-effort dependency still let dependents run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestEffortPolicy {
    #[serde(default = "default_tolerates")]
    pub tolerates: Vec<JobResult>,
}

fn default_tolerates() -> Vec<JobResult> {
    vec![JobResult::Failed]
}

impl Default for BestEffortPolicy {
    fn default() -> Self {
        Self {
            tolerates: default_tolerates(),
        }
    }
}

impl BestEffortPolicy {
    pub fn tolerates(&self, result: JobResult) -> bool {
        result == JobResult::Succeeded || self.tolerates.contains(&result)
    }
}

/// Engine-wide policy knobs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnginePolicy {
    #[serde(default)]
    pub best_effort: BestEffortPolicy,
    #[serde(default)]
    pub empty_paths: PathFilterPolicy,
}
