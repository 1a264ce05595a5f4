//! Concurrency groups: at most one active run (or job) per group key
//!
//! The coordinator is shared by every run in the process. All mutation goes
//! through one async mutex, so two runs registering the same key at the same
//! moment are ordered and the later one always wins.

use crate::core::context::RunId;
use crate::execution::signal::CancellationSignal;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Identifier of a concurrency group. Run-level and job-level groups are
/// separate namespaces even when their keys render the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    Run(String),
    Job(String),
}

impl GroupKey {
    pub fn run(key: impl Into<String>) -> Self {
        GroupKey::Run(key.into())
    }

    pub fn job(key: impl Into<String>) -> Self {
        GroupKey::Job(key.into())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Run(key) => f.write_str(key),
            GroupKey::Job(key) => write!(f, "job:{}", key),
        }
    }
}

#[derive(Debug, Clone)]
struct Occupant {
    run_id: RunId,
    signal: CancellationSignal,
}

/// Result of registering a run with its group
#[derive(Debug, Clone)]
pub struct Registration {
    pub key: GroupKey,

    /// Fired if a newer run later supersedes this one
    pub signal: CancellationSignal,

    /// Runs this registration displaced; their signals have already fired
    pub superseded: Vec<RunId>,
}

/// Process-wide registry of active concurrency group occupants
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyCoordinator {
    groups: Arc<Mutex<HashMap<GroupKey, Occupant>>>,
}

impl ConcurrencyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `run_id` the active run of `key`, cancelling whoever held it
    pub async fn register(&self, key: impl Into<String>, run_id: RunId) -> Registration {
        let key = GroupKey::run(key);
        let signal = CancellationSignal::new();
        let superseded = self
            .install(key.clone(), Occupant {
                run_id,
                signal: signal.clone(),
            })
            .await;
        Registration {
            key,
            signal,
            superseded,
        }
    }

    /// Make a job instance the active holder of a job-level group.
    ///
    /// A holder from an older run is cancelled through its own signal, which
    /// leaves the rest of that run alone. Instances of the same run never
    /// cancel each other.
    pub async fn register_job(
        &self,
        key: &str,
        run_id: RunId,
        signal: CancellationSignal,
    ) -> Vec<RunId> {
        self.install(GroupKey::job(key), Occupant { run_id, signal }).await
    }

    async fn install(&self, key: GroupKey, occupant: Occupant) -> Vec<RunId> {
        let mut groups = self.groups.lock().await;
        let mut superseded = Vec::new();

        if let Some(previous) = groups.get(&key) {
            if previous.run_id != occupant.run_id {
                info!(
                    "Run {} supersedes run {} in concurrency group '{}'",
                    occupant.run_id.short(),
                    previous.run_id.short(),
                    key
                );
                previous.signal.cancel();
                superseded.push(previous.run_id);
            }
        }

        debug!("Run {} holds concurrency group '{}'", occupant.run_id.short(), key);
        groups.insert(key, occupant);
        superseded
    }

    /// Drop every group held by `run_id`. Groups already taken over by a
    /// newer run are left untouched.
    pub async fn release(&self, run_id: RunId) {
        let mut groups = self.groups.lock().await;
        groups.retain(|key, occupant| {
            let held = occupant.run_id == run_id;
            if held {
                debug!("Run {} released concurrency group '{}'", run_id.short(), key);
            }
            !held
        });
    }

    /// Drop a job-level group if this exact instance still holds it
    pub async fn release_job(&self, key: &str, signal: &CancellationSignal) {
        let key = GroupKey::job(key);
        let mut groups = self.groups.lock().await;
        if groups.get(&key).is_some_and(|o| o.signal.same_as(signal)) {
            groups.remove(&key);
        }
    }

    /// Current holder of a run-level group
    pub async fn occupant(&self, key: &str) -> Option<RunId> {
        self.groups
            .lock()
            .await
            .get(&GroupKey::run(key))
            .map(|o| o.run_id)
    }

    pub async fn job_occupant(&self, key: &str) -> Option<RunId> {
        self.groups
            .lock()
            .await
            .get(&GroupKey::job(key))
            .map(|o| o.run_id)
    }

    /// Whether `run_id` holds any group
    pub async fn is_active(&self, run_id: RunId) -> bool {
        self.groups
            .lock()
            .await
            .values()
            .any(|o| o.run_id == run_id)
    }
}
