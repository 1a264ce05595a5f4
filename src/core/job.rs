//! Job domain model

use crate::core::{
    condition::Predicate,
    error::LoadError,
    state::JobState,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A job as declared in a pipeline definition
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Unique job name
    pub name: String,

    /// Jobs that must finish before this one, in declaration order
    pub needs: Vec<String>,

    /// Gate evaluated against the run context (and, when referenced, dependency outputs)
    pub condition: Option<Predicate>,

    /// Condition text as written, for diagnostics
    pub condition_source: Option<String>,

    /// Build matrix
    pub strategy: Option<Strategy>,

    /// Environment scope whose bindings the job may read
    pub environment: Option<String>,

    /// Job-level concurrency group
    pub concurrency: Option<String>,

    /// Failure does not block dependents (but is still recorded)
    pub best_effort: bool,

    /// Per-instance execution timeout
    pub timeout: Option<Duration>,
}

/// Matrix strategy: ordered axes expanded into their cartesian product
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub axes: Vec<MatrixAxis>,

    /// Upper bound on concurrently running instances of this job
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

/// One matrix dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl MatrixAxis {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            needs: Vec::new(),
            condition: None,
            condition_source: None,
            strategy: None,
            environment: None,
            concurrency: None,
            best_effort: false,
            timeout: None,
        }
    }

    pub fn needs<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a condition, parsing it now so syntax errors surface at load time
    pub fn with_condition(mut self, source: &str) -> Result<Self, LoadError> {
        let predicate = Predicate::parse(source).map_err(|e| LoadError::ConditionSyntax {
            job: self.name.clone(),
            expression: source.to_string(),
            source: e,
        })?;
        self.condition = Some(predicate);
        self.condition_source = Some(source.to_string());
        Ok(self)
    }

    pub fn with_axis(mut self, axis: MatrixAxis) -> Self {
        self.strategy.get_or_insert_with(Strategy::default).axes.push(axis);
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.strategy.get_or_insert_with(Strategy::default).max_parallel = Some(max);
        self
    }

    pub fn in_environment(mut self, scope: impl Into<String>) -> Self {
        self.environment = Some(scope.into());
        self
    }

    pub fn with_concurrency(mut self, key: impl Into<String>) -> Self {
        self.concurrency = Some(key.into());
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_matrixed(&self) -> bool {
        self.strategy.as_ref().is_some_and(|s| !s.axes.is_empty())
    }
}

/// Stable identifier of a job instance: job name plus matrix values in axis order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(job: &str, matrix: &[(String, String)]) -> Self {
        if matrix.is_empty() {
            return Self(job.to_string());
        }
        let values: Vec<&str> = matrix.iter().map(|(_, v)| v.as_str()).collect();
        Self(format!("{} ({})", job, values.join(", ")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A job resolved against one matrix combination
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub id: InstanceId,

    /// Name of the job this instance was expanded from
    pub job: String,

    /// Axis name/value pairs in axis declaration order
    pub matrix: Vec<(String, String)>,

    pub state: JobState,

    /// Structured output reported by the executor
    pub outputs: BTreeMap<String, String>,
}

impl JobInstance {
    pub fn new(job: &str, matrix: Vec<(String, String)>) -> Self {
        Self {
            id: InstanceId::new(job, &matrix),
            job: job.to_string(),
            matrix,
            state: JobState::Pending,
            outputs: BTreeMap::new(),
        }
    }
}
