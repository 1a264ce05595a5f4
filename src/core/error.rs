//! Error taxonomy for pipeline loading and environment resolution

use thiserror::Error;

/// Errors detected while loading a pipeline, before any job runs.
///
/// All of these are fatal for the run: nothing is registered with the
/// concurrency coordinator and no job is dispatched.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("job '{job}': invalid condition `{expression}`: {source}")]
    ConditionSyntax {
        job: String,
        expression: String,
        #[source]
        source: ConditionSyntaxError,
    },

    #[error("job '{job}' needs unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("job '{job}': matrix axis '{axis}' has no values")]
    EmptyMatrixAxis { job: String, axis: String },

    #[error("job '{job}': matrix axis '{axis}' is declared more than once")]
    DuplicateMatrixAxis { job: String, axis: String },

    #[error("duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("failed to parse pipeline YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read pipeline file: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed predicate syntax
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at position {position}")]
pub struct ConditionSyntaxError {
    pub position: usize,
    pub message: String,
}

impl ConditionSyntaxError {
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// Errors from the environment provisioner
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    #[error("unknown environment '{scope}': {reason}")]
    UnknownEnvironment { scope: String, reason: String },

    #[error("failed to load bindings for environment '{scope}': {message}")]
    Source { scope: String, message: String },
}
