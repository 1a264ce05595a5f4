//! Pipeline configuration from YAML

use crate::core::{
    condition::Predicate,
    context::RunContext,
    environment::{EnvBindings, EnvironmentScope, StaticBindings},
    error::LoadError,
    graph::PipelineGraph,
    job::{JobSpec, MatrixAxis},
    policy::EnginePolicy,
};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, also the workflow name in the default concurrency key
    pub name: String,

    /// Concurrency group template, e.g. `"{repository}/{workflow}/{ref}"`
    #[serde(default)]
    pub concurrency: Option<String>,

    /// Worker slots for this pipeline
    #[serde(default)]
    pub max_parallel: Option<usize>,

    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,

    #[serde(default)]
    pub policy: EnginePolicy,

    /// Jobs keyed by name, in declaration order
    pub jobs: Mapping,
}

/// Environment scope as defined in YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Plain values
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Names of process environment variables read when the scope is provisioned
    #[serde(default)]
    pub secrets_from_env: Vec<String>,

    /// Admission condition
    #[serde(default)]
    pub when: Option<String>,
}

/// Job as defined in YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    #[serde(default)]
    pub needs: Vec<String>,

    #[serde(default)]
    pub strategy: Option<StrategyConfig>,

    #[serde(default)]
    pub environment: Option<String>,

    #[serde(default)]
    pub concurrency: Option<String>,

    /// Failure is recorded but does not block dependents
    #[serde(default)]
    pub best_effort: bool,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Axis name -> values, in declaration order
    pub matrix: Mapping,

    #[serde(default)]
    pub max_parallel: Option<usize>,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, LoadError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Convert into the validated domain model. Stops at the first error.
    pub fn to_definition(&self) -> Result<PipelineDefinition, LoadError> {
        let mut definition = PipelineDefinition::new(&self.name);
        definition.policy = self.policy.clone();

        if let Some(max) = self.max_parallel {
            if max == 0 {
                return Err(LoadError::InvalidDefinition(
                    "max_parallel must be at least 1".to_string(),
                ));
            }
            definition.max_parallel = Some(max);
        }

        if let Some(template) = &self.concurrency {
            definition.concurrency = Some(ConcurrencyTemplate::parse(template)?);
        }

        for (name, env) in &self.environments {
            definition.environments.push(env.to_scope(name)?);
        }

        for (key, value) in &self.jobs {
            let name = key.as_str().ok_or_else(|| {
                LoadError::InvalidDefinition(format!("job names must be strings, got {:?}", key))
            })?;
            let job: JobConfig = if value.is_null() {
                JobConfig::default()
            } else {
                serde_yaml::from_value(value.clone())?
            };
            definition.jobs.push(job.to_spec(name)?);
        }

        definition.build_graph()?;
        Ok(definition)
    }
}

impl EnvironmentConfig {
    fn to_scope(&self, name: &str) -> Result<EnvironmentScope, LoadError> {
        let mut scope = EnvironmentScope::new(name);
        if let Some(when) = &self.when {
            let predicate = Predicate::parse(when).map_err(|e| LoadError::ConditionSyntax {
                job: format!("environment {}", name),
                expression: when.clone(),
                source: e,
            })?;
            scope = scope.admit_when(predicate);
        }
        if !self.variables.is_empty() {
            scope = scope.with_source(StaticBindings::new(self.variables.clone()));
        }
        if !self.secrets_from_env.is_empty() {
            scope = scope.with_source(EnvBindings::new(self.secrets_from_env.clone()));
        }
        Ok(scope)
    }
}

impl JobConfig {
    fn to_spec(&self, name: &str) -> Result<JobSpec, LoadError> {
        let mut spec = JobSpec::new(name).needs(self.needs.iter().cloned());

        if let Some(condition) = &self.condition {
            spec = spec.with_condition(condition)?;
        }

        if let Some(strategy) = &self.strategy {
            for (axis, values) in &strategy.matrix {
                let axis = scalar(axis).ok_or_else(|| {
                    LoadError::InvalidDefinition(format!("job '{}': matrix axis names must be scalars", name))
                })?;
                let values = match values {
                    Value::Sequence(seq) => seq
                        .iter()
                        .map(|v| {
                            scalar(v).ok_or_else(|| {
                                LoadError::InvalidDefinition(format!(
                                    "job '{}': matrix axis '{}' values must be scalars",
                                    name, axis
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => {
                        return Err(LoadError::InvalidDefinition(format!(
                            "job '{}': matrix axis '{}' must be a list",
                            name, axis
                        )))
                    }
                };
                spec = spec.with_axis(MatrixAxis::new(axis, values));
            }
            if let Some(max) = strategy.max_parallel {
                if max == 0 {
                    return Err(LoadError::InvalidDefinition(format!(
                        "job '{}': strategy.max_parallel must be at least 1",
                        name
                    )));
                }
                spec = spec.with_max_parallel(max);
            }
        }

        if let Some(environment) = &self.environment {
            spec = spec.in_environment(environment);
        }
        if let Some(concurrency) = &self.concurrency {
            spec = spec.with_concurrency(concurrency);
        }
        if self.best_effort {
            spec = spec.best_effort();
        }
        if let Some(secs) = self.timeout_secs {
            spec = spec.with_timeout(Duration::from_secs(secs));
        }
        Ok(spec)
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Concurrency group key template with `{repository}`, `{workflow}`,
/// `{ref}` and `{event}` placeholders
#[derive(Debug, Clone)]
pub struct ConcurrencyTemplate {
    template: String,
    placeholder: Regex,
}

impl ConcurrencyTemplate {
    const PLACEHOLDERS: [&'static str; 4] = ["repository", "workflow", "ref", "event"];

    pub fn parse(template: &str) -> Result<Self, LoadError> {
        let placeholder = Regex::new(r"\{([a-z_]+)\}")
            .map_err(|e| LoadError::InvalidDefinition(e.to_string()))?;
        for caps in placeholder.captures_iter(template) {
            let name = &caps[1];
            if !Self::PLACEHOLDERS.contains(&name) {
                return Err(LoadError::InvalidDefinition(format!(
                    "unknown placeholder {{{}}} in concurrency group '{}'",
                    name, template
                )));
            }
        }
        Ok(Self {
            template: template.to_string(),
            placeholder,
        })
    }

    pub fn render(&self, context: &RunContext) -> String {
        self.placeholder
            .replace_all(&self.template, |caps: &Captures| match &caps[1] {
                "repository" => context.repository.clone(),
                "workflow" => context.workflow.clone(),
                "ref" => context.git_ref.clone(),
                "event" => context.event.to_string(),
                other => other.to_string(),
            })
            .into_owned()
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }
}

/// A loaded pipeline: everything needed to run it against a trigger
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,
    pub jobs: Vec<JobSpec>,
    pub environments: Vec<EnvironmentScope>,
    pub policy: EnginePolicy,
    pub max_parallel: Option<usize>,
    pub concurrency: Option<ConcurrencyTemplate>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
            environments: Vec::new(),
            policy: EnginePolicy::default(),
            max_parallel: None,
            concurrency: None,
        }
    }

    /// Load and validate a definition from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        PipelineConfig::from_file(path)?.to_definition()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, LoadError> {
        PipelineConfig::from_yaml(yaml)?.to_definition()
    }

    pub fn with_job(mut self, job: JobSpec) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn with_environment(mut self, scope: EnvironmentScope) -> Self {
        self.environments.push(scope);
        self
    }

    pub fn with_policy(mut self, policy: EnginePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = Some(max);
        self
    }

    pub fn with_concurrency(mut self, template: ConcurrencyTemplate) -> Self {
        self.concurrency = Some(template);
        self
    }

    /// Expand and validate the job graph
    pub fn build_graph(&self) -> Result<PipelineGraph, LoadError> {
        PipelineGraph::build(self.jobs.clone())
    }

    /// Concurrency group for a run of this pipeline
    pub fn concurrency_key(&self, context: &RunContext) -> String {
        match &self.concurrency {
            Some(template) => template.render(context),
            None => context.concurrency_key(),
        }
    }
}
