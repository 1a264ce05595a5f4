//! Environment scopes: per-scope variables and secrets
//!
//! Each scope owns its own binding set. Bindings are loaded the first time a
//! job in the scope is about to run and dropped again once the last such job
//! is finished, so sensitive values live only as long as they are needed.
//! Nothing here ever copies values from one scope into another.

use crate::core::{
    condition::{EvalScope, Predicate},
    context::RunContext,
    error::EnvironmentError,
    policy::PathFilterPolicy,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Scope that is only ever admitted for release-published runs
pub const PRODUCTION_SCOPE: &str = "production";

/// A value that must not end up in logs
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Immutable binding set of one scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bindings {
    scope: String,
    values: BTreeMap<String, Secret>,
}

impl Bindings {
    pub fn new(scope: impl Into<String>, values: BTreeMap<String, Secret>) -> Self {
        Self {
            scope: scope.into(),
            values,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn get(&self, key: &str) -> Option<&Secret> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Where a scope's values come from
#[async_trait]
pub trait BindingSource: Send + Sync + fmt::Debug {
    async fn load(&self, scope: &str) -> Result<BTreeMap<String, Secret>, EnvironmentError>;
}

/// Fixed values declared alongside the pipeline
#[derive(Debug, Clone, Default)]
pub struct StaticBindings {
    values: BTreeMap<String, String>,
}

impl StaticBindings {
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[async_trait]
impl BindingSource for StaticBindings {
    async fn load(&self, _scope: &str) -> Result<BTreeMap<String, Secret>, EnvironmentError> {
        Ok(self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), Secret::new(v.clone())))
            .collect())
    }
}

/// Values read from the process environment at resolve time
#[derive(Debug, Clone, Default)]
pub struct EnvBindings {
    names: Vec<String>,
}

impl EnvBindings {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl BindingSource for EnvBindings {
    async fn load(&self, scope: &str) -> Result<BTreeMap<String, Secret>, EnvironmentError> {
        let mut values = BTreeMap::new();
        for name in &self.names {
            let value = std::env::var(name).map_err(|_| EnvironmentError::Source {
                scope: scope.to_string(),
                message: format!("environment variable {} is not set", name),
            })?;
            values.insert(name.clone(), Secret::new(value));
        }
        Ok(values)
    }
}

/// Declaration of an environment scope
#[derive(Debug, Clone)]
pub struct EnvironmentScope {
    pub name: String,

    /// Extra admission rule evaluated against the run context
    pub admit: Option<Predicate>,

    pub sources: Vec<Arc<dyn BindingSource>>,
}

impl EnvironmentScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            admit: None,
            sources: Vec::new(),
        }
    }

    pub fn admit_when(mut self, predicate: Predicate) -> Self {
        self.admit = Some(predicate);
        self
    }

    pub fn with_source(mut self, source: impl BindingSource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    fn admits(&self, context: &RunContext, empty_paths: PathFilterPolicy) -> bool {
        if self.name == PRODUCTION_SCOPE && !context.is_release() {
            return false;
        }
        match &self.admit {
            Some(predicate) => predicate.evaluate(&EvalScope::new(context, empty_paths)),
            None => true,
        }
    }
}

/// Resolves scope bindings for one run
#[derive(Debug)]
pub struct EnvironmentProvisioner {
    context: Arc<RunContext>,
    empty_paths: PathFilterPolicy,
    scopes: HashMap<String, EnvironmentScope>,
    resolved: Mutex<HashMap<String, Arc<Bindings>>>,
}

impl EnvironmentProvisioner {
    pub fn new(
        context: Arc<RunContext>,
        scopes: impl IntoIterator<Item = EnvironmentScope>,
        empty_paths: PathFilterPolicy,
    ) -> Self {
        Self {
            context,
            empty_paths,
            scopes: scopes.into_iter().map(|s| (s.name.clone(), s)).collect(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Check declaration and admission without loading anything
    pub fn check(&self, scope: &str) -> Result<(), EnvironmentError> {
        let declared = self
            .scopes
            .get(scope)
            .ok_or_else(|| EnvironmentError::UnknownEnvironment {
                scope: scope.to_string(),
                reason: "not declared by this pipeline".to_string(),
            })?;

        if !declared.admits(&self.context, self.empty_paths) {
            let reason = if scope == PRODUCTION_SCOPE && !self.context.is_release() {
                format!("only available to release runs, not {}", self.context.event)
            } else {
                format!("not admitted for {} on {}", self.context.event, self.context.git_ref)
            };
            return Err(EnvironmentError::UnknownEnvironment {
                scope: scope.to_string(),
                reason,
            });
        }
        Ok(())
    }

    /// Resolve a scope's bindings, loading them on first use
    pub async fn resolve(&self, scope: &str) -> Result<Arc<Bindings>, EnvironmentError> {
        self.check(scope)?;

        let mut resolved = self.resolved.lock().await;
        if let Some(bindings) = resolved.get(scope) {
            return Ok(Arc::clone(bindings));
        }

        let declared = &self.scopes[scope];
        let mut values = BTreeMap::new();
        for source in &declared.sources {
            values.extend(source.load(scope).await?);
        }

        info!("Provisioned environment '{}' ({} bindings)", scope, values.len());
        let bindings = Arc::new(Bindings::new(scope, values));
        resolved.insert(scope.to_string(), Arc::clone(&bindings));
        Ok(bindings)
    }

    /// Drop a scope's cached bindings
    pub async fn revoke(&self, scope: &str) {
        if self.resolved.lock().await.remove(scope).is_some() {
            debug!("Revoked environment '{}'", scope);
        }
    }

    pub async fn is_resolved(&self, scope: &str) -> bool {
        self.resolved.lock().await.contains_key(scope)
    }

    pub fn is_declared(&self, scope: &str) -> bool {
        self.scopes.contains_key(scope)
    }
}
