//! Core domain models for conductor
//!
//! This module defines the data structures a run is built from: the trigger
//! context, job specs and their instances, the dependency graph, conditions,
//! environment scopes and execution state.

pub mod condition;
pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod graph;
pub mod job;
pub mod matrix;
pub mod policy;
pub mod state;

pub use condition::{ConditionCache, EvalScope, OutputMap, Predicate};
pub use config::{ConcurrencyTemplate, PipelineConfig, PipelineDefinition};
pub use context::*;
pub use environment::{
    BindingSource, Bindings, EnvBindings, EnvironmentProvisioner, EnvironmentScope, Secret,
    StaticBindings,
};
pub use error::{ConditionSyntaxError, EnvironmentError, LoadError};
pub use graph::{NodeIndex, PipelineGraph};
pub use job::*;
pub use matrix::MatrixExpander;
pub use policy::*;
pub use state::*;
