//! Matrix expansion - turns a job's strategy axes into concrete instances

use crate::core::{
    error::LoadError,
    job::{JobInstance, JobSpec, MatrixAxis},
};
use std::collections::HashSet;

/// Expands job specs into job instances
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a job into its instances.
    ///
    /// The cartesian product keeps axis declaration order, with the last
    /// axis varying fastest, so instance identifiers are stable across
    /// runs. A job without a matrix expands to exactly one instance.
    pub fn expand(job: &JobSpec) -> Result<Vec<JobInstance>, LoadError> {
        let axes: &[MatrixAxis] = job
            .strategy
            .as_ref()
            .map(|s| s.axes.as_slice())
            .unwrap_or(&[]);

        Self::validate(&job.name, axes)?;

        let combinations = Self::combinations(axes);
        Ok(combinations
            .into_iter()
            .map(|matrix| JobInstance::new(&job.name, matrix))
            .collect())
    }

    fn validate(job: &str, axes: &[MatrixAxis]) -> Result<(), LoadError> {
        let mut seen = HashSet::new();
        for axis in axes {
            if !seen.insert(axis.name.as_str()) {
                return Err(LoadError::DuplicateMatrixAxis {
                    job: job.to_string(),
                    axis: axis.name.clone(),
                });
            }
            // An empty axis would silently drop coverage
            if axis.values.is_empty() {
                return Err(LoadError::EmptyMatrixAxis {
                    job: job.to_string(),
                    axis: axis.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn combinations(axes: &[MatrixAxis]) -> Vec<Vec<(String, String)>> {
        let mut result: Vec<Vec<(String, String)>> = vec![Vec::new()];
        for axis in axes {
            result = result
                .into_iter()
                .flat_map(|prefix| {
                    axis.values.iter().map(move |value| {
                        let mut combo = prefix.clone();
                        combo.push((axis.name.clone(), value.clone()));
                        combo
                    })
                })
                .collect();
        }
        result
    }
}
