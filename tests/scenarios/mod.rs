//! Scenario-based tests for conductor

mod best_effort;
mod environments;
mod matrix;
mod ordering;
