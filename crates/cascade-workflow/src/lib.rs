//! Validated workflow model and dependency graph.
//!
//! [`Workflow::parse`] is the single entry point from definition text to an
//! executable model: definition validation, then graph construction with
//! cycle detection. A `Workflow` in hand means execution can begin.

mod error;
mod graph;
mod workflow;

pub use error::GraphError;
pub use graph::Graph;
pub use workflow::Workflow;
