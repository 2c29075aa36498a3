//! Cascade workflow definitions.
//!
//! This crate contains the serializable workflow definition types and the
//! parser/validator that turns definition text into a typed model. Parsing
//! is a pure function over the text: all detectable problems are collected
//! into one batch of [`ValidationError`]s and nothing executes until the
//! batch is empty.

mod error;
mod step;
mod validate;
mod workflow;

pub use error::ValidationError;
pub use step::{LoopFailureMode, RetryPolicyDef, StepDef, StepKind};
pub use validate::{parse, validate};
pub use workflow::{InputDef, ValueType, WorkflowDef};
