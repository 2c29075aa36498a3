use thiserror::Error;

/// Errors that prevent a run from starting or completing its bookkeeping.
///
/// Step failures are not engine errors: a run whose steps fail still
/// completes and is returned (and recorded) with a failed status.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("missing required inputs: {}", .names.join(", "))]
  MissingInputs { names: Vec<String> },

  #[error("input {name:?} is not of declared type {expected}")]
  InputType { name: String, expected: &'static str },

  #[error("step task panicked: {message}")]
  Join { message: String },

  #[error(transparent)]
  Store(#[from] cascade_store::Error),
}
