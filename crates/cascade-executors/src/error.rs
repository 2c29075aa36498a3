use thiserror::Error;

/// Typed failure of one step attempt.
///
/// Variants split into two classes. Execution-class failures (the step's
/// underlying action failed) are retryable under a retry policy.
/// Runtime-class failures are defects in the workflow's own logic, so
/// retrying cannot help; the retry wrapper surfaces them immediately.
#[derive(Debug, Error)]
pub enum StepError {
  #[error("step cancelled")]
  Cancelled,

  #[error("step timed out after {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },

  #[error("process exited with status {code:?}: {stderr}")]
  NonZeroExit {
    code: Option<i32>,
    stdout: String,
    stderr: String,
  },

  #[error("failed to spawn process: {message}")]
  Spawn { message: String },

  #[error("i/o failure talking to process: {message}")]
  ProcessIo { message: String },

  #[error("malformed step output: {message}")]
  MalformedOutput { message: String },

  #[error("declared output {name:?} missing from result")]
  MissingOutput { name: String },

  #[error("model invocation failed: {message}")]
  Model { message: String },

  #[error("no model collaborator configured")]
  ModelUnconfigured,

  #[error("delegated operation failed: {message}")]
  Delegated { message: String },

  #[error("no operation collaborator configured")]
  OperationsUnconfigured,

  #[error("approval denied")]
  ApprovalDenied,

  #[error("condition did not evaluate to a boolean: {message}")]
  Condition { message: String },

  #[error("unresolved reference: {reference}")]
  Unresolved { reference: String },

  #[error("loop collection is not an array: {message}")]
  NotACollection { message: String },

  #[error("{failed} of {total} loop iterations failed (first: {first})")]
  LoopPartial {
    failed: usize,
    total: usize,
    first: String,
  },

  #[error("loop iteration {index} failed: {source}")]
  LoopIteration {
    index: usize,
    #[source]
    source: Box<StepError>,
  },
}

impl StepError {
  /// Whether this failure is execution-class, i.e. eligible for retry.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Timeout { .. }
      | Self::NonZeroExit { .. }
      | Self::Spawn { .. }
      | Self::ProcessIo { .. }
      | Self::MalformedOutput { .. }
      | Self::MissingOutput { .. }
      | Self::Model { .. }
      | Self::Delegated { .. }
      | Self::ApprovalDenied => true,
      Self::Cancelled
      | Self::ModelUnconfigured
      | Self::OperationsUnconfigured
      | Self::Condition { .. }
      | Self::Unresolved { .. }
      | Self::NotACollection { .. }
      | Self::LoopPartial { .. } => false,
      Self::LoopIteration { source, .. } => source.is_retryable(),
    }
  }
}
