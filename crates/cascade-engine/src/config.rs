use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cascade_executors::{
  AllowAll, ApprovalGate, DEFAULT_SCRIPT_TIMEOUT, ModelInvoker, OperationHandler,
};

/// Collaborators and knobs the embedding application supplies.
///
/// Model invocations and delegated operations only work when their
/// collaborator is configured; a step of that kind in a workflow executed
/// without one fails with a non-retryable error.
pub struct EngineConfig {
  pub model: Option<Arc<dyn ModelInvoker>>,
  pub operations: Option<Arc<dyn OperationHandler>>,
  pub approvals: Arc<dyn ApprovalGate>,
  /// Script timeout applied when a step does not declare its own.
  pub script_timeout: Duration,
  /// Environment snapshot override; defaults to the process environment,
  /// captured once per run.
  pub env: Option<HashMap<String, String>>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      model: None,
      operations: None,
      approvals: Arc::new(AllowAll),
      script_timeout: DEFAULT_SCRIPT_TIMEOUT,
      env: None,
    }
  }
}
