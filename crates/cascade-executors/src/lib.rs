//! Step executors for Cascade workflows.
//!
//! Each executor takes already-resolved inputs and a requested output-name
//! list and returns a map covering exactly those names, or a typed
//! [`StepError`]. Executors never touch the execution context; resolution
//! happens before dispatch.

mod condition;
mod delegated;
mod error;
mod gate;
mod model;
mod script;

pub use condition::evaluate_condition;
pub use delegated::{DelegatedExecutor, OperationHandler};
pub use error::StepError;
pub use gate::{AllowAll, Approval, ApprovalGate};
pub use model::{ModelExecutor, ModelInvoker};
pub use script::{DEFAULT_SCRIPT_TIMEOUT, ScriptExecutor, ScriptRequest};

use serde_json::{Map, Value};

/// Pick exactly the requested output names out of a result object.
pub(crate) fn select_outputs(
  result: &Map<String, Value>,
  requested: &[String],
) -> Result<Map<String, Value>, StepError> {
  let mut outputs = Map::new();
  for name in requested {
    let value = result.get(name).ok_or_else(|| StepError::MissingOutput {
      name: name.clone(),
    })?;
    outputs.insert(name.clone(), value.clone());
  }
  Ok(outputs)
}
