use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One structured validation failure: where in the definition it was found
/// and a human-readable message. The parser reports every detectable error
/// together instead of stopping at the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{path}: {message}")]
pub struct ValidationError {
  /// Field path into the definition, e.g. `steps[2].inputs.url`.
  pub path: String,
  pub message: String,
}

impl ValidationError {
  pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      message: message.into(),
    }
  }
}
