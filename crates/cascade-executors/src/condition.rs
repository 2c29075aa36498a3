use serde_json::Value;

use crate::error::StepError;

/// Interpret a resolved condition value as a boolean.
///
/// Accepts a JSON boolean, or the strings "true"/"false" for conditions
/// built by interpolation. Anything else is a defect in the workflow's
/// logic, not a transient failure.
pub fn evaluate_condition(value: &Value) -> Result<bool, StepError> {
  match value {
    Value::Bool(b) => Ok(*b),
    Value::String(s) if s == "true" => Ok(true),
    Value::String(s) if s == "false" => Ok(false),
    other => Err(StepError::Condition {
      message: format!("got {other}"),
    }),
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_booleans_and_boolean_strings() {
    assert!(evaluate_condition(&json!(true)).unwrap());
    assert!(!evaluate_condition(&json!(false)).unwrap());
    assert!(evaluate_condition(&json!("true")).unwrap());
    assert!(!evaluate_condition(&json!("false")).unwrap());
  }

  #[test]
  fn test_non_boolean_is_an_error() {
    let err = evaluate_condition(&json!(1)).unwrap_err();
    assert!(matches!(err, StepError::Condition { .. }));
    assert!(!err.is_retryable());
  }
}
