use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::StepError;
use crate::select_outputs;

/// Collaborator for side-effecting operations the embedding application
/// mediates (file writes, network calls, anything needing its own gating).
/// The engine never embeds that logic directly.
#[async_trait]
pub trait OperationHandler: Send + Sync {
  async fn perform(
    &self,
    operation: &str,
    inputs: &Map<String, Value>,
  ) -> Result<Map<String, Value>, StepError>;
}

/// Routes delegated-operation steps to the configured handler.
#[derive(Clone)]
pub struct DelegatedExecutor {
  handler: Option<Arc<dyn OperationHandler>>,
}

impl DelegatedExecutor {
  pub fn new(handler: Option<Arc<dyn OperationHandler>>) -> Self {
    Self { handler }
  }

  #[instrument(name = "delegated_perform", skip(self, inputs, outputs, cancel))]
  pub async fn execute(
    &self,
    operation: &str,
    inputs: &Map<String, Value>,
    outputs: &[String],
    cancel: &CancellationToken,
  ) -> Result<Map<String, Value>, StepError> {
    let handler = self
      .handler
      .as_ref()
      .ok_or(StepError::OperationsUnconfigured)?;

    let result = tokio::select! {
      result = handler.perform(operation, inputs) => result?,
      _ = cancel.cancelled() => return Err(StepError::Cancelled),
    };

    select_outputs(&result, outputs)
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  struct Echo;

  #[async_trait]
  impl OperationHandler for Echo {
    async fn perform(
      &self,
      operation: &str,
      inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, StepError> {
      let mut out = inputs.clone();
      out.insert("operation".to_string(), json!(operation));
      Ok(out)
    }
  }

  #[tokio::test]
  async fn test_outputs_cover_exactly_the_requested_names() {
    let executor = DelegatedExecutor::new(Some(Arc::new(Echo)));
    let mut inputs = Map::new();
    inputs.insert("value".to_string(), json!(7));
    inputs.insert("ignored".to_string(), json!("x"));

    let outputs = executor
      .execute(
        "echo",
        &inputs,
        &["value".to_string(), "operation".to_string()],
        &CancellationToken::new(),
      )
      .await
      .unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs["value"], json!(7));
    assert_eq!(outputs["operation"], json!("echo"));
  }

  #[tokio::test]
  async fn test_missing_handler_is_not_retryable() {
    let executor = DelegatedExecutor::new(None);
    let err = executor
      .execute("echo", &Map::new(), &[], &CancellationToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, StepError::OperationsUnconfigured));
    assert!(!err.is_retryable());
  }
}
