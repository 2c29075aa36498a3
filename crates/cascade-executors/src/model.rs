use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::StepError;
use crate::select_outputs;

/// Collaborator that performs the actual model request. Supplied by the
/// embedding application; the engine never talks to a provider directly.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
  async fn invoke(
    &self,
    system_instruction: Option<&str>,
    prompt: &str,
    parameters: &Map<String, Value>,
  ) -> Result<String, StepError>;
}

/// Maps model responses onto a step's declared outputs.
#[derive(Clone)]
pub struct ModelExecutor {
  invoker: Option<Arc<dyn ModelInvoker>>,
}

impl ModelExecutor {
  pub fn new(invoker: Option<Arc<dyn ModelInvoker>>) -> Self {
    Self { invoker }
  }

  /// Issue one request and map the response.
  ///
  /// With a single declared output, the full response text is assigned to
  /// it. With several, the response must parse as a JSON object and each
  /// output is taken by key; an absent key is a failure.
  #[instrument(name = "model_invoke", skip_all)]
  pub async fn execute(
    &self,
    system_instruction: Option<&str>,
    prompt: &str,
    parameters: &Map<String, Value>,
    outputs: &[String],
    cancel: &CancellationToken,
  ) -> Result<Map<String, Value>, StepError> {
    let invoker = self.invoker.as_ref().ok_or(StepError::ModelUnconfigured)?;

    let response = tokio::select! {
      result = invoker.invoke(system_instruction, prompt, parameters) => result?,
      _ = cancel.cancelled() => return Err(StepError::Cancelled),
    };

    match outputs {
      [] => Ok(Map::new()),
      [single] => {
        let mut out = Map::new();
        out.insert(single.clone(), Value::String(response));
        Ok(out)
      }
      several => {
        let parsed: Value =
          serde_json::from_str(&response).map_err(|e| StepError::MalformedOutput {
            message: format!(
              "{} outputs declared but response is not JSON: {e}",
              several.len()
            ),
          })?;
        let Value::Object(fields) = parsed else {
          return Err(StepError::MalformedOutput {
            message: "structured response is not a JSON object".to_string(),
          });
        };
        select_outputs(&fields, several)
      }
    }
  }
}
