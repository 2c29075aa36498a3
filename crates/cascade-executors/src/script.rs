//! External script execution.
//!
//! Scripts speak JSON over stdio: the resolved inputs are written to the
//! child's stdin as one JSON object, and on success the child must write
//! exactly one JSON object to stdout and exit 0. Non-zero exit, malformed
//! output, or a missing declared output key are failures, never crashes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::StepError;
use crate::select_outputs;

/// Default per-step timeout when the definition does not override it.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// One script invocation, fully resolved.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
  pub command: String,
  pub args: Vec<String>,
  pub working_dir: Option<PathBuf>,
  pub inputs: Map<String, Value>,
  pub outputs: Vec<String>,
  pub timeout: Option<Duration>,
}

/// Spawns and supervises script processes.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
  default_timeout: Duration,
}

impl Default for ScriptExecutor {
  fn default() -> Self {
    Self {
      default_timeout: DEFAULT_SCRIPT_TIMEOUT,
    }
  }
}

impl ScriptExecutor {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_default_timeout(default_timeout: Duration) -> Self {
    Self { default_timeout }
  }

  /// Run the script to completion, enforcing the timeout and cancellation.
  ///
  /// The child is spawned with `kill_on_drop`, so abandoning it on timeout
  /// or cancellation forcibly terminates the process.
  #[instrument(name = "script_execute", skip(self, request), fields(command = %request.command))]
  pub async fn execute(
    &self,
    request: &ScriptRequest,
    cancel: &CancellationToken,
  ) -> Result<Map<String, Value>, StepError> {
    let timeout = request.timeout.unwrap_or(self.default_timeout);

    let mut cmd = Command::new(&request.command);
    cmd
      .args(&request.args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    if let Some(dir) = &request.working_dir {
      cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| StepError::Spawn {
      message: e.to_string(),
    })?;

    let payload = serde_json::to_vec(&request.inputs).map_err(|e| StepError::ProcessIo {
      message: format!("failed to serialize inputs: {e}"),
    })?;
    let mut stdin = child.stdin.take().ok_or_else(|| StepError::Spawn {
      message: "stdin not captured".to_string(),
    })?;

    // The stdin write lives inside the supervised future so a child that
    // never reads still hits the timeout. A child that exits without
    // reading produces a broken pipe; the exit status tells the real story.
    let supervise = async move {
      let _ = stdin.write_all(&payload).await;
      drop(stdin);
      child.wait_with_output().await
    };

    let output = tokio::select! {
      result = supervise => result.map_err(|e| StepError::ProcessIo {
        message: e.to_string(),
      })?,
      _ = tokio::time::sleep(timeout) => {
        return Err(StepError::Timeout {
          timeout_ms: timeout.as_millis() as u64,
        });
      }
      _ = cancel.cancelled() => return Err(StepError::Cancelled),
    };

    if !output.status.success() {
      return Err(StepError::NonZeroExit {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
      });
    }

    debug!(bytes = output.stdout.len(), "script produced output");

    let parsed: Value =
      serde_json::from_slice(&output.stdout).map_err(|e| StepError::MalformedOutput {
        message: format!("stdout is not valid JSON: {e}"),
      })?;
    let Value::Object(result) = parsed else {
      return Err(StepError::MalformedOutput {
        message: format!("expected a JSON object, got {parsed}"),
      });
    };

    select_outputs(&result, &request.outputs)
  }
}
