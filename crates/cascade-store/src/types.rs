use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Terminal-tracked status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
  Pending,
  Running,
  Succeeded,
  Failed,
  Cancelled,
}

impl RunStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
  }
}

/// Status of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum StepStatus {
  Pending,
  Running,
  Succeeded,
  Failed,
  Skipped,
}

impl StepStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
  }
}

/// One workflow invocation, tracked from start to a terminal status.
///
/// Owned exclusively by the orchestrator while running; handed to the
/// history store once terminal and read-only from then on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
  pub run_id: String,
  /// Identifies the workflow this run executed (its declared name).
  pub workflow_ref: String,
  pub status: RunStatus,
  /// The first fatal step error, when the run failed.
  pub error: Option<String>,
  /// Aggregated workflow outputs, present when the run succeeded.
  pub outputs: Map<String, Value>,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  /// Step records in dispatch order.
  pub steps: Vec<StepRecord>,
}

/// The record of one step within a run. Created the moment the step becomes
/// eligible for dispatch; never mutated after reaching a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
  pub step_id: String,
  pub status: StepStatus,
  /// How many attempts actually ran (0 if the step never dispatched).
  pub attempts: u32,
  /// Snapshot of the step's inputs after expression resolution.
  pub resolved_inputs: Value,
  pub outputs: Option<Value>,
  pub error: Option<String>,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}
