use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step of a workflow.
///
/// The kind-specific fields are flattened alongside the common ones, tagged
/// by `type`:
///
/// ```json
/// { "id": "fetch", "type": "script", "command": "scripts/fetch.py",
///   "inputs": { "url": "${input.url}" }, "outputs": ["data"] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
  #[serde(flatten)]
  pub kind: StepKind,
  /// Input name -> expression or literal JSON value.
  #[serde(default)]
  pub inputs: HashMap<String, Value>,
  /// Output names this step declares.
  #[serde(default)]
  pub outputs: Vec<String>,
  /// Explicit ordering hints; implicit edges are also derived from
  /// `step.<id>` references in expressions.
  #[serde(default)]
  pub depends_on: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry: Option<RetryPolicyDef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
  /// When set, the orchestrator blocks on the approval gate before dispatch.
  #[serde(default)]
  pub requires_approval: bool,
}

/// The closed set of step kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
  /// Spawns an executable that speaks JSON over stdio.
  Script {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    working_dir: Option<PathBuf>,
  },
  /// A single request to the configured model collaborator.
  ModelInvocation {
    prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system_instruction: Option<String>,
    #[serde(default)]
    parameters: HashMap<String, Value>,
  },
  /// Evaluates a boolean expression and gates two branches of step ids.
  Conditional {
    condition: String,
    then_steps: Vec<String>,
    #[serde(default)]
    else_steps: Vec<String>,
  },
  /// Iterates a collection, executing the nested steps once per item with
  /// `loop.<item_var>` bound.
  Loop {
    collection: String,
    item_var: String,
    steps: Vec<StepDef>,
    #[serde(default)]
    failure_mode: LoopFailureMode,
  },
  /// Forwards inputs to the embedding application's operation handler.
  DelegatedOperation { operation: String },
}

impl StepKind {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Script { .. } => "script",
      Self::ModelInvocation { .. } => "model_invocation",
      Self::Conditional { .. } => "conditional",
      Self::Loop { .. } => "loop",
      Self::DelegatedOperation { .. } => "delegated_operation",
    }
  }
}

/// What to do when a single loop iteration fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopFailureMode {
  /// Fail the loop step at the first failed iteration.
  #[default]
  StopAndFail,
  /// Keep collecting remaining iterations and report a partial failure.
  Continue,
}

/// Per-step retry policy. Delays follow
/// `min(initial_delay_ms * backoff_multiplier^(attempt-1), max_delay_ms)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyDef {
  pub max_attempts: u32,
  #[serde(default = "default_initial_delay_ms")]
  pub initial_delay_ms: u64,
  #[serde(default = "default_backoff_multiplier")]
  pub backoff_multiplier: f64,
  #[serde(default = "default_max_delay_ms")]
  pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
  500
}

fn default_backoff_multiplier() -> f64 {
  2.0
}

fn default_max_delay_ms() -> u64 {
  30_000
}
