use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::step::StepDef;

/// A declarative workflow definition, immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
  pub name: String,
  /// Semantic version string; checked during validation.
  pub version: String,
  #[serde(default)]
  pub inputs: Vec<InputDef>,
  pub steps: Vec<StepDef>,
  /// Workflow output name -> expression over inputs and step outputs.
  #[serde(default)]
  pub outputs: HashMap<String, String>,
}

/// A declared workflow input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDef {
  pub name: String,
  #[serde(rename = "type", default)]
  pub value_type: ValueType,
  #[serde(default)]
  pub required: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<Value>,
}

/// Type tag for a declared input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
  #[default]
  String,
  Number,
  Boolean,
  Object,
  Array,
}
