use std::collections::HashMap;

use serde_json::{Map, Value};

/// Per-run resolution context.
///
/// Owned and mutated by the orchestrator for one run. Step outputs are
/// append-only: a step id is written exactly once, after the step succeeds.
/// Loop variables form a stack so nested iterations shadow outer ones.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
  inputs: Map<String, Value>,
  step_outputs: HashMap<String, Map<String, Value>>,
  loop_scopes: Vec<(String, Value)>,
  env: HashMap<String, String>,
}

impl ExecutionContext {
  /// Create a context from resolved workflow inputs and an environment
  /// snapshot.
  pub fn new(inputs: Map<String, Value>, env: HashMap<String, String>) -> Self {
    Self {
      inputs,
      step_outputs: HashMap::new(),
      loop_scopes: Vec::new(),
      env,
    }
  }

  /// Create a context with the current process environment as the snapshot.
  pub fn with_process_env(inputs: Map<String, Value>) -> Self {
    Self::new(inputs, std::env::vars().collect())
  }

  pub fn input(&self, name: &str) -> Option<&Value> {
    self.inputs.get(name)
  }

  pub fn inputs(&self) -> &Map<String, Value> {
    &self.inputs
  }

  pub fn env(&self) -> &HashMap<String, String> {
    &self.env
  }

  pub fn step_outputs(&self, step_id: &str) -> Option<&Map<String, Value>> {
    self.step_outputs.get(step_id)
  }

  /// Record a step's outputs. Writing the same step id twice is a logic
  /// error in the orchestrator; the later write wins.
  pub fn insert_step_outputs(&mut self, step_id: impl Into<String>, outputs: Map<String, Value>) {
    self.step_outputs.insert(step_id.into(), outputs);
  }

  /// Push a loop variable binding for a new iteration scope.
  pub fn push_loop_var(&mut self, name: impl Into<String>, value: Value) {
    self.loop_scopes.push((name.into(), value));
  }

  /// Pop the innermost loop variable binding.
  pub fn pop_loop_var(&mut self) {
    self.loop_scopes.pop();
  }

  /// Look up a loop variable, innermost scope first.
  pub fn loop_var(&self, name: &str) -> Option<&Value> {
    self
      .loop_scopes
      .iter()
      .rev()
      .find(|(n, _)| n == name)
      .map(|(_, v)| v)
  }
}
