//! Definition parsing and validation.

use std::collections::{HashMap, HashSet};

use cascade_expr::{Expr, Reference, Scope};
use serde_json::Value;

use crate::error::ValidationError;
use crate::step::{StepDef, StepKind};
use crate::workflow::WorkflowDef;

/// Parse workflow definition text into a typed model.
///
/// Pure function over the text. Either the definition is fully valid, or
/// every detectable error is returned as one batch and nothing executes.
pub fn parse(text: &str) -> Result<WorkflowDef, Vec<ValidationError>> {
  let def: WorkflowDef = serde_json::from_str(text)
    .map_err(|e| vec![ValidationError::new("$", format!("malformed definition: {e}"))])?;

  let errors = validate(&def);
  if errors.is_empty() { Ok(def) } else { Err(errors) }
}

/// Validate a parsed definition, collecting every error.
pub fn validate(def: &WorkflowDef) -> Vec<ValidationError> {
  let mut v = Validator::new(def);
  v.run();
  v.errors
}

struct Validator<'a> {
  def: &'a WorkflowDef,
  errors: Vec<ValidationError>,
  /// Steps schedulable by the orchestrator (not inside a loop body).
  top_ids: HashSet<&'a str>,
  /// Declared output names per step id, including nested steps.
  outputs_by_id: HashMap<&'a str, &'a StepDef>,
}

impl<'a> Validator<'a> {
  fn new(def: &'a WorkflowDef) -> Self {
    Self {
      def,
      errors: Vec::new(),
      top_ids: HashSet::new(),
      outputs_by_id: HashMap::new(),
    }
  }

  fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
    self.errors.push(ValidationError::new(path, message));
  }

  fn run(&mut self) {
    if self.def.name.is_empty() {
      self.error("name", "workflow name must not be empty");
    }
    if let Err(e) = semver::Version::parse(&self.def.version) {
      self.error("version", format!("not a semantic version: {e}"));
    }
    if self.def.steps.is_empty() {
      self.error("steps", "workflow must declare at least one step");
    }

    let def = self.def;
    let mut input_names = HashSet::new();
    for (i, input) in def.inputs.iter().enumerate() {
      if input.name.is_empty() {
        self.error(format!("inputs[{i}].name"), "input name must not be empty");
      }
      if !input_names.insert(input.name.as_str()) {
        self.error(
          format!("inputs[{i}].name"),
          format!("duplicate input name {:?}", input.name),
        );
      }
    }

    self.index_steps();
    self.check_depends_on();

    let mut loop_vars = Vec::new();
    for (i, step) in def.steps.iter().enumerate() {
      self.check_step(step, &format!("steps[{i}]"), &mut loop_vars, None);
    }

    self.check_workflow_outputs();
  }

  /// Collect step ids (top-level and loop-nested) and flag duplicates.
  fn index_steps(&mut self) {
    fn collect<'a>(
      steps: &'a [StepDef],
      path: &str,
      top_level: bool,
      v: &mut Validator<'a>,
    ) {
      for (i, step) in steps.iter().enumerate() {
        let step_path = format!("{path}[{i}]");
        if step.id.is_empty() {
          v.error(format!("{step_path}.id"), "step id must not be empty");
        }
        if v.outputs_by_id.insert(step.id.as_str(), step).is_some() {
          v.error(
            format!("{step_path}.id"),
            format!("duplicate step id {:?}", step.id),
          );
        }
        if top_level {
          v.top_ids.insert(step.id.as_str());
        }
        if let StepKind::Loop { steps, .. } = &step.kind {
          collect(steps, &format!("{step_path}.steps"), false, v);
        }
      }
    }
    let def = self.def;
    collect(&def.steps, "steps", true, self);
  }

  fn check_depends_on(&mut self) {
    let def = self.def;
    for (i, step) in def.steps.iter().enumerate() {
      for (j, dep) in step.depends_on.iter().enumerate() {
        if !self.top_ids.contains(dep.as_str()) {
          self.error(
            format!("steps[{i}].depends_on[{j}]"),
            format!("depends_on references unknown step {dep:?}"),
          );
        }
      }
    }
  }

  fn check_step(
    &mut self,
    step: &'a StepDef,
    path: &str,
    loop_vars: &mut Vec<&'a str>,
    enclosing_loop: Option<&HashSet<&'a str>>,
  ) {
    if let Some(retry) = &step.retry
      && retry.max_attempts == 0
    {
      self.error(
        format!("{path}.retry.max_attempts"),
        "max_attempts must be at least 1",
      );
    }

    for (name, value) in &step.inputs {
      self.check_value(value, &format!("{path}.inputs.{name}"), loop_vars, enclosing_loop);
    }

    match &step.kind {
      StepKind::Script { command, .. } => {
        if command.is_empty() {
          self.error(format!("{path}.command"), "script command must not be empty");
        }
      }
      StepKind::ModelInvocation {
        prompt,
        system_instruction,
        parameters,
      } => {
        self.check_expr(prompt, &format!("{path}.prompt"), loop_vars, enclosing_loop);
        if let Some(system) = system_instruction {
          self.check_expr(
            system,
            &format!("{path}.system_instruction"),
            loop_vars,
            enclosing_loop,
          );
        }
        for (name, value) in parameters {
          self.check_value(
            value,
            &format!("{path}.parameters.{name}"),
            loop_vars,
            enclosing_loop,
          );
        }
      }
      StepKind::Conditional {
        condition,
        then_steps,
        else_steps,
      } => {
        if enclosing_loop.is_some() {
          self.error(path, "conditional steps are not allowed inside loop bodies");
        }
        self.check_expr(condition, &format!("{path}.condition"), loop_vars, enclosing_loop);
        for (field, ids) in [("then_steps", then_steps), ("else_steps", else_steps)] {
          for (j, id) in ids.iter().enumerate() {
            if id == &step.id {
              self.error(
                format!("{path}.{field}[{j}]"),
                "a conditional cannot gate itself",
              );
            } else if !self.top_ids.contains(id.as_str()) {
              self.error(
                format!("{path}.{field}[{j}]"),
                format!("branch references unknown step {id:?}"),
              );
            }
          }
        }
      }
      StepKind::Loop {
        collection,
        item_var,
        steps,
        ..
      } => {
        if enclosing_loop.is_some() {
          self.error(path, "loop steps are not allowed inside loop bodies");
        }
        self.check_expr(collection, &format!("{path}.collection"), loop_vars, enclosing_loop);
        if item_var.is_empty() {
          self.error(format!("{path}.item_var"), "item_var must not be empty");
        }
        let body_ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        loop_vars.push(item_var.as_str());
        for (i, nested) in steps.iter().enumerate() {
          let nested_path = format!("{path}.steps[{i}]");
          if !nested.depends_on.is_empty() {
            self.error(
              format!("{nested_path}.depends_on"),
              "loop body steps execute in declaration order and may not declare depends_on",
            );
          }
          self.check_step(nested, &nested_path, loop_vars, Some(&body_ids));
        }
        loop_vars.pop();
      }
      StepKind::DelegatedOperation { operation } => {
        if operation.is_empty() {
          self.error(format!("{path}.operation"), "operation must not be empty");
        }
      }
    }
  }

  /// Walk a JSON value, checking every embedded string expression.
  fn check_value(
    &mut self,
    value: &Value,
    path: &str,
    loop_vars: &[&str],
    enclosing_loop: Option<&HashSet<&'a str>>,
  ) {
    match value {
      Value::String(s) => self.check_expr(s, path, loop_vars, enclosing_loop),
      Value::Array(items) => {
        for (i, item) in items.iter().enumerate() {
          self.check_value(item, &format!("{path}[{i}]"), loop_vars, enclosing_loop);
        }
      }
      Value::Object(fields) => {
        for (name, v) in fields {
          self.check_value(v, &format!("{path}.{name}"), loop_vars, enclosing_loop);
        }
      }
      _ => {}
    }
  }

  fn check_expr(
    &mut self,
    text: &str,
    path: &str,
    loop_vars: &[&str],
    enclosing_loop: Option<&HashSet<&str>>,
  ) {
    let expr = match Expr::parse(text) {
      Ok(expr) => expr,
      Err(e) => {
        self.error(path, e.to_string());
        return;
      }
    };
    for reference in expr.references() {
      self.check_reference(reference, path, loop_vars, enclosing_loop);
    }
  }

  fn check_reference(
    &mut self,
    reference: &Reference,
    path: &str,
    loop_vars: &[&str],
    enclosing_loop: Option<&HashSet<&str>>,
  ) {
    match reference.scope {
      Scope::Env => {}
      Scope::Input => {
        let Some(name) = reference.first_key() else {
          return;
        };
        if !self.def.inputs.iter().any(|i| i.name == name) {
          self.error(path, format!("reference to undeclared input {name:?}"));
        }
      }
      Scope::Loop => {
        let Some(name) = reference.first_key() else {
          return;
        };
        if !loop_vars.contains(&name) {
          self.error(path, format!("loop variable {name:?} is not in scope here"));
        }
      }
      Scope::Step => {
        let Some(id) = reference.step_id() else {
          return;
        };
        let visible = self.top_ids.contains(id)
          || enclosing_loop.is_some_and(|body| body.contains(id));
        if !visible {
          self.error(path, format!("reference to unknown step {id:?}"));
          return;
        }
        if let Some(output) = reference.step_output_name() {
          let target = self.outputs_by_id[id];
          let implicit_result =
            matches!(target.kind, StepKind::Conditional { .. }) && output == "result";
          if !implicit_result && !target.outputs.iter().any(|o| o == output) {
            self.error(
              path,
              format!("step {id:?} does not declare output {output:?}"),
            );
          }
        }
      }
    }
  }

  /// Workflow outputs may reference only declared inputs and step outputs.
  fn check_workflow_outputs(&mut self) {
    let def = self.def;
    for (name, expr_text) in &def.outputs {
      let path = format!("outputs.{name}");
      let expr = match Expr::parse(expr_text) {
        Ok(expr) => expr,
        Err(e) => {
          self.error(&path, e.to_string());
          continue;
        }
      };
      for reference in expr.references() {
        match reference.scope {
          Scope::Input | Scope::Step => {
            self.check_reference(reference, &path, &[], None);
          }
          Scope::Env | Scope::Loop => {
            self.error(
              &path,
              "workflow outputs may only reference inputs and step outputs",
            );
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse_json(def: serde_json::Value) -> Result<WorkflowDef, Vec<ValidationError>> {
    parse(&def.to_string())
  }

  fn minimal() -> serde_json::Value {
    serde_json::json!({
      "name": "demo",
      "version": "1.0.0",
      "inputs": [{ "name": "url", "required": true }],
      "steps": [
        {
          "id": "fetch",
          "type": "script",
          "command": "scripts/fetch.py",
          "inputs": { "url": "${input.url}" },
          "outputs": ["data"]
        },
        {
          "id": "summarize",
          "type": "model_invocation",
          "prompt": "Summarize: ${step.fetch.outputs.data}",
          "outputs": ["summary"]
        }
      ],
      "outputs": { "summary": "${step.summarize.outputs.summary}" }
    })
  }

  #[test]
  fn test_valid_definition_parses() {
    let def = parse_json(minimal()).unwrap();
    assert_eq!(def.name, "demo");
    assert_eq!(def.steps.len(), 2);
  }

  #[test]
  fn test_malformed_text_is_one_error() {
    let errors = parse("{ not json").unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].path, "$");
  }

  #[test]
  fn test_duplicate_step_ids_rejected() {
    let mut def = minimal();
    def["steps"][1]["id"] = "fetch".into();
    let errors = parse_json(def).unwrap_err();
    assert!(errors.iter().any(|e| e.message.contains("duplicate step id")));
  }

  #[test]
  fn test_bad_semver_rejected() {
    let mut def = minimal();
    def["version"] = "one point oh".into();
    let errors = parse_json(def).unwrap_err();
    assert!(errors.iter().any(|e| e.path == "version"));
  }

  #[test]
  fn test_unknown_depends_on_rejected() {
    let mut def = minimal();
    def["steps"][1]["depends_on"] = serde_json::json!(["missing"]);
    let errors = parse_json(def).unwrap_err();
    assert!(errors.iter().any(|e| e.path == "steps[1].depends_on[0]"));
  }

  #[test]
  fn test_undeclared_input_reference_rejected() {
    let mut def = minimal();
    def["steps"][0]["inputs"]["url"] = "${input.nope}".into();
    let errors = parse_json(def).unwrap_err();
    assert!(errors.iter().any(|e| e.message.contains("undeclared input")));
  }

  #[test]
  fn test_undeclared_step_output_rejected() {
    let mut def = minimal();
    def["steps"][1]["prompt"] = "${step.fetch.outputs.nope}".into();
    let errors = parse_json(def).unwrap_err();
    assert!(
      errors
        .iter()
        .any(|e| e.message.contains("does not declare output"))
    );
  }

  #[test]
  fn test_all_errors_reported_together() {
    let mut def = minimal();
    def["version"] = "bad".into();
    def["steps"][1]["id"] = "fetch".into();
    def["steps"][0]["inputs"]["url"] = "${input.nope}".into();
    let errors = parse_json(def).unwrap_err();
    assert!(errors.len() >= 3, "expected a batch, got {errors:?}");
  }

  #[test]
  fn test_loop_variable_scoping() {
    let def = serde_json::json!({
      "name": "loopy",
      "version": "0.1.0",
      "inputs": [{ "name": "items" }],
      "steps": [
        {
          "id": "each",
          "type": "loop",
          "collection": "${input.items}",
          "item_var": "item",
          "outputs": ["results"],
          "steps": [
            {
              "id": "work",
              "type": "delegated_operation",
              "operation": "echo",
              "inputs": { "value": "${loop.item}" },
              "outputs": ["results"]
            }
          ]
        },
        {
          "id": "after",
          "type": "delegated_operation",
          "operation": "echo",
          "inputs": { "value": "${loop.item}" }
        }
      ]
    });
    let errors = parse_json(def).unwrap_err();
    // In scope inside the body, out of scope after it.
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].path, "steps[1].inputs.value");
  }

  #[test]
  fn test_conditional_branch_must_name_existing_steps() {
    let def = serde_json::json!({
      "name": "branchy",
      "version": "0.1.0",
      "inputs": [{ "name": "flag" }],
      "steps": [
        {
          "id": "gate",
          "type": "conditional",
          "condition": "${input.flag}",
          "then_steps": ["missing"],
          "else_steps": []
        }
      ]
    });
    let errors = parse_json(def).unwrap_err();
    assert!(errors.iter().any(|e| e.path == "steps[0].then_steps[0]"));
  }

  #[test]
  fn test_conditional_result_is_implicitly_declared() {
    let def = serde_json::json!({
      "name": "branchy",
      "version": "0.1.0",
      "inputs": [{ "name": "flag" }],
      "steps": [
        {
          "id": "gate",
          "type": "conditional",
          "condition": "${input.flag}",
          "then_steps": ["note"],
          "else_steps": []
        },
        {
          "id": "note",
          "type": "delegated_operation",
          "operation": "echo",
          "inputs": { "taken": "${step.gate.outputs.result}" }
        }
      ]
    });
    parse_json(def).unwrap();
  }

  #[test]
  fn test_workflow_outputs_reject_env_scope() {
    let mut def = minimal();
    def["outputs"]["home"] = "${env.HOME}".into();
    let errors = parse_json(def).unwrap_err();
    assert!(errors.iter().any(|e| e.path == "outputs.home"));
  }

  #[test]
  fn test_nested_reference_reported_with_field_path() {
    let mut def = minimal();
    def["steps"][0]["inputs"]["url"] = "${input.${input.url}}".into();
    let errors = parse_json(def).unwrap_err();
    assert!(errors.iter().any(|e| e.path == "steps[0].inputs.url"));
  }
}
