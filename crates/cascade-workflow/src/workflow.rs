use std::collections::HashMap;

use cascade_definition::{StepDef, ValidationError, WorkflowDef};

use crate::graph::Graph;

/// A fully validated workflow, ready for execution.
#[derive(Debug, Clone)]
pub struct Workflow {
  def: WorkflowDef,
  version: semver::Version,
  graph: Graph,
  index: HashMap<String, usize>,
}

impl Workflow {
  /// Parse and validate definition text end to end.
  ///
  /// Runs the definition validator and graph construction over the same
  /// deserialized definition; a cycle or rootless graph joins the same
  /// batch of validation errors, so the caller sees every problem at once
  /// and nothing ever executes against a broken definition. Only malformed
  /// JSON short-circuits, as a single-error batch.
  pub fn parse(text: &str) -> Result<Self, Vec<ValidationError>> {
    let def: WorkflowDef = serde_json::from_str(text)
      .map_err(|e| vec![ValidationError::new("$", format!("malformed definition: {e}"))])?;
    Self::from_def(def)
  }

  /// Build a workflow from an already-deserialized definition. The single
  /// validation entry point: both the definition validator and the graph
  /// builder run here, exactly once.
  pub fn from_def(def: WorkflowDef) -> Result<Self, Vec<ValidationError>> {
    let mut errors = cascade_definition::validate(&def);
    let graph = match Graph::build(&def.steps) {
      Ok(graph) => Some(graph),
      Err(e) => {
        errors.push(ValidationError::new("steps", e.to_string()));
        None
      }
    };
    if !errors.is_empty() {
      return Err(errors);
    }
    let graph = graph.expect("graph built when no errors");

    let version = semver::Version::parse(&def.version).expect("version validated");
    let index = def
      .steps
      .iter()
      .enumerate()
      .map(|(i, s)| (s.id.clone(), i))
      .collect();

    Ok(Self {
      def,
      version,
      graph,
      index,
    })
  }

  pub fn name(&self) -> &str {
    &self.def.name
  }

  pub fn version(&self) -> &semver::Version {
    &self.version
  }

  pub fn def(&self) -> &WorkflowDef {
    &self.def
  }

  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// Schedulable (top-level) steps in declaration order.
  pub fn steps(&self) -> &[StepDef] {
    &self.def.steps
  }

  /// Look up a schedulable step by id.
  pub fn step(&self, id: &str) -> Option<&StepDef> {
    self.index.get(id).map(|i| &self.def.steps[*i])
  }
}
