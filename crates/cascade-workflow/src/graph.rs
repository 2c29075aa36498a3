use std::collections::{HashMap, HashSet, VecDeque};

use cascade_definition::{StepDef, StepKind};
use cascade_expr::{Expr, Reference, value_refs};

use crate::error::GraphError;

/// Dependency graph over a workflow's schedulable steps.
///
/// Edges come from two places: explicit `depends_on` declarations, and
/// implicit `step.<id>` references found in step expressions. A conditional
/// also gains an edge to every step in its branch lists, since those steps
/// must wait for the condition to be evaluated.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Step ids in declaration order.
  order: Vec<String>,
  /// node -> downstream nodes.
  adjacency: HashMap<String, Vec<String>>,
  /// node -> upstream nodes.
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Nodes with no incoming edges.
  roots: Vec<String>,
}

impl Graph {
  /// Build the dependency graph, rejecting cycles and rootless graphs.
  pub fn build(steps: &[StepDef]) -> Result<Self, GraphError> {
    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();

    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let order: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();

    for id in &order {
      adjacency.entry(id.clone()).or_default();
      reverse_adjacency.entry(id.clone()).or_default();
    }

    let mut add_edge = |from: &str, to: &str| {
      if from == to || !seen.insert((from.to_string(), to.to_string())) {
        return;
      }
      adjacency
        .entry(from.to_string())
        .or_default()
        .push(to.to_string());
      reverse_adjacency
        .entry(to.to_string())
        .or_default()
        .push(from.to_string());
    };

    for step in steps {
      for dep in &step.depends_on {
        add_edge(dep, &step.id);
      }
      for reference in step_refs(step) {
        if let Some(from) = reference.step_id()
          && ids.contains(from)
        {
          add_edge(from, &step.id);
        }
      }
      if let StepKind::Conditional {
        then_steps,
        else_steps,
        ..
      } = &step.kind
      {
        for member in then_steps.iter().chain(else_steps) {
          add_edge(&step.id, member);
        }
      }
    }

    if let Some(path) = detect_cycle(&order, &adjacency) {
      return Err(GraphError::Cycle { path });
    }

    let roots: Vec<String> = order
      .iter()
      .filter(|id| reverse_adjacency[*id].is_empty())
      .cloned()
      .collect();
    if roots.is_empty() {
      return Err(GraphError::NoRoots);
    }

    Ok(Self {
      order,
      adjacency,
      reverse_adjacency,
      roots,
    })
  }

  /// Step ids in declaration order.
  pub fn order(&self) -> &[String] {
    &self.order
  }

  pub fn roots(&self) -> &[String] {
    &self.roots
  }

  pub fn downstream(&self, id: &str) -> &[String] {
    self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn upstream(&self, id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(id)
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }

  /// Every step reachable downstream from `id`, excluding `id` itself.
  pub fn descendants(&self, id: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut queue: VecDeque<&str> = self.downstream(id).iter().map(String::as_str).collect();
    while let Some(next) = queue.pop_front() {
      if out.insert(next.to_string()) {
        queue.extend(self.downstream(next).iter().map(String::as_str));
      }
    }
    out
  }

  /// Topological order via Kahn's algorithm. The graph is acyclic by
  /// construction, so this always covers every node.
  pub fn topo_sort(&self) -> Vec<String> {
    let mut indegree: HashMap<&str, usize> = self
      .order
      .iter()
      .map(|id| (id.as_str(), self.upstream(id).len()))
      .collect();
    let mut queue: VecDeque<&str> = self
      .order
      .iter()
      .map(String::as_str)
      .filter(|id| indegree[id] == 0)
      .collect();
    let mut sorted = Vec::with_capacity(self.order.len());
    while let Some(id) = queue.pop_front() {
      sorted.push(id.to_string());
      for next in self.downstream(id) {
        let entry = indegree.get_mut(next.as_str()).unwrap();
        *entry -= 1;
        if *entry == 0 {
          queue.push_back(next);
        }
      }
    }
    sorted
  }
}

/// Every reference a step's definition mentions, including those inside a
/// loop body (attributed to the loop step itself for edge purposes).
fn step_refs(step: &StepDef) -> Vec<Reference> {
  let mut refs = Vec::new();
  for value in step.inputs.values() {
    refs.extend(value_refs(value));
  }
  match &step.kind {
    StepKind::Script { .. } | StepKind::DelegatedOperation { .. } => {}
    StepKind::ModelInvocation {
      prompt,
      system_instruction,
      parameters,
    } => {
      string_refs(prompt, &mut refs);
      if let Some(system) = system_instruction {
        string_refs(system, &mut refs);
      }
      for value in parameters.values() {
        refs.extend(value_refs(value));
      }
    }
    StepKind::Conditional { condition, .. } => string_refs(condition, &mut refs),
    StepKind::Loop {
      collection, steps, ..
    } => {
      string_refs(collection, &mut refs);
      for nested in steps {
        refs.extend(step_refs(nested));
      }
    }
  }
  refs
}

fn string_refs(text: &str, refs: &mut Vec<Reference>) {
  // Unparsable strings were already rejected by validation.
  if let Ok(expr) = Expr::parse(text) {
    refs.extend(expr.references().into_iter().cloned());
  }
}

/// DFS coloring. Returns the full cycle path when one exists.
fn detect_cycle(order: &[String], adjacency: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
  #[derive(Clone, Copy, PartialEq)]
  enum Color {
    White,
    Gray,
    Black,
  }

  fn dfs<'a>(
    node: &'a str,
    adjacency: &'a HashMap<String, Vec<String>>,
    color: &mut HashMap<&'a str, Color>,
    stack: &mut Vec<&'a str>,
  ) -> Option<Vec<String>> {
    color.insert(node, Color::Gray);
    stack.push(node);

    if let Some(neighbors) = adjacency.get(node) {
      for next in neighbors {
        match color.get(next.as_str()) {
          Some(Color::Gray) => {
            // Back edge: the cycle runs from the first occurrence of
            // `next` on the stack back around to it.
            let start = stack.iter().position(|n| *n == next.as_str()).unwrap();
            let mut path: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
            path.push(next.clone());
            return Some(path);
          }
          Some(Color::White) => {
            if let Some(path) = dfs(next, adjacency, color, stack) {
              return Some(path);
            }
          }
          _ => {}
        }
      }
    }

    stack.pop();
    color.insert(node, Color::Black);
    None
  }

  let mut color: HashMap<&str, Color> = order.iter().map(|id| (id.as_str(), Color::White)).collect();
  let mut stack = Vec::new();
  for id in order {
    if color[id.as_str()] == Color::White
      && let Some(path) = dfs(id, adjacency, &mut color, &mut stack)
    {
      return Some(path);
    }
  }
  None
}
