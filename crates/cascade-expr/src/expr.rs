//! Expression AST and parser.
//!
//! Grammar: a field value is either a plain literal, a whole-value reference
//! (`"${step.fetch.outputs.data}"`), or an interpolation mixing literal text
//! with one or more references (`"Summarize: ${step.fetch.outputs.data}"`).
//! A reference is `scope.segment(.segment|[index])*` with an optional
//! `|| <json literal>` default. References inside references are rejected.

use std::fmt;

use serde_json::{Map, Value};

use crate::context::ExecutionContext;
use crate::error::ExprError;

/// The four reference scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
  Input,
  Step,
  Env,
  Loop,
}

impl Scope {
  fn parse(s: &str) -> Option<Self> {
    match s {
      "input" => Some(Self::Input),
      "step" => Some(Self::Step),
      "env" => Some(Self::Env),
      "loop" => Some(Self::Loop),
      _ => None,
    }
  }

  fn as_str(&self) -> &'static str {
    match self {
      Self::Input => "input",
      Self::Step => "step",
      Self::Env => "env",
      Self::Loop => "loop",
    }
  }
}

/// One path segment: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
  Key(String),
  Index(usize),
}

/// A parsed reference path, e.g. `step.fetch.outputs.items[0]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
  pub scope: Scope,
  pub segments: Vec<Segment>,
}

impl Reference {
  /// The first path segment, when it is a key. This is the input name, step
  /// id, environment variable, or loop variable the reference starts from.
  pub fn first_key(&self) -> Option<&str> {
    match self.segments.first() {
      Some(Segment::Key(k)) => Some(k),
      _ => None,
    }
  }

  /// For step-scope references, the id of the referenced step.
  pub fn step_id(&self) -> Option<&str> {
    if self.scope != Scope::Step {
      return None;
    }
    match self.segments.first() {
      Some(Segment::Key(id)) => Some(id),
      _ => None,
    }
  }

  /// For step-scope references shaped `step.<id>.outputs.<name>...`, the
  /// referenced output name.
  pub fn step_output_name(&self) -> Option<&str> {
    if self.scope != Scope::Step {
      return None;
    }
    match (self.segments.get(1), self.segments.get(2)) {
      (Some(Segment::Key(k)), Some(Segment::Key(name))) if k == "outputs" => Some(name),
      _ => None,
    }
  }

  fn lookup(&self, ctx: &ExecutionContext) -> Option<Value> {
    match self.scope {
      Scope::Input => {
        let Some(Segment::Key(name)) = self.segments.first() else {
          return None;
        };
        navigate(ctx.input(name)?, &self.segments[1..])
      }
      Scope::Step => {
        let Some(Segment::Key(step_id)) = self.segments.first() else {
          return None;
        };
        let outputs = ctx.step_outputs(step_id)?;
        match self.segments.get(1) {
          Some(Segment::Key(k)) if k == "outputs" => match self.segments.get(2) {
            None => Some(Value::Object(outputs.clone())),
            Some(Segment::Key(name)) => navigate(outputs.get(name)?, &self.segments[3..]),
            Some(Segment::Index(_)) => None,
          },
          _ => None,
        }
      }
      Scope::Env => {
        let Some(Segment::Key(name)) = self.segments.first() else {
          return None;
        };
        if self.segments.len() > 1 {
          return None;
        }
        ctx.env().get(name).map(|v| Value::String(v.clone()))
      }
      Scope::Loop => {
        let Some(Segment::Key(name)) = self.segments.first() else {
          return None;
        };
        navigate(ctx.loop_var(name)?, &self.segments[1..])
      }
    }
  }
}

impl fmt::Display for Reference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.scope.as_str())?;
    for segment in &self.segments {
      match segment {
        Segment::Key(k) => write!(f, ".{k}")?,
        Segment::Index(i) => write!(f, "[{i}]")?,
      }
    }
    Ok(())
  }
}

/// A reference with its optional `||` default.
#[derive(Debug, Clone, PartialEq)]
pub struct RefExpr {
  pub reference: Reference,
  pub default: Option<Value>,
}

impl RefExpr {
  fn resolve(&self, ctx: &ExecutionContext) -> Result<Value, ExprError> {
    match self.reference.lookup(ctx) {
      Some(value) => Ok(value),
      None => match &self.default {
        Some(default) => Ok(default.clone()),
        None => Err(ExprError::Unresolved {
          reference: self.reference.to_string(),
        }),
      },
    }
  }
}

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
  Text(String),
  Reference(RefExpr),
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  /// No `${...}` present; resolves to itself.
  Literal(Value),
  /// The entire value is exactly one reference; resolution preserves the
  /// referenced value's type.
  Reference(RefExpr),
  /// Literal text with embedded references; resolution always produces a
  /// string.
  Interpolation(Vec<Part>),
}

impl Expr {
  /// Parse a string field into an expression.
  pub fn parse(input: &str) -> Result<Self, ExprError> {
    let mut parts: Vec<Part> = Vec::new();
    let mut cursor = 0;

    while let Some(found) = input[cursor..].find("${") {
      let start = cursor + found;
      if start > cursor {
        parts.push(Part::Text(input[cursor..start].to_string()));
      }
      let body_start = start + 2;
      let Some(close) = input[body_start..].find('}') else {
        return Err(ExprError::Unterminated {
          input: input.to_string(),
        });
      };
      let body = &input[body_start..body_start + close];
      if body.contains("${") {
        return Err(ExprError::Nested {
          input: input.to_string(),
        });
      }
      parts.push(Part::Reference(parse_ref(body)?));
      cursor = body_start + close + 1;
    }

    if parts.is_empty() {
      return Ok(Self::Literal(Value::String(input.to_string())));
    }
    if cursor < input.len() {
      parts.push(Part::Text(input[cursor..].to_string()));
    }

    match parts.as_slice() {
      [Part::Reference(r)] => Ok(Self::Reference(r.clone())),
      _ => Ok(Self::Interpolation(parts)),
    }
  }

  /// All references mentioned by this expression.
  pub fn references(&self) -> Vec<&Reference> {
    match self {
      Self::Literal(_) => Vec::new(),
      Self::Reference(r) => vec![&r.reference],
      Self::Interpolation(parts) => parts
        .iter()
        .filter_map(|part| match part {
          Part::Reference(r) => Some(&r.reference),
          Part::Text(_) => None,
        })
        .collect(),
    }
  }

  /// Resolve against a context. Deterministic: an unchanged context always
  /// yields the same value.
  pub fn resolve(&self, ctx: &ExecutionContext) -> Result<Value, ExprError> {
    match self {
      Self::Literal(value) => Ok(value.clone()),
      Self::Reference(r) => r.resolve(ctx),
      Self::Interpolation(parts) => {
        let mut out = String::new();
        for part in parts {
          match part {
            Part::Text(text) => out.push_str(text),
            Part::Reference(r) => out.push_str(&stringify(&r.resolve(ctx)?)),
          }
        }
        Ok(Value::String(out))
      }
    }
  }
}

/// Resolve every string inside a JSON value, recursing through objects and
/// arrays. Non-string leaves pass through unchanged.
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Result<Value, ExprError> {
  match value {
    Value::String(s) => Expr::parse(s)?.resolve(ctx),
    Value::Array(items) => {
      let resolved: Result<Vec<_>, _> = items.iter().map(|v| resolve_value(v, ctx)).collect();
      Ok(Value::Array(resolved?))
    }
    Value::Object(fields) => {
      let mut resolved = Map::new();
      for (key, v) in fields {
        resolved.insert(key.clone(), resolve_value(v, ctx)?);
      }
      Ok(Value::Object(resolved))
    }
    _ => Ok(value.clone()),
  }
}

/// Collect every reference mentioned anywhere inside a JSON value. Strings
/// that fail to parse contribute nothing; validation reports those
/// separately.
pub fn value_refs(value: &Value) -> Vec<Reference> {
  let mut refs = Vec::new();
  collect_refs(value, &mut refs);
  refs
}

fn collect_refs(value: &Value, refs: &mut Vec<Reference>) {
  match value {
    Value::String(s) => {
      if let Ok(expr) = Expr::parse(s) {
        refs.extend(expr.references().into_iter().cloned());
      }
    }
    Value::Array(items) => {
      for item in items {
        collect_refs(item, refs);
      }
    }
    Value::Object(fields) => {
      for v in fields.values() {
        collect_refs(v, refs);
      }
    }
    _ => {}
  }
}

/// Canonical text form used for interpolation: strings verbatim, scalars via
/// their display form, objects and arrays as compact JSON.
fn stringify(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn navigate(root: &Value, segments: &[Segment]) -> Option<Value> {
  let mut current = root;
  for segment in segments {
    current = match segment {
      Segment::Key(k) => current.get(k.as_str())?,
      Segment::Index(i) => current.get(i)?,
    };
  }
  Some(current.clone())
}

fn parse_ref(body: &str) -> Result<RefExpr, ExprError> {
  let body = body.trim();
  let (path, default) = match body.find("||") {
    Some(at) => {
      let literal = body[at + 2..].trim();
      let default = serde_json::from_str(literal).map_err(|e| ExprError::BadDefault {
        literal: literal.to_string(),
        message: e.to_string(),
      })?;
      (body[..at].trim(), Some(default))
    }
    None => (body, None),
  };

  let (scope, segments) = parse_path(path)?;
  Ok(RefExpr {
    reference: Reference { scope, segments },
    default,
  })
}

fn parse_path(path: &str) -> Result<(Scope, Vec<Segment>), ExprError> {
  let syntax = |message: &str| ExprError::Syntax {
    reference: path.to_string(),
    message: message.to_string(),
  };

  let mut pieces = path.split('.');
  let scope_str = pieces.next().unwrap_or_default();
  let scope = Scope::parse(scope_str).ok_or_else(|| ExprError::UnknownScope {
    scope: scope_str.to_string(),
  })?;

  let mut segments = Vec::new();
  for piece in pieces {
    let (name, mut rest) = match piece.find('[') {
      Some(at) => (&piece[..at], &piece[at..]),
      None => (piece, ""),
    };
    if name.is_empty() && rest.is_empty() {
      return Err(syntax("empty path segment"));
    }
    if !name.is_empty() {
      if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(syntax("segment names may only contain alphanumerics, '_' and '-'"));
      }
      segments.push(Segment::Key(name.to_string()));
    }
    while !rest.is_empty() {
      let Some(end) = rest.find(']') else {
        return Err(syntax("unterminated index"));
      };
      let index: usize = rest[1..end]
        .parse()
        .map_err(|_| syntax("index must be a non-negative integer"))?;
      segments.push(Segment::Index(index));
      rest = &rest[end + 1..];
      if !rest.is_empty() && !rest.starts_with('[') {
        return Err(syntax("unexpected characters after index"));
      }
    }
  }

  if segments.is_empty() {
    return Err(syntax("missing path after scope"));
  }
  Ok((scope, segments))
}
