use thiserror::Error;

/// Errors produced while parsing or resolving expressions.
///
/// Every variant except [`ExprError::Unresolved`] is a parse-time error and
/// should be caught by definition validation before a run starts. An
/// `Unresolved` error at run time means the workflow's logic is wrong (a
/// referenced value was never produced), so callers must not retry it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
  #[error("unterminated '${{' in {input:?}")]
  Unterminated { input: String },

  #[error("nested reference in {input:?} (flat substitution only)")]
  Nested { input: String },

  #[error("unknown scope {scope:?} (expected input, step, env, or loop)")]
  UnknownScope { scope: String },

  #[error("invalid reference {reference:?}: {message}")]
  Syntax { reference: String, message: String },

  #[error("invalid default literal {literal:?}: {message}")]
  BadDefault { literal: String, message: String },

  #[error("unresolved reference {reference}")]
  Unresolved { reference: String },
}
