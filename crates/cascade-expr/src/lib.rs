//! Expression language for Cascade workflows.
//!
//! Workflow definitions embed `${...}` references inside otherwise literal
//! JSON values. This crate parses those strings into a small AST and resolves
//! them against an [`ExecutionContext`]. Resolution is pure: no clocks, no
//! I/O, no host-language eval.

mod context;
mod error;
mod expr;

pub use context::ExecutionContext;
pub use error::ExprError;
pub use expr::{Expr, Part, RefExpr, Reference, Scope, Segment, resolve_value, value_refs};
