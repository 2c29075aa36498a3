use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
  /// A dependency cycle was found; the path lists the step ids around the
  /// cycle, ending where it started.
  #[error("dependency cycle: {}", path.join(" -> "))]
  Cycle { path: Vec<String> },

  /// Every step depends on another step, so nothing can ever start.
  #[error("workflow has no root steps (every step depends on another)")]
  NoRoots,
}
