//! Cascade execution history storage.
//!
//! The [`HistoryStore`] trait is the contract the engine needs from
//! persistence: record a terminal run, query past runs. The engine is
//! injected with a store rather than reaching for ambient global state, so
//! tests run against [`MemoryStore`] while the CLI uses [`SqliteStore`].

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{ExecutionRun, RunStatus, StepRecord, StepStatus};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Durable record of workflow runs.
#[async_trait]
pub trait HistoryStore: Send + Sync {
  /// Persist a run that has reached a terminal status.
  async fn record_run(&self, run: &ExecutionRun) -> Result<(), Error>;

  /// Fetch one run by id, including its step records.
  async fn get_run(&self, run_id: &str) -> Result<ExecutionRun, Error>;

  /// Fetch up to `limit` runs of the named workflow, most recent first.
  async fn get_history(&self, workflow_ref: &str, limit: u32) -> Result<Vec<ExecutionRun>, Error>;
}
