use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::ExecutionRun;
use crate::{Error, HistoryStore};

/// In-memory history store for tests and embedders that do not want
/// persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
  runs: Mutex<Vec<ExecutionRun>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl HistoryStore for MemoryStore {
  async fn record_run(&self, run: &ExecutionRun) -> Result<(), Error> {
    self.runs.lock().unwrap().push(run.clone());
    Ok(())
  }

  async fn get_run(&self, run_id: &str) -> Result<ExecutionRun, Error> {
    self
      .runs
      .lock()
      .unwrap()
      .iter()
      .find(|r| r.run_id == run_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(run_id.to_string()))
  }

  async fn get_history(&self, workflow_ref: &str, limit: u32) -> Result<Vec<ExecutionRun>, Error> {
    let runs = self.runs.lock().unwrap();
    let mut matching: Vec<ExecutionRun> = runs
      .iter()
      .filter(|r| r.workflow_ref == workflow_ref)
      .cloned()
      .collect();
    matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    matching.truncate(limit as usize);
    Ok(matching)
  }
}
