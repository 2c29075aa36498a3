use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};

use crate::types::{ExecutionRun, RunStatus, StepRecord, StepStatus};
use crate::{Error, HistoryStore};

/// SQLite-backed history store.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Wrap an existing connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) a database file and set up the schema.
  pub async fn open(path: &std::path::Path) -> Result<Self, Error> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Create the schema if it does not exist.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::query(
      r#"
      CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        workflow_ref TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        outputs TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT
      )
      "#,
    )
    .execute(&self.pool)
    .await?;

    sqlx::query(
      r#"
      CREATE TABLE IF NOT EXISTS step_records (
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        seq INTEGER NOT NULL,
        step_id TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        resolved_inputs TEXT NOT NULL,
        outputs TEXT,
        error TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        PRIMARY KEY (run_id, seq)
      )
      "#,
    )
    .execute(&self.pool)
    .await?;

    sqlx::query(
      "CREATE INDEX IF NOT EXISTS idx_runs_workflow ON runs (workflow_ref, started_at)",
    )
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn load_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, Error> {
    let rows: Vec<StepRow> = sqlx::query_as(
      r#"
      SELECT step_id, status, attempts, resolved_inputs, outputs, error,
             started_at, completed_at
      FROM step_records
      WHERE run_id = ?
      ORDER BY seq ASC
      "#,
    )
    .bind(run_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(StepRow::into_record).collect())
  }
}

#[async_trait::async_trait]
impl HistoryStore for SqliteStore {
  async fn record_run(&self, run: &ExecutionRun) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;

    sqlx::query(
      r#"
      INSERT INTO runs (run_id, workflow_ref, status, error, outputs, started_at, completed_at)
      VALUES (?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&run.run_id)
    .bind(&run.workflow_ref)
    .bind(run.status)
    .bind(&run.error)
    .bind(Json(&run.outputs))
    .bind(run.started_at)
    .bind(run.completed_at)
    .execute(&mut *tx)
    .await?;

    for (seq, step) in run.steps.iter().enumerate() {
      sqlx::query(
        r#"
        INSERT INTO step_records
          (run_id, seq, step_id, status, attempts, resolved_inputs, outputs,
           error, started_at, completed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
      )
      .bind(&run.run_id)
      .bind(seq as i64)
      .bind(&step.step_id)
      .bind(step.status)
      .bind(step.attempts as i64)
      .bind(Json(&step.resolved_inputs))
      .bind(step.outputs.as_ref().map(Json))
      .bind(&step.error)
      .bind(step.started_at)
      .bind(step.completed_at)
      .execute(&mut *tx)
      .await?;
    }

    tx.commit().await?;
    Ok(())
  }

  async fn get_run(&self, run_id: &str) -> Result<ExecutionRun, Error> {
    let row: Option<RunRow> = sqlx::query_as(
      r#"
      SELECT run_id, workflow_ref, status, error, outputs, started_at, completed_at
      FROM runs
      WHERE run_id = ?
      "#,
    )
    .bind(run_id)
    .fetch_optional(&self.pool)
    .await?;

    let row = row.ok_or_else(|| Error::NotFound(run_id.to_string()))?;
    let steps = self.load_steps(run_id).await?;
    Ok(row.into_run(steps))
  }

  async fn get_history(&self, workflow_ref: &str, limit: u32) -> Result<Vec<ExecutionRun>, Error> {
    let rows: Vec<RunRow> = sqlx::query_as(
      r#"
      SELECT run_id, workflow_ref, status, error, outputs, started_at, completed_at
      FROM runs
      WHERE workflow_ref = ?
      ORDER BY started_at DESC
      LIMIT ?
      "#,
    )
    .bind(workflow_ref)
    .bind(limit as i64)
    .fetch_all(&self.pool)
    .await?;

    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
      let steps = self.load_steps(&row.run_id).await?;
      runs.push(row.into_run(steps));
    }
    Ok(runs)
  }
}

#[derive(FromRow)]
struct RunRow {
  run_id: String,
  workflow_ref: String,
  status: RunStatus,
  error: Option<String>,
  outputs: Json<Map<String, Value>>,
  started_at: DateTime<Utc>,
  completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
  fn into_run(self, steps: Vec<StepRecord>) -> ExecutionRun {
    ExecutionRun {
      run_id: self.run_id,
      workflow_ref: self.workflow_ref,
      status: self.status,
      error: self.error,
      outputs: self.outputs.0,
      started_at: self.started_at,
      completed_at: self.completed_at,
      steps,
    }
  }
}

#[derive(FromRow)]
struct StepRow {
  step_id: String,
  status: StepStatus,
  attempts: i64,
  resolved_inputs: Json<Value>,
  outputs: Option<Json<Value>>,
  error: Option<String>,
  started_at: DateTime<Utc>,
  completed_at: Option<DateTime<Utc>>,
}

impl StepRow {
  fn into_record(self) -> StepRecord {
    StepRecord {
      step_id: self.step_id,
      status: self.status,
      attempts: self.attempts as u32,
      resolved_inputs: self.resolved_inputs.0,
      outputs: self.outputs.map(|j| j.0),
      error: self.error,
      started_at: self.started_at,
      completed_at: self.completed_at,
    }
  }
}
