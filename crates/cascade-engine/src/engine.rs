//! The orchestrator.
//!
//! One [`RunDriver`] exists per active run. It owns the run's
//! [`ExecutionContext`] and all bookkeeping; dispatched steps run as spawned
//! tasks that hand back a [`TaskOutcome`], so independent DAG branches
//! execute in parallel while steps within a dependency chain execute
//! strictly in sequence. The readiness loop itself never blocks on a step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cascade_definition::{InputDef, StepDef, StepKind, ValueType, WorkflowDef};
use cascade_executors::{
  ApprovalGate, DelegatedExecutor, ModelExecutor, ScriptExecutor, StepError,
};
use cascade_expr::{ExecutionContext, Expr, ExprError};
use cascade_store::{ExecutionRun, HistoryStore, RunStatus, StepRecord, StepStatus};
use cascade_workflow::Workflow;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::retry::RetryPolicy;
use crate::runner::{self, Executors, LoopWork, TaskOutcome, Work};

/// The workflow execution engine. Cheap to share behind an `Arc`; each
/// `execute` call drives one independent run.
pub struct Engine {
  store: Arc<dyn HistoryStore>,
  executors: Arc<Executors>,
  gate: Arc<dyn ApprovalGate>,
  events: EventBus,
  env: Option<HashMap<String, String>>,
}

impl Engine {
  pub fn new(store: Arc<dyn HistoryStore>, config: EngineConfig) -> Self {
    let executors = Executors {
      script: ScriptExecutor::with_default_timeout(config.script_timeout),
      model: ModelExecutor::new(config.model),
      delegated: DelegatedExecutor::new(config.operations),
    };
    Self {
      store,
      executors: Arc::new(executors),
      gate: config.approvals,
      events: EventBus::new(),
      env: config.env,
    }
  }

  /// Subscribe to a run's lifecycle events. Safe to call before
  /// [`Engine::execute_with_run_id`] starts the run.
  pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<EngineEvent> {
    self.events.subscribe(run_id)
  }

  /// Execute a workflow with a fresh run id.
  pub async fn execute(
    &self,
    workflow: &Workflow,
    inputs: Map<String, Value>,
    cancel: CancellationToken,
  ) -> Result<ExecutionRun, EngineError> {
    let run_id = uuid::Uuid::new_v4().to_string();
    self.execute_with_run_id(workflow, run_id, inputs, cancel).await
  }

  /// Execute a workflow under a caller-chosen run id.
  ///
  /// The returned run is terminal and already recorded in the history
  /// store. A run whose steps failed is an `Ok` result with a failed
  /// status; `Err` means the run could not start or could not be recorded.
  #[instrument(skip_all, fields(workflow = %workflow.name(), run_id = %run_id))]
  pub async fn execute_with_run_id(
    &self,
    workflow: &Workflow,
    run_id: String,
    inputs: Map<String, Value>,
    cancel: CancellationToken,
  ) -> Result<ExecutionRun, EngineError> {
    let inputs = ingest_inputs(workflow.def(), inputs)?;
    let env = match &self.env {
      Some(env) => env.clone(),
      None => std::env::vars().collect(),
    };

    let mut driver = RunDriver {
      engine: self,
      workflow,
      run_id,
      cancel,
      ctx: ExecutionContext::new(inputs, env),
      outcomes: HashMap::new(),
      branch_untaken: HashSet::new(),
      in_flight: HashMap::new(),
      records: Vec::new(),
      record_index: HashMap::new(),
      fatal: None,
      started_at: Utc::now(),
    };
    let run = driver.run().await?;

    self.store.record_run(&run).await?;
    self.events.close(&run.run_id);
    Ok(run)
  }
}

/// Apply declared defaults and check provided inputs against the
/// declarations. Undeclared extra inputs pass through untouched.
fn ingest_inputs(
  def: &WorkflowDef,
  mut provided: Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
  let mut missing = Vec::new();
  for input in &def.inputs {
    match provided.get(&input.name) {
      Some(value) => check_input_type(input, value)?,
      None => {
        if let Some(default) = &input.default {
          provided.insert(input.name.clone(), default.clone());
        } else if input.required {
          missing.push(input.name.clone());
        }
      }
    }
  }
  if !missing.is_empty() {
    return Err(EngineError::MissingInputs { names: missing });
  }
  Ok(provided)
}

fn check_input_type(input: &InputDef, value: &Value) -> Result<(), EngineError> {
  let (ok, expected) = match input.value_type {
    ValueType::String => (value.is_string(), "string"),
    ValueType::Number => (value.is_number(), "number"),
    ValueType::Boolean => (value.is_boolean(), "boolean"),
    ValueType::Object => (value.is_object(), "object"),
    ValueType::Array => (value.is_array(), "array"),
  };
  if ok {
    Ok(())
  } else {
    Err(EngineError::InputType {
      name: input.name.clone(),
      expected,
    })
  }
}

/// Terminal outcome of one scheduled step, as the readiness loop sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
  Succeeded,
  Failed,
  Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
  BranchNotTaken,
  UpstreamFailed,
  RunAborted,
  RunCancelled,
}

impl SkipReason {
  fn as_str(&self) -> &'static str {
    match self {
      Self::BranchNotTaken => "branch not taken",
      Self::UpstreamFailed => "upstream failure",
      Self::RunAborted => "run failed before dispatch",
      Self::RunCancelled => "run cancelled",
    }
  }
}

/// Drives one run to a terminal state.
struct RunDriver<'a> {
  engine: &'a Engine,
  workflow: &'a Workflow,
  run_id: String,
  cancel: CancellationToken,
  ctx: ExecutionContext,
  outcomes: HashMap<String, Outcome>,
  branch_untaken: HashSet<String>,
  /// Dispatch instant per in-flight step, for duration reporting.
  in_flight: HashMap<String, DateTime<Utc>>,
  records: Vec<StepRecord>,
  record_index: HashMap<String, usize>,
  /// First fatal step error; once set, nothing new dispatches.
  fatal: Option<String>,
  started_at: DateTime<Utc>,
}

impl RunDriver<'_> {
  async fn run(&mut self) -> Result<ExecutionRun, EngineError> {
    self.emit(EngineEvent::RunStarted {
      run_id: self.run_id.clone(),
      workflow: self.workflow.name().to_string(),
    });

    let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();
    loop {
      if self.fatal.is_none() && !self.cancel.is_cancelled() {
        self.dispatch_ready(&mut join_set);
      }
      // In-flight siblings always finish before the final status is
      // computed, including after a failure or cancellation.
      let Some(joined) = join_set.join_next().await else {
        break;
      };
      let outcome = joined.map_err(|e| EngineError::Join {
        message: e.to_string(),
      })?;
      self.finish_step(outcome);
    }

    Ok(self.finalize())
  }

  /// Dispatch every step whose predecessors are all terminal, repeating
  /// until no inline progress (conditional evaluation, skip propagation)
  /// unlocks anything further.
  fn dispatch_ready(&mut self, join_set: &mut JoinSet<TaskOutcome>) {
    loop {
      let mut progressed = false;
      for step_id in self.workflow.graph().order().to_vec() {
        if self.fatal.is_some() || self.cancel.is_cancelled() {
          return;
        }
        if self.outcomes.contains_key(&step_id) || self.in_flight.contains_key(&step_id) {
          continue;
        }
        let upstream = self.workflow.graph().upstream(&step_id).to_vec();
        if !upstream.iter().all(|u| self.outcomes.contains_key(u)) {
          continue;
        }

        progressed = true;
        if let Some(reason) = self.skip_reason(&step_id, &upstream) {
          self.mark_skipped(&step_id, reason);
          continue;
        }

        let step = self
          .workflow
          .step(&step_id)
          .expect("graph order names a known step")
          .clone();
        match &step.kind {
          StepKind::Conditional {
            condition,
            then_steps,
            else_steps,
          } => self.dispatch_conditional(&step, condition, then_steps, else_steps),
          _ => self.dispatch_task(&step, join_set),
        }
      }
      if !progressed {
        return;
      }
    }
  }

  /// Whether a ready step must be skipped instead of dispatched.
  ///
  /// Any failed (or failure-skipped) predecessor poisons the step. A step
  /// on an untaken conditional branch is skipped, and that skip propagates
  /// to steps whose every predecessor was branch-skipped; a join with at
  /// least one succeeded predecessor still runs.
  fn skip_reason(&self, step_id: &str, upstream: &[String]) -> Option<SkipReason> {
    let poisoned = upstream.iter().any(|u| {
      matches!(
        self.outcomes.get(u),
        Some(Outcome::Failed) | Some(Outcome::Skipped(SkipReason::UpstreamFailed))
      )
    });
    if poisoned {
      return Some(SkipReason::UpstreamFailed);
    }
    if self.branch_untaken.contains(step_id) {
      return Some(SkipReason::BranchNotTaken);
    }
    if !upstream.is_empty()
      && upstream.iter().all(|u| {
        matches!(
          self.outcomes.get(u),
          Some(Outcome::Skipped(SkipReason::BranchNotTaken))
        )
      })
    {
      return Some(SkipReason::BranchNotTaken);
    }
    None
  }

  /// Conditionals are evaluated inline: they only decide which branch's
  /// steps stay eligible, publishing the decision as an implicit `result`
  /// output.
  fn dispatch_conditional(
    &mut self,
    step: &StepDef,
    condition: &str,
    then_steps: &[String],
    else_steps: &[String],
  ) {
    let started_at = Utc::now();
    self.new_record(&step.id, Value::Null);
    self.emit(EngineEvent::StepStarted {
      run_id: self.run_id.clone(),
      step_id: step.id.clone(),
    });

    match runner::resolve_condition(condition, &self.ctx) {
      Ok(taken) => {
        let untaken = if taken { else_steps } else { then_steps };
        for id in untaken {
          self.branch_untaken.insert(id.clone());
        }
        let mut outputs = Map::new();
        outputs.insert("result".to_string(), Value::Bool(taken));
        self.ctx.insert_step_outputs(step.id.clone(), outputs.clone());
        self.finish_record(
          &step.id,
          StepStatus::Succeeded,
          1,
          Some(Value::Object(outputs.clone())),
          None,
        );
        self.outcomes.insert(step.id.clone(), Outcome::Succeeded);
        self.emit(EngineEvent::StepSucceeded {
          run_id: self.run_id.clone(),
          step_id: step.id.clone(),
          outputs: Value::Object(outputs),
          duration_ms: duration_ms(started_at),
        });
      }
      Err(e) => self.fail_step(&step.id, 1, &e),
    }
  }

  /// Resolve a step's inputs, package its work unit, and spawn it.
  fn dispatch_task(&mut self, step: &StepDef, join_set: &mut JoinSet<TaskOutcome>) {
    let resolved = match runner::resolve_inputs(&step.inputs, &self.ctx) {
      Ok(resolved) => resolved,
      Err(e) => {
        self.new_record(&step.id, Value::Null);
        self.emit(EngineEvent::StepStarted {
          run_id: self.run_id.clone(),
          step_id: step.id.clone(),
        });
        self.fail_step(&step.id, 0, &e);
        return;
      }
    };

    self.new_record(&step.id, Value::Object(resolved.clone()));
    self.emit(EngineEvent::StepStarted {
      run_id: self.run_id.clone(),
      step_id: step.id.clone(),
    });

    let work = match &step.kind {
      StepKind::Loop {
        collection,
        item_var,
        steps,
        failure_mode,
      } => match runner::resolve_collection(collection, &self.ctx) {
        Ok(items) => Work::Loop(LoopWork {
          ctx: self.ctx.clone(),
          item_var: item_var.clone(),
          items,
          steps: steps.clone(),
          failure_mode: *failure_mode,
          outputs: step.outputs.clone(),
        }),
        Err(e) => {
          self.fail_step(&step.id, 0, &e);
          return;
        }
      },
      _ => match runner::build_work(step, &self.ctx, &resolved) {
        Ok(work) => work,
        Err(e) => {
          self.fail_step(&step.id, 0, &e);
          return;
        }
      },
    };

    let policy = RetryPolicy::from_def(step.retry.as_ref());
    self.in_flight.insert(step.id.clone(), Utc::now());
    join_set.spawn(runner::run_dispatched(
      self.engine.executors.clone(),
      self.engine.gate.clone(),
      self.engine.events.clone(),
      self.run_id.clone(),
      step.id.clone(),
      step.requires_approval,
      Value::Object(resolved),
      policy,
      work,
      self.cancel.clone(),
    ));
  }

  fn finish_step(&mut self, outcome: TaskOutcome) {
    let started_at = self
      .in_flight
      .remove(&outcome.step_id)
      .unwrap_or_else(Utc::now);
    let step_id = outcome.step_id;

    match outcome.result {
      Ok(outputs) => {
        self.ctx.insert_step_outputs(step_id.clone(), outputs.clone());
        self.finish_record(
          &step_id,
          StepStatus::Succeeded,
          outcome.attempts,
          Some(Value::Object(outputs.clone())),
          None,
        );
        self.outcomes.insert(step_id.clone(), Outcome::Succeeded);
        self.emit(EngineEvent::StepSucceeded {
          run_id: self.run_id.clone(),
          step_id,
          outputs: Value::Object(outputs),
          duration_ms: duration_ms(started_at),
        });
      }
      Err(StepError::Cancelled) if self.cancel.is_cancelled() => {
        self.finish_record(
          &step_id,
          StepStatus::Skipped,
          outcome.attempts,
          None,
          Some("run cancelled".to_string()),
        );
        self
          .outcomes
          .insert(step_id.clone(), Outcome::Skipped(SkipReason::RunCancelled));
        self.emit(EngineEvent::StepSkipped {
          run_id: self.run_id.clone(),
          step_id,
          reason: SkipReason::RunCancelled.as_str().to_string(),
        });
      }
      Err(e) => self.fail_step(&step_id, outcome.attempts, &e),
    }
  }

  fn fail_step(&mut self, step_id: &str, attempts: u32, error: &StepError) {
    self.finish_record(
      step_id,
      StepStatus::Failed,
      attempts,
      None,
      Some(error.to_string()),
    );
    self.outcomes.insert(step_id.to_string(), Outcome::Failed);
    self.emit(EngineEvent::StepFailed {
      run_id: self.run_id.clone(),
      step_id: step_id.to_string(),
      error: error.to_string(),
    });
    if self.fatal.is_none() {
      self.fatal = Some(format!("step {step_id}: {error}"));
    }
  }

  fn mark_skipped(&mut self, step_id: &str, reason: SkipReason) {
    let now = Utc::now();
    self.record_index.insert(step_id.to_string(), self.records.len());
    self.records.push(StepRecord {
      step_id: step_id.to_string(),
      status: StepStatus::Skipped,
      attempts: 0,
      resolved_inputs: Value::Null,
      outputs: None,
      error: Some(reason.as_str().to_string()),
      started_at: now,
      completed_at: Some(now),
    });
    self
      .outcomes
      .insert(step_id.to_string(), Outcome::Skipped(reason));
    self.emit(EngineEvent::StepSkipped {
      run_id: self.run_id.clone(),
      step_id: step_id.to_string(),
      reason: reason.as_str().to_string(),
    });
  }

  /// Every dispatched step is terminal; settle the rest and compute the
  /// run's final status.
  fn finalize(&mut self) -> ExecutionRun {
    let cancelled = self.fatal.is_none() && self.cancel.is_cancelled();

    let failed_descendants: HashSet<String> = self
      .outcomes
      .iter()
      .filter(|(_, outcome)| matches!(outcome, Outcome::Failed))
      .flat_map(|(id, _)| self.workflow.graph().descendants(id))
      .collect();
    for step_id in self.workflow.graph().order().to_vec() {
      if self.outcomes.contains_key(&step_id) {
        continue;
      }
      let reason = if cancelled {
        SkipReason::RunCancelled
      } else if failed_descendants.contains(&step_id) {
        SkipReason::UpstreamFailed
      } else {
        SkipReason::RunAborted
      };
      self.mark_skipped(&step_id, reason);
    }

    let (status, error, outputs) = if let Some(error) = self.fatal.clone() {
      (RunStatus::Failed, Some(error), Map::new())
    } else if cancelled {
      (RunStatus::Cancelled, None, Map::new())
    } else {
      match self.resolve_workflow_outputs() {
        Ok(outputs) => (RunStatus::Succeeded, None, outputs),
        Err(e) => (RunStatus::Failed, Some(format!("workflow outputs: {e}")), Map::new()),
      }
    };

    match (&status, &error) {
      (RunStatus::Succeeded, _) => self.emit(EngineEvent::RunSucceeded {
        run_id: self.run_id.clone(),
        outputs: Value::Object(outputs.clone()),
      }),
      (RunStatus::Cancelled, _) => self.emit(EngineEvent::RunCancelled {
        run_id: self.run_id.clone(),
      }),
      (_, error) => self.emit(EngineEvent::RunFailed {
        run_id: self.run_id.clone(),
        error: error.clone().unwrap_or_default(),
      }),
    }

    ExecutionRun {
      run_id: self.run_id.clone(),
      workflow_ref: self.workflow.name().to_string(),
      status,
      error,
      outputs,
      started_at: self.started_at,
      completed_at: Some(Utc::now()),
      steps: self.records.clone(),
    }
  }

  fn resolve_workflow_outputs(&self) -> Result<Map<String, Value>, ExprError> {
    let mut outputs = Map::new();
    for (name, expr) in &self.workflow.def().outputs {
      outputs.insert(name.clone(), Expr::parse(expr)?.resolve(&self.ctx)?);
    }
    Ok(outputs)
  }

  fn new_record(&mut self, step_id: &str, resolved_inputs: Value) {
    self.record_index.insert(step_id.to_string(), self.records.len());
    self.records.push(StepRecord {
      step_id: step_id.to_string(),
      status: StepStatus::Running,
      attempts: 0,
      resolved_inputs,
      outputs: None,
      error: None,
      started_at: Utc::now(),
      completed_at: None,
    });
  }

  fn finish_record(
    &mut self,
    step_id: &str,
    status: StepStatus,
    attempts: u32,
    outputs: Option<Value>,
    error: Option<String>,
  ) {
    if let Some(&i) = self.record_index.get(step_id) {
      let record = &mut self.records[i];
      record.status = status;
      record.attempts = attempts;
      record.outputs = outputs;
      record.error = error;
      record.completed_at = Some(Utc::now());
    }
  }

  fn emit(&self, event: EngineEvent) {
    self.engine.events.emit(&self.run_id, event);
  }
}

fn duration_ms(started_at: DateTime<Utc>) -> u64 {
  (Utc::now() - started_at).num_milliseconds().max(0) as u64
}
