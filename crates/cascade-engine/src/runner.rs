//! Dispatched-step execution.
//!
//! The engine resolves a step's expressions on its own thread of control,
//! packages the result as a [`Work`] unit, and spawns [`run_dispatched`]
//! onto the runtime. The spawned task owns the retry loop and, for loop
//! steps, the per-iteration scoping.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cascade_definition::{LoopFailureMode, StepDef, StepKind};
use cascade_executors::{
  Approval, ApprovalGate, DelegatedExecutor, ModelExecutor, ScriptExecutor, ScriptRequest,
  StepError, evaluate_condition,
};
use cascade_expr::{ExecutionContext, Expr, ExprError, resolve_value};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{EngineEvent, EventBus};
use crate::retry::RetryPolicy;

/// The executors shared by every run of one engine.
#[derive(Clone)]
pub(crate) struct Executors {
  pub script: ScriptExecutor,
  pub model: ModelExecutor,
  pub delegated: DelegatedExecutor,
}

/// A step's pre-resolved work unit. Everything an attempt needs is owned
/// here, so the spawned task never touches the run's live context.
pub(crate) enum Work {
  Script(ScriptRequest),
  Model {
    system_instruction: Option<String>,
    prompt: String,
    parameters: Map<String, Value>,
    outputs: Vec<String>,
    timeout: Option<Duration>,
  },
  Delegated {
    operation: String,
    inputs: Map<String, Value>,
    outputs: Vec<String>,
    timeout: Option<Duration>,
  },
  Loop(LoopWork),
}

/// Snapshot for a loop step: the materialized collection and a clone of the
/// context as it stood at dispatch. Later top-level mutations never reach an
/// in-flight loop.
pub(crate) struct LoopWork {
  pub ctx: ExecutionContext,
  pub item_var: String,
  pub items: Vec<Value>,
  pub steps: Vec<StepDef>,
  pub failure_mode: LoopFailureMode,
  pub outputs: Vec<String>,
}

/// What a spawned step task reports back to the engine.
pub(crate) struct TaskOutcome {
  pub step_id: String,
  pub attempts: u32,
  pub result: Result<Map<String, Value>, StepError>,
}

/// Run one dispatched step to a terminal result, applying the retry policy.
///
/// Only execution-class failures retry; runtime-class failures and
/// cancellation surface immediately. The final failure is the original
/// error, not a wrapper.
pub(crate) async fn run_dispatched(
  executors: Arc<Executors>,
  gate: Arc<dyn ApprovalGate>,
  events: EventBus,
  run_id: String,
  step_id: String,
  requires_approval: bool,
  preview: Value,
  policy: RetryPolicy,
  work: Work,
  cancel: CancellationToken,
) -> TaskOutcome {
  let mut attempt: u32 = 1;
  let result = loop {
    let attempt_result = async {
      if requires_approval {
        match gate.request_approval(&run_id, &step_id, &preview).await {
          Approval::Granted => {}
          Approval::Denied => return Err(StepError::ApprovalDenied),
        }
      }
      perform_work(&executors, &work, &cancel).await
    }
    .await;

    match attempt_result {
      Ok(outputs) => break Ok(outputs),
      Err(e) if e.is_retryable() && attempt < policy.max_attempts && !cancel.is_cancelled() => {
        let delay = policy.delay_for(attempt);
        events.emit(
          &run_id,
          EngineEvent::StepRetry {
            run_id: run_id.clone(),
            step_id: step_id.clone(),
            attempt: attempt + 1,
            delay_ms: delay.as_millis() as u64,
          },
        );
        tokio::select! {
          _ = tokio::time::sleep(delay) => {}
          _ = cancel.cancelled() => break Err(StepError::Cancelled),
        }
        attempt += 1;
      }
      Err(e) => break Err(e),
    }
  };

  TaskOutcome {
    step_id,
    attempts: attempt,
    result,
  }
}

async fn perform_work(
  executors: &Executors,
  work: &Work,
  cancel: &CancellationToken,
) -> Result<Map<String, Value>, StepError> {
  match work {
    Work::Script(request) => executors.script.execute(request, cancel).await,
    Work::Model {
      system_instruction,
      prompt,
      parameters,
      outputs,
      timeout,
    } => {
      with_timeout(
        *timeout,
        executors
          .model
          .execute(system_instruction.as_deref(), prompt, parameters, outputs, cancel),
      )
      .await
    }
    Work::Delegated {
      operation,
      inputs,
      outputs,
      timeout,
    } => {
      with_timeout(
        *timeout,
        executors.delegated.execute(operation, inputs, outputs, cancel),
      )
      .await
    }
    Work::Loop(work) => run_loop(executors, work, cancel).await,
  }
}

async fn with_timeout<F>(timeout: Option<Duration>, fut: F) -> Result<Map<String, Value>, StepError>
where
  F: Future<Output = Result<Map<String, Value>, StepError>>,
{
  match timeout {
    Some(limit) => match tokio::time::timeout(limit, fut).await {
      Ok(result) => result,
      Err(_) => Err(StepError::Timeout {
        timeout_ms: limit.as_millis() as u64,
      }),
    },
    None => fut.await,
  }
}

/// Execute a loop step: one pass over the snapshot per item, nested steps
/// strictly in declaration order within each iteration.
///
/// Cancellation is cooperative at iteration granularity: the in-flight
/// iteration runs under its own token and is allowed to finish, remaining
/// iterations are abandoned.
async fn run_loop(
  executors: &Executors,
  work: &LoopWork,
  cancel: &CancellationToken,
) -> Result<Map<String, Value>, StepError> {
  let total = work.items.len();
  let mut aggregated: Map<String, Value> = work
    .outputs
    .iter()
    .map(|name| (name.clone(), Value::Array(Vec::new())))
    .collect();
  let mut failures: Vec<(usize, StepError)> = Vec::new();

  for (index, item) in work.items.iter().enumerate() {
    if cancel.is_cancelled() {
      return Err(StepError::Cancelled);
    }

    match run_iteration(executors, work, item).await {
      Ok(iteration) => {
        for (name, value) in iteration {
          if let Some(Value::Array(values)) = aggregated.get_mut(&name) {
            values.push(value);
          }
        }
      }
      Err(e) => match work.failure_mode {
        LoopFailureMode::StopAndFail => {
          return Err(StepError::LoopIteration {
            index,
            source: Box::new(e),
          });
        }
        LoopFailureMode::Continue => {
          debug!(index, error = %e, "loop iteration failed, continuing");
          failures.push((index, e));
        }
      },
    }
  }

  match failures.first() {
    None => Ok(aggregated),
    Some((index, first)) => Err(StepError::LoopPartial {
      failed: failures.len(),
      total,
      first: format!("iteration {index}: {first}"),
    }),
  }
}

/// One loop iteration over a fresh clone of the snapshot context, with the
/// item variable pushed. Nested steps see the outputs of earlier nested
/// steps from the same iteration, never from other iterations. Returns the
/// iteration's values for the loop step's declared output names; a declared
/// name no nested step produced fails the iteration.
async fn run_iteration(
  executors: &Executors,
  work: &LoopWork,
  item: &Value,
) -> Result<Map<String, Value>, StepError> {
  let mut ctx = work.ctx.clone();
  ctx.push_loop_var(work.item_var.clone(), item.clone());
  // The iteration finishes on its own token; run-level cancellation is
  // honored between iterations by the caller.
  let iteration_cancel = CancellationToken::new();

  let mut merged: Map<String, Value> = Map::new();
  for step in &work.steps {
    let resolved = resolve_inputs(&step.inputs, &ctx)?;
    let nested = build_work(step, &ctx, &resolved)?;
    let policy = RetryPolicy::from_def(step.retry.as_ref());

    let mut attempt: u32 = 1;
    let outputs = loop {
      // Boxed to break the async recursion through perform_work; the Loop
      // arm itself is unreachable here since validation bars nested loops.
      match Box::pin(perform_work(executors, &nested, &iteration_cancel)).await {
        Ok(outputs) => break outputs,
        Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
          let delay = policy.delay_for(attempt);
          debug!(step_id = %step.id, attempt, "nested step retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    };

    for (name, value) in &outputs {
      merged.insert(name.clone(), value.clone());
    }
    ctx.insert_step_outputs(step.id.clone(), outputs);
  }

  let mut selected = Map::new();
  for name in &work.outputs {
    let value = merged
      .get(name)
      .ok_or_else(|| StepError::MissingOutput { name: name.clone() })?;
    selected.insert(name.clone(), value.clone());
  }
  Ok(selected)
}

/// Package a script, model, or delegated step into a work unit against the
/// given context. Conditionals and loops never reach this: the engine
/// evaluates conditionals inline and builds loop snapshots itself, and
/// validation keeps both out of loop bodies.
pub(crate) fn build_work(
  step: &StepDef,
  ctx: &ExecutionContext,
  resolved_inputs: &Map<String, Value>,
) -> Result<Work, StepError> {
  let timeout = step.timeout_ms.map(Duration::from_millis);
  match &step.kind {
    StepKind::Script {
      command,
      args,
      working_dir,
    } => {
      let command = resolve_string(command, ctx)?;
      let args = args
        .iter()
        .map(|arg| resolve_string(arg, ctx))
        .collect::<Result<Vec<_>, _>>()?;
      Ok(Work::Script(ScriptRequest {
        command,
        args,
        working_dir: working_dir.clone(),
        inputs: resolved_inputs.clone(),
        outputs: step.outputs.clone(),
        timeout,
      }))
    }
    StepKind::ModelInvocation {
      prompt,
      system_instruction,
      parameters,
    } => {
      let prompt = resolve_string(prompt, ctx)?;
      let system_instruction = system_instruction
        .as_deref()
        .map(|s| resolve_string(s, ctx))
        .transpose()?;
      let mut resolved_parameters = Map::new();
      for (name, value) in parameters {
        resolved_parameters.insert(name.clone(), resolve_value(value, ctx).map_err(expr_error)?);
      }
      Ok(Work::Model {
        system_instruction,
        prompt,
        parameters: resolved_parameters,
        outputs: step.outputs.clone(),
        timeout,
      })
    }
    StepKind::DelegatedOperation { operation } => Ok(Work::Delegated {
      operation: operation.clone(),
      inputs: resolved_inputs.clone(),
      outputs: step.outputs.clone(),
      timeout,
    }),
    StepKind::Conditional { .. } | StepKind::Loop { .. } => Err(StepError::Condition {
      message: format!("step kind {} cannot be packaged as work", step.kind.name()),
    }),
  }
}

/// Resolve a step's declared inputs against the context.
pub(crate) fn resolve_inputs(
  inputs: &std::collections::HashMap<String, Value>,
  ctx: &ExecutionContext,
) -> Result<Map<String, Value>, StepError> {
  let mut resolved = Map::new();
  for (name, value) in inputs {
    resolved.insert(name.clone(), resolve_value(value, ctx).map_err(expr_error)?);
  }
  Ok(resolved)
}

/// Resolve a string-typed definition field (command, arg, prompt,
/// condition) to its canonical text form.
pub(crate) fn resolve_string(text: &str, ctx: &ExecutionContext) -> Result<String, StepError> {
  let value = Expr::parse(text).map_err(expr_error)?.resolve(ctx).map_err(expr_error)?;
  Ok(match value {
    Value::String(s) => s,
    other => other.to_string(),
  })
}

/// Materialize a loop's collection expression into a snapshot. Anything
/// other than an array is a defect in the workflow's logic.
pub(crate) fn resolve_collection(
  collection: &str,
  ctx: &ExecutionContext,
) -> Result<Vec<Value>, StepError> {
  let value = Expr::parse(collection)
    .map_err(expr_error)?
    .resolve(ctx)
    .map_err(expr_error)?;
  match value {
    Value::Array(items) => Ok(items),
    other => Err(StepError::NotACollection {
      message: format!("got {other}"),
    }),
  }
}

/// Evaluate a conditional step's expression to a boolean.
pub(crate) fn resolve_condition(
  condition: &str,
  ctx: &ExecutionContext,
) -> Result<bool, StepError> {
  let value = Expr::parse(condition)
    .map_err(expr_error)?
    .resolve(ctx)
    .map_err(expr_error)?;
  evaluate_condition(&value)
}

/// At run time only unresolved references can surface: parse-class errors
/// were all rejected during validation.
fn expr_error(e: ExprError) -> StepError {
  match e {
    ExprError::Unresolved { reference } => StepError::Unresolved { reference },
    other => StepError::Unresolved {
      reference: other.to_string(),
    },
  }
}
