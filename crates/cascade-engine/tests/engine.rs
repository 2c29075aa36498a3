//! End-to-end orchestration tests over in-memory collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cascade_engine::{Engine, EngineConfig, EngineError, EngineEvent};
use cascade_executors::{
  Approval, ApprovalGate, ModelInvoker, OperationHandler, StepError,
};
use cascade_store::{HistoryStore, MemoryStore, RunStatus, StepStatus};
use cascade_workflow::Workflow;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

/// Test operation handler covering the behaviors the workflows below need.
struct Ops {
  calls: AtomicUsize,
}

impl Ops {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      calls: AtomicUsize::new(0),
    })
  }
}

#[async_trait]
impl OperationHandler for Ops {
  async fn perform(
    &self,
    operation: &str,
    inputs: &Map<String, Value>,
  ) -> Result<Map<String, Value>, StepError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst);
    match operation {
      "echo" => Ok(inputs.clone()),
      "fail" => Err(StepError::Delegated {
        message: "boom".to_string(),
      }),
      // Fails on the first two calls, succeeds afterwards.
      "flaky" => {
        if call < 2 {
          Err(StepError::Delegated {
            message: format!("transient {call}"),
          })
        } else {
          Ok(inputs.clone())
        }
      }
      "fail_on_two" => {
        if inputs.get("value") == Some(&json!(2)) {
          Err(StepError::Delegated {
            message: "cannot handle two".to_string(),
          })
        } else {
          Ok(inputs.clone())
        }
      }
      "hang" => {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Map::new())
      }
      other => Err(StepError::Delegated {
        message: format!("unknown operation {other}"),
      }),
    }
  }
}

struct CannedModel(String);

#[async_trait]
impl ModelInvoker for CannedModel {
  async fn invoke(
    &self,
    _system: Option<&str>,
    _prompt: &str,
    _parameters: &Map<String, Value>,
  ) -> Result<String, StepError> {
    Ok(self.0.clone())
  }
}

struct DenyAll;

#[async_trait]
impl ApprovalGate for DenyAll {
  async fn request_approval(&self, _run_id: &str, _step_id: &str, _preview: &Value) -> Approval {
    Approval::Denied
  }
}

struct Harness {
  engine: Engine,
  store: Arc<MemoryStore>,
  ops: Arc<Ops>,
}

fn harness() -> Harness {
  harness_with(|_| {})
}

fn harness_with(configure: impl FnOnce(&mut EngineConfig)) -> Harness {
  let store = Arc::new(MemoryStore::new());
  let ops = Ops::new();
  let mut config = EngineConfig {
    model: Some(Arc::new(CannedModel("SUMMARY".to_string()))),
    operations: Some(ops.clone()),
    ..EngineConfig::default()
  };
  configure(&mut config);
  Harness {
    engine: Engine::new(store.clone(), config),
    store,
    ops,
  }
}

fn workflow(def: Value) -> Workflow {
  Workflow::parse(&def.to_string()).unwrap()
}

fn inputs(pairs: Value) -> Map<String, Value> {
  match pairs {
    Value::Object(map) => map,
    other => panic!("expected an object, got {other}"),
  }
}

fn step_record<'a>(run: &'a cascade_store::ExecutionRun, step_id: &str) -> &'a cascade_store::StepRecord {
  run
    .steps
    .iter()
    .find(|s| s.step_id == step_id)
    .unwrap_or_else(|| panic!("no record for step {step_id}"))
}

#[tokio::test]
async fn test_linear_pipeline_executes_and_records_history() {
  let h = harness();
  let wf = workflow(json!({
    "name": "fetch-and-summarize",
    "version": "1.0.0",
    "inputs": [{ "name": "url", "required": true }],
    "steps": [
      {
        "id": "fetch",
        "type": "delegated_operation",
        "operation": "echo",
        "inputs": { "data": "contents of ${input.url}" },
        "outputs": ["data"]
      },
      {
        "id": "summarize",
        "type": "model_invocation",
        "prompt": "Summarize: ${step.fetch.outputs.data}",
        "outputs": ["summary"]
      }
    ],
    "outputs": { "summary": "${step.summarize.outputs.summary}" }
  }));

  let run = h
    .engine
    .execute(&wf, inputs(json!({ "url": "https://a" })), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Succeeded);
  assert_eq!(run.outputs["summary"], json!("SUMMARY"));
  assert_eq!(step_record(&run, "fetch").status, StepStatus::Succeeded);
  assert_eq!(step_record(&run, "fetch").attempts, 1);
  assert_eq!(
    step_record(&run, "fetch").outputs,
    Some(json!({ "data": "contents of https://a" }))
  );

  let history = h.store.get_history("fetch-and-summarize", 10).await.unwrap();
  assert_eq!(history.len(), 1);
  assert_eq!(history[0].run_id, run.run_id);
}

#[tokio::test]
async fn test_event_order_for_a_successful_run() {
  let h = harness();
  let wf = workflow(json!({
    "name": "events",
    "version": "1.0.0",
    "steps": [
      {
        "id": "only",
        "type": "delegated_operation",
        "operation": "echo",
        "inputs": { "x": 1 },
        "outputs": ["x"]
      }
    ]
  }));

  let mut rx = h.engine.subscribe("run-events");
  h.engine
    .execute_with_run_id(&wf, "run-events".to_string(), Map::new(), CancellationToken::new())
    .await
    .unwrap();

  let mut events = Vec::new();
  while let Ok(event) = rx.try_recv() {
    events.push(event);
  }

  assert!(matches!(events.first(), Some(EngineEvent::RunStarted { .. })));
  assert!(matches!(events.last(), Some(EngineEvent::RunSucceeded { .. })));
  let started = events
    .iter()
    .position(|e| matches!(e, EngineEvent::StepStarted { .. }))
    .unwrap();
  let succeeded = events
    .iter()
    .position(|e| matches!(e, EngineEvent::StepSucceeded { .. }))
    .unwrap();
  assert!(started < succeeded);
}

#[tokio::test]
async fn test_conditional_false_skips_then_branch() {
  let h = harness();
  let wf = workflow(json!({
    "name": "branchy",
    "version": "1.0.0",
    "inputs": [{ "name": "flag", "type": "boolean", "required": true }],
    "steps": [
      {
        "id": "gate",
        "type": "conditional",
        "condition": "${input.flag}",
        "then_steps": ["yes"],
        "else_steps": ["no"]
      },
      {
        "id": "yes",
        "type": "delegated_operation",
        "operation": "echo",
        "inputs": { "v": "took yes" },
        "outputs": ["v"]
      },
      {
        "id": "no",
        "type": "delegated_operation",
        "operation": "echo",
        "inputs": { "v": "took no" },
        "outputs": ["v"]
      }
    ],
    "outputs": { "taken": "${step.gate.outputs.result}" }
  }));

  let run = h
    .engine
    .execute(&wf, inputs(json!({ "flag": false })), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Succeeded);
  assert_eq!(run.outputs["taken"], json!(false));
  assert_eq!(step_record(&run, "yes").status, StepStatus::Skipped);
  assert_eq!(step_record(&run, "no").status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_join_over_untaken_branch_uses_default() {
  let h = harness();
  let wf = workflow(json!({
    "name": "joiny",
    "version": "1.0.0",
    "inputs": [{ "name": "flag", "type": "boolean", "required": true }],
    "steps": [
      {
        "id": "gate",
        "type": "conditional",
        "condition": "${input.flag}",
        "then_steps": ["yes"],
        "else_steps": ["no"]
      },
      {
        "id": "yes",
        "type": "delegated_operation",
        "operation": "echo",
        "inputs": { "v": "from yes" },
        "outputs": ["v"]
      },
      {
        "id": "no",
        "type": "delegated_operation",
        "operation": "echo",
        "inputs": { "v": "from no" },
        "outputs": ["v"]
      },
      {
        "id": "join",
        "type": "delegated_operation",
        "operation": "echo",
        "inputs": {
          "a": "${step.yes.outputs.v || \"fallback\"}",
          "b": "${step.no.outputs.v}"
        },
        "outputs": ["a", "b"]
      }
    ],
    "outputs": { "a": "${step.join.outputs.a}" }
  }));

  let run = h
    .engine
    .execute(&wf, inputs(json!({ "flag": false })), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Succeeded);
  assert_eq!(run.outputs["a"], json!("fallback"));
  assert_eq!(step_record(&run, "join").status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_retry_until_success_counts_attempts() {
  let h = harness();
  let wf = workflow(json!({
    "name": "retries",
    "version": "1.0.0",
    "steps": [
      {
        "id": "flaky",
        "type": "delegated_operation",
        "operation": "flaky",
        "inputs": { "v": 1 },
        "outputs": ["v"],
        "retry": {
          "max_attempts": 3,
          "initial_delay_ms": 5,
          "backoff_multiplier": 1.0,
          "max_delay_ms": 5
        }
      }
    ]
  }));

  let mut rx = h.engine.subscribe("run-retry");
  let run = h
    .engine
    .execute_with_run_id(&wf, "run-retry".to_string(), Map::new(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Succeeded);
  assert_eq!(step_record(&run, "flaky").attempts, 3);
  assert_eq!(h.ops.calls.load(Ordering::SeqCst), 3);

  let mut retries = 0;
  while let Ok(event) = rx.try_recv() {
    if matches!(event, EngineEvent::StepRetry { .. }) {
      retries += 1;
    }
  }
  assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_retry_exhaustion_surfaces_the_original_error() {
  let h = harness();
  let wf = workflow(json!({
    "name": "exhausted",
    "version": "1.0.0",
    "steps": [
      {
        "id": "doomed",
        "type": "delegated_operation",
        "operation": "fail",
        "outputs": ["x"],
        "retry": {
          "max_attempts": 3,
          "initial_delay_ms": 5,
          "backoff_multiplier": 1.0,
          "max_delay_ms": 5
        }
      }
    ]
  }));

  let mut rx = h.engine.subscribe("run-exhausted");
  let run = h
    .engine
    .execute_with_run_id(&wf, "run-exhausted".to_string(), Map::new(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Failed);
  let record = step_record(&run, "doomed");
  assert_eq!(record.status, StepStatus::Failed);
  assert_eq!(record.attempts, 3);
  assert_eq!(h.ops.calls.load(Ordering::SeqCst), 3);
  assert!(run.error.unwrap().contains("boom"));

  // Intermediate failures surface as retries; StepFailed is terminal only.
  let (mut retries, mut failures) = (0, 0);
  while let Ok(event) = rx.try_recv() {
    match event {
      EngineEvent::StepRetry { .. } => retries += 1,
      EngineEvent::StepFailed { .. } => failures += 1,
      _ => {}
    }
  }
  assert_eq!(retries, 2);
  assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_runtime_class_failures_are_never_retried() {
  // No model collaborator configured, but a retry policy is declared.
  let h = harness_with(|config| config.model = None);
  let wf = workflow(json!({
    "name": "no-model",
    "version": "1.0.0",
    "steps": [
      {
        "id": "ask",
        "type": "model_invocation",
        "prompt": "hello",
        "outputs": ["answer"],
        "retry": { "max_attempts": 3, "initial_delay_ms": 5 }
      }
    ]
  }));

  let run = h
    .engine
    .execute(&wf, Map::new(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Failed);
  assert_eq!(step_record(&run, "ask").attempts, 1);
  assert!(run.error.unwrap().contains("no model collaborator"));
}

#[tokio::test]
async fn test_failure_skips_downstream_and_lets_siblings_finish() {
  let h = harness();
  let wf = workflow(json!({
    "name": "fail-fast",
    "version": "1.0.0",
    "steps": [
      {
        "id": "bad",
        "type": "delegated_operation",
        "operation": "fail",
        "outputs": ["x"]
      },
      {
        "id": "after",
        "type": "delegated_operation",
        "operation": "echo",
        "inputs": { "x": "${step.bad.outputs.x}" }
      },
      {
        "id": "independent",
        "type": "delegated_operation",
        "operation": "echo",
        "inputs": { "v": "own branch" },
        "outputs": ["v"]
      }
    ]
  }));

  let run = h
    .engine
    .execute(&wf, Map::new(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Failed);
  assert!(run.error.as_deref().unwrap().contains("boom"));
  assert_eq!(step_record(&run, "bad").status, StepStatus::Failed);
  assert_eq!(step_record(&run, "after").status, StepStatus::Skipped);
  // Dispatched in the same wave as the failing root; allowed to finish.
  assert_eq!(step_record(&run, "independent").status, StepStatus::Succeeded);
}

fn loop_workflow(failure_mode: &str, operation: &str) -> Workflow {
  workflow(json!({
    "name": "loopy",
    "version": "1.0.0",
    "inputs": [{ "name": "items", "type": "array", "required": true }],
    "steps": [
      {
        "id": "each",
        "type": "loop",
        "collection": "${input.items}",
        "item_var": "item",
        "failure_mode": failure_mode,
        "outputs": ["value"],
        "steps": [
          {
            "id": "work",
            "type": "delegated_operation",
            "operation": operation,
            "inputs": { "value": "${loop.item}" },
            "outputs": ["value"]
          }
        ]
      }
    ],
    "outputs": { "values": "${step.each.outputs.value}" }
  }))
}

#[tokio::test]
async fn test_loop_aggregates_iteration_outputs() {
  let h = harness();
  let run = h
    .engine
    .execute(
      &loop_workflow("stop_and_fail", "echo"),
      inputs(json!({ "items": [1, 2, 3] })),
      CancellationToken::new(),
    )
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Succeeded);
  assert_eq!(run.outputs["values"], json!([1, 2, 3]));
}

#[tokio::test]
async fn test_empty_loop_collection_succeeds_with_empty_outputs() {
  let h = harness();
  let run = h
    .engine
    .execute(
      &loop_workflow("stop_and_fail", "echo"),
      inputs(json!({ "items": [] })),
      CancellationToken::new(),
    )
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Succeeded);
  assert_eq!(run.outputs["values"], json!([]));
  assert_eq!(h.ops.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_loop_stops_at_first_failed_iteration_by_default() {
  let h = harness();
  let run = h
    .engine
    .execute(
      &loop_workflow("stop_and_fail", "fail_on_two"),
      inputs(json!({ "items": [1, 2, 3] })),
      CancellationToken::new(),
    )
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Failed);
  let error = run.error.unwrap();
  assert!(error.contains("iteration 1"), "unexpected error: {error}");
  // The third item is never attempted.
  assert_eq!(h.ops.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_loop_continue_mode_reports_partial_failure() {
  let h = harness();
  let run = h
    .engine
    .execute(
      &loop_workflow("continue", "fail_on_two"),
      inputs(json!({ "items": [1, 2, 3] })),
      CancellationToken::new(),
    )
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Failed);
  let error = run.error.unwrap();
  assert!(error.contains("1 of 3"), "unexpected error: {error}");
  assert_eq!(h.ops.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancellation_stops_in_flight_work() {
  let h = harness();
  let wf = workflow(json!({
    "name": "cancellable",
    "version": "1.0.0",
    "steps": [
      { "id": "slow", "type": "delegated_operation", "operation": "hang" }
    ]
  }));

  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.cancel();
  });

  let started = std::time::Instant::now();
  let run = h.engine.execute(&wf, Map::new(), cancel).await.unwrap();

  assert_eq!(run.status, RunStatus::Cancelled);
  assert_eq!(step_record(&run, "slow").status, StepStatus::Skipped);
  assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_approval_denial_fails_the_step() {
  let h = harness_with(|config| config.approvals = Arc::new(DenyAll));
  let wf = workflow(json!({
    "name": "gated",
    "version": "1.0.0",
    "steps": [
      {
        "id": "guarded",
        "type": "delegated_operation",
        "operation": "echo",
        "inputs": { "v": 1 },
        "outputs": ["v"],
        "requires_approval": true
      }
    ]
  }));

  let run = h
    .engine
    .execute(&wf, Map::new(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Failed);
  assert!(run.error.unwrap().contains("approval denied"));
  assert_eq!(h.ops.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_script_step_speaks_json_over_stdio() {
  use std::io::Write;
  use std::os::unix::fs::PermissionsExt;

  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("shout.sh");
  let mut file = std::fs::File::create(&path).unwrap();
  // Echoes the "word" input back, uppercased, as a JSON object.
  writeln!(file, "#!/bin/sh").unwrap();
  writeln!(
    file,
    r#"word=$(cat | sed 's/.*"word":"\([^"]*\)".*/\1/' | tr a-z A-Z)"#
  )
  .unwrap();
  writeln!(file, r#"echo "{{\"loud\":\"$word\"}}""#).unwrap();
  // The handle must be closed before spawn, or exec hits ETXTBSY.
  drop(file);
  let mut perms = std::fs::metadata(&path).unwrap().permissions();
  perms.set_mode(0o755);
  std::fs::set_permissions(&path, perms).unwrap();

  let h = harness();
  let wf = workflow(json!({
    "name": "scripted",
    "version": "1.0.0",
    "inputs": [{ "name": "word", "required": true }],
    "steps": [
      {
        "id": "shout",
        "type": "script",
        "command": path.to_string_lossy(),
        "inputs": { "word": "${input.word}" },
        "outputs": ["loud"],
        "timeout_ms": 5000
      }
    ],
    "outputs": { "loud": "${step.shout.outputs.loud}" }
  }));

  let run = h
    .engine
    .execute(&wf, inputs(json!({ "word": "quiet" })), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(run.status, RunStatus::Succeeded);
  assert_eq!(run.outputs["loud"], json!("QUIET"));
}

#[tokio::test]
async fn test_missing_required_input_refuses_to_start() {
  let h = harness();
  let wf = workflow(json!({
    "name": "needs-input",
    "version": "1.0.0",
    "inputs": [{ "name": "url", "required": true }],
    "steps": [
      {
        "id": "fetch",
        "type": "delegated_operation",
        "operation": "echo",
        "inputs": { "url": "${input.url}" }
      }
    ]
  }));

  let err = h
    .engine
    .execute(&wf, Map::new(), CancellationToken::new())
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::MissingInputs { .. }));
  // Nothing was recorded.
  assert!(h.store.get_history("needs-input", 10).await.unwrap().is_empty());
}
