//! Lifecycle events and the per-run event bus.
//!
//! Events are emitted in the order the corresponding state transition is
//! committed. Concurrent branches interleave their events, but a step's
//! succeeded/failed event never precedes its own started event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

/// Events emitted over a run's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
  RunStarted {
    run_id: String,
    workflow: String,
  },
  StepStarted {
    run_id: String,
    step_id: String,
  },
  /// A retryable attempt failed; the next attempt runs after `delay_ms`.
  StepRetry {
    run_id: String,
    step_id: String,
    attempt: u32,
    delay_ms: u64,
  },
  StepSucceeded {
    run_id: String,
    step_id: String,
    outputs: Value,
    duration_ms: u64,
  },
  /// Terminal failure after all attempts; retryable intermediate failures
  /// surface as [`EngineEvent::StepRetry`] instead.
  StepFailed {
    run_id: String,
    step_id: String,
    error: String,
  },
  StepSkipped {
    run_id: String,
    step_id: String,
    reason: String,
  },
  RunSucceeded {
    run_id: String,
    outputs: Value,
  },
  RunFailed {
    run_id: String,
    error: String,
  },
  RunCancelled {
    run_id: String,
  },
}

/// Broadcast buffer per run. Subscribers that lag past this many events
/// lose the oldest ones rather than blocking the engine.
const EVENT_CAPACITY: usize = 256;

/// Event bus keyed by run id.
///
/// Subscribing creates the run's channel if it does not exist yet, so
/// consumers may subscribe before calling `execute_with_run_id`. Dropping a
/// receiver stops delivery to it without affecting run progress.
#[derive(Clone, Default)]
pub struct EventBus {
  channels: Arc<Mutex<HashMap<String, broadcast::Sender<EngineEvent>>>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Subscribe to a run's events.
  pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<EngineEvent> {
    let mut channels = self.channels.lock().unwrap();
    channels
      .entry(run_id.to_string())
      .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
      .subscribe()
  }

  /// Emit one event, mirroring it to tracing so progress is visible even
  /// without a subscriber.
  pub fn emit(&self, run_id: &str, event: EngineEvent) {
    trace_event(&event);
    let sender = {
      let channels = self.channels.lock().unwrap();
      channels.get(run_id).cloned()
    };
    if let Some(sender) = sender {
      // A send error only means there are no live receivers.
      let _ = sender.send(event);
    }
  }

  /// Drop a run's channel once the run is terminal. Live receivers keep
  /// their already-buffered events.
  pub(crate) fn close(&self, run_id: &str) {
    self.channels.lock().unwrap().remove(run_id);
  }
}

fn trace_event(event: &EngineEvent) {
  match event {
    EngineEvent::RunStarted { run_id, workflow } => {
      info!(run_id, workflow, "run started");
    }
    EngineEvent::StepStarted { run_id, step_id } => {
      info!(run_id, step_id, "step started");
    }
    EngineEvent::StepRetry {
      run_id,
      step_id,
      attempt,
      delay_ms,
    } => {
      info!(run_id, step_id, attempt, delay_ms, "step retrying");
    }
    EngineEvent::StepSucceeded {
      run_id,
      step_id,
      duration_ms,
      ..
    } => {
      info!(run_id, step_id, duration_ms, "step succeeded");
    }
    EngineEvent::StepFailed {
      run_id,
      step_id,
      error,
    } => {
      info!(run_id, step_id, error, "step failed");
    }
    EngineEvent::StepSkipped {
      run_id,
      step_id,
      reason,
    } => {
      info!(run_id, step_id, reason, "step skipped");
    }
    EngineEvent::RunSucceeded { run_id, .. } => {
      info!(run_id, "run succeeded");
    }
    EngineEvent::RunFailed { run_id, error } => {
      info!(run_id, error, "run failed");
    }
    EngineEvent::RunCancelled { run_id } => {
      info!(run_id, "run cancelled");
    }
  }
}
