//! Cascade workflow orchestration.
//!
//! The [`Engine`] drives validated workflows ([`cascade_workflow::Workflow`])
//! to a terminal [`cascade_store::ExecutionRun`]: ready-set scheduling with
//! concurrent dispatch of independent steps, conditional branch gating, loop
//! materialization, per-step retry with exponential backoff, cooperative
//! cancellation, and lifecycle events over a per-run broadcast bus.

mod config;
mod engine;
mod error;
mod events;
mod retry;
mod runner;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use events::{EngineEvent, EventBus};
pub use retry::RetryPolicy;
