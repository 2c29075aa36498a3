use async_trait::async_trait;
use serde_json::Value;

/// Outcome of a human-approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
  Granted,
  Denied,
}

/// Collaborator consulted before dispatching steps flagged
/// `requires_approval`. The preview is the step's resolved inputs, so the
/// approver sees exactly what would run.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
  async fn request_approval(&self, run_id: &str, step_id: &str, preview: &Value) -> Approval;
}

/// Gate that grants every request. The default for embedders that do not
/// mediate approvals.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl ApprovalGate for AllowAll {
  async fn request_approval(&self, _run_id: &str, _step_id: &str, _preview: &Value) -> Approval {
    Approval::Granted
  }
}
