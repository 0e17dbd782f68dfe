use async_trait::async_trait;

use super::types::{ApprovalDecision, ApprovalRequest};

/// A pluggable approval decision source.
///
/// Implementations must never approve on an I/O error: a failure to reach
/// the decider is a denial whose `reason` carries the error.
#[async_trait]
pub trait ApprovalBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Blocking variant, for synchronous tool code.
    fn request_approval_sync(&self, request: &ApprovalRequest) -> ApprovalDecision;

    /// Suspendable variant.
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Approves everything. No I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApproveBackend;

#[async_trait]
impl ApprovalBackend for AutoApproveBackend {
    fn name(&self) -> &str {
        "auto"
    }

    fn request_approval_sync(&self, request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::approve(format!("auto-approved {}", request.operation)).by("system")
    }

    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        self.request_approval_sync(request)
    }
}
