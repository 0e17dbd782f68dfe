//! Approval gating for risky operations.
//!
//! A gated tool calls [`ApprovalRegistry::approve`] (or
//! [`ApprovalRegistry::gate`]) at its top and proceeds only on approval.
//! Backends decide; the registry routes, caches per session, and
//! short-circuits operations that need no review.

pub mod backend;
pub mod console;
pub mod registry;
pub mod remote;
pub mod scope;
pub mod types;

pub use backend::{ApprovalBackend, AutoApproveBackend};
pub use console::ConsoleBackend;
pub use registry::{ApprovalRegistry, OperationPolicy};
pub use remote::{parse_reply, ChannelClient, ChannelError, ChannelReply, HttpChannelClient, RemoteChannelBackend};
pub use scope::ApprovalScope;
pub use types::{ApprovalDecision, ApprovalRequest, OperationCategory, RiskLevel};
