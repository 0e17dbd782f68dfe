//! Autonomy control for agent executions
//!
//! This library provides:
//! - A stage escalation pipeline that starts a request at the cheapest
//!   plausible autonomy level and climbs on failure
//! - Doom-loop detection over an execution's action history, with a
//!   recovery ladder and exponential backoff
//! - Approval gating for risky operations with pluggable backends
//!   (auto, console, chat channel) and session-scoped caching
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use autonomy::{
//!     AutonomyConfig, EscalationPipeline, RequestContext, StageExecutor, StageTurn,
//! };
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl StageExecutor for Echo {
//!     async fn execute(&self, turn: &mut StageTurn<'_>) -> anyhow::Result<String> {
//!         Ok(format!("[{}] {}", turn.stage(), turn.request()))
//!     }
//! }
//!
//! # async fn demo() -> autonomy::AutonomyResult<()> {
//! autonomy::telemetry::init_tracing();
//! let config = AutonomyConfig::from_env()?;
//! let pipeline = EscalationPipeline::new(Arc::new(Echo), &config);
//! let result = pipeline
//!     .run("What is the capital of France?", &RequestContext::default())
//!     .await;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod approval;
pub mod config;
pub mod doom_loop;
pub mod errors;
pub mod escalation;
pub mod telemetry;

// Re-export key escalation types
pub use escalation::{
    BlockingExecutor, EscalationHooks, EscalationPipeline, EscalationResult, NoopHooks, Outcome,
    RequestContext, Signal, SignalDetector, SignalSet, Stage, StageContext, StageExecutor,
    StageRecommender, StageTransition, StageTurn, TransitionReason,
};

// Re-export key doom-loop types
pub use doom_loop::{DoomLoopDetector, DoomLoopStats, LoopType, RecoveryAction};

// Re-export key approval types
pub use approval::{
    ApprovalBackend, ApprovalDecision, ApprovalRegistry, ApprovalRequest, ApprovalScope,
    AutoApproveBackend, ChannelClient, ConsoleBackend, HttpChannelClient, OperationCategory,
    RemoteChannelBackend, RiskLevel,
};

pub use config::{
    ApprovalRequirements, ApprovalSettings, AutonomyConfig, DoomLoopConfig, EscalationConfig,
    RemoteChannelConfig,
};
pub use errors::{AutonomyError, AutonomyResult, BudgetKind};
