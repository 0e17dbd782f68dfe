//! Error taxonomy for the escalation pipeline and approval gating.
//!
//! Every failure the core can report is represented here. Callers query
//! `is_terminal()` instead of matching on message text.
//!
//! | Variant              | Terminal | Surfaces as                          |
//! |----------------------|----------|--------------------------------------|
//! | ExecutorFailure      | no       | escalation / retry, then `errors`    |
//! | BudgetExceeded       | yes      | `Outcome::FailedBudget`              |
//! | DoomLoopDetected     | yes      | `Outcome::FailedDoomLoop`            |
//! | ApprovalDenied       | no       | returned to the executor             |
//! | BackendUnavailable   | no       | folded into a denial's `reason`      |
//! | Cancelled            | yes      | `Outcome::FailedExhausted`           |
//! | Config / Io / Toml   | yes      | configuration loading                |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::doom_loop::LoopType;
use crate::escalation::Stage;

/// Result alias used across the crate.
pub type AutonomyResult<T> = Result<T, AutonomyError>;

/// The budget that was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    /// Wall-clock seconds.
    Time,
    /// Recorded steps across all attempts.
    Steps,
    /// Tokens reported by the executor.
    Tokens,
    /// Tool calls reported by the executor.
    ToolCalls,
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time => write!(f, "time"),
            Self::Steps => write!(f, "steps"),
            Self::Tokens => write!(f, "tokens"),
            Self::ToolCalls => write!(f, "tool_calls"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AutonomyError {
    /// The injected executor returned an error.
    #[error("executor failed at stage {stage}: {message}")]
    ExecutorFailure { stage: Stage, message: String },

    #[error("budget exceeded: {budget} used {used} of {limit}")]
    BudgetExceeded {
        budget: BudgetKind,
        used: u64,
        limit: u64,
    },

    #[error("doom loop detected ({loop_type}) after {recovery_attempts} recovery attempts")]
    DoomLoopDetected {
        loop_type: LoopType,
        recovery_attempts: u32,
    },

    /// A gated operation was blocked. Never a pipeline-level failure.
    #[error("operation '{operation}' denied: {reason}")]
    ApprovalDenied { operation: String, reason: String },

    /// The approval backend could not be reached.
    #[error("approval backend '{backend}' unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),
}

impl AutonomyError {
    /// Returns `true` when the pipeline must stop instead of escalating.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::ExecutorFailure { .. }
                | Self::ApprovalDenied { .. }
                | Self::BackendUnavailable { .. }
        )
    }

    pub fn denied(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ApprovalDenied {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_failure_is_not_terminal() {
        let err = AutonomyError::ExecutorFailure {
            stage: Stage::Heuristic,
            message: "boom".into(),
        };
        assert!(!err.is_terminal());
        assert_eq!(err.to_string(), "executor failed at stage heuristic: boom");
    }

    #[test]
    fn budget_and_loop_errors_are_terminal() {
        let budget = AutonomyError::BudgetExceeded {
            budget: BudgetKind::Time,
            used: 2,
            limit: 1,
        };
        assert!(budget.is_terminal());
        assert_eq!(budget.to_string(), "budget exceeded: time used 2 of 1");

        let looped = AutonomyError::DoomLoopDetected {
            loop_type: LoopType::RepeatedFailure,
            recovery_attempts: 3,
        };
        assert!(looped.is_terminal());
        assert!(looped.to_string().contains("repeated_failure"));
    }

    #[test]
    fn denial_keeps_operation_and_reason() {
        let err = AutonomyError::denied("run_shell", "timeout");
        assert!(!err.is_terminal());
        assert_eq!(err.to_string(), "operation 'run_shell' denied: timeout");
    }

    #[test]
    fn cancelled_display() {
        assert!(AutonomyError::Cancelled.to_string().contains("cancelled"));
    }
}
