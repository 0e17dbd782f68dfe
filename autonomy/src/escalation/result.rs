use serde::{Deserialize, Serialize};

use super::signals::Signal;
use super::stage::Stage;
use crate::doom_loop::LoopType;

/// Terminal outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    FailedBudget,
    FailedDoomLoop,
    /// Out of stages, auto-escalation off, or cancelled.
    FailedExhausted,
}

/// Why the stage changed between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Escalation,
    /// Forced by the doom-loop recovery ladder.
    Recovery,
    /// Reporting-only step down after a clean success.
    Deescalation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub reason: TransitionReason,
}

/// Immutable summary of one request.
///
/// `escalations` counts stage increases actually applied, including ones
/// forced by recovery. `final_stage < initial_stage` only when
/// `was_deescalated` holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationResult {
    pub session_id: String,
    pub initial_stage: Stage,
    pub final_stage: Stage,
    pub success: bool,
    pub outcome: Outcome,
    pub response: Option<String>,
    pub escalations: u32,
    pub was_deescalated: bool,
    pub steps_used: u32,
    pub tokens_used: u64,
    pub tool_calls: u32,
    pub elapsed_seconds: f64,
    pub files_touched: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub signals: Vec<Signal>,
    pub stage_history: Vec<StageTransition>,
    pub loop_type: Option<LoopType>,
    pub checkpoint_id: Option<String>,
}

impl EscalationResult {
    /// The last error recorded, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }

    /// Stage increases recorded in the history.
    pub fn stage_increases(&self) -> usize {
        self.stage_history
            .iter()
            .filter(|t| t.to > t.from)
            .count()
    }
}
