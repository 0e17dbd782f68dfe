//! Per-attempt record of what happened while running at one stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::signals::{Signal, SignalSet};
use super::stage::Stage;
use crate::config::EscalationConfig;

const MAX_SUMMARY_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub action: String,
    pub result_summary: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(action: impl Into<String>, result: &str, success: bool) -> Self {
        Self {
            action: action.into(),
            result_summary: summarize(result),
            success,
            timestamp: Utc::now(),
        }
    }
}

/// Owned by a single attempt. Discarded, or folded into the result, when
/// the attempt ends.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub stage: Stage,
    pub signals: SignalSet,
    pub steps: Vec<StepRecord>,
    pub tool_calls: u32,
    pub started_at: DateTime<Utc>,
}

impl StageContext {
    pub fn new(stage: Stage, signals: SignalSet) -> Self {
        Self {
            stage,
            signals,
            steps: Vec::new(),
            tool_calls: 0,
            started_at: Utc::now(),
        }
    }

    pub fn record_step(&mut self, action: impl Into<String>, result: &str, success: bool) {
        self.steps.push(StepRecord::new(action, result, success));
    }

    pub fn record_tool_call(&mut self, action: impl Into<String>, result: &str, success: bool) {
        self.tool_calls += 1;
        self.record_step(action, result, success);
    }

    pub fn failure_count(&self) -> usize {
        self.steps.iter().filter(|s| !s.success).count()
    }

    /// Failures were seen and a higher stage exists.
    pub fn should_escalate(&self, config: &EscalationConfig) -> bool {
        config.auto_escalate && !self.stage.is_highest() && self.failure_count() > 0
    }

    /// Only question-type signals and a clean step log.
    pub fn should_deescalate(&self, config: &EscalationConfig) -> bool {
        config.auto_deescalate
            && self.stage > Stage::Direct
            && self.failure_count() == 0
            && self.signals.contains(&Signal::SimpleQuestion)
            && self
                .signals
                .iter()
                .all(|s| matches!(s, Signal::SimpleQuestion | Signal::RepoContext))
    }
}

fn summarize(result: &str) -> String {
    let trimmed = result.trim();
    if trimmed.chars().count() <= MAX_SUMMARY_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_SUMMARY_CHARS).collect();
    out.push_str("...");
    out
}
