use super::signals::{Signal, SignalSet};
use super::stage::Stage;

/// Maps a signal set to the autonomy stage a request should start at.
///
/// Precedence, highest first:
///
/// | Signals                              | Stage        |
/// |--------------------------------------|--------------|
/// | `MultiStepIntent`, `RefactorIntent`  | Autonomous   |
/// | `EditIntent`, `ComplexKeywords`      | Planned      |
/// | `FileReferences`, `LongPrompt`, `CodeBlocks` | Heuristic |
/// | `SimpleQuestion`, or nothing         | Direct       |
///
/// With a current stage and `ToolFailure` present, the result is always
/// strictly above the current stage (capped at `Autonomous`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StageRecommender;

impl StageRecommender {
    pub fn recommend(signals: &SignalSet, current: Option<Stage>) -> Stage {
        Self::explain(signals, current).0
    }

    /// Recommendation plus a short reason naming the deciding signal.
    pub fn explain(signals: &SignalSet, current: Option<Stage>) -> (Stage, String) {
        let (base, reason) = base_stage(signals);

        match current {
            Some(current) if signals.contains(&Signal::ToolFailure) => {
                let floor = current.escalated();
                if floor > base {
                    (floor, format!("tool_failure at {current}"))
                } else {
                    (base, reason)
                }
            }
            _ => (base, reason),
        }
    }
}

fn base_stage(signals: &SignalSet) -> (Stage, String) {
    const RULES: &[(&[Signal], Stage)] = &[
        (&[Signal::MultiStepIntent, Signal::RefactorIntent], Stage::Autonomous),
        (&[Signal::EditIntent, Signal::ComplexKeywords], Stage::Planned),
        (
            &[Signal::FileReferences, Signal::LongPrompt, Signal::CodeBlocks],
            Stage::Heuristic,
        ),
        (&[Signal::SimpleQuestion], Stage::Direct),
    ];

    for (triggers, stage) in RULES {
        if let Some(hit) = triggers.iter().find(|s| signals.contains(*s)) {
            return (*stage, hit.to_string());
        }
    }
    (Stage::Direct, "no signals".to_string())
}
