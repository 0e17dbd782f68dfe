//! Autonomy stages: the ordered ladder the pipeline climbs on failure

use serde::{Deserialize, Serialize};

/// Autonomy levels, cheapest first.
///
/// Declaration order is the escalation order, so the derived `Ord` makes
/// `Stage::Direct < Stage::Autonomous`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Answer directly, no tools.
    Direct,
    /// A handful of targeted tool calls guided by simple heuristics.
    Heuristic,
    /// Write a plan first, then execute it step by step.
    Planned,
    /// Open-ended tool use with self-directed planning.
    Autonomous,
}

impl Stage {
    /// All stages in escalation order.
    pub const ALL: [Stage; 4] = [
        Stage::Direct,
        Stage::Heuristic,
        Stage::Planned,
        Stage::Autonomous,
    ];

    /// The next stage up, or `None` at the top.
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Direct => Some(Self::Heuristic),
            Self::Heuristic => Some(Self::Planned),
            Self::Planned => Some(Self::Autonomous),
            Self::Autonomous => None,
        }
    }

    /// The next stage down, or `None` at the bottom.
    pub fn previous(self) -> Option<Stage> {
        match self {
            Self::Direct => None,
            Self::Heuristic => Some(Self::Direct),
            Self::Planned => Some(Self::Heuristic),
            Self::Autonomous => Some(Self::Planned),
        }
    }

    /// One level up, saturating at `Autonomous`.
    pub fn escalated(self) -> Stage {
        self.next().unwrap_or(self)
    }

    pub fn is_highest(self) -> bool {
        self == Self::Autonomous
    }

    /// Tool calls a single attempt may make before the context asks for
    /// escalation. `None` = unlimited.
    pub fn tool_call_allowance(self) -> Option<u32> {
        match self {
            Self::Direct => Some(0),
            Self::Heuristic => Some(5),
            Self::Planned => Some(25),
            Self::Autonomous => None,
        }
    }

    /// Short instruction an executor can splice into its prompt.
    pub fn guidance(self) -> &'static str {
        match self {
            Self::Direct => "Answer directly without calling tools.",
            Self::Heuristic => "Use a few targeted tool calls to gather what you need, then answer.",
            Self::Planned => "Write a short numbered plan first, then execute it step by step.",
            Self::Autonomous => {
                "Work autonomously: plan, use any tools you need, verify your results, and iterate."
            }
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Heuristic => write!(f, "heuristic"),
            Self::Planned => write!(f, "planned"),
            Self::Autonomous => write!(f, "autonomous"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_matches_declaration() {
        for (i, a) in Stage::ALL.iter().enumerate() {
            for b in &Stage::ALL[i + 1..] {
                assert!(a < b, "{a} should be below {b}");
                assert!(b > a);
            }
        }
    }

    #[test]
    fn test_next_and_previous_are_inverse() {
        for stage in Stage::ALL {
            if let Some(up) = stage.next() {
                assert_eq!(up.previous(), Some(stage));
            }
        }
        assert_eq!(Stage::Autonomous.next(), None);
        assert_eq!(Stage::Direct.previous(), None);
        assert_eq!(Stage::Autonomous.escalated(), Stage::Autonomous);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Stage::Planned).unwrap();
        assert_eq!(json, "\"planned\"");
        let back: Stage = serde_json::from_str("\"autonomous\"").unwrap();
        assert_eq!(back, Stage::Autonomous);
    }

    #[test]
    fn test_tool_allowance_grows_with_stage() {
        assert_eq!(Stage::Direct.tool_call_allowance(), Some(0));
        assert!(Stage::Heuristic.tool_call_allowance() < Stage::Planned.tool_call_allowance());
        assert_eq!(Stage::Autonomous.tool_call_allowance(), None);
    }
}
