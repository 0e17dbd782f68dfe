//! Recovery ladder and backoff schedule applied once a loop is detected.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::DoomLoopConfig;

/// What the pipeline does about a detected loop, mildest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-run at the same stage with an instruction to change approach.
    RetryDifferent,
    /// Force a stage bump even when auto-escalation is off.
    EscalateModel,
    /// Give up.
    Abort,
}

impl RecoveryAction {
    /// Ladder position for the given number of prior recovery attempts.
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 => Self::RetryDifferent,
            1 => Self::EscalateModel,
            _ => Self::Abort,
        }
    }

    /// Instruction passed to the executor on the retried turn.
    pub fn instruction(self) -> &'static str {
        match self {
            Self::RetryDifferent => {
                "Your previous attempts repeated without progress. Try a different approach: \
                 change tools, arguments, or strategy instead of repeating the last action."
            }
            Self::EscalateModel => {
                "Previous attempts looped. You now have more autonomy; re-plan from scratch."
            }
            Self::Abort => "Stop.",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryDifferent => write!(f, "retry_different"),
            Self::EscalateModel => write!(f, "escalate_model"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Exponential backoff, multiplied on every application and capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    factor: f64,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            initial,
            factor: factor.max(1.0),
            max,
        }
    }

    pub fn from_config(config: &DoomLoopConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            config.backoff_factor,
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Grow the delay and return the new value. The caller sleeps for it.
    pub fn advance(&mut self) -> Duration {
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.factor)
            .map_or(self.max, |next| next.min(self.max));
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_order() {
        assert_eq!(RecoveryAction::for_attempt(0), RecoveryAction::RetryDifferent);
        assert_eq!(RecoveryAction::for_attempt(1), RecoveryAction::EscalateModel);
        assert_eq!(RecoveryAction::for_attempt(2), RecoveryAction::Abort);
        assert_eq!(RecoveryAction::for_attempt(9), RecoveryAction::Abort);
    }

    #[test]
    fn test_backoff_multiplies_and_caps() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(350),
        );
        assert_eq!(backoff.current(), Duration::from_millis(100));
        assert_eq!(backoff.advance(), Duration::from_millis(200));
        assert_eq!(backoff.advance(), Duration::from_millis(350));
        assert_eq!(backoff.advance(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_with_unbounded_factor_saturates_at_max() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            f64::INFINITY,
            Duration::from_secs(30),
        );
        assert_eq!(backoff.advance(), Duration::from_secs(30));
        assert_eq!(backoff.advance(), Duration::from_secs(30));
    }

    #[test]
    fn test_display_is_snake_case() {
        assert_eq!(RecoveryAction::EscalateModel.to_string(), "escalate_model");
    }
}
