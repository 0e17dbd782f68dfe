//! Per-session loop detection over a bounded action history.
//!
//! Each recorded action is reduced to a signature: a BLAKE3 hash of the
//! action type plus its arguments normalized to sorted keys and trimmed
//! strings, so `{"b":1,"a":" x "}` and `{"a":"x","b":1}` collide. Three
//! independent counters feed the verdict:
//!
//! - the run of identical consecutive signatures,
//! - consecutive failures (reset by any success),
//! - steps since the last progress marker, paired with a count of
//!   repeated result signatures.
//!
//! A detector is owned by exactly one execution. It holds no shared
//! state and is never handed to another session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::recovery::{Backoff, RecoveryAction};
use crate::config::DoomLoopConfig;

/// Category of a detected loop, in reporting priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    RepeatedFailure,
    RepeatedAction,
    NoProgress,
}

impl fmt::Display for LoopType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RepeatedFailure => write!(f, "repeated_failure"),
            Self::RepeatedAction => write!(f, "repeated_action"),
            Self::NoProgress => write!(f, "no_progress"),
        }
    }
}

/// Point-in-time snapshot of a detector, for logs and reports.
#[derive(Debug, Clone, Serialize)]
pub struct DoomLoopStats {
    pub session_id: Option<String>,
    pub total_actions: u64,
    pub unique_signatures: usize,
    pub identical_streak: u32,
    pub consecutive_failures: u32,
    pub steps_since_progress: u32,
    pub recovery_attempts: u32,
    pub current_backoff_ms: u64,
    pub progress_markers: Vec<String>,
    pub loop_type: Option<LoopType>,
}

pub struct DoomLoopDetector {
    config: DoomLoopConfig,
    session_id: Option<String>,
    /// Most recent signatures, oldest first, at most `window_size` long.
    window: VecDeque<String>,
    seen: HashSet<String>,
    total_actions: u64,
    identical_streak: u32,
    consecutive_failures: u32,
    /// Result signature -> occurrences since the last progress marker.
    result_counts: HashMap<String, u32>,
    steps_since_progress: u32,
    recovery_attempts: u32,
    backoff: Backoff,
    progress_markers: Vec<String>,
}

impl DoomLoopDetector {
    pub fn new(config: DoomLoopConfig) -> Self {
        let backoff = Backoff::from_config(&config);
        Self {
            window: VecDeque::with_capacity(config.window_size),
            config,
            session_id: None,
            seen: HashSet::new(),
            total_actions: 0,
            identical_streak: 0,
            consecutive_failures: 0,
            result_counts: HashMap::new(),
            steps_since_progress: 0,
            recovery_attempts: 0,
            backoff,
            progress_markers: Vec::new(),
        }
    }

    /// Reset all history and counters for a new session.
    pub fn start_session(&mut self, session_id: impl Into<String>) {
        let config = self.config.clone();
        *self = Self::new(config);
        self.session_id = Some(session_id.into());
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Record one action and its outcome.
    pub fn record_action(&mut self, action_type: &str, args: &Value, result: &str, success: bool) {
        let signature = action_signature(action_type, args);

        if self.window.back() == Some(&signature) {
            self.identical_streak += 1;
        } else {
            self.identical_streak = 1;
        }

        if self.window.len() >= self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(signature.clone());
        self.seen.insert(signature);
        self.total_actions += 1;

        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }

        *self
            .result_counts
            .entry(result_signature(result))
            .or_insert(0) += 1;
        self.steps_since_progress += 1;

        debug!(
            session = self.session_id.as_deref().unwrap_or("-"),
            action = action_type,
            success,
            identical_streak = self.identical_streak,
            consecutive_failures = self.consecutive_failures,
            "Recorded action"
        );
    }

    /// Signal genuine forward movement; clears the no-progress counters
    /// and restarts the backoff schedule.
    pub fn mark_progress(&mut self, note: impl Into<String>) {
        let note = note.into();
        debug!(
            session = self.session_id.as_deref().unwrap_or("-"),
            note = %note,
            "Progress marked"
        );
        self.progress_markers.push(note);
        self.steps_since_progress = 0;
        self.result_counts.clear();
        self.backoff.reset();
    }

    pub fn is_doom_loop(&self) -> bool {
        self.loop_type().is_some()
    }

    /// The highest-priority matching loop category, if any.
    pub fn loop_type(&self) -> Option<LoopType> {
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            return Some(LoopType::RepeatedFailure);
        }
        if self.identical_streak >= self.config.max_identical_actions {
            return Some(LoopType::RepeatedAction);
        }
        let results_repeat = self.result_counts.values().any(|&n| n >= 2);
        if self.steps_since_progress >= self.config.max_no_progress_steps && results_repeat {
            return Some(LoopType::NoProgress);
        }
        None
    }

    /// Consume one rung of the recovery ladder.
    pub fn next_recovery(&mut self) -> RecoveryAction {
        let action = RecoveryAction::for_attempt(self.recovery_attempts);
        self.recovery_attempts += 1;
        warn!(
            session = self.session_id.as_deref().unwrap_or("-"),
            loop_type = ?self.loop_type(),
            recovery = %action,
            recovery_attempts = self.recovery_attempts,
            "Doom loop recovery"
        );
        action
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts
    }

    /// Grow the backoff and return the delay to wait. Use a non-blocking
    /// sleep such as `tokio::time::sleep` for it.
    pub fn apply_backoff(&mut self) -> Duration {
        self.backoff.advance()
    }

    pub fn current_backoff(&self) -> Duration {
        self.backoff.current()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn stats(&self) -> DoomLoopStats {
        DoomLoopStats {
            session_id: self.session_id.clone(),
            total_actions: self.total_actions,
            unique_signatures: self.seen.len(),
            identical_streak: self.identical_streak,
            consecutive_failures: self.consecutive_failures,
            steps_since_progress: self.steps_since_progress,
            recovery_attempts: self.recovery_attempts,
            current_backoff_ms: self.backoff.current().as_millis() as u64,
            progress_markers: self.progress_markers.clone(),
            loop_type: self.loop_type(),
        }
    }
}

/// Hash of the action type and its normalized arguments.
pub fn action_signature(action_type: &str, args: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(action_type.trim().as_bytes());
    hasher.update(&[0]);
    hasher.update(normalize(args).to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn result_signature(result: &str) -> String {
    blake3::hash(result.trim().as_bytes()).to_hex().to_string()
}

/// Sort object keys and trim strings, recursively.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (key, inner) in entries {
                out.insert(key.clone(), normalize(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}
