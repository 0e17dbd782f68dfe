//! Runtime configuration for the escalation pipeline, doom-loop detector,
//! and approval registry.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (`AUTONOMY_*`)
//! 2. Values loaded from a TOML file
//! 3. Built-in defaults
//!
//! Every struct is `#[serde(default)]`, so a file only needs the keys it
//! changes:
//!
//! ```toml
//! [escalation]
//! max_time_seconds = 120
//! auto_deescalate = false
//!
//! [escalation.approvals]
//! file_write = true
//!
//! [approval]
//! pre_approved = ["write_file"]
//! ```

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{AutonomyError, AutonomyResult};

const ENV_MAX_STEPS: &str = "AUTONOMY_MAX_STEPS";
const ENV_MAX_TIME_SECONDS: &str = "AUTONOMY_MAX_TIME_SECONDS";
const ENV_MAX_TOKENS: &str = "AUTONOMY_MAX_TOKENS";
const ENV_MAX_TOOL_CALLS: &str = "AUTONOMY_MAX_TOOL_CALLS";
const ENV_AUTO_ESCALATE: &str = "AUTONOMY_AUTO_ESCALATE";
const ENV_AUTO_DEESCALATE: &str = "AUTONOMY_AUTO_DEESCALATE";
const ENV_AUTO_APPROVE: &str = "AUTONOMY_AUTO_APPROVE";

/// Which operation categories require approval before they run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalRequirements {
    pub shell: bool,
    pub file_write: bool,
    pub file_delete: bool,
    pub network: bool,
    pub git: bool,
}

impl Default for ApprovalRequirements {
    fn default() -> Self {
        Self {
            shell: true,
            file_write: false,
            file_delete: true,
            network: false,
            git: true,
        }
    }
}

/// Immutable per-pipeline configuration. Budgets of 0 mean unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Word count above which a request is a `LongPrompt`.
    pub long_prompt_threshold: usize,
    /// Complexity keywords needed for `ComplexKeywords`.
    pub complex_keyword_threshold: usize,
    /// Longest request (in words) still considered a simple question.
    pub simple_question_max_words: usize,
    pub max_steps: u32,
    pub max_time_seconds: f64,
    pub max_tokens: u64,
    pub max_tool_calls: u32,
    pub auto_escalate: bool,
    pub auto_deescalate: bool,
    pub approvals: ApprovalRequirements,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            long_prompt_threshold: 200,
            complex_keyword_threshold: 2,
            simple_question_max_words: 20,
            max_steps: 50,
            max_time_seconds: 300.0,
            max_tokens: 200_000,
            max_tool_calls: 100,
            auto_escalate: true,
            auto_deescalate: true,
            approvals: ApprovalRequirements::default(),
        }
    }
}

impl EscalationConfig {
    /// Wall-clock budget, `None` when unlimited.
    pub fn time_budget(&self) -> Option<Duration> {
        if self.max_time_seconds > 0.0 {
            Duration::try_from_secs_f64(self.max_time_seconds).ok()
        } else {
            None
        }
    }
}

/// Thresholds and backoff schedule for doom-loop detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DoomLoopConfig {
    /// Number of recent action signatures kept.
    pub window_size: usize,
    pub max_identical_actions: u32,
    pub max_consecutive_failures: u32,
    pub max_no_progress_steps: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
}

impl Default for DoomLoopConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            max_identical_actions: 3,
            max_consecutive_failures: 3,
            max_no_progress_steps: 8,
            initial_backoff_ms: 500,
            backoff_factor: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

/// Connection settings for a Slack-style approval channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteChannelConfig {
    pub base_url: String,
    pub token: String,
    pub channel: String,
    /// Replies authored by this user are ignored.
    pub bot_user_id: Option<String>,
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for RemoteChannelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://slack.com/api".to_string(),
            token: String::new(),
            channel: String::new(),
            bot_user_id: None,
            poll_interval_ms: 3_000,
            timeout_secs: 300,
        }
    }
}

impl RemoteChannelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Process-wide approval settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    /// Operations statically declared safe for every session.
    pub pre_approved: Vec<String>,
    /// Approve everything without consulting a backend.
    pub auto_approve: bool,
    pub remote: Option<RemoteChannelConfig>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    pub escalation: EscalationConfig,
    pub doom_loop: DoomLoopConfig,
    pub approval: ApprovalSettings,
}

impl AutonomyConfig {
    pub fn from_toml_str(raw: &str) -> AutonomyResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and apply environment overrides on top.
    pub fn load(path: impl AsRef<Path>) -> AutonomyResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> AutonomyResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> AutonomyResult<()> {
        let esc = &mut self.escalation;
        if let Some(v) = env_parse::<u32>(ENV_MAX_STEPS)? {
            esc.max_steps = v;
        }
        if let Some(v) = env_parse::<f64>(ENV_MAX_TIME_SECONDS)? {
            esc.max_time_seconds = v;
        }
        if let Some(v) = env_parse::<u64>(ENV_MAX_TOKENS)? {
            esc.max_tokens = v;
        }
        if let Some(v) = env_parse::<u32>(ENV_MAX_TOOL_CALLS)? {
            esc.max_tool_calls = v;
        }
        if let Some(v) = env_bool(ENV_AUTO_ESCALATE)? {
            esc.auto_escalate = v;
        }
        if let Some(v) = env_bool(ENV_AUTO_DEESCALATE)? {
            esc.auto_deescalate = v;
        }
        if let Some(v) = env_bool(ENV_AUTO_APPROVE)? {
            self.approval.auto_approve = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> AutonomyResult<()> {
        let dl = &self.doom_loop;
        if dl.window_size == 0 {
            return Err(AutonomyError::Config("doom_loop.window_size must be > 0".into()));
        }
        if dl.max_identical_actions == 0
            || dl.max_consecutive_failures == 0
            || dl.max_no_progress_steps == 0
        {
            return Err(AutonomyError::Config(
                "doom_loop thresholds must be > 0".into(),
            ));
        }
        if !dl.backoff_factor.is_finite() || dl.backoff_factor < 1.0 {
            return Err(AutonomyError::Config(format!(
                "doom_loop.backoff_factor must be >= 1.0, got {}",
                dl.backoff_factor
            )));
        }
        let max_time = self.escalation.max_time_seconds;
        if !max_time.is_finite() || max_time < 0.0 {
            return Err(AutonomyError::Config(format!(
                "escalation.max_time_seconds must be a finite, non-negative number, got {max_time}"
            )));
        }
        if let Some(remote) = &self.approval.remote {
            if remote.poll_interval_ms == 0 {
                return Err(AutonomyError::Config(
                    "approval.remote.poll_interval_ms must be > 0".into(),
                ));
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> AutonomyResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AutonomyError::Config(format!("{key}: cannot parse '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn env_bool(key: &str) -> AutonomyResult<Option<bool>> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(AutonomyError::Config(format!(
                "{key}: expected a boolean, got '{raw}'"
            ))),
        },
        Err(_) => Ok(None),
    }
}
