//! Request/decision value types shared by every approval backend.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Static risk classification attached to an operation name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Which approval-requirement flag governs an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    Shell,
    FileWrite,
    FileDelete,
    Network,
    Git,
    Other,
}

/// One gated call, built per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub operation: String,
    pub arguments: Value,
    pub risk: RiskLevel,
    pub agent: Option<String>,
    pub session_id: Option<String>,
    pub context: Option<String>,
}

impl ApprovalRequest {
    pub fn new(operation: impl Into<String>, arguments: Value, risk: RiskLevel) -> Self {
        Self {
            operation: operation.into(),
            arguments,
            risk,
            agent: None,
            session_id: None,
            context: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Human-readable prompt used by the console and remote backends.
    pub fn describe(&self) -> String {
        let mut text = format!(
            "Approval required [{} risk]: {}\nArguments: {}",
            self.risk, self.operation, self.arguments
        );
        if let Some(agent) = &self.agent {
            text.push_str(&format!("\nAgent: {agent}"));
        }
        if let Some(context) = &self.context {
            text.push_str(&format!("\nContext: {context}"));
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub reason: String,
    /// Replacement arguments to use instead of the requested ones.
    pub modified_arguments: Option<Value>,
    pub approver: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalDecision {
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
            modified_arguments: None,
            approver: None,
            metadata: HashMap::new(),
            decided_at: Utc::now(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            ..Self::approve(reason)
        }
    }

    pub fn by(mut self, approver: impl Into<String>) -> Self {
        self.approver = Some(approver.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.modified_arguments = Some(arguments);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
