//! Operation risk table and backend routing.
//!
//! `approve` resolves in this order, stopping at the first hit:
//!
//! 1. operation not gated → approve, no backend call
//! 2. already approved in the current scope → approve
//! 3. pre-approved in the current scope → approve and mark
//! 4. process-wide auto-approve → approve and mark
//! 5. ask the agent's backend (or the default) and mark on approval
//!
//! Without an active [`ApprovalScope`] steps 2 and 3 never match and
//! nothing is cached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::backend::ApprovalBackend;
use super::scope::ApprovalScope;
use super::types::{ApprovalDecision, ApprovalRequest, OperationCategory, RiskLevel};
use crate::config::{ApprovalRequirements, ApprovalSettings};
use crate::errors::{AutonomyError, AutonomyResult};

/// Built-in operations: name, category, risk.
const DEFAULT_OPERATIONS: &[(&str, OperationCategory, RiskLevel)] = &[
    ("run_shell", OperationCategory::Shell, RiskLevel::High),
    ("execute_command", OperationCategory::Shell, RiskLevel::High),
    ("delete_file", OperationCategory::FileDelete, RiskLevel::High),
    ("write_file", OperationCategory::FileWrite, RiskLevel::Medium),
    ("edit_file", OperationCategory::FileWrite, RiskLevel::Medium),
    ("http_request", OperationCategory::Network, RiskLevel::Medium),
    ("send_message", OperationCategory::Network, RiskLevel::Medium),
    ("git_commit", OperationCategory::Git, RiskLevel::Medium),
    ("git_push", OperationCategory::Git, RiskLevel::High),
    ("git_reset", OperationCategory::Git, RiskLevel::Critical),
];

impl ApprovalRequirements {
    pub fn requires(&self, category: OperationCategory) -> bool {
        match category {
            OperationCategory::Shell => self.shell,
            OperationCategory::FileWrite => self.file_write,
            OperationCategory::FileDelete => self.file_delete,
            OperationCategory::Network => self.network,
            OperationCategory::Git => self.git,
            OperationCategory::Other => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPolicy {
    pub required: bool,
    pub risk: RiskLevel,
    pub category: OperationCategory,
}

enum Resolution {
    Decided(ApprovalDecision),
    Ask {
        backend: Arc<dyn ApprovalBackend>,
        request: ApprovalRequest,
        scope: Option<ApprovalScope>,
    },
}

pub struct ApprovalRegistry {
    operations: RwLock<HashMap<String, OperationPolicy>>,
    agent_backends: RwLock<HashMap<String, Arc<dyn ApprovalBackend>>>,
    default_backend: RwLock<Arc<dyn ApprovalBackend>>,
    pre_approved: RwLock<Vec<String>>,
    auto_approve: AtomicBool,
}

impl ApprovalRegistry {
    /// Empty risk table: nothing is gated until registered.
    pub fn new(default_backend: Arc<dyn ApprovalBackend>) -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            agent_backends: RwLock::new(HashMap::new()),
            default_backend: RwLock::new(default_backend),
            pre_approved: RwLock::new(Vec::new()),
            auto_approve: AtomicBool::new(false),
        }
    }

    /// Built-in risk table under the default requirement flags.
    pub fn with_defaults(default_backend: Arc<dyn ApprovalBackend>) -> Self {
        Self::from_settings(
            &ApprovalRequirements::default(),
            &ApprovalSettings::default(),
            default_backend,
        )
    }

    pub fn from_settings(
        requirements: &ApprovalRequirements,
        settings: &ApprovalSettings,
        default_backend: Arc<dyn ApprovalBackend>,
    ) -> Self {
        let registry = Self::new(default_backend);
        for (name, category, risk) in DEFAULT_OPERATIONS {
            let required = *risk == RiskLevel::Critical || requirements.requires(*category);
            registry.register_operation(*name, *risk, *category, required);
        }
        registry.set_auto_approve(settings.auto_approve);
        *registry.pre_approved.write().unwrap_or_else(PoisonError::into_inner) =
            settings.pre_approved.clone();
        registry
    }

    pub fn register_operation(
        &self,
        name: impl Into<String>,
        risk: RiskLevel,
        category: OperationCategory,
        required: bool,
    ) {
        let name = name.into();
        debug!(operation = %name, %risk, required, "Registering operation");
        self.operations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name,
                OperationPolicy {
                    required,
                    risk,
                    category,
                },
            );
    }

    pub fn unregister_operation(&self, name: &str) -> Option<OperationPolicy> {
        self.operations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn policy(&self, name: &str) -> Option<OperationPolicy> {
        self.operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.policy(name).is_some_and(|p| p.required)
    }

    pub fn set_backend(&self, agent: impl Into<String>, backend: Arc<dyn ApprovalBackend>) {
        self.agent_backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent.into(), backend);
    }

    pub fn remove_backend(&self, agent: &str) -> Option<Arc<dyn ApprovalBackend>> {
        self.agent_backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent)
    }

    pub fn set_default_backend(&self, backend: Arc<dyn ApprovalBackend>) {
        *self
            .default_backend
            .write()
            .unwrap_or_else(PoisonError::into_inner) = backend;
    }

    pub fn set_auto_approve(&self, enabled: bool) {
        if enabled {
            warn!("Auto-approve enabled: gated operations will not be reviewed");
        }
        self.auto_approve.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve.load(Ordering::SeqCst)
    }

    /// Statically pre-approved operation names seeded into new scopes.
    pub fn pre_approved(&self) -> Vec<String> {
        self.pre_approved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A fresh scope for one session, seeded with the pre-approved list.
    pub fn open_scope(&self, session_id: impl Into<String>) -> ApprovalScope {
        ApprovalScope::new(session_id).with_pre_approved(self.pre_approved())
    }

    fn backend_for(&self, agent: Option<&str>) -> Arc<dyn ApprovalBackend> {
        if let Some(agent) = agent {
            if let Some(backend) = self
                .agent_backends
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(agent)
            {
                return Arc::clone(backend);
            }
        }
        self.default_backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn resolve(&self, agent: Option<&str>, operation: &str, arguments: Value) -> Resolution {
        let policy = match self.policy(operation) {
            Some(policy) if policy.required => policy,
            _ => {
                return Resolution::Decided(ApprovalDecision::approve(format!(
                    "'{operation}' does not require approval"
                )))
            }
        };

        let scope = ApprovalScope::current();
        if let Some(scope) = &scope {
            if scope.is_approved(operation) {
                debug!(operation, session = scope.session_id(), "Already approved this session");
                return Resolution::Decided(ApprovalDecision::approve(
                    "already approved this session",
                ));
            }
            if scope.is_pre_approved(operation) {
                debug!(operation, session = scope.session_id(), "Pre-approved");
                scope.mark_approved(operation);
                return Resolution::Decided(ApprovalDecision::approve("pre-approved"));
            }
        }

        if self.auto_approve() {
            if let Some(scope) = &scope {
                scope.mark_approved(operation);
            }
            return Resolution::Decided(ApprovalDecision::approve("auto-approve enabled").by("system"));
        }

        let mut request = ApprovalRequest::new(operation, arguments, policy.risk);
        if let Some(agent) = agent {
            request = request.with_agent(agent);
        }
        if let Some(scope) = &scope {
            request = request.with_session(scope.session_id());
        }
        Resolution::Ask {
            backend: self.backend_for(agent),
            request,
            scope,
        }
    }

    fn record(decision: &ApprovalDecision, backend: &str, request: &ApprovalRequest, scope: Option<&ApprovalScope>) {
        if decision.approved {
            if let Some(scope) = scope {
                scope.mark_approved(request.operation.clone());
            }
            info!(operation = %request.operation, backend, risk = %request.risk, "Operation approved");
        } else {
            warn!(
                operation = %request.operation,
                backend,
                reason = %decision.reason,
                "Operation denied"
            );
        }
    }

    pub async fn approve(
        &self,
        agent: Option<&str>,
        operation: &str,
        arguments: Value,
    ) -> ApprovalDecision {
        match self.resolve(agent, operation, arguments) {
            Resolution::Decided(decision) => decision,
            Resolution::Ask {
                backend,
                request,
                scope,
            } => {
                let decision = backend.request_approval(&request).await;
                Self::record(&decision, backend.name(), &request, scope.as_ref());
                decision
            }
        }
    }

    /// Blocking variant for synchronous tool code.
    pub fn approve_sync(
        &self,
        agent: Option<&str>,
        operation: &str,
        arguments: Value,
    ) -> ApprovalDecision {
        match self.resolve(agent, operation, arguments) {
            Resolution::Decided(decision) => decision,
            Resolution::Ask {
                backend,
                request,
                scope,
            } => {
                let decision = backend.request_approval_sync(&request);
                Self::record(&decision, backend.name(), &request, scope.as_ref());
                decision
            }
        }
    }

    /// Approve-or-block helper for the top of a gated operation.
    ///
    /// Returns the arguments to run with (the backend's overrides, if it
    /// supplied any) or `ApprovalDenied`.
    pub async fn gate(
        &self,
        agent: Option<&str>,
        operation: &str,
        arguments: Value,
    ) -> AutonomyResult<Value> {
        let decision = self.approve(agent, operation, arguments.clone()).await;
        if decision.approved {
            Ok(decision.modified_arguments.unwrap_or(arguments))
        } else {
            Err(AutonomyError::denied(operation, decision.reason))
        }
    }
}
