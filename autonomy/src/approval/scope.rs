//! Session-scoped approval marks.
//!
//! Each pipeline run executes inside its own [`ApprovalScope`], stored in
//! tokio task-local storage. Two runs on the same runtime never see each
//! other's marks, and the marks disappear when the scope's future ends.
//! Work moved to the blocking pool re-enters the scope with
//! [`ApprovalScope::enter_sync`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

tokio::task_local! {
    static CURRENT_SCOPE: ApprovalScope;
}

#[derive(Debug, Default)]
struct ScopeState {
    approved: HashSet<String>,
    pre_approved: HashSet<String>,
}

/// Cheap to clone; clones share the same marks.
#[derive(Debug, Clone)]
pub struct ApprovalScope {
    session_id: Arc<str>,
    state: Arc<Mutex<ScopeState>>,
}

impl ApprovalScope {
    pub fn new(session_id: impl Into<String>) -> Self {
        let session_id: String = session_id.into();
        Self {
            session_id: Arc::from(session_id),
            state: Arc::new(Mutex::new(ScopeState::default())),
        }
    }

    pub fn with_pre_approved<I, S>(self, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for op in operations {
            self.pre_approve(op);
        }
        self
    }

    /// The scope active on the current task, if any.
    pub fn current() -> Option<ApprovalScope> {
        CURRENT_SCOPE.try_with(Clone::clone).ok()
    }

    /// Run `fut` with this scope active.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        CURRENT_SCOPE.scope(self, fut).await
    }

    /// Run a synchronous closure with this scope active.
    pub fn enter_sync<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT_SCOPE.sync_scope(self, f)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn mark_approved(&self, operation: impl Into<String>) {
        self.lock().approved.insert(operation.into());
    }

    pub fn is_approved(&self, operation: &str) -> bool {
        self.lock().approved.contains(operation)
    }

    pub fn pre_approve(&self, operation: impl Into<String>) {
        self.lock().pre_approved.insert(operation.into());
    }

    pub fn is_pre_approved(&self, operation: &str) -> bool {
        self.lock().pre_approved.contains(operation)
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.approved.clear();
        state.pre_approved.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
