//! Approval gating as seen from executors running inside the pipeline.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autonomy::{
    ApprovalBackend, ApprovalDecision, ApprovalRegistry, ApprovalRequest, ApprovalScope,
    AutonomyConfig, AutonomyError, BlockingExecutor, EscalationPipeline, Outcome, RequestContext,
    Stage, StageExecutor, StageTurn,
};
use serde_json::json;

/// Approves or denies everything, counting calls.
struct CountingBackend {
    approve: bool,
    calls: AtomicUsize,
}

impl CountingBackend {
    fn new(approve: bool) -> Arc<Self> {
        Arc::new(Self {
            approve,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.approve {
            ApprovalDecision::approve(format!("ok {}", request.operation)).by("reviewer")
        } else {
            ApprovalDecision::deny("not today").by("reviewer")
        }
    }
}

#[async_trait]
impl ApprovalBackend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    fn request_approval_sync(&self, request: &ApprovalRequest) -> ApprovalDecision {
        self.decide(request)
    }

    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.decide(request)
    }
}

/// Runs `run_shell` twice per attempt through the registry.
struct ShellTwice {
    registry: Arc<ApprovalRegistry>,
}

#[async_trait]
impl StageExecutor for ShellTwice {
    async fn execute(&self, turn: &mut StageTurn<'_>) -> anyhow::Result<String> {
        for cmd in ["cargo build", "cargo test"] {
            let args = self
                .registry
                .gate(Some("builder"), "run_shell", json!({ "cmd": cmd }))
                .await?;
            turn.record_tool_call("run_shell", &args, "exit 0", true);
        }
        Ok("built and tested".to_string())
    }
}

#[tokio::test]
async fn session_cache_and_isolation_across_concurrent_runs() {
    let backend = CountingBackend::new(true);
    let registry = Arc::new(ApprovalRegistry::with_defaults(backend.clone()));
    let exec = Arc::new(ShellTwice {
        registry: registry.clone(),
    });
    let pipeline = EscalationPipeline::with_defaults(exec);
    let ctx = RequestContext::default();

    let (a, b) = tokio::join!(
        pipeline.run("Build it and test it", &ctx),
        pipeline.run("Build it and test it", &ctx)
    );

    assert!(a.success && b.success);
    assert_eq!(a.tool_calls, 2);
    // One backend call per session; the second run_shell in each run hits
    // that session's cache and never sees the other session's mark.
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn denial_blocks_the_operation_and_surfaces_the_reason() {
    let backend = CountingBackend::new(false);
    let registry = Arc::new(ApprovalRegistry::with_defaults(backend.clone()));
    let exec = Arc::new(ShellTwice {
        registry: registry.clone(),
    });
    let config = AutonomyConfig {
        escalation: autonomy::EscalationConfig {
            auto_escalate: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let pipeline = EscalationPipeline::new(exec, &config);
    let result = pipeline
        .run("What is the capital of France?", &RequestContext::default())
        .await;

    assert_eq!(result.outcome, Outcome::FailedExhausted);
    assert_eq!(result.tool_calls, 0, "denied operation must not run");
    assert!(result.last_error().unwrap().contains("not today"));
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn ungated_operations_never_reach_the_backend() {
    let backend = CountingBackend::new(false);
    let registry = ApprovalRegistry::with_defaults(backend.clone());
    for op in ["read_file", "search", "write_file", "http_request"] {
        assert!(registry.approve(None, op, json!({})).await.approved, "{op}");
    }
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn pipeline_seeds_pre_approved_operations() {
    let backend = CountingBackend::new(false);
    let registry = Arc::new(ApprovalRegistry::with_defaults(backend.clone()));
    let exec = Arc::new(ShellTwice {
        registry: registry.clone(),
    });
    let pipeline = EscalationPipeline::with_defaults(exec).with_pre_approved(["run_shell"]);
    let result = pipeline
        .run("What is the capital of France?", &RequestContext::default())
        .await;

    assert!(result.success);
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn outer_scope_spans_several_runs() {
    let backend = CountingBackend::new(true);
    let registry = Arc::new(ApprovalRegistry::with_defaults(backend.clone()));
    let exec = Arc::new(ShellTwice {
        registry: registry.clone(),
    });
    let pipeline = EscalationPipeline::with_defaults(exec);

    ApprovalScope::new("chat-session")
        .run(async {
            for _ in 0..3 {
                let result = pipeline
                    .run("What is the capital of France?", &RequestContext::default())
                    .await;
                assert!(result.success);
            }
        })
        .await;
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn caller_owned_scope_is_not_seeded_by_the_pipeline() {
    let backend = CountingBackend::new(true);
    let registry = Arc::new(ApprovalRegistry::with_defaults(backend.clone()));
    let exec = Arc::new(ShellTwice {
        registry: registry.clone(),
    });
    let pipeline = EscalationPipeline::with_defaults(exec).with_pre_approved(["run_shell"]);
    let scope = ApprovalScope::new("chat-session");

    let result = scope
        .clone()
        .run(pipeline.run("What is the capital of France?", &RequestContext::default()))
        .await;

    assert!(result.success);
    assert!(!scope.is_pre_approved("run_shell"));
    assert!(scope.is_approved("run_shell"), "backend approval is still cached");
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn blocking_executor_keeps_session_scope() {
    let backend = CountingBackend::new(true);
    let registry = Arc::new(ApprovalRegistry::with_defaults(backend.clone()));
    let gate = registry.clone();
    let exec = BlockingExecutor::new(move |_request: &str, _stage: Stage| {
        for _ in 0..3 {
            let decision = gate.approve_sync(None, "delete_file", json!({"path": "tmp.txt"}));
            if !decision.approved {
                return Err(AutonomyError::denied("delete_file", decision.reason).into());
            }
        }
        Ok("deleted".to_string())
    });
    let pipeline = EscalationPipeline::with_defaults(Arc::new(exec));
    let result = pipeline
        .run("What is the capital of France?", &RequestContext::default())
        .await;

    assert!(result.success);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn registry_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[escalation.approvals]
shell = false
file_write = true

[approval]
pre_approved = ["edit_file"]
"#
    )
    .unwrap();
    let config = AutonomyConfig::load(file.path()).unwrap();

    let backend = CountingBackend::new(false);
    let registry = ApprovalRegistry::from_settings(
        &config.escalation.approvals,
        &config.approval,
        backend.clone(),
    );
    assert!(!registry.is_required("run_shell"));
    assert!(registry.is_required("write_file"));

    registry
        .open_scope("cfg")
        .run(async {
            assert!(registry.approve(None, "edit_file", json!({})).await.approved);
            assert!(!registry.approve(None, "write_file", json!({})).await.approved);
        })
        .await;
    assert_eq!(backend.calls(), 1);
}
