//! The escalation pipeline: run a request at the cheapest plausible stage
//! and climb the ladder on failure.
//!
//! ## Lifecycle
//!
//! ```text
//! EscalationPipeline::run(request, context)
//!   → SignalDetector::detect        # signals from text + context
//!   → StageRecommender::recommend   # initial stage
//!   → loop (inside the session's ApprovalScope):
//!       check cancellation / budgets
//!       checkpoint hook (first time at Autonomous)
//!       executor.execute(turn)      # bounded by the remaining time budget
//!       success → optional reporting-only de-escalation, done
//!       failure → budgets → doom-loop recovery ladder → escalate or give up
//! ```
//!
//! Each attempt yields a tagged [`AttemptOutcome`]; the loop here is the
//! only place that decides what happens next.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::StageContext;
use super::recommender::StageRecommender;
use super::result::{EscalationResult, Outcome, StageTransition, TransitionReason};
use super::signals::{RequestContext, Signal, SignalDetector, SignalSet};
use super::stage::Stage;
use crate::approval::ApprovalScope;
use crate::config::{AutonomyConfig, DoomLoopConfig, EscalationConfig};
use crate::doom_loop::{DoomLoopDetector, LoopType, RecoveryAction};
use crate::errors::{AutonomyError, BudgetKind};

// ── Executor seam ────────────────────────────────────────────────────────────

/// The agent that does the actual work at a given stage.
///
/// Any error is treated as a failed attempt. Gated side effects must go
/// through `ApprovalRegistry::approve` before they run; the pipeline
/// executes the call inside the session's approval scope.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, turn: &mut StageTurn<'_>) -> anyhow::Result<String>;
}

/// Usage accumulated across all attempts of one run.
#[derive(Debug, Default)]
struct Ledger {
    tokens: u64,
    tool_calls: u32,
    files_touched: Vec<String>,
    warnings: Vec<String>,
}

/// Handle given to the executor for one attempt.
pub struct StageTurn<'a> {
    request: &'a str,
    stage: Stage,
    attempt: u32,
    recovery: Option<&'static str>,
    cancel: CancellationToken,
    context: &'a mut StageContext,
    detector: &'a mut DoomLoopDetector,
    ledger: &'a mut Ledger,
    max_tool_calls: u32,
}

impl<'a> StageTurn<'a> {
    pub fn request(&self) -> &str {
        self.request
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// 1-based attempt number across the whole run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn guidance(&self) -> &'static str {
        self.stage.guidance()
    }

    /// Set when the previous attempt looped and the executor should vary
    /// its approach.
    pub fn recovery_instruction(&self) -> Option<&'static str> {
        self.recovery
    }

    pub fn signals(&self) -> &SignalSet {
        &self.context.signals
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a tool call in the step log and the loop detector.
    pub fn record_tool_call(&mut self, action: &str, args: &Value, result: &str, success: bool) {
        self.context.record_tool_call(action, result, success);
        self.detector.record_action(action, args, result, success);
        self.ledger.tool_calls += 1;
    }

    /// Tool calls this stage still allows before the executor should stop
    /// and fail over to a higher stage. `None` = unlimited.
    pub fn stage_tool_calls_left(&self) -> Option<u32> {
        self.stage
            .tool_call_allowance()
            .map(|limit| limit.saturating_sub(self.context.tool_calls))
    }

    /// Tool calls left before the run's budget is spent. `None` = unlimited.
    pub fn remaining_tool_calls(&self) -> Option<u32> {
        (self.max_tool_calls > 0).then(|| self.max_tool_calls.saturating_sub(self.ledger.tool_calls))
    }

    /// The executor's own actions look like a loop.
    pub fn is_looping(&self) -> bool {
        self.detector.is_doom_loop()
    }

    pub fn mark_progress(&mut self, note: impl Into<String>) {
        self.detector.mark_progress(note);
    }

    pub fn add_tokens(&mut self, tokens: u64) {
        self.ledger.tokens += tokens;
    }

    pub fn touch_file(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.ledger.files_touched.contains(&path) {
            self.ledger.files_touched.push(path);
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(stage = %self.stage, attempt = self.attempt, warning = %message, "Executor warning");
        self.ledger.warnings.push(message);
    }
}

/// Runs a synchronous executor on the blocking pool.
///
/// The closure runs inside the caller's approval scope, so blocking
/// `approve_sync` calls still hit the session cache.
pub struct BlockingExecutor<F> {
    func: Arc<F>,
}

impl<F> BlockingExecutor<F>
where
    F: Fn(&str, Stage) -> anyhow::Result<String> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func: Arc::new(func) }
    }
}

#[async_trait]
impl<F> StageExecutor for BlockingExecutor<F>
where
    F: Fn(&str, Stage) -> anyhow::Result<String> + Send + Sync + 'static,
{
    async fn execute(&self, turn: &mut StageTurn<'_>) -> anyhow::Result<String> {
        let func = Arc::clone(&self.func);
        let request = turn.request().to_string();
        let stage = turn.stage();
        let scope = ApprovalScope::current();

        tokio::task::spawn_blocking(move || match scope {
            Some(scope) => scope.enter_sync(|| func(&request, stage)),
            None => func(&request, stage),
        })
        .await
        .map_err(|e| anyhow::anyhow!("blocking executor panicked or was cancelled: {e}"))?
    }
}

// ── Hooks ────────────────────────────────────────────────────────────────────

/// Collaborator callbacks. Both have no-op defaults.
#[async_trait]
pub trait EscalationHooks: Send + Sync {
    /// Called on every stage transition, including reporting-only
    /// de-escalation.
    fn on_stage_change(&self, _from: Stage, _to: Stage) {}

    /// Called once before the first attempt at `Autonomous`. The returned
    /// id is reported in `EscalationResult::checkpoint_id`.
    async fn create_checkpoint(&self, _request: &str, _stage: Stage) -> Option<String> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl EscalationHooks for NoopHooks {}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Result of one executor call.
#[derive(Debug)]
enum AttemptOutcome {
    Succeeded(String),
    Failed(String),
    /// Abandoned because the time budget ran out mid-call.
    TimedOut,
    Cancelled,
}

/// Mutable bookkeeping for one run. Never shared across runs.
struct Run {
    session_id: String,
    initial_stage: Stage,
    stage: Stage,
    signals: SignalSet,
    escalations: u32,
    steps_used: u32,
    attempts: u32,
    errors: Vec<String>,
    history: Vec<StageTransition>,
    checkpoint_id: Option<String>,
    loop_type: Option<LoopType>,
    ledger: Ledger,
    started: Instant,
}

impl Run {
    fn finish(self, outcome: Outcome, final_stage: Stage, response: Option<String>) -> EscalationResult {
        let elapsed = self.started.elapsed().as_secs_f64();
        let was_deescalated = self
            .history
            .iter()
            .any(|t| t.reason == TransitionReason::Deescalation);
        info!(
            session = %self.session_id,
            outcome = ?outcome,
            initial_stage = %self.initial_stage,
            final_stage = %final_stage,
            escalations = self.escalations,
            steps = self.steps_used,
            elapsed_secs = elapsed,
            "Escalation run finished"
        );
        EscalationResult {
            session_id: self.session_id,
            initial_stage: self.initial_stage,
            final_stage,
            success: outcome == Outcome::Succeeded,
            outcome,
            response,
            escalations: self.escalations,
            was_deescalated,
            steps_used: self.steps_used,
            tokens_used: self.ledger.tokens,
            tool_calls: self.ledger.tool_calls,
            elapsed_seconds: elapsed,
            files_touched: self.ledger.files_touched,
            errors: self.errors,
            warnings: self.ledger.warnings,
            signals: self.signals.into_iter().collect(),
            stage_history: self.history,
            loop_type: self.loop_type,
            checkpoint_id: self.checkpoint_id,
        }
    }

    fn fail(mut self, outcome: Outcome, error: AutonomyError) -> EscalationResult {
        self.errors.push(error.to_string());
        let stage = self.stage;
        self.finish(outcome, stage, None)
    }
}

pub struct EscalationPipeline {
    executor: Arc<dyn StageExecutor>,
    config: EscalationConfig,
    doom_config: DoomLoopConfig,
    detector: SignalDetector,
    hooks: Arc<dyn EscalationHooks>,
    pre_approved: Vec<String>,
}

impl EscalationPipeline {
    pub fn new(executor: Arc<dyn StageExecutor>, config: &AutonomyConfig) -> Self {
        Self {
            executor,
            detector: SignalDetector::from_config(&config.escalation),
            config: config.escalation.clone(),
            doom_config: config.doom_loop.clone(),
            hooks: Arc::new(NoopHooks),
            pre_approved: config.approval.pre_approved.clone(),
        }
    }

    pub fn with_defaults(executor: Arc<dyn StageExecutor>) -> Self {
        Self::new(executor, &AutonomyConfig::default())
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn EscalationHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Extra operations to pre-approve in every session scope.
    pub fn with_pre_approved<I, S>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pre_approved.extend(operations.into_iter().map(Into::into));
        self
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    pub async fn run(&self, request: &str, context: &RequestContext) -> EscalationResult {
        self.run_with_cancel(request, context, CancellationToken::new())
            .await
    }

    /// Run with an external cancellation signal, honoured at the next
    /// suspension point.
    pub async fn run_with_cancel(
        &self,
        request: &str,
        context: &RequestContext,
        cancel: CancellationToken,
    ) -> EscalationResult {
        let signals = self.detector.detect(request, context);
        let (stage, reason) = StageRecommender::explain(&signals, None);
        info!(
            stage = %stage,
            reason = %reason,
            signals = ?signals,
            "Initial stage selected"
        );
        self.execute_at_stage(request, stage, signals, cancel).await
    }

    /// Run starting at an explicit stage.
    ///
    /// Reuses the caller's approval scope when one is active, so a
    /// multi-request session keeps its approvals; otherwise each run gets
    /// a fresh scope seeded with the pipeline's pre-approved operations.
    /// A caller-owned scope is left as the caller configured it.
    pub async fn execute_at_stage(
        &self,
        request: &str,
        stage: Stage,
        signals: SignalSet,
        cancel: CancellationToken,
    ) -> EscalationResult {
        let session_id = Uuid::new_v4().to_string();
        let scope = match ApprovalScope::current() {
            Some(outer) => outer,
            None => ApprovalScope::new(session_id.clone()).with_pre_approved(self.pre_approved.iter().cloned()),
        };

        let run = Run {
            session_id,
            initial_stage: stage,
            stage,
            signals,
            escalations: 0,
            steps_used: 0,
            attempts: 0,
            errors: Vec::new(),
            history: Vec::new(),
            checkpoint_id: None,
            loop_type: None,
            ledger: Ledger::default(),
            started: Instant::now(),
        };
        scope.run(self.drive(request, run, cancel)).await
    }

    async fn drive(&self, request: &str, mut run: Run, cancel: CancellationToken) -> EscalationResult {
        let mut detector = DoomLoopDetector::new(self.doom_config.clone());
        detector.start_session(run.session_id.clone());
        let mut recovery: Option<&'static str> = None;

        loop {
            if cancel.is_cancelled() {
                info!(session = %run.session_id, "Run cancelled");
                return run.fail(Outcome::FailedExhausted, AutonomyError::Cancelled);
            }
            if let Some(err) = self.budget_violation(&run) {
                warn!(session = %run.session_id, error = %err, "Budget exhausted");
                return run.fail(Outcome::FailedBudget, err);
            }
            if run.stage == Stage::Autonomous && run.checkpoint_id.is_none() {
                run.checkpoint_id = self.hooks.create_checkpoint(request, run.stage).await;
                if let Some(id) = &run.checkpoint_id {
                    debug!(session = %run.session_id, checkpoint = %id, "Checkpoint created");
                }
            }

            run.attempts += 1;
            let stage = run.stage;
            let mut context = StageContext::new(stage, run.signals.clone());
            info!(
                session = %run.session_id,
                stage = %stage,
                attempt = run.attempts,
                recovering = recovery.is_some(),
                "Executing attempt"
            );

            let outcome = self
                .attempt(request, &mut run, &mut context, &mut detector, recovery.take(), &cancel)
                .await;

            let message = match outcome {
                AttemptOutcome::Succeeded(response) => {
                    context.record_step("execute", &response, true);
                    run.steps_used += context.steps.len() as u32;
                    let final_stage = self.maybe_deescalate(&mut run, &context);
                    return run.finish(Outcome::Succeeded, final_stage, Some(response));
                }
                AttemptOutcome::Cancelled => {
                    context.record_step("execute", "cancelled", false);
                    run.steps_used += context.steps.len() as u32;
                    info!(session = %run.session_id, stage = %stage, "Run cancelled mid-attempt");
                    return run.fail(Outcome::FailedExhausted, AutonomyError::Cancelled);
                }
                AttemptOutcome::TimedOut => {
                    context.record_step("execute", "abandoned: time budget exhausted", false);
                    run.steps_used += context.steps.len() as u32;
                    let err = self
                        .budget_violation(&run)
                        .unwrap_or_else(|| self.time_exceeded(&run));
                    warn!(session = %run.session_id, stage = %stage, error = %err, "Executor call exceeded time budget");
                    return run.fail(Outcome::FailedBudget, err);
                }
                AttemptOutcome::Failed(message) => message,
            };

            // Failed attempt.
            context.record_step("execute", &message, false);
            run.steps_used += context.steps.len() as u32;
            let failure = AutonomyError::ExecutorFailure {
                stage,
                message: message.clone(),
            };
            warn!(session = %run.session_id, stage = %stage, error = %message, "Attempt failed");
            run.ledger.warnings.push(failure.to_string());
            // Every later attempt, recovery retries included, carries the failure.
            run.signals.insert(Signal::ToolFailure);

            if let Some(err) = self.budget_violation(&run) {
                warn!(session = %run.session_id, error = %err, "Budget exhausted after failure");
                return run.fail(Outcome::FailedBudget, err);
            }

            // The executor's own tool calls may already form a loop that the
            // attempt record below would mask.
            let executor_loop = detector.loop_type();
            detector.record_action("stage_attempt", &json!({ "stage": stage }), &message, false);

            if let Some(loop_type) = detector.loop_type().or(executor_loop) {
                run.loop_type = Some(loop_type);
                match detector.next_recovery() {
                    RecoveryAction::RetryDifferent => {
                        let delay = self.cap_to_budget(&run, detector.apply_backoff());
                        info!(session = %run.session_id, stage = %stage, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return run.fail(Outcome::FailedExhausted, AutonomyError::Cancelled);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        recovery = Some(RecoveryAction::RetryDifferent.instruction());
                        continue;
                    }
                    RecoveryAction::EscalateModel => match stage.next() {
                        Some(next) => {
                            self.transition(&mut run, next, TransitionReason::Recovery);
                            recovery = Some(RecoveryAction::EscalateModel.instruction());
                            continue;
                        }
                        None => {
                            let err = AutonomyError::DoomLoopDetected {
                                loop_type,
                                recovery_attempts: detector.recovery_attempts(),
                            };
                            return run.fail(Outcome::FailedDoomLoop, err);
                        }
                    },
                    RecoveryAction::Abort => {
                        let err = AutonomyError::DoomLoopDetected {
                            loop_type,
                            recovery_attempts: detector.recovery_attempts(),
                        };
                        return run.fail(Outcome::FailedDoomLoop, err);
                    }
                }
            }

            if context.should_escalate(&self.config) {
                self.transition(&mut run, stage.escalated(), TransitionReason::Escalation);
                continue;
            }

            info!(
                session = %run.session_id,
                stage = %stage,
                auto_escalate = self.config.auto_escalate,
                "No further escalation possible"
            );
            return run.fail(Outcome::FailedExhausted, failure);
        }
    }

    async fn attempt(
        &self,
        request: &str,
        run: &mut Run,
        context: &mut StageContext,
        detector: &mut DoomLoopDetector,
        recovery: Option<&'static str>,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let remaining = self.remaining_time(run);
        let mut turn = StageTurn {
            request,
            stage: run.stage,
            attempt: run.attempts,
            recovery,
            cancel: cancel.clone(),
            context,
            detector,
            ledger: &mut run.ledger,
            max_tool_calls: self.config.max_tool_calls,
        };

        let call = self.executor.execute(&mut turn);
        let bounded = async move {
            match remaining {
                Some(limit) => tokio::time::timeout(limit, call).await.ok(),
                None => Some(call.await),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => AttemptOutcome::Cancelled,
            result = bounded => match result {
                None => AttemptOutcome::TimedOut,
                Some(Ok(response)) => AttemptOutcome::Succeeded(response),
                Some(Err(e)) => AttemptOutcome::Failed(format!("{e:#}")),
            },
        }
    }

    fn transition(&self, run: &mut Run, to: Stage, reason: TransitionReason) {
        let from = run.stage;
        run.escalations += 1;
        run.history.push(StageTransition { from, to, reason });
        run.stage = to;
        info!(
            session = %run.session_id,
            from = %from,
            to = %to,
            reason = ?reason,
            escalations = run.escalations,
            "Stage escalated"
        );
        self.hooks.on_stage_change(from, to);
    }

    /// Reporting-only step down after a clean success.
    fn maybe_deescalate(&self, run: &mut Run, context: &StageContext) -> Stage {
        let stage = run.stage;
        if !context.should_deescalate(&self.config) {
            return stage;
        }
        match stage.previous() {
            Some(lower) => {
                info!(session = %run.session_id, from = %stage, to = %lower, "Reporting de-escalated stage");
                run.history.push(StageTransition {
                    from: stage,
                    to: lower,
                    reason: TransitionReason::Deescalation,
                });
                self.hooks.on_stage_change(stage, lower);
                lower
            }
            None => stage,
        }
    }

    fn remaining_time(&self, run: &Run) -> Option<Duration> {
        self.config
            .time_budget()
            .map(|limit| limit.saturating_sub(run.started.elapsed()))
    }

    fn cap_to_budget(&self, run: &Run, delay: Duration) -> Duration {
        match self.remaining_time(run) {
            Some(left) => delay.min(left),
            None => delay,
        }
    }

    fn time_exceeded(&self, run: &Run) -> AutonomyError {
        AutonomyError::BudgetExceeded {
            budget: BudgetKind::Time,
            used: run.started.elapsed().as_secs_f64().ceil() as u64,
            limit: self.config.max_time_seconds.ceil() as u64,
        }
    }

    /// The first exhausted budget, if any. Zero limits are unlimited.
    fn budget_violation(&self, run: &Run) -> Option<AutonomyError> {
        let cfg = &self.config;
        if let Some(limit) = cfg.time_budget() {
            if run.started.elapsed() >= limit {
                return Some(self.time_exceeded(run));
            }
        }
        let checks = [
            (BudgetKind::Steps, u64::from(run.steps_used), u64::from(cfg.max_steps)),
            (BudgetKind::Tokens, run.ledger.tokens, cfg.max_tokens),
            (
                BudgetKind::ToolCalls,
                u64::from(run.ledger.tool_calls),
                u64::from(cfg.max_tool_calls),
            ),
        ];
        checks
            .into_iter()
            .find(|&(_, used, limit)| limit > 0 && used >= limit)
            .map(|(budget, used, limit)| AutonomyError::BudgetExceeded { budget, used, limit })
    }
}
