//! Stage escalation: pick a starting autonomy level for a request and
//! climb when attempts fail.

pub mod context;
pub mod pipeline;
pub mod recommender;
pub mod result;
pub mod signals;
pub mod stage;

pub use context::{StageContext, StepRecord};
pub use pipeline::{
    BlockingExecutor, EscalationHooks, EscalationPipeline, NoopHooks, StageExecutor, StageTurn,
};
pub use recommender::StageRecommender;
pub use result::{EscalationResult, Outcome, StageTransition, TransitionReason};
pub use signals::{RequestContext, Signal, SignalDetector, SignalSet};
pub use stage::Stage;
