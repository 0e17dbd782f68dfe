//! Doom-loop detection: spotting an executor that is stuck, and deciding
//! how hard to push back.

pub mod detector;
pub mod recovery;

pub use detector::{action_signature, DoomLoopDetector, DoomLoopStats, LoopType};
pub use recovery::{Backoff, RecoveryAction};
