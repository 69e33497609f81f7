//! Failure pattern learning for retry-loop detection.
//!
//! | Submodule    | What it owns                                                  |
//! |--------------|---------------------------------------------------------------|
//! | `learning`   | `FailureRecord`, `PatternMemory`, `FailurePatternLearner`     |
//! | `similarity` | diagnostic normalization, `fingerprint()`, `jaccard()`        |

pub mod learning;
pub mod similarity;

pub use learning::{
    DIAGNOSTIC_EXCERPT_LEN, FailurePatternLearner, FailureRecord, LearnerConfig, LoopAction,
    LoopSignal, PatternMemory, PhaseHistory, corrective_constraint, phase_key,
};
