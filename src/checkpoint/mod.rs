//! Durable run state and resume.
//!
//! `.marshal/checkpoint.json` is the only source of truth for resuming a run.
//! It is written atomically after every phase transition by the
//! [`CheckpointManager`], which also holds an exclusive lock on
//! `.marshal/checkpoint.lock` for the whole run.
//!
//! | Submodule  | What it owns                                                   |
//! |------------|----------------------------------------------------------------|
//! | `snapshot` | `Checkpoint`, `ProjectState`, `MilestoneState`, `PhaseRecord`  |
//! | `store`    | atomic save, versioned load                                    |
//! | `manager`  | directory lock, serialized commits, resume recovery            |

mod manager;
mod snapshot;
mod store;

pub use manager::{CHECKPOINT_FILE, CheckpointManager, LOCK_FILE, OpenMode};
pub use snapshot::{
    CHECKPOINT_VERSION, Checkpoint, Ledger, MilestoneState, PhaseRecord, PhaseState, ProjectState,
};
pub use store::CheckpointStore;
