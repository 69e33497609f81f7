//! Run orchestration: the per-phase state machine and the milestone runner.

pub mod events;
pub mod machine;
pub mod payload;
pub mod runner;
pub mod settings;

pub use events::RunEvent;
pub use machine::{FatalReport, MilestonePlan, PhaseOutcome, PhaseStateMachine};
pub use payload::{PayloadInput, build_payload};
pub use runner::{EXIT_INTERRUPTED, Orchestrator, RunOutcome, RunScope};
pub use settings::{PhaseSettings, RunSettings};
