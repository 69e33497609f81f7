//! CLI command implementations.
//!
//! | Module    | Commands handled             |
//! |-----------|------------------------------|
//! | `run`     | `Run`, `Resume`              |
//! | `phase`   | `Status`, `Phases`, `Reset`  |
//! | `project` | `Init`                       |
//! | `config`  | `Config`                     |

pub mod config;
pub mod phase;
pub mod project;
pub mod run;

pub use config::cmd_config;
pub use phase::{cmd_phases, cmd_reset, cmd_status};
pub use project::cmd_init;
pub use run::{StartMode, cmd_run};
