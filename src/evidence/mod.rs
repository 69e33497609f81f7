//! Evidence validation: worker-reported success is never enough.
//!
//! After a worker claims success the phase enters `EvidenceValidating` and the
//! [`EvidenceValidator`] checks the phase's [`EvidenceContract`] against the
//! project directory, external checker processes and git history.

pub mod checker;
pub mod contract;
mod validator;

pub use checker::{CheckerConfig, CheckerReport, DefectParser, default_checkers, run_checker};
pub use contract::{ContractRegistry, EvidenceContract, PLACEHOLDER_PATTERN, Predicate};
pub use validator::{EvidenceContext, EvidenceValidator, EvidenceVerdict};
