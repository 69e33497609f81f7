//! Dependency graph scheduling for milestone phases.
//!
//! Each milestone's phases form a directed acyclic graph declared through
//! explicit `depends_on` lists. The graph is never inferred.
//!
//! [`DagScheduler::from_phases`] rejects unknown dependencies, duplicate
//! names and cycles; the scheduler then answers `ready_phases`,
//! `compute_waves` and `downstream_of` queries without executing anything.
//!
//! ## Example
//!
//! ```no_run
//! use marshal::dag::DagScheduler;
//! use marshal::phase::PhaseSpec;
//! use std::collections::HashSet;
//!
//! # fn example() -> anyhow::Result<()> {
//! let phases = vec![
//!     PhaseSpec::new("research", &[]),
//!     PhaseSpec::new("lint", &["research"]),
//!     PhaseSpec::new("typecheck", &["research"]),
//!     PhaseSpec::new("test", &["lint", "typecheck"]),
//! ];
//!
//! let scheduler = DagScheduler::from_phases(&phases)?;
//! let completed: HashSet<String> = ["research".to_string()].into();
//! let ready = scheduler.ready_phases(&completed, &HashSet::new());
//! // ready == {"lint", "typecheck"}
//! # Ok(())
//! # }
//! ```

mod scheduler;

pub use scheduler::DagScheduler;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseSpec;

    #[test]
    fn test_dag_construction_rejects_cycle() {
        let phases = vec![
            PhaseSpec::new("a", &["c"]),
            PhaseSpec::new("b", &["a"]),
            PhaseSpec::new("c", &["b"]),
        ];

        let err = DagScheduler::from_phases(&phases).unwrap_err().to_string();
        assert!(err.contains("Cycle"));
    }

    #[test]
    fn test_missing_dependency() {
        let phases = vec![PhaseSpec::new("a", &["nonexistent"])];
        let err = DagScheduler::from_phases(&phases).unwrap_err().to_string();
        assert!(err.contains("Unknown dependency"));
    }
}
