//! DAG scheduler for computing which phases may start.
//!
//! The scheduler is pure: it answers questions about the dependency graph given
//! the sets of completed and running phases, and never executes anything.

use crate::phase::PhaseSpec;
use anyhow::{Result, bail};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// The dependency graph scheduler for one milestone.
///
/// Phases are addressed by declaration position; `dependencies[i]` and
/// `dependents[i]` hold the positions on either side of phase `i`.
#[derive(Debug, Clone)]
pub struct DagScheduler {
    names: Vec<String>,
    positions: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl DagScheduler {
    /// Index `phases` and reject duplicate names, unknown dependencies and cycles.
    pub fn from_phases(phases: &[PhaseSpec]) -> Result<Self> {
        let mut positions = HashMap::with_capacity(phases.len());
        for (i, phase) in phases.iter().enumerate() {
            if positions.insert(phase.name.clone(), i).is_some() {
                bail!("Duplicate phase name: {}", phase.name);
            }
        }

        let mut dependencies = vec![Vec::new(); phases.len()];
        let mut dependents = vec![Vec::new(); phases.len()];
        for (i, phase) in phases.iter().enumerate() {
            for dep in &phase.depends_on {
                let Some(&d) = positions.get(dep) else {
                    bail!("Unknown dependency '{}' declared by phase '{}'", dep, phase.name);
                };
                if !dependencies[i].contains(&d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let scheduler = Self {
            names: phases.iter().map(|p| p.name.clone()).collect(),
            positions,
            dependencies,
            dependents,
        };
        scheduler.reject_cycles()?;
        Ok(scheduler)
    }

    /// Kahn's algorithm: whatever never reaches zero in-degree sits on a cycle.
    fn reject_cycles(&self) -> Result<()> {
        let mut pending: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut free: Vec<usize> = (0..pending.len()).filter(|&i| pending[i] == 0).collect();
        while let Some(i) = free.pop() {
            for &next in &self.dependents[i] {
                pending[next] -= 1;
                if pending[next] == 0 {
                    free.push(next);
                }
            }
        }

        let stuck: Vec<&str> = (0..pending.len())
            .filter(|&i| pending[i] > 0)
            .map(|i| self.names[i].as_str())
            .collect();
        if !stuck.is_empty() {
            bail!("Cycle in phase dependencies through: {}", stuck.join(", "));
        }
        Ok(())
    }

    pub fn phase_count(&self) -> usize {
        self.names.len()
    }

    /// Check whether a phase exists in this graph.
    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    fn satisfied(&self, i: usize, completed: &HashSet<String>) -> bool {
        self.dependencies[i]
            .iter()
            .all(|&d| completed.contains(&self.names[d]))
    }

    /// Phases whose full dependency set is a subset of `completed`, which are
    /// themselves neither completed nor running.
    pub fn ready_phases(
        &self,
        completed: &HashSet<String>,
        running: &HashSet<String>,
    ) -> BTreeSet<String> {
        self.names
            .iter()
            .enumerate()
            .filter(|(_, name)| !completed.contains(*name) && !running.contains(*name))
            .filter(|(i, _)| self.satisfied(*i, completed))
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Group phases into waves: every phase of a wave can run once all
    /// earlier waves are done.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut completed: HashSet<String> = HashSet::new();

        loop {
            let ready: Vec<String> = self
                .names
                .iter()
                .enumerate()
                .filter(|(i, name)| !completed.contains(*name) && self.satisfied(*i, &completed))
                .map(|(_, name)| name.clone())
                .collect();

            if ready.is_empty() {
                break;
            }

            completed.extend(ready.iter().cloned());
            waves.push(ready);
        }

        waves
    }

    /// All transitive dependents of a phase, in declaration order, excluding the phase itself.
    pub fn downstream_of(&self, name: &str) -> Vec<String> {
        self.reach(name, &self.dependents)
    }

    /// All transitive dependencies of a phase, in declaration order, excluding the phase itself.
    pub fn upstream_of(&self, name: &str) -> Vec<String> {
        self.reach(name, &self.dependencies)
    }

    fn reach(&self, name: &str, edges: &[Vec<usize>]) -> Vec<String> {
        let Some(&start) = self.positions.get(name) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.names.len()];
        let mut queue: VecDeque<usize> = edges[start].iter().copied().collect();
        while let Some(i) = queue.pop_front() {
            if !std::mem::replace(&mut seen[i], true) {
                queue.extend(edges[i].iter().copied());
            }
        }
        self.names
            .iter()
            .zip(seen)
            .filter_map(|(name, hit)| hit.then(|| name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::default_pipeline;

    fn phase(name: &str, deps: &[&str]) -> PhaseSpec {
        PhaseSpec::new(name, deps)
    }

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_wave_computation_linear() {
        let phases = vec![phase("a", &[]), phase("b", &["a"]), phase("c", &["b"])];

        let scheduler = DagScheduler::from_phases(&phases).unwrap();
        let waves = scheduler.compute_waves();

        assert_eq!(waves, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_wave_computation_default_pipeline() {
        let scheduler = DagScheduler::from_phases(&default_pipeline()).unwrap();
        let waves = scheduler.compute_waves();

        assert_eq!(waves.len(), 10);
        assert_eq!(waves[4], vec!["lint", "typecheck"]);
        assert_eq!(waves[9], vec!["commit"]);
    }

    #[test]
    fn test_ready_phases_initial_and_after_completion() {
        let phases = vec![
            phase("research", &[]),
            phase("lint", &["research"]),
            phase("typecheck", &["research"]),
            phase("test", &["lint", "typecheck"]),
        ];
        let scheduler = DagScheduler::from_phases(&phases).unwrap();

        let ready = scheduler.ready_phases(&set(&[]), &set(&[]));
        assert_eq!(ready.into_iter().collect::<Vec<_>>(), vec!["research"]);

        let ready = scheduler.ready_phases(&set(&["research"]), &set(&[]));
        assert_eq!(
            ready.into_iter().collect::<Vec<_>>(),
            vec!["lint", "typecheck"]
        );

        let ready = scheduler.ready_phases(&set(&["research", "lint"]), &set(&["typecheck"]));
        assert!(ready.is_empty());

        let ready = scheduler.ready_phases(&set(&["research", "lint", "typecheck"]), &set(&[]));
        assert_eq!(ready.into_iter().collect::<Vec<_>>(), vec!["test"]);
    }

    #[test]
    fn test_ready_phases_never_returns_unsatisfied_phase() {
        let scheduler = DagScheduler::from_phases(&default_pipeline()).unwrap();
        let names: Vec<String> = default_pipeline().into_iter().map(|p| p.name).collect();

        // Every subset along a prefix of the pipeline, with an arbitrary running set.
        for completed_len in 0..=names.len() {
            let completed: HashSet<String> = names[..completed_len].iter().cloned().collect();
            for running_name in &names {
                let running = set(&[running_name.as_str()]);
                for ready in scheduler.ready_phases(&completed, &running) {
                    let spec = default_pipeline().into_iter().find(|p| p.name == ready).unwrap();
                    assert!(spec.depends_on.iter().all(|d| completed.contains(d)));
                    assert!(!completed.contains(&ready));
                    assert!(!running.contains(&ready));
                }
            }
        }
    }

    #[test]
    fn test_duplicate_phase_name_rejected() {
        let err = DagScheduler::from_phases(&[phase("a", &[]), phase("a", &[])]).unwrap_err();
        assert!(err.to_string().contains("Duplicate phase name: a"));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = DagScheduler::from_phases(&[phase("a", &["a"])]).unwrap_err();
        assert!(err.to_string().contains("Cycle"));
    }

    #[test]
    fn test_repeated_dependency_counts_once() {
        let scheduler = DagScheduler::from_phases(&[phase("a", &[]), phase("b", &["a", "a"])]).unwrap();
        assert_eq!(scheduler.compute_waves(), vec![vec!["a"], vec!["b"]]);
        assert_eq!(scheduler.downstream_of("a"), vec!["b"]);
    }

    #[test]
    fn test_empty_graph_has_no_waves() {
        let scheduler = DagScheduler::from_phases(&[]).unwrap();
        assert_eq!(scheduler.phase_count(), 0);
        assert!(scheduler.compute_waves().is_empty());
    }

    #[test]
    fn test_downstream_of_collects_transitive_dependents() {
        let scheduler = DagScheduler::from_phases(&default_pipeline()).unwrap();

        let downstream = scheduler.downstream_of("implementation");
        assert_eq!(downstream[0], "architecture-review");
        assert!(downstream.contains(&"lint".to_string()));
        assert!(downstream.contains(&"commit".to_string()));
        assert!(!downstream.contains(&"implementation".to_string()));
        assert!(!downstream.contains(&"planning".to_string()));

        assert!(scheduler.downstream_of("commit").is_empty());
        assert!(scheduler.downstream_of("missing").is_empty());
    }

    #[test]
    fn test_upstream_of_collects_transitive_dependencies() {
        let scheduler = DagScheduler::from_phases(&default_pipeline()).unwrap();
        let upstream = scheduler.upstream_of("test");
        assert_eq!(
            upstream,
            vec![
                "research",
                "planning",
                "implementation",
                "architecture-review",
                "lint",
                "typecheck"
            ]
        );
    }
}
