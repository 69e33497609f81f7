//! The checkpoint data model: project, milestones, phases, cost and failure log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::errors::CheckpointError;
use crate::patterns::{FailureRecord, PatternMemory};
use crate::phase::{MilestoneSpec, PhaseSpec};
use crate::recovery::ErrorClassification;

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Lifecycle state of one phase.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Pending,
    Running {
        attempt: u32,
        session_id: String,
        started_at: DateTime<Utc>,
    },
    EvidenceValidating {
        attempt: u32,
    },
    Success {
        completed_at: DateTime<Utc>,
    },
    Failed {
        classification: ErrorClassification,
    },
    FatalStop {
        classification: ErrorClassification,
    },
}

impl PhaseState {
    pub fn label(&self) -> &'static str {
        match self {
            PhaseState::Pending => "pending",
            PhaseState::Running { .. } => "running",
            PhaseState::EvidenceValidating { .. } => "evidence_validating",
            PhaseState::Success { .. } => "success",
            PhaseState::Failed { .. } => "failed",
            PhaseState::FatalStop { .. } => "fatal_stop",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PhaseState::Success { .. })
    }

    /// Running or validating: an invocation was in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PhaseState::Running { .. } | PhaseState::EvidenceValidating { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PhaseState::FatalStop { .. })
    }

    /// Eligible to be started by the state machine.
    pub fn is_startable(&self) -> bool {
        matches!(self, PhaseState::Pending | PhaseState::Failed { .. })
    }
}

/// Durable record of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub state: PhaseState,
    /// Attempts started; reset only by a step-back
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub last_failure: Option<FailureRecord>,
    /// Corrective constraints appended to every later payload
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Per-phase commit sequence
    #[serde(default)]
    pub revision: u64,
    /// HEAD when the current attempt started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_head: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_id: Option<String>,
}

impl PhaseRecord {
    pub fn from_spec(spec: &PhaseSpec) -> Self {
        Self {
            name: spec.name.clone(),
            depends_on: spec.depends_on.clone(),
            state: PhaseState::Pending,
            attempts: 0,
            cost_usd: 0.0,
            last_failure: None,
            constraints: Vec::new(),
            revision: 0,
            baseline_head: None,
            last_session_id: None,
        }
    }

    /// Return to `Pending` with a fresh attempt budget.
    pub fn reset(&mut self) {
        self.state = PhaseState::Pending;
        self.attempts = 0;
        self.last_failure = None;
        self.constraints.clear();
        self.baseline_head = None;
        self.revision += 1;
    }
}

/// Durable record of one milestone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MilestoneState {
    pub name: String,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    /// Set only once every phase is `Success`
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub step_backs: u32,
}

impl MilestoneState {
    pub fn from_spec(spec: &MilestoneSpec) -> Self {
        Self {
            name: spec.name.clone(),
            phases: spec.phases.iter().map(PhaseRecord::from_spec).collect(),
            completed: false,
            step_backs: 0,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_mut(&mut self, name: &str) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().find(|p| p.name == name)
    }

    /// Names of phases in `Success`.
    pub fn completed_set(&self) -> HashSet<String> {
        self.phases
            .iter()
            .filter(|p| p.state.is_success())
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn all_success(&self) -> bool {
        !self.phases.is_empty() && self.phases.iter().all(|p| p.state.is_success())
    }

    /// First phase in `FatalStop`, if any.
    pub fn fatal_phase(&self) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.state.is_fatal())
    }

    pub fn cost_usd(&self) -> f64 {
        self.phases.iter().map(|p| p.cost_usd).sum()
    }
}

/// Root aggregate: the project and its milestones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    #[serde(default)]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub milestones: Vec<MilestoneState>,
    /// Index of the first milestone not yet completed
    #[serde(default)]
    pub current_milestone: usize,
}

impl ProjectState {
    pub fn milestone(&self, name: &str) -> Option<&MilestoneState> {
        self.milestones.iter().find(|m| m.name == name)
    }

    pub fn milestone_mut(&mut self, name: &str) -> Option<&mut MilestoneState> {
        self.milestones.iter_mut().find(|m| m.name == name)
    }

    /// Move the progress pointer past completed milestones.
    pub fn advance_pointer(&mut self) {
        self.current_milestone = self
            .milestones
            .iter()
            .position(|m| !m.completed)
            .unwrap_or(self.milestones.len());
    }
}

/// Mutable views of the checkpoint-wide ledgers, borrowed alongside one phase.
pub struct Ledger<'a> {
    pub failures: &'a mut Vec<FailureRecord>,
    pub patterns: &'a mut PatternMemory,
    pub total_cost_usd: &'a mut f64,
}

/// The full persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub project: ProjectState,
    #[serde(default)]
    pub total_cost_usd: f64,
    /// Append-only failure log
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    #[serde(default)]
    pub patterns: PatternMemory,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Number of commits written
    #[serde(default)]
    pub sequence: u64,
}

fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

impl Checkpoint {
    /// A fresh checkpoint with every phase `Pending`.
    pub fn new(project: &str, milestones: &[MilestoneSpec]) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            project: ProjectState {
                id: Uuid::new_v4(),
                name: project.to_string(),
                milestones: milestones.iter().map(MilestoneState::from_spec).collect(),
                current_milestone: 0,
            },
            total_cost_usd: 0.0,
            failures: Vec::new(),
            patterns: PatternMemory::default(),
            updated_at: Utc::now(),
            sequence: 0,
        }
    }

    /// Align the stored milestones with the current milestone definitions.
    ///
    /// Known phases keep their state; new phases start `Pending`; phases and
    /// milestones no longer defined are dropped. Dependencies always come from
    /// the definitions.
    pub fn reconcile(&mut self, specs: &[MilestoneSpec]) {
        let mut previous = std::mem::take(&mut self.project.milestones);
        let mut reconciled = Vec::with_capacity(specs.len());

        for spec in specs {
            let mut state = match previous.iter().position(|m| m.name == spec.name) {
                Some(pos) => previous.swap_remove(pos),
                None => MilestoneState::from_spec(spec),
            };
            let mut old_phases = std::mem::take(&mut state.phases);
            state.phases = spec
                .phases
                .iter()
                .map(|phase_spec| {
                    match old_phases.iter().position(|p| p.name == phase_spec.name) {
                        Some(pos) => {
                            let mut record = old_phases.swap_remove(pos);
                            record.depends_on = phase_spec.depends_on.clone();
                            record
                        }
                        None => PhaseRecord::from_spec(phase_spec),
                    }
                })
                .collect();
            state.completed = state.all_success();
            reconciled.push(state);
        }

        self.project.milestones = reconciled;
        self.project.advance_pointer();
    }

    /// Demote phases caught mid-attempt to `Failed{RetryableTransient}`.
    ///
    /// The attempt already counted stays counted. Each demoted phase gets one
    /// failure record. Returns `(milestone, phase)` pairs that were demoted.
    pub fn recover_interrupted(&mut self) -> Vec<(String, String)> {
        let mut recovered = Vec::new();
        for milestone in &mut self.project.milestones {
            for phase in &mut milestone.phases {
                if !phase.state.is_active() {
                    continue;
                }
                let diagnostic = format!(
                    "interrupted while {}; the worker invocation cannot be presumed alive",
                    phase.state.label()
                );
                let record = FailureRecord::new(
                    &milestone.name,
                    &phase.name,
                    phase.attempts,
                    ErrorClassification::RetryableTransient,
                    &diagnostic,
                );
                phase.state = PhaseState::Failed {
                    classification: ErrorClassification::RetryableTransient,
                };
                phase.last_failure = Some(record.clone());
                phase.revision += 1;
                self.failures.push(record);
                recovered.push((milestone.name.clone(), phase.name.clone()));
            }
        }
        recovered
    }

    pub fn phase(&self, milestone: &str, phase: &str) -> Option<&PhaseRecord> {
        self.project.milestone(milestone)?.phase(phase)
    }

    pub fn milestone_mut(&mut self, milestone: &str) -> Result<&mut MilestoneState, CheckpointError> {
        self.project
            .milestone_mut(milestone)
            .ok_or_else(|| CheckpointError::UnknownMilestone {
                milestone: milestone.to_string(),
            })
    }

    pub fn phase_mut(&mut self, milestone: &str, phase: &str) -> Result<&mut PhaseRecord, CheckpointError> {
        self.split_phase_mut(milestone, phase).map(|(record, _)| record)
    }

    /// Borrow one phase together with the checkpoint-wide ledgers.
    pub fn split_phase_mut(
        &mut self,
        milestone: &str,
        phase: &str,
    ) -> Result<(&mut PhaseRecord, Ledger<'_>), CheckpointError> {
        let Checkpoint {
            project,
            failures,
            patterns,
            total_cost_usd,
            ..
        } = self;
        let record = project
            .milestone_mut(milestone)
            .and_then(|m| m.phase_mut(phase))
            .ok_or_else(|| CheckpointError::UnknownPhase {
                milestone: milestone.to_string(),
                phase: phase.to_string(),
            })?;
        Ok((
            record,
            Ledger {
                failures,
                patterns,
                total_cost_usd,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{MilestoneSpec, PhaseSpec, names};

    fn small() -> MilestoneSpec {
        MilestoneSpec {
            name: "mvp".to_string(),
            description: String::new(),
            phases: vec![
                PhaseSpec::new("research", &[]),
                PhaseSpec::new("planning", &["research"]),
                PhaseSpec::new("test", &["planning"]),
            ],
        }
    }

    #[test]
    fn test_new_checkpoint_is_all_pending() {
        let cp = Checkpoint::new("demo", &[small()]);
        assert_eq!(cp.version, CHECKPOINT_VERSION);
        assert_eq!(cp.project.name, "demo");
        let m = &cp.project.milestones[0];
        assert_eq!(m.phases.len(), 3);
        assert!(m.phases.iter().all(|p| p.state == PhaseState::Pending));
        assert!(!m.completed);
    }

    #[test]
    fn test_phase_state_serializes_with_status_tag() {
        let state = PhaseState::Failed {
            classification: ErrorClassification::RetryableTransient,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(
            json,
            r#"{"status":"failed","classification":"retryable_transient"}"#
        );
    }

    #[test]
    fn test_recover_interrupted_demotes_running_phase() {
        let mut cp = Checkpoint::new("demo", &[small()]);
        {
            let phase = cp.phase_mut("mvp", "test").unwrap();
            phase.attempts = 1;
            phase.state = PhaseState::Running {
                attempt: 1,
                session_id: "s".to_string(),
                started_at: Utc::now(),
            };
        }
        let recovered = cp.recover_interrupted();
        assert_eq!(recovered, vec![("mvp".to_string(), "test".to_string())]);

        let phase = cp.phase("mvp", "test").unwrap();
        assert_eq!(
            phase.state,
            PhaseState::Failed {
                classification: ErrorClassification::RetryableTransient
            }
        );
        assert_eq!(phase.attempts, 1);
        assert_eq!(cp.failures.len(), 1);
        assert!(phase.last_failure.as_ref().unwrap().diagnostic.contains("interrupted"));
    }

    #[test]
    fn test_reconcile_keeps_state_and_adds_new_phases() {
        let mut cp = Checkpoint::new("demo", &[small()]);
        cp.phase_mut("mvp", "research").unwrap().state = PhaseState::Success {
            completed_at: Utc::now(),
        };

        let mut grown = small();
        grown.phases.push(PhaseSpec::new(names::COMMIT, &["test"]));
        cp.reconcile(&[grown]);

        let m = &cp.project.milestones[0];
        assert_eq!(m.phases.len(), 4);
        assert!(m.phase("research").unwrap().state.is_success());
        assert_eq!(m.phase("commit").unwrap().state, PhaseState::Pending);
    }

    #[test]
    fn test_reconcile_drops_unknown_milestones() {
        let mut cp = Checkpoint::new("demo", &[small()]);
        let other = MilestoneSpec::with_default_pipeline("v2");
        cp.reconcile(&[other]);
        assert_eq!(cp.project.milestones.len(), 1);
        assert_eq!(cp.project.milestones[0].name, "v2");
    }

    #[test]
    fn test_missing_fields_are_defaulted() {
        let json = r#"{"project":{"name":"old","milestones":[{"name":"mvp","phases":[{"name":"research"}]}]},"extra":true}"#;
        let cp: Checkpoint = serde_json::from_str(json).unwrap();
        assert_eq!(cp.version, CHECKPOINT_VERSION);
        let phase = cp.phase("mvp", "research").unwrap();
        assert_eq!(phase.state, PhaseState::Pending);
        assert_eq!(phase.attempts, 0);
    }

    #[test]
    fn test_split_phase_mut_unknown_phase() {
        let mut cp = Checkpoint::new("demo", &[small()]);
        let err = cp.split_phase_mut("mvp", "nope").err().unwrap();
        assert!(matches!(err, CheckpointError::UnknownPhase { .. }));
    }

    #[test]
    fn test_advance_pointer_skips_completed() {
        let mut cp = Checkpoint::new(
            "demo",
            &[small(), MilestoneSpec::with_default_pipeline("v2")],
        );
        cp.project.milestones[0].completed = true;
        cp.project.advance_pointer();
        assert_eq!(cp.project.current_milestone, 1);
        cp.project.milestones[1].completed = true;
        cp.project.advance_pointer();
        assert_eq!(cp.project.current_milestone, 2);
    }
}
