//! Milestone runner: a bounded worker pool over the dependency graph.
//!
//! For each milestone the runner repeatedly asks the scheduler which phases
//! are ready (dependencies `Success` in the checkpoint), starts each one as a
//! task on a [`JoinSet`] guarded by a [`Semaphore`], and reacts to the
//! outcomes. Milestones run in order; the run stops at the first milestone
//! that halts.

use anyhow::anyhow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;

use super::events::RunEvent;
use super::machine::{FatalReport, MilestonePlan, PhaseOutcome, PhaseStateMachine};
use super::settings::RunSettings;
use crate::checkpoint::CheckpointManager;
use crate::errors::{CheckpointError, OrchestratorError};
use crate::evidence::EvidenceValidator;
use crate::phase::MilestoneSpec;
use crate::recovery::ErrorClassifier;
use crate::worker::WorkerGateway;

/// Exit status for a run that can be resumed.
pub const EXIT_INTERRUPTED: u8 = 75;

/// Which milestones a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    /// Every milestone in order, skipping completed ones
    All,
    /// A single milestone by name
    Milestone(String),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every milestone in scope is complete
    Completed,
    /// A phase stopped its milestone
    Fatal(FatalReport),
    /// Reported cost passed the configured bound
    BudgetExceeded { spent_usd: f64, limit_usd: f64 },
    /// Cancelled; the checkpoint can be resumed
    Interrupted,
}

impl RunOutcome {
    /// Process exit status: 0 complete, 1 fatal or over budget, 75 interrupted.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Fatal(_) | RunOutcome::BudgetExceeded { .. } => 1,
            RunOutcome::Interrupted => EXIT_INTERRUPTED,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Fatal(_) => "fatal",
            RunOutcome::BudgetExceeded { .. } => "budget_exceeded",
            RunOutcome::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "all milestones complete"),
            RunOutcome::Fatal(report) => write!(f, "{}", report),
            RunOutcome::BudgetExceeded {
                spent_usd,
                limit_usd,
            } => write!(
                f,
                "cost bound exceeded: spent ${:.2} of ${:.2}",
                spent_usd, limit_usd
            ),
            RunOutcome::Interrupted => write!(f, "interrupted; run `marshal resume` to continue"),
        }
    }
}

/// Drives milestones to completion.
pub struct Orchestrator {
    checkpoint: Arc<CheckpointManager>,
    machine: PhaseStateMachine,
    settings: Arc<RunSettings>,
    milestones: Vec<MilestoneSpec>,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl Orchestrator {
    pub fn new(
        checkpoint: Arc<CheckpointManager>,
        gateway: Arc<dyn WorkerGateway>,
        classifier: ErrorClassifier,
        validator: EvidenceValidator,
        settings: RunSettings,
        milestones: Vec<MilestoneSpec>,
    ) -> Self {
        let settings = Arc::new(settings);
        let machine = PhaseStateMachine::new(
            checkpoint.clone(),
            gateway,
            Arc::new(classifier),
            Arc::new(validator),
            settings.clone(),
        );
        Self {
            checkpoint,
            machine,
            settings,
            milestones,
            events: None,
        }
    }

    /// Set an event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.machine = self.machine.with_event_channel(tx.clone());
        self.events = Some(tx);
        self
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointManager> {
        &self.checkpoint
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Run the milestones in `scope` until they complete or the run halts.
    pub async fn run(
        &self,
        scope: RunScope,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        let selected: Vec<&MilestoneSpec> = match &scope {
            RunScope::All => self.milestones.iter().collect(),
            RunScope::Milestone(name) => vec![
                self.milestones
                    .iter()
                    .find(|m| &m.name == name)
                    .ok_or_else(|| OrchestratorError::UnknownMilestone { name: name.clone() })?,
            ],
        };
        let plans = selected
            .into_iter()
            .map(|spec| MilestonePlan::new(spec.clone()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let mut outcome = RunOutcome::Completed;
        for plan in plans {
            let completed = self
                .checkpoint
                .read(|cp| cp.project.milestone(plan.name()).map(|m| m.completed))
                .await
                .ok_or_else(|| CheckpointError::UnknownMilestone {
                    milestone: plan.name().to_string(),
                })?;
            if completed {
                tracing::info!(milestone = plan.name(), "milestone already complete, skipping");
                continue;
            }
            if let Some(halted) = self.run_milestone(&plan, &cancel).await? {
                outcome = halted;
                break;
            }
        }

        let total_cost_usd = self.checkpoint.read(|cp| cp.total_cost_usd).await;
        tracing::info!(outcome = outcome.label(), total_cost_usd, "run finished");
        self.emit(RunEvent::RunFinished {
            outcome: outcome.label().to_string(),
            exit_code: outcome.exit_code(),
            total_cost_usd,
        })
        .await;
        Ok(outcome)
    }

    /// Run one milestone. `None` means it completed; otherwise the run halts
    /// with the returned outcome.
    async fn run_milestone(
        &self,
        plan: &Arc<MilestonePlan>,
        cancel: &CancellationToken,
    ) -> Result<Option<RunOutcome>, OrchestratorError> {
        let milestone = plan.name().to_string();
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent.max(1)));
        let mut tasks: JoinSet<Result<PhaseOutcome, OrchestratorError>> = JoinSet::new();
        let mut running: HashMap<String, CancellationToken> = HashMap::new();
        let mut names: HashMap<Id, String> = HashMap::new();
        // Phases the machine refused to start; retried once anything else changes.
        let mut not_ready: HashSet<String> = HashSet::new();
        let mut halt: Option<RunOutcome> = None;
        let mut failure: Option<OrchestratorError> = None;

        let mut done: Vec<String> = self
            .checkpoint
            .read(|cp| cp.project.milestone(&milestone).map(|m| m.completed_set()))
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
        done.sort();
        tracing::info!(
            milestone = %milestone,
            phases = plan.scheduler.phase_count(),
            already_done = done.len(),
            "milestone started"
        );
        self.emit(RunEvent::MilestoneStarted {
            milestone: milestone.clone(),
            waves: plan.scheduler.compute_waves(),
            completed: done,
        })
        .await;

        loop {
            if failure.is_none() && halt.is_none() {
                let (state, spent) = self
                    .checkpoint
                    .read(|cp| (cp.project.milestone(&milestone).cloned(), cp.total_cost_usd))
                    .await;
                let state = state.ok_or_else(|| CheckpointError::UnknownMilestone {
                    milestone: milestone.clone(),
                })?;

                if let Some(record) = state.fatal_phase() {
                    halt = Some(RunOutcome::Fatal(FatalReport::from_record(&milestone, record)));
                } else if tasks.is_empty() && state.all_success() {
                    break;
                } else if cancel.is_cancelled() {
                    // Let in-flight attempts observe the cancellation.
                } else if self.settings.over_budget(spent) {
                    let limit_usd = self.settings.max_cost_usd.unwrap_or_default();
                    tracing::warn!(spent_usd = spent, limit_usd, "cost bound exceeded, no new attempts");
                    halt = Some(RunOutcome::BudgetExceeded {
                        spent_usd: spent,
                        limit_usd,
                    });
                } else {
                    let completed = state.completed_set();
                    let busy: HashSet<String> = running.keys().cloned().collect();
                    for name in plan.scheduler.ready_phases(&completed, &busy) {
                        let startable = state.phase(&name).is_some_and(|r| r.state.is_startable());
                        if !startable || not_ready.contains(&name) {
                            continue;
                        }
                        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                            break;
                        };
                        let token = cancel.child_token();
                        let machine = self.machine.clone();
                        let task_plan = plan.clone();
                        let phase = name.clone();
                        let phase_cancel = token.clone();
                        let handle = tasks.spawn(async move {
                            let _permit = permit;
                            machine.advance(&task_plan, &phase, &phase_cancel).await
                        });
                        tracing::debug!(milestone = %milestone, phase = %name, "phase task spawned");
                        names.insert(handle.id(), name.clone());
                        running.insert(name, token);
                    }
                }
            }

            if tasks.is_empty() {
                if let Some(e) = failure {
                    return Err(e);
                }
                if halt.is_some() {
                    return Ok(halt);
                }
                if cancel.is_cancelled() {
                    return Ok(Some(RunOutcome::Interrupted));
                }
                return Err(anyhow!(
                    "milestone '{}' cannot make progress: no phase is ready or running",
                    milestone
                )
                .into());
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                continue;
            };
            match joined {
                Err(e) => {
                    let name = names.remove(&e.id()).unwrap_or_default();
                    running.remove(&name);
                    tracing::error!(milestone = %milestone, phase = %name, error = %e, "phase task failed");
                    failure.get_or_insert(OrchestratorError::TaskPanicked(format!(
                        "phase '{}': {}",
                        name, e
                    )));
                }
                Ok((id, result)) => {
                    let name = names.remove(&id).unwrap_or_default();
                    running.remove(&name);
                    match result {
                        Err(e) => {
                            tracing::error!(milestone = %milestone, phase = %name, error = %e, "phase errored");
                            failure.get_or_insert(e);
                        }
                        Ok(PhaseOutcome::NotReady) => {
                            not_ready.insert(name);
                        }
                        Ok(PhaseOutcome::SteppedBack { reset, .. }) => {
                            not_ready.clear();
                            for phase in &reset {
                                if let Some(token) = running.get(phase) {
                                    tracing::info!(phase = %phase, "cancelling attempt re-opened by step-back");
                                    token.cancel();
                                }
                            }
                        }
                        Ok(PhaseOutcome::Fatal(report)) => {
                            halt.get_or_insert(RunOutcome::Fatal(report));
                        }
                        Ok(outcome) => {
                            not_ready.clear();
                            tracing::debug!(milestone = %milestone, phase = %name, ?outcome, "phase attempt finished");
                        }
                    }
                }
            }
        }

        let cost_usd = self
            .checkpoint
            .commit(|cp| {
                let state = cp.milestone_mut(&milestone)?;
                state.completed = true;
                let cost = state.cost_usd();
                cp.project.advance_pointer();
                Ok(cost)
            })
            .await?;
        tracing::info!(milestone = %milestone, cost_usd, "milestone complete");
        self.emit(RunEvent::MilestoneCompleted {
            milestone,
            cost_usd,
        })
        .await;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{OpenMode, PhaseState};
    use crate::evidence::{ContractRegistry, EvidenceContract, Predicate};
    use crate::phase::PhaseSpec;
    use crate::poller::PollerConfig;
    use crate::worker::scripted::{ScriptedAttempt, ScriptedGateway};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn diamond() -> MilestoneSpec {
        MilestoneSpec {
            name: "m1".into(),
            description: String::new(),
            phases: vec![
                PhaseSpec::new("a", &[]),
                PhaseSpec::new("b", &["a"]),
                PhaseSpec::new("c", &["a"]),
                PhaseSpec::new("d", &["b", "c"]),
            ],
        }
    }

    fn file_contracts(phases: &[&str]) -> EvidenceValidator {
        let mut registry = ContractRegistry::empty();
        for phase in phases {
            registry.insert(
                phase,
                EvidenceContract::new(vec![Predicate::FileExists {
                    any_of: vec![format!("{}.done", phase)],
                }]),
            );
        }
        EvidenceValidator::new(registry, BTreeMap::new())
    }

    fn settings(dir: &Path) -> RunSettings {
        let mut settings = RunSettings::new(dir);
        settings.poller = PollerConfig::new(Duration::from_millis(2), 1.5, Duration::from_millis(10));
        settings
    }

    fn orchestrator(
        dir: &Path,
        gateway: &ScriptedGateway,
        milestones: Vec<MilestoneSpec>,
        configure: impl FnOnce(&mut RunSettings),
    ) -> Orchestrator {
        let checkpoint = Arc::new(
            CheckpointManager::open(&dir.join(".marshal"), "demo", &milestones, OpenMode::Fresh)
                .unwrap(),
        );
        let mut settings = settings(dir);
        configure(&mut settings);
        Orchestrator::new(
            checkpoint,
            Arc::new(gateway.clone()),
            ErrorClassifier::with_default_rules(),
            file_contracts(&["a", "b", "c", "d"]),
            settings,
            milestones,
        )
    }

    fn done(phase: &str) -> ScriptedAttempt {
        ScriptedAttempt::succeed().writing(&format!("{}.done", phase), "ok")
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        assert_eq!(
            RunOutcome::BudgetExceeded {
                spent_usd: 2.0,
                limit_usd: 1.0
            }
            .exit_code(),
            1
        );
        assert_eq!(RunOutcome::Interrupted.exit_code(), 75);
    }

    #[tokio::test]
    async fn test_diamond_completes_in_dependency_order() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new();
        for phase in ["a", "b", "c", "d"] {
            gateway.push(phase, done(phase));
        }
        let orch = orchestrator(dir.path(), &gateway, vec![diamond()], |_| {});
        let outcome = orch.run(RunScope::All, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let order: Vec<String> = gateway.requests().into_iter().map(|r| r.phase).collect();
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));

        let snapshot = orch.checkpoint().snapshot().await;
        let m1 = snapshot.project.milestone("m1").unwrap();
        assert!(m1.completed);
        assert!(m1.all_success());
        assert_eq!(snapshot.project.current_milestone, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let dir = tempdir().unwrap();
        let spec = MilestoneSpec {
            name: "wide".into(),
            description: String::new(),
            phases: vec![
                PhaseSpec::new("a", &[]),
                PhaseSpec::new("b", &[]),
                PhaseSpec::new("c", &[]),
                PhaseSpec::new("d", &[]),
            ],
        };
        let gateway = ScriptedGateway::new();
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for phase in ["a", "b", "c", "d"] {
            let active = active.clone();
            let peak = peak.clone();
            let file = format!("{}.done", phase);
            gateway.push(
                phase,
                ScriptedAttempt::succeed().touching(move |dir| {
                    use std::sync::atomic::Ordering;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    active.fetch_sub(1, Ordering::SeqCst);
                    std::fs::write(dir.join(&file), "ok")
                }),
            );
        }
        let orch = orchestrator(dir.path(), &gateway, vec![spec], |s| s.max_concurrent = 2);
        let outcome = orch.run(RunScope::All, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_fatal_phase_halts_milestone() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new();
        gateway.push("a", done("a"));
        gateway.push("b", ScriptedAttempt::fail("Error: credit balance is too low"));
        gateway.push("c", done("c"));
        let orch = orchestrator(dir.path(), &gateway, vec![diamond()], |_| {});

        let outcome = orch.run(RunScope::All, CancellationToken::new()).await.unwrap();
        let RunOutcome::Fatal(report) = &outcome else {
            panic!("expected fatal, got {:?}", outcome);
        };
        assert_eq!(report.phase, "b");
        assert_eq!(outcome.exit_code(), 1);
        assert!(gateway.requests_for("d").is_empty());

        let snapshot = orch.checkpoint().snapshot().await;
        assert!(!snapshot.project.milestone("m1").unwrap().completed);
    }

    #[tokio::test]
    async fn test_budget_halts_new_attempts() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new();
        gateway.push("a", done("a").costing(1.5));
        let orch = orchestrator(dir.path(), &gateway, vec![diamond()], |s| {
            s.max_cost_usd = Some(1.0)
        });
        let outcome = orch.run(RunScope::All, CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::BudgetExceeded {
                spent_usd: 1.5,
                limit_usd: 1.0
            }
        );
        assert_eq!(gateway.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_run() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new().with_fallback(ScriptedAttempt::hang());
        let orch = orchestrator(dir.path(), &gateway, vec![diamond()], |_| {});
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let outcome = orch.run(RunScope::All, cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        assert_eq!(outcome.exit_code(), EXIT_INTERRUPTED);
        let record = orch
            .checkpoint()
            .read(|cp| cp.phase("m1", "a").cloned())
            .await
            .unwrap();
        assert!(matches!(record.state, PhaseState::Running { .. }));
    }

    #[tokio::test]
    async fn test_single_milestone_scope() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new();
        let second = MilestoneSpec {
            name: "m2".into(),
            description: String::new(),
            phases: vec![PhaseSpec::new("a", &[])],
        };
        gateway.push("a", done("a"));
        let orch = orchestrator(dir.path(), &gateway, vec![diamond(), second], |_| {});

        let outcome = orch
            .run(RunScope::Milestone("m2".into()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        let snapshot = orch.checkpoint().snapshot().await;
        assert!(snapshot.project.milestone("m2").unwrap().completed);
        assert!(!snapshot.project.milestone("m1").unwrap().completed);

        let err = orch
            .run(RunScope::Milestone("nope".into()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownMilestone { .. }));
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new();
        for phase in ["a", "b", "c", "d"] {
            gateway.push(phase, done(phase));
        }
        let (tx, mut rx) = mpsc::channel(256);
        let orch = orchestrator(dir.path(), &gateway, vec![diamond()], |_| {}).with_event_channel(tx);
        orch.run(RunScope::All, CancellationToken::new()).await.unwrap();
        drop(orch);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(RunEvent::MilestoneStarted { .. })));
        assert!(matches!(events.last(), Some(RunEvent::RunFinished { exit_code: 0, .. })));
        let succeeded = events
            .iter()
            .filter(|e| matches!(e, RunEvent::PhaseSucceeded { .. }))
            .count();
        assert_eq!(succeeded, 4);
    }
}
