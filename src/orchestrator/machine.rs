//! Phase state machine.
//!
//! [`PhaseStateMachine::advance`] runs exactly one attempt of one phase:
//!
//! ```text
//! Pending|Failed ──► Running ──► EvidenceValidating ──► Success
//!                       │                │
//!                       └──── error ─────┴──► classify + policy
//!                                               ├─► Failed (retry, maybe with a constraint)
//!                                               ├─► step-back: target + dependents → Pending
//!                                               └─► FatalStop
//! ```
//!
//! Every transition is one checkpoint commit. Failure commits carry their
//! `FailureRecord`, learner update and cost in the same write. Each commit is
//! guarded by the phase's `revision`: if a step-back re-opened the phase while
//! the attempt was in flight, the attempt's result is discarded as superseded.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::RunEvent;
use super::payload::{PayloadInput, build_payload};
use super::settings::RunSettings;
use crate::checkpoint::{Checkpoint, CheckpointManager, PhaseRecord, PhaseState};
use crate::dag::DagScheduler;
use crate::errors::{CheckpointError, OrchestratorError};
use crate::evidence::{EvidenceContext, EvidenceValidator, EvidenceVerdict};
use crate::patterns::{FailurePatternLearner, FailureRecord, LoopAction, LoopSignal};
use crate::phase::MilestoneSpec;
use crate::poller::{AdaptivePoller, PollOutcome};
use crate::recovery::{Decision, ErrorClassification, ErrorClassifier, RecoveryAction, RetryPolicy};
use crate::tracker::GitTracker;
use crate::worker::{RawWorkerError, WorkerGateway, WorkerRequest, WorkerTerminal};

/// A milestone's definition together with its validated dependency graph.
#[derive(Debug, Clone)]
pub struct MilestonePlan {
    pub spec: MilestoneSpec,
    pub scheduler: DagScheduler,
}

impl MilestonePlan {
    /// Build the graph; fails on unknown dependencies, duplicates or cycles.
    pub fn new(spec: MilestoneSpec) -> Result<Self, OrchestratorError> {
        let scheduler = DagScheduler::from_phases(&spec.phases)?;
        Ok(Self { spec, scheduler })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// What an operator needs to know about a phase that stopped its milestone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FatalReport {
    pub milestone: String,
    pub phase: String,
    pub attempts: u32,
    pub classification: ErrorClassification,
    pub diagnostic: String,
}

impl FatalReport {
    /// Rebuild the report from a phase already recorded as `FatalStop`.
    pub fn from_record(milestone: &str, record: &PhaseRecord) -> Self {
        let classification = match &record.state {
            PhaseState::FatalStop { classification } => *classification,
            _ => ErrorClassification::FatalTaskFailure,
        };
        Self {
            milestone: milestone.to_string(),
            phase: record.name.clone(),
            attempts: record.attempts,
            classification,
            diagnostic: record
                .last_failure
                .as_ref()
                .map(|f| f.diagnostic.clone())
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for FatalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "milestone '{}' stopped at phase '{}' after {} attempt(s) [{}]: {}",
            self.milestone, self.phase, self.attempts, self.classification, self.diagnostic
        )
    }
}

/// Result of one call to [`PhaseStateMachine::advance`].
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    /// Dependencies are not all `Success`, or the phase is not startable; nothing changed
    NotReady,
    Succeeded,
    /// The phase is `Failed` and may be started again
    Retry,
    /// A failure loop re-opened `to` and its dependents
    SteppedBack { to: String, reset: Vec<String> },
    Fatal(FatalReport),
    /// The run was cancelled mid-attempt; the phase stays in flight for resume to recover
    Interrupted,
    /// The phase was re-opened by a step-back while this attempt ran
    Superseded,
}

/// How evidence validation of an attempt ended.
enum Gate {
    Verdict(EvidenceVerdict),
    /// The phase was re-opened before validation started
    Superseded,
    Cancelled,
}

/// The attempt in flight, as far as the state machine tracks it.
struct Attempt<'a> {
    plan: &'a MilestonePlan,
    phase: &'a str,
    number: u32,
    /// Revision of the phase record as of our last commit
    revision: u64,
    retry: RetryPolicy,
    baseline_head: Option<String>,
}

impl Attempt<'_> {
    fn milestone(&self) -> &str {
        self.plan.name()
    }
}

/// What a failure commit decided.
enum Resolution {
    Retry { signal: Option<LoopSignal> },
    SteppedBack {
        to: String,
        reset: Vec<String>,
        signal: LoopSignal,
    },
    Fatal(FatalReport),
}

/// Drives single phase attempts through their transitions.
#[derive(Clone)]
pub struct PhaseStateMachine {
    checkpoint: Arc<CheckpointManager>,
    gateway: Arc<dyn WorkerGateway>,
    classifier: Arc<ErrorClassifier>,
    validator: Arc<EvidenceValidator>,
    settings: Arc<RunSettings>,
    poller: AdaptivePoller,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl PhaseStateMachine {
    pub fn new(
        checkpoint: Arc<CheckpointManager>,
        gateway: Arc<dyn WorkerGateway>,
        classifier: Arc<ErrorClassifier>,
        validator: Arc<EvidenceValidator>,
        settings: Arc<RunSettings>,
    ) -> Self {
        let poller = AdaptivePoller::new(settings.poller);
        Self {
            checkpoint,
            gateway,
            classifier,
            validator,
            settings,
            poller,
            events: None,
        }
    }

    /// Send progress events to `tx`.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Run one attempt of `phase`.
    pub async fn advance(
        &self,
        plan: &MilestonePlan,
        phase: &str,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        let milestone = plan.name();
        let spec = plan
            .spec
            .phase(phase)
            .ok_or_else(|| CheckpointError::UnknownPhase {
                milestone: milestone.to_string(),
                phase: phase.to_string(),
            })?;
        let phase_settings = self.settings.phase_settings(phase);
        let baseline_head = GitTracker::try_open(&self.settings.workdir).and_then(|g| g.head_sha());
        let session_id = uuid::Uuid::new_v4().to_string();

        let started = self
            .checkpoint
            .commit_if(|cp| {
                let project = cp.project.name.clone();
                let state = cp.milestone_mut(milestone)?;
                let completed = state.completed_set();
                let record = state
                    .phase_mut(phase)
                    .ok_or_else(|| CheckpointError::UnknownPhase {
                        milestone: milestone.to_string(),
                        phase: phase.to_string(),
                    })?;
                if !record.state.is_startable()
                    || !record.depends_on.iter().all(|d| completed.contains(d))
                {
                    return Ok(None);
                }
                record.attempts += 1;
                record.revision += 1;
                record.baseline_head = baseline_head.clone();
                record.state = PhaseState::Running {
                    attempt: record.attempts,
                    session_id: session_id.clone(),
                    started_at: Utc::now(),
                };
                Ok(Some((
                    project,
                    record.attempts,
                    record.revision,
                    record.constraints.clone(),
                    record.last_failure.as_ref().map(|f| f.diagnostic.clone()),
                )))
            })
            .await?;

        let Some((project, number, revision, constraints, previous)) = started else {
            tracing::debug!(milestone, phase, "phase not ready");
            return Ok(PhaseOutcome::NotReady);
        };

        tracing::info!(milestone, phase, attempt = number, "phase started");
        self.emit(RunEvent::PhaseStarted {
            milestone: milestone.to_string(),
            phase: phase.to_string(),
            attempt: number,
        })
        .await;

        let mut attempt = Attempt {
            plan,
            phase,
            number,
            revision,
            retry: phase_settings.retry,
            baseline_head,
        };

        let instruction = phase_settings
            .instruction
            .clone()
            .unwrap_or_else(|| spec.effective_instruction());
        let payload = build_payload(&PayloadInput {
            project: &project,
            milestone,
            milestone_description: &plan.spec.description,
            phase,
            attempt: number,
            instruction: &instruction,
            constraints: &constraints,
            previous_diagnostic: previous.as_deref(),
            contract: self.validator.contract_for(phase),
        });
        let request = WorkerRequest {
            milestone: milestone.to_string(),
            phase: phase.to_string(),
            attempt: number,
            payload,
            workdir: self.settings.workdir.clone(),
        };

        let mut invocation = match self.gateway.start(request).await {
            Ok(invocation) => invocation,
            Err(e) => {
                tracing::error!(milestone, phase, error = %e, "worker failed to start");
                let raw = RawWorkerError::transport(e.to_string());
                return self.handle_error(&mut attempt, raw, 0.0, None, cancel).await;
            }
        };

        let polled = self
            .poller
            .await_terminal(&mut invocation, phase_settings.timeout, cancel)
            .await;
        let cost = invocation.cost_usd();
        let session = invocation.session_id().to_string();
        drop(invocation);

        match polled {
            PollOutcome::Cancelled => self.interrupted(&attempt, cost).await,
            PollOutcome::TimedOut { after } => {
                let raw = RawWorkerError::timeout(after);
                self.handle_error(&mut attempt, raw, cost, Some(session), cancel).await
            }
            PollOutcome::Terminal(WorkerTerminal::Success { summary }) => {
                tracing::info!(milestone, phase, attempt = number, summary = %summary, "worker reported success");
                let mut cost = cost;
                match self.validate(&mut attempt, &mut cost, Some(session), cancel).await? {
                    Gate::Superseded => Ok(PhaseOutcome::Superseded),
                    Gate::Cancelled => self.interrupted(&attempt, cost).await,
                    Gate::Verdict(EvidenceVerdict::Pass) => self.succeed(&mut attempt, &mut cost).await,
                    Gate::Verdict(EvidenceVerdict::Fail { diagnostic }) => {
                        let decision = attempt.retry.decide(
                            ErrorClassification::RetryableTransient,
                            attempt.number,
                            false,
                        );
                        let diagnostic = format!("evidence: {}", diagnostic);
                        self.fail(&mut attempt, &mut cost, decision, diagnostic).await
                    }
                }
            }
            PollOutcome::Terminal(WorkerTerminal::Error(raw)) => {
                self.handle_error(&mut attempt, raw, cost, Some(session), cancel).await
            }
        }
    }

    /// Classify a worker error and apply the recovery policy.
    ///
    /// Benign noise is accepted only when the validator independently passes.
    async fn handle_error(
        &self,
        attempt: &mut Attempt<'_>,
        raw: RawWorkerError,
        cost: f64,
        session: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        let mut cost = cost;
        let classified = self.classifier.classify(&raw);
        let classification = classified.classification;
        tracing::warn!(
            milestone = attempt.milestone(),
            phase = attempt.phase,
            attempt = attempt.number,
            %classification,
            rule = classified.rule.as_deref().unwrap_or("-"),
            error = %raw,
            "worker attempt failed"
        );

        if classification != ErrorClassification::BenignInfrastructureNoise {
            let decision = attempt.retry.decide(classification, attempt.number, false);
            return self.fail(attempt, &mut cost, decision, raw.to_string()).await;
        }

        match self.validate(attempt, &mut cost, session, cancel).await? {
            Gate::Superseded => Ok(PhaseOutcome::Superseded),
            Gate::Cancelled => self.interrupted(attempt, cost).await,
            Gate::Verdict(EvidenceVerdict::Pass) => {
                let decision = attempt.retry.decide(classification, attempt.number, true);
                debug_assert_eq!(decision.action, RecoveryAction::AcceptAsSuccess);
                tracing::info!(
                    milestone = attempt.milestone(),
                    phase = attempt.phase,
                    "benign worker noise; evidence confirmed"
                );
                self.succeed(attempt, &mut cost).await
            }
            Gate::Verdict(EvidenceVerdict::Fail { diagnostic }) => {
                let decision = attempt.retry.decide(classification, attempt.number, false);
                let diagnostic = format!("{} (treated as retryable: evidence: {})", raw, diagnostic);
                self.fail(attempt, &mut cost, decision, diagnostic).await
            }
        }
    }

    /// `Running → EvidenceValidating`, then run the validator.
    async fn validate(
        &self,
        attempt: &mut Attempt<'_>,
        cost: &mut f64,
        session: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Gate, OrchestratorError> {
        let (milestone, phase, number) = (attempt.milestone().to_string(), attempt.phase, attempt.number);
        let staged = self
            .commit_phase(attempt, cost, session.as_deref(), |cp| {
                cp.phase_mut(&milestone, phase)?.state =
                    PhaseState::EvidenceValidating { attempt: number };
                Ok(())
            })
            .await?;
        if staged.is_none() {
            return Ok(Gate::Superseded);
        }

        self.emit(RunEvent::PhaseValidating {
            milestone: milestone.clone(),
            phase: phase.to_string(),
            attempt: number,
        })
        .await;

        let ctx = EvidenceContext::new(&self.settings.workdir)
            .with_baseline(attempt.baseline_head.clone());
        let Some(verdict) = self.validator.validate_or_cancel(phase, &ctx, cancel).await else {
            return Ok(Gate::Cancelled);
        };
        tracing::info!(
            milestone = %milestone,
            phase,
            attempt = number,
            pass = verdict.is_pass(),
            diagnostic = verdict.diagnostic().unwrap_or(""),
            "evidence verdict"
        );
        Ok(Gate::Verdict(verdict))
    }

    /// `EvidenceValidating → Success`.
    async fn succeed(
        &self,
        attempt: &mut Attempt<'_>,
        cost: &mut f64,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        let milestone = attempt.milestone().to_string();
        let phase = attempt.phase;
        let learner = self.settings.learner;
        let done = self
            .commit_phase(attempt, cost, None, |cp| {
                let (record, ledger) = cp.split_phase_mut(&milestone, phase)?;
                record.state = PhaseState::Success {
                    completed_at: Utc::now(),
                };
                FailurePatternLearner::new(learner, ledger.patterns).reset(&milestone, phase);
                Ok((record.attempts, record.cost_usd))
            })
            .await?;

        let Some((attempts, cost_usd)) = done else {
            return Ok(PhaseOutcome::Superseded);
        };
        tracing::info!(milestone = %milestone, phase, attempts, cost_usd, "phase succeeded");
        self.emit(RunEvent::PhaseSucceeded {
            milestone,
            phase: phase.to_string(),
            attempts,
            cost_usd,
        })
        .await;
        Ok(PhaseOutcome::Succeeded)
    }

    /// Record a failure and apply the decision, consulting the learner.
    async fn fail(
        &self,
        attempt: &mut Attempt<'_>,
        cost: &mut f64,
        decision: Decision,
        diagnostic: String,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        let milestone = attempt.milestone().to_string();
        let (plan, phase, number) = (attempt.plan, attempt.phase, attempt.number);
        let resolution = self
            .commit_phase(attempt, cost, None, |cp| {
                self.apply_failure(cp, plan, phase, number, decision, &diagnostic)
            })
            .await?;

        let Some(resolution) = resolution else {
            return Ok(PhaseOutcome::Superseded);
        };

        match resolution {
            Resolution::Retry { signal } => {
                if let Some(signal) = signal {
                    self.emit_loop(&signal).await;
                }
                tracing::warn!(
                    milestone = %milestone,
                    phase,
                    attempt = number,
                    classification = %decision.effective,
                    diagnostic = %diagnostic,
                    "phase will be retried"
                );
                self.emit(RunEvent::PhaseRetrying {
                    milestone,
                    phase: phase.to_string(),
                    attempt: number,
                    classification: decision.effective,
                    diagnostic,
                })
                .await;
                Ok(PhaseOutcome::Retry)
            }
            Resolution::SteppedBack { to, reset, signal } => {
                self.emit_loop(&signal).await;
                tracing::warn!(
                    milestone = %milestone,
                    from = phase,
                    to = %to,
                    reset = ?reset,
                    "stepping back"
                );
                self.emit(RunEvent::SteppedBack {
                    milestone,
                    from: phase.to_string(),
                    to: to.clone(),
                    reset: reset.clone(),
                })
                .await;
                Ok(PhaseOutcome::SteppedBack { to, reset })
            }
            Resolution::Fatal(report) => {
                tracing::error!(
                    milestone = %report.milestone,
                    phase = %report.phase,
                    attempts = report.attempts,
                    classification = %report.classification,
                    diagnostic = %report.diagnostic,
                    "phase failed fatally"
                );
                self.emit(RunEvent::PhaseFatal {
                    milestone: report.milestone.clone(),
                    phase: report.phase.clone(),
                    attempts: report.attempts,
                    classification: report.classification,
                    diagnostic: report.diagnostic.clone(),
                })
                .await;
                Ok(PhaseOutcome::Fatal(report))
            }
        }
    }

    async fn emit_loop(&self, signal: &LoopSignal) {
        let action = match &signal.action {
            LoopAction::AddConstraint(_) => "add_constraint",
            LoopAction::StepBack => "step_back",
        };
        self.emit(RunEvent::LoopDetected {
            milestone: signal.milestone.clone(),
            phase: signal.phase.clone(),
            occurrences: signal.occurrences,
            action: action.to_string(),
        })
        .await;
    }

    /// The body of a failure commit.
    fn apply_failure(
        &self,
        cp: &mut Checkpoint,
        plan: &MilestonePlan,
        phase: &str,
        attempt: u32,
        decision: Decision,
        diagnostic: &str,
    ) -> Result<Resolution, CheckpointError> {
        let milestone = plan.name();
        let failure = FailureRecord::new(milestone, phase, attempt, decision.recorded(), diagnostic);

        let signal = {
            let (record, ledger) = cp.split_phase_mut(milestone, phase)?;
            record.last_failure = Some(failure.clone());
            ledger.failures.push(failure.clone());
            let mut learner = FailurePatternLearner::new(self.settings.learner, ledger.patterns);
            learner.record(failure);

            // A persisting loop steps back even when the attempt ceiling is reached.
            let signal = match decision.action {
                RecoveryAction::FatalStop if decision.exhausted.is_none() => None,
                _ => learner.detect_loop(milestone, phase),
            };
            let stepping_back = signal
                .as_ref()
                .is_some_and(|s| s.action == LoopAction::StepBack);

            if decision.action == RecoveryAction::FatalStop && !stepping_back {
                record.state = PhaseState::FatalStop {
                    classification: decision.effective,
                };
                return Ok(Resolution::Fatal(FatalReport::from_record(milestone, record)));
            }

            record.state = PhaseState::Failed {
                classification: decision.recorded(),
            };
            if let Some(signal) = &signal {
                learner.acknowledge(milestone, phase);
                if let LoopAction::AddConstraint(text) = &signal.action {
                    record.constraints.push(text.clone());
                }
            }
            signal
        };

        match signal {
            Some(signal) if signal.action == LoopAction::StepBack => {
                self.step_back(cp, plan, phase, signal)
            }
            signal => Ok(Resolution::Retry { signal }),
        }
    }

    /// Re-open the step-back target and everything downstream of it, or
    /// escalate to `FatalStop` when no step-back is available.
    fn step_back(
        &self,
        cp: &mut Checkpoint,
        plan: &MilestonePlan,
        phase: &str,
        signal: LoopSignal,
    ) -> Result<Resolution, CheckpointError> {
        let milestone = plan.name();
        let target = self
            .settings
            .step_back_target(phase)
            .filter(|t| plan.scheduler.contains(t));
        let state = cp.milestone_mut(milestone)?;

        let target = match target {
            Some(target) if state.step_backs < self.settings.max_step_backs => target,
            other => {
                let reason = if other.is_none() {
                    format!(
                        "failure loop persisted after a corrective constraint and '{}' has no step-back target",
                        phase
                    )
                } else {
                    format!(
                        "failure loop persisted and the milestone used all {} step-back(s)",
                        self.settings.max_step_backs
                    )
                };
                let record = state
                    .phase_mut(phase)
                    .ok_or_else(|| CheckpointError::UnknownPhase {
                        milestone: milestone.to_string(),
                        phase: phase.to_string(),
                    })?;
                record.state = PhaseState::FatalStop {
                    classification: ErrorClassification::FatalTaskFailure,
                };
                let mut report = FatalReport::from_record(milestone, record);
                report.diagnostic = format!("{}: {}", reason, signal.diagnostic);
                return Ok(Resolution::Fatal(report));
            }
        };

        state.step_backs += 1;
        let mut reset = vec![target.to_string()];
        reset.extend(plan.scheduler.downstream_of(target));
        if !reset.iter().any(|name| name == phase) {
            reset.push(phase.to_string());
        }
        for name in &reset {
            if let Some(record) = state.phase_mut(name) {
                record.reset();
            }
        }
        if let Some(record) = state.phase_mut(target) {
            record.constraints.push(step_back_constraint(phase, &signal.diagnostic));
        }

        let mut learner = FailurePatternLearner::new(self.settings.learner, &mut cp.patterns);
        for name in &reset {
            learner.reset(milestone, name);
        }

        Ok(Resolution::SteppedBack {
            to: target.to_string(),
            reset,
            signal,
        })
    }

    /// Cancellation: charge the cost, leave the phase in flight.
    async fn interrupted(&self, attempt: &Attempt<'_>, cost: f64) -> Result<PhaseOutcome, OrchestratorError> {
        let milestone = attempt.milestone();
        let phase = attempt.phase;
        let current = self
            .checkpoint
            .read(|cp| cp.phase(milestone, phase).map(|r| r.revision))
            .await
            == Some(attempt.revision);

        if cost > 0.0 {
            self.checkpoint
                .commit(|cp| {
                    let (record, ledger) = cp.split_phase_mut(milestone, phase)?;
                    record.cost_usd += cost;
                    *ledger.total_cost_usd += cost;
                    Ok(())
                })
                .await?;
        }

        if current {
            tracing::info!(milestone, phase, attempt = attempt.number, "phase interrupted");
            Ok(PhaseOutcome::Interrupted)
        } else {
            Ok(PhaseOutcome::Superseded)
        }
    }

    /// Commit a transition of the attempt's phase.
    ///
    /// Unmerged cost is charged in this commit whether or not the attempt is
    /// still current. Returns `None` without applying `f` when the phase's
    /// revision moved on since our last commit.
    async fn commit_phase<T>(
        &self,
        attempt: &mut Attempt<'_>,
        cost: &mut f64,
        session: Option<&str>,
        f: impl FnOnce(&mut Checkpoint) -> Result<T, CheckpointError>,
    ) -> Result<Option<T>, OrchestratorError> {
        let expected = attempt.revision;
        let charge = std::mem::take(cost);
        let milestone = attempt.milestone().to_string();
        let phase = attempt.phase;

        let committed = self
            .checkpoint
            .commit_if(|cp| {
                let (record, ledger) = cp.split_phase_mut(&milestone, phase)?;
                if charge > 0.0 {
                    record.cost_usd += charge;
                    *ledger.total_cost_usd += charge;
                }
                if record.revision != expected {
                    // Still write the charge; drop the transition.
                    return Ok((charge > 0.0).then_some(None));
                }
                if let Some(id) = session {
                    record.last_session_id = Some(id.to_string());
                }
                record.revision += 1;
                let revision = record.revision;
                f(cp).map(|value| Some(Some((value, revision))))
            })
            .await?;

        match committed.flatten() {
            Some((value, revision)) => {
                attempt.revision = revision;
                Ok(Some(value))
            }
            None => {
                tracing::info!(
                    milestone = %milestone,
                    phase,
                    attempt = attempt.number,
                    "attempt superseded by a step-back"
                );
                Ok(None)
            }
        }
    }
}

/// Constraint added to a step-back target.
fn step_back_constraint(from: &str, diagnostic: &str) -> String {
    format!(
        "The downstream phase '{}' kept failing the same way after this phase completed: \"{}\". \
         Rework this phase's output so that '{}' can succeed.",
        from,
        crate::worker::stream::truncate_str(diagnostic, 200),
        from
    )
}
