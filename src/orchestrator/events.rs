//! Progress events emitted while a run executes.
//!
//! Events are informational. Consumers must never infer state from them; the
//! checkpoint is the only source of truth.

use serde::{Deserialize, Serialize};

use crate::recovery::ErrorClassification;

/// Events sent on the runner's event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A milestone began (or resumed) execution.
    MilestoneStarted {
        milestone: String,
        waves: Vec<Vec<String>>,
        completed: Vec<String>,
    },
    /// A phase attempt started.
    PhaseStarted {
        milestone: String,
        phase: String,
        attempt: u32,
    },
    /// The worker claimed success; evidence is being checked.
    PhaseValidating {
        milestone: String,
        phase: String,
        attempt: u32,
    },
    /// The phase reached Success.
    PhaseSucceeded {
        milestone: String,
        phase: String,
        attempts: u32,
        cost_usd: f64,
    },
    /// The attempt failed and the phase will be retried.
    PhaseRetrying {
        milestone: String,
        phase: String,
        attempt: u32,
        classification: ErrorClassification,
        diagnostic: String,
    },
    /// The learner flagged a repeating failure.
    LoopDetected {
        milestone: String,
        phase: String,
        occurrences: usize,
        action: String,
    },
    /// A looping phase re-opened an upstream phase.
    SteppedBack {
        milestone: String,
        from: String,
        to: String,
        reset: Vec<String>,
    },
    /// The phase stopped the milestone.
    PhaseFatal {
        milestone: String,
        phase: String,
        attempts: u32,
        classification: ErrorClassification,
        diagnostic: String,
    },
    /// Every phase of the milestone succeeded.
    MilestoneCompleted { milestone: String, cost_usd: f64 },
    /// The run ended.
    RunFinished {
        outcome: String,
        exit_code: u8,
        total_cost_usd: f64,
    },
}

impl RunEvent {
    /// The phase the event concerns, if it concerns one.
    pub fn phase(&self) -> Option<&str> {
        match self {
            RunEvent::PhaseStarted { phase, .. }
            | RunEvent::PhaseValidating { phase, .. }
            | RunEvent::PhaseSucceeded { phase, .. }
            | RunEvent::PhaseRetrying { phase, .. }
            | RunEvent::LoopDetected { phase, .. }
            | RunEvent::PhaseFatal { phase, .. } => Some(phase),
            RunEvent::SteppedBack { from, .. } => Some(from),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged() {
        let event = RunEvent::PhaseRetrying {
            milestone: "m1".into(),
            phase: "lint".into(),
            attempt: 1,
            classification: ErrorClassification::RetryableTransient,
            diagnostic: "evidence: checker 'lint' exited 1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "phase_retrying");
        assert_eq!(json["classification"], "retryable_transient");
        assert_eq!(event.phase(), Some("lint"));
    }

    #[test]
    fn test_run_events_have_no_phase() {
        let event = RunEvent::RunFinished {
            outcome: "completed".into(),
            exit_code: 0,
            total_cost_usd: 1.5,
        };
        assert_eq!(event.phase(), None);
    }
}
