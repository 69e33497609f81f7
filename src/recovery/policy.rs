//! Recovery policy: what to do with a classified failure.

use super::ErrorClassification;
use serde::{Deserialize, Serialize};

/// Attempt ceilings for retrying failed phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed for retryable failures
    pub max_attempts: u32,
    /// Total attempts allowed when the failure is unclassified
    pub unknown_max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            unknown_max_attempts: 2,
        }
    }
}

/// The action the state machine takes after a failure path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Benign noise whose artifacts the validator confirmed
    AcceptAsSuccess,
    /// Run the phase again
    Retry,
    /// Stop the milestone
    FatalStop,
}

/// A policy decision and the classification it is recorded under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: RecoveryAction,
    pub effective: ErrorClassification,
    /// Set when `FatalStop` comes from the attempt ceiling: the retryable
    /// classification the failure had before escalation.
    pub exhausted: Option<ErrorClassification>,
}

impl Decision {
    fn new(action: RecoveryAction, effective: ErrorClassification) -> Self {
        Self {
            action,
            effective,
            exhausted: None,
        }
    }

    fn exhausted(from: ErrorClassification) -> Self {
        Self {
            action: RecoveryAction::FatalStop,
            effective: ErrorClassification::FatalTaskFailure,
            exhausted: Some(from),
        }
    }

    /// The classification the failure is recorded and learned under.
    pub fn recorded(&self) -> ErrorClassification {
        self.exhausted.unwrap_or(self.effective)
    }
}

impl RetryPolicy {
    /// Decide how to recover.
    ///
    /// `attempts` counts the attempt that just failed. `evidence_confirmed` is
    /// whether the evidence validator independently passed for this attempt.
    pub fn decide(
        &self,
        classification: ErrorClassification,
        attempts: u32,
        evidence_confirmed: bool,
    ) -> Decision {
        use ErrorClassification::*;
        match classification {
            BenignInfrastructureNoise if evidence_confirmed => {
                Decision::new(RecoveryAction::AcceptAsSuccess, BenignInfrastructureNoise)
            }
            BenignInfrastructureNoise | RetryableTransient => {
                if attempts < self.max_attempts {
                    Decision::new(RecoveryAction::Retry, RetryableTransient)
                } else {
                    Decision::exhausted(RetryableTransient)
                }
            }
            Unknown => {
                if attempts < self.unknown_max_attempts {
                    Decision::new(RecoveryAction::Retry, Unknown)
                } else {
                    Decision::exhausted(Unknown)
                }
            }
            FatalTaskFailure => Decision::new(RecoveryAction::FatalStop, FatalTaskFailure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ErrorClassification::*;

    #[test]
    fn test_benign_accepted_only_with_evidence() {
        let policy = RetryPolicy::default();
        let accepted = policy.decide(BenignInfrastructureNoise, 1, true);
        assert_eq!(accepted.action, RecoveryAction::AcceptAsSuccess);

        let demoted = policy.decide(BenignInfrastructureNoise, 1, false);
        assert_eq!(demoted.action, RecoveryAction::Retry);
        assert_eq!(demoted.effective, RetryableTransient);
    }

    #[test]
    fn test_retryable_escalates_at_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 3,
            unknown_max_attempts: 1,
        };
        assert_eq!(
            policy.decide(RetryableTransient, 2, false).action,
            RecoveryAction::Retry
        );
        let at_ceiling = policy.decide(RetryableTransient, 3, false);
        assert_eq!(at_ceiling.action, RecoveryAction::FatalStop);
        assert_eq!(at_ceiling.effective, FatalTaskFailure);
        assert_eq!(at_ceiling.exhausted, Some(RetryableTransient));
        assert_eq!(at_ceiling.recorded(), RetryableTransient);
    }

    #[test]
    fn test_unknown_uses_lower_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(Unknown, 1, false).action, RecoveryAction::Retry);
        assert_eq!(policy.decide(Unknown, 1, false).effective, Unknown);
        assert_eq!(
            policy.decide(Unknown, 2, false).action,
            RecoveryAction::FatalStop
        );
        // Still retryable under the normal ceiling.
        assert_eq!(
            policy.decide(RetryableTransient, 2, false).action,
            RecoveryAction::Retry
        );
    }

    #[test]
    fn test_fatal_never_retries() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(FatalTaskFailure, 1, true);
        assert_eq!(decision.action, RecoveryAction::FatalStop);
        assert_eq!(decision.exhausted, None);
        assert_eq!(decision.recorded(), FatalTaskFailure);
    }

    #[test]
    fn test_unknown_is_never_accepted() {
        let policy = RetryPolicy::default();
        for attempts in 1..=5 {
            assert_ne!(
                policy.decide(Unknown, attempts, true).action,
                RecoveryAction::AcceptAsSuccess
            );
        }
    }
}
