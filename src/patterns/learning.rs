//! Failure records and loop detection.
//!
//! Core types:
//! - [`FailureRecord`]: one failed attempt, as appended to the checkpoint log
//! - [`PatternMemory`]: per-phase recent failures and signal counts (persisted)
//! - [`FailurePatternLearner`]: records failures and detects retry loops
//!
//! A loop is the last `window` failures of one phase, recorded since the
//! previous signal, sharing a classification and pairwise similar diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::similarity::{fingerprint, jaccard};
use crate::recovery::ErrorClassification;
use crate::worker::stream::truncate_str;

/// Maximum characters kept from a failure diagnostic.
pub const DIAGNOSTIC_EXCERPT_LEN: usize = 400;

/// One failed phase attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub milestone: String,
    pub phase: String,
    pub attempt: u32,
    pub classification: ErrorClassification,
    pub timestamp: DateTime<Utc>,
    /// Diagnostic excerpt, at most [`DIAGNOSTIC_EXCERPT_LEN`] characters
    pub diagnostic: String,
    /// SHA-256 of the normalized full diagnostic
    #[serde(default)]
    pub fingerprint: String,
}

impl FailureRecord {
    pub fn new(
        milestone: &str,
        phase: &str,
        attempt: u32,
        classification: ErrorClassification,
        diagnostic: &str,
    ) -> Self {
        Self {
            milestone: milestone.to_string(),
            phase: phase.to_string(),
            attempt,
            classification,
            timestamp: Utc::now(),
            diagnostic: truncate_str(diagnostic.trim(), DIAGNOSTIC_EXCERPT_LEN),
            fingerprint: fingerprint(diagnostic),
        }
    }

    /// Key under which this record's phase history is kept.
    pub fn key(&self) -> String {
        phase_key(&self.milestone, &self.phase)
    }
}

pub fn phase_key(milestone: &str, phase: &str) -> String {
    format!("{}/{}", milestone, phase)
}

/// Loop detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    /// Consecutive matching failures needed to signal a loop
    pub window: usize,
    /// Minimum pairwise diagnostic similarity (0.0–1.0)
    pub similarity: f64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            window: 3,
            similarity: 0.85,
        }
    }
}

/// Recent failures and signal count for one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistory {
    /// Failures recorded since the last signal, oldest first
    #[serde(default)]
    pub recent: Vec<FailureRecord>,
    /// Loop signals already issued for this phase
    #[serde(default)]
    pub signals: u32,
}

/// Learner state carried in the checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternMemory {
    #[serde(default)]
    phases: BTreeMap<String, PhaseHistory>,
}

impl PatternMemory {
    pub fn history(&self, milestone: &str, phase: &str) -> Option<&PhaseHistory> {
        self.phases.get(&phase_key(milestone, phase))
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// What the state machine should do about a detected loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopAction {
    /// Append this corrective constraint to the next payload
    AddConstraint(String),
    /// A constraint was already issued; step back instead
    StepBack,
}

/// A detected retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSignal {
    pub milestone: String,
    pub phase: String,
    pub classification: ErrorClassification,
    /// Number of matching failures in the window
    pub occurrences: usize,
    /// Diagnostic of the most recent failure
    pub diagnostic: String,
    pub action: LoopAction,
}

/// Records failures into a [`PatternMemory`] and detects loops.
pub struct FailurePatternLearner<'m> {
    config: LearnerConfig,
    memory: &'m mut PatternMemory,
}

impl<'m> FailurePatternLearner<'m> {
    pub fn new(config: LearnerConfig, memory: &'m mut PatternMemory) -> Self {
        Self { config, memory }
    }

    /// Record a failure, keeping at most `window` recent records for its phase.
    pub fn record(&mut self, record: FailureRecord) {
        let window = self.config.window.max(1);
        let history = self.memory.phases.entry(record.key()).or_default();
        history.recent.push(record);
        if history.recent.len() > window {
            let excess = history.recent.len() - window;
            history.recent.drain(..excess);
        }
    }

    /// Check whether the phase is stuck repeating the same failure.
    pub fn detect_loop(&self, milestone: &str, phase: &str) -> Option<LoopSignal> {
        let window = self.config.window.max(1);
        let history = self.memory.history(milestone, phase)?;
        if history.recent.len() < window {
            return None;
        }
        let recent = &history.recent[history.recent.len() - window..];
        let first = &recent[0];
        if recent.iter().any(|r| r.classification != first.classification) {
            return None;
        }

        for (i, a) in recent.iter().enumerate() {
            for b in &recent[i + 1..] {
                if !self.similar(a, b) {
                    return None;
                }
            }
        }

        let last = &recent[recent.len() - 1];
        let action = if history.signals == 0 {
            LoopAction::AddConstraint(corrective_constraint(phase, window, &last.diagnostic))
        } else {
            LoopAction::StepBack
        };

        tracing::info!(
            milestone,
            phase,
            occurrences = window,
            classification = %first.classification,
            signals = history.signals,
            "failure loop detected"
        );

        Some(LoopSignal {
            milestone: milestone.to_string(),
            phase: phase.to_string(),
            classification: first.classification,
            occurrences: window,
            diagnostic: last.diagnostic.clone(),
            action,
        })
    }

    /// Mark a signal as acted on: count it and start a fresh window.
    pub fn acknowledge(&mut self, milestone: &str, phase: &str) {
        if let Some(history) = self.memory.phases.get_mut(&phase_key(milestone, phase)) {
            history.signals += 1;
            history.recent.clear();
        }
    }

    /// Forget everything about a phase (after a step-back re-plans it).
    pub fn reset(&mut self, milestone: &str, phase: &str) {
        self.memory.phases.remove(&phase_key(milestone, phase));
    }

    fn similar(&self, a: &FailureRecord, b: &FailureRecord) -> bool {
        if !a.fingerprint.is_empty() && a.fingerprint == b.fingerprint {
            return true;
        }
        jaccard(&a.diagnostic, &b.diagnostic) >= self.config.similarity
    }
}

/// Constraint text appended to the next attempt's payload.
pub fn corrective_constraint(phase: &str, occurrences: usize, diagnostic: &str) -> String {
    format!(
        "The last {} attempts of '{}' failed the same way: \"{}\". \
         Do not repeat the previous approach; address this failure directly before anything else.",
        occurrences,
        phase,
        truncate_str(diagnostic, 200)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ErrorClassification::*;

    fn failure(attempt: u32, classification: ErrorClassification, diag: &str) -> FailureRecord {
        FailureRecord::new("mvp", "implementation", attempt, classification, diag)
    }

    #[test]
    fn test_failure_record_truncates_diagnostic() {
        let long = "x".repeat(1000);
        let record = failure(1, RetryableTransient, &long);
        assert!(record.diagnostic.chars().count() <= DIAGNOSTIC_EXCERPT_LEN);
        assert_eq!(record.key(), "mvp/implementation");
        assert_eq!(record.fingerprint.len(), 64);
    }

    #[test]
    fn test_no_loop_below_window() {
        let mut memory = PatternMemory::default();
        let mut learner = FailurePatternLearner::new(LearnerConfig::default(), &mut memory);
        learner.record(failure(1, RetryableTransient, "evidence: docs/plan.md missing"));
        learner.record(failure(2, RetryableTransient, "evidence: docs/plan.md missing"));
        assert!(learner.detect_loop("mvp", "implementation").is_none());
    }

    #[test]
    fn test_identical_failures_signal_constraint_then_step_back() {
        let mut memory = PatternMemory::default();
        let mut learner = FailurePatternLearner::new(LearnerConfig::default(), &mut memory);
        for attempt in 1..=3 {
            learner.record(failure(attempt, RetryableTransient, "cargo build failed: E0308"));
        }
        let signal = learner.detect_loop("mvp", "implementation").unwrap();
        assert_eq!(signal.occurrences, 3);
        match &signal.action {
            LoopAction::AddConstraint(text) => assert!(text.contains("E0308")),
            other => panic!("expected constraint, got {:?}", other),
        }

        learner.acknowledge("mvp", "implementation");
        assert!(learner.detect_loop("mvp", "implementation").is_none());

        for attempt in 4..=6 {
            learner.record(failure(attempt, RetryableTransient, "cargo build failed: E0308"));
        }
        let again = learner.detect_loop("mvp", "implementation").unwrap();
        assert_eq!(again.action, LoopAction::StepBack);
    }

    #[test]
    fn test_mixed_classifications_do_not_signal() {
        let mut memory = PatternMemory::default();
        let mut learner = FailurePatternLearner::new(LearnerConfig::default(), &mut memory);
        learner.record(failure(1, RetryableTransient, "same text"));
        learner.record(failure(2, Unknown, "same text"));
        learner.record(failure(3, RetryableTransient, "same text"));
        assert!(learner.detect_loop("mvp", "implementation").is_none());
    }

    #[test]
    fn test_dissimilar_diagnostics_do_not_signal() {
        let mut memory = PatternMemory::default();
        let mut learner = FailurePatternLearner::new(LearnerConfig::default(), &mut memory);
        learner.record(failure(1, RetryableTransient, "rate limit reached"));
        learner.record(failure(2, RetryableTransient, "connection reset by peer"));
        learner.record(failure(3, RetryableTransient, "rate limit reached"));
        assert!(learner.detect_loop("mvp", "implementation").is_none());
    }

    #[test]
    fn test_near_identical_diagnostics_signal() {
        let mut memory = PatternMemory::default();
        let mut learner = FailurePatternLearner::new(LearnerConfig::default(), &mut memory);
        learner.record(failure(1, RetryableTransient, "test auth::login failed at line 12"));
        learner.record(failure(2, RetryableTransient, "test auth::login failed at line 40"));
        learner.record(failure(3, RetryableTransient, "test auth::login failed at line 41"));
        assert!(learner.detect_loop("mvp", "implementation").is_some());
    }

    #[test]
    fn test_window_is_bounded_and_reset_forgets() {
        let mut memory = PatternMemory::default();
        {
            let mut learner = FailurePatternLearner::new(LearnerConfig::default(), &mut memory);
            for attempt in 1..=5 {
                learner.record(failure(attempt, Unknown, "boom"));
            }
        }
        let history = memory.history("mvp", "implementation").unwrap();
        assert_eq!(history.recent.len(), 3);
        assert_eq!(history.recent[0].attempt, 3);

        let mut learner = FailurePatternLearner::new(LearnerConfig::default(), &mut memory);
        learner.reset("mvp", "implementation");
        assert!(memory.is_empty());
    }

    #[test]
    fn test_memory_round_trips_through_json() {
        let mut memory = PatternMemory::default();
        FailurePatternLearner::new(LearnerConfig::default(), &mut memory)
            .record(failure(1, RetryableTransient, "flaky"));
        let json = serde_json::to_string(&memory).unwrap();
        let back: PatternMemory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, memory);
    }
}
