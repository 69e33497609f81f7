//! Run-wide settings and their per-phase resolution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::marshal_config::{PhaseOverride, default_step_back_map, pattern_matches};
use crate::patterns::LearnerConfig;
use crate::poller::PollerConfig;
use crate::recovery::RetryPolicy;

/// Everything the runner and state machine need besides their collaborators.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Project directory handed to the worker and the validator
    pub workdir: PathBuf,
    pub max_concurrent: usize,
    pub max_cost_usd: Option<f64>,
    /// Default per-attempt worker deadline
    pub phase_timeout: Duration,
    pub retry: RetryPolicy,
    /// Step-backs allowed per milestone
    pub max_step_backs: u32,
    pub poller: PollerConfig,
    pub learner: LearnerConfig,
    /// Phase → step-back target
    pub step_back: BTreeMap<String, String>,
    /// Glob pattern → override, applied in key order
    pub overrides: BTreeMap<String, PhaseOverride>,
}

impl RunSettings {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            max_concurrent: 2,
            max_cost_usd: None,
            phase_timeout: Duration::from_secs(30 * 60),
            retry: RetryPolicy::default(),
            max_step_backs: 2,
            poller: PollerConfig::default(),
            learner: LearnerConfig::default(),
            step_back: default_step_back_map(),
            overrides: BTreeMap::new(),
        }
    }

    /// Effective settings for one phase after applying every matching override.
    pub fn phase_settings(&self, phase: &str) -> PhaseSettings {
        let mut settings = PhaseSettings {
            timeout: self.phase_timeout,
            retry: self.retry,
            instruction: None,
        };
        for (pattern, over) in &self.overrides {
            if !pattern_matches(pattern, phase) {
                continue;
            }
            if let Some(secs) = over.timeout_secs {
                settings.timeout = Duration::from_secs(secs);
            }
            if let Some(max) = over.max_attempts {
                settings.retry.max_attempts = max;
            }
            if let Some(instruction) = &over.instruction {
                settings.instruction = Some(instruction.clone());
            }
        }
        settings
    }

    /// Where a phase stuck in a failure loop steps back to, if anywhere.
    pub fn step_back_target(&self, phase: &str) -> Option<&str> {
        self.step_back
            .get(phase)
            .map(String::as_str)
            .filter(|target| *target != phase)
    }

    /// Whether the run has spent more than its cost bound.
    pub fn over_budget(&self, spent_usd: f64) -> bool {
        self.max_cost_usd.is_some_and(|limit| spent_usd > limit)
    }
}

/// Settings resolved for a single phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Replaces the phase's own instruction when set
    pub instruction: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_settings_without_overrides() {
        let settings = RunSettings::new("/tmp/p");
        let lint = settings.phase_settings("lint");
        assert_eq!(lint.timeout, Duration::from_secs(1800));
        assert_eq!(lint.retry, RetryPolicy::default());
        assert!(lint.instruction.is_none());
    }

    #[test]
    fn test_overrides_apply_in_pattern_order() {
        let mut settings = RunSettings::new("/tmp/p");
        settings.overrides.insert(
            "*".into(),
            PhaseOverride {
                timeout_secs: Some(100),
                max_attempts: Some(3),
                instruction: None,
            },
        );
        settings.overrides.insert(
            "e2e".into(),
            PhaseOverride {
                timeout_secs: Some(900),
                instruction: Some("Run playwright".into()),
                ..Default::default()
            },
        );

        let e2e = settings.phase_settings("e2e");
        assert_eq!(e2e.timeout, Duration::from_secs(900));
        assert_eq!(e2e.retry.max_attempts, 3);
        assert_eq!(e2e.instruction.as_deref(), Some("Run playwright"));

        let lint = settings.phase_settings("lint");
        assert_eq!(lint.timeout, Duration::from_secs(100));
        assert!(lint.instruction.is_none());
    }

    #[test]
    fn test_step_back_target() {
        let mut settings = RunSettings::new("/tmp/p");
        assert_eq!(settings.step_back_target("test"), Some("implementation"));
        assert_eq!(settings.step_back_target("implementation"), None);
        settings.step_back.insert("planning".into(), "planning".into());
        assert_eq!(settings.step_back_target("planning"), None);
    }

    #[test]
    fn test_over_budget() {
        let mut settings = RunSettings::new("/tmp/p");
        assert!(!settings.over_budget(1_000.0));
        settings.max_cost_usd = Some(2.0);
        assert!(!settings.over_budget(2.0));
        assert!(settings.over_budget(2.01));
    }
}
