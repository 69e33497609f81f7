//! Rule-based classification of raw worker errors.
//!
//! Rules are evaluated in order and the first match wins. A rule matches on the
//! error kind, a regex over the message, or both. Errors matching no rule are
//! `Unknown`, which is never treated as benign.

use crate::errors::ConfigError;
use crate::worker::{RawErrorKind, RawWorkerError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of failure classifications consumed by the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    BenignInfrastructureNoise,
    RetryableTransient,
    FatalTaskFailure,
    Unknown,
}

impl ErrorClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClassification::BenignInfrastructureNoise => "benign_infrastructure_noise",
            ErrorClassification::RetryableTransient => "retryable_transient",
            ErrorClassification::FatalTaskFailure => "fatal_task_failure",
            ErrorClassification::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classifier rule as written in `marshal.toml`.
///
/// ```toml
/// [[classifier.rules]]
/// name = "quota"
/// classification = "fatal_task_failure"
/// pattern = "(?i)quota exceeded"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub classification: ErrorClassification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RawErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// A compiled classifier rule.
#[derive(Debug, Clone)]
pub struct ClassifierRule {
    name: String,
    classification: ErrorClassification,
    kind: Option<RawErrorKind>,
    pattern: Option<Regex>,
}

impl ClassifierRule {
    /// Compile a rule.
    ///
    /// A rule must constrain something. Benign rules must carry a message
    /// pattern, so no rule can demote a whole error kind to noise.
    pub fn new(
        name: &str,
        classification: ErrorClassification,
        kind: Option<RawErrorKind>,
        pattern: Option<&str>,
    ) -> Result<Self, ConfigError> {
        if kind.is_none() && pattern.is_none() {
            return Err(ConfigError::InvalidRule {
                name: name.to_string(),
                message: "a rule needs a kind, a pattern, or both".to_string(),
            });
        }
        if classification == ErrorClassification::BenignInfrastructureNoise && pattern.is_none() {
            return Err(ConfigError::InvalidRule {
                name: name.to_string(),
                message: "benign rules must match a message pattern".to_string(),
            });
        }
        let pattern = pattern
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .transpose()?;
        Ok(Self {
            name: name.to_string(),
            classification,
            kind,
            pattern,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classification(&self) -> ErrorClassification {
        self.classification
    }

    fn matches(&self, error: &RawWorkerError) -> bool {
        if let Some(kind) = self.kind
            && kind != error.kind
        {
            return false;
        }
        match &self.pattern {
            Some(re) => re.is_match(&error.message),
            None => true,
        }
    }
}

impl TryFrom<&RuleConfig> for ClassifierRule {
    type Error = ConfigError;

    fn try_from(cfg: &RuleConfig) -> Result<Self, Self::Error> {
        ClassifierRule::new(
            &cfg.name,
            cfg.classification,
            cfg.kind,
            cfg.pattern.as_deref(),
        )
    }
}

/// The outcome of classifying one error, naming the rule that decided it.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub classification: ErrorClassification,
    pub rule: Option<String>,
}

/// Ordered rule list mapping raw worker errors to classifications.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassifierRule>,
}

const WORKER_MISSING: &str = r"(?i)failed to spawn worker";
const FATAL_TASK: &str = r"(?i)(invalid[ _-]?api[ _-]?key|authentication[ _]error|\bunauthorized\b|\b401\b|\b403\b|permission[ _]denied|credit balance is too low|billing|invalid_request_error|prompt is too long)";
const BENIGN_TEARDOWN: &str = r"(?i)(cancel scope.* in a different task|attempted to exit cancel scope|event loop is closed|task was destroyed but it is pending|exception ignored in: <function|brokenpipeerror|broken pipe|processlookuperror)";
const RETRYABLE: &str = r"(?i)(rate[ _-]?limit|\b429\b|overloaded|\b529\b|\b502\b|\b503\b|econnreset|connection reset|connection refused|timed? ?out|temporarily unavailable|without a terminal event|without reporting a result|error_max_turns|error_during_execution)";

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

impl ErrorClassifier {
    /// The built-in rule set, in evaluation order.
    pub fn with_default_rules() -> Self {
        let rules = default_rule_configs()
            .iter()
            .filter_map(|cfg| ClassifierRule::try_from(cfg).ok())
            .collect();
        Self { rules }
    }

    /// Configured rules evaluated before the built-in ones.
    pub fn from_config(extra: &[RuleConfig]) -> Result<Self, ConfigError> {
        let mut rules = extra
            .iter()
            .map(ClassifierRule::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        rules.extend(Self::with_default_rules().rules);
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    /// Classify a raw worker error. No matching rule yields `Unknown`.
    pub fn classify(&self, error: &RawWorkerError) -> Classified {
        let classified = self
            .rules
            .iter()
            .find(|rule| rule.matches(error))
            .map(|rule| Classified {
                classification: rule.classification,
                rule: Some(rule.name.clone()),
            })
            .unwrap_or(Classified {
                classification: ErrorClassification::Unknown,
                rule: None,
            });
        tracing::debug!(
            kind = %error.kind,
            classification = %classified.classification,
            rule = classified.rule.as_deref().unwrap_or("-"),
            "classified worker error"
        );
        classified
    }
}

/// The built-in rules as configuration, in evaluation order.
pub fn default_rule_configs() -> Vec<RuleConfig> {
    let rule = |name: &str, classification, kind, pattern: Option<&str>| RuleConfig {
        name: name.to_string(),
        classification,
        kind,
        pattern: pattern.map(str::to_string),
    };
    vec![
        rule(
            "worker-timeout",
            ErrorClassification::RetryableTransient,
            Some(RawErrorKind::Timeout),
            None,
        ),
        rule(
            "worker-missing",
            ErrorClassification::FatalTaskFailure,
            Some(RawErrorKind::Transport),
            Some(WORKER_MISSING),
        ),
        rule(
            "auth-or-billing",
            ErrorClassification::FatalTaskFailure,
            None,
            Some(FATAL_TASK),
        ),
        rule(
            "teardown-race",
            ErrorClassification::BenignInfrastructureNoise,
            None,
            Some(BENIGN_TEARDOWN),
        ),
        rule(
            "transient-infrastructure",
            ErrorClassification::RetryableTransient,
            None,
            Some(RETRYABLE),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn classify(error: RawWorkerError) -> ErrorClassification {
        ErrorClassifier::with_default_rules()
            .classify(&error)
            .classification
    }

    #[test]
    fn test_default_rules_all_compile() {
        assert_eq!(
            ErrorClassifier::with_default_rules().rules().len(),
            default_rule_configs().len()
        );
    }

    #[test]
    fn test_teardown_race_is_benign() {
        let err = RawWorkerError::process(
            Some(1),
            "RuntimeError: Attempted to exit cancel scope in a different task than it was entered in",
        );
        assert_eq!(
            classify(err),
            ErrorClassification::BenignInfrastructureNoise
        );
        assert_eq!(
            classify(RawWorkerError::process(None, "RuntimeError: Event loop is closed")),
            ErrorClassification::BenignInfrastructureNoise
        );
    }

    #[test]
    fn test_rate_limit_and_overload_are_retryable() {
        for msg in [
            "429 Too Many Requests",
            "API Error: Overloaded",
            "read ECONNRESET",
            "Rate limit reached for requests",
        ] {
            assert_eq!(
                classify(RawWorkerError::reported(msg)),
                ErrorClassification::RetryableTransient,
                "{}",
                msg
            );
        }
    }

    #[test]
    fn test_timeout_kind_is_retryable_not_fatal() {
        assert_eq!(
            classify(RawWorkerError::timeout(Duration::from_secs(60))),
            ErrorClassification::RetryableTransient
        );
    }

    #[test]
    fn test_auth_failures_are_fatal() {
        assert_eq!(
            classify(RawWorkerError::reported("Invalid API key · Please run /login")),
            ErrorClassification::FatalTaskFailure
        );
        assert_eq!(
            classify(RawWorkerError::reported("Credit balance is too low")),
            ErrorClassification::FatalTaskFailure
        );
    }

    #[test]
    fn test_missing_worker_binary_is_fatal() {
        let err = RawWorkerError::transport("failed to spawn worker 'claude': No such file");
        assert_eq!(classify(err), ErrorClassification::FatalTaskFailure);
    }

    #[test]
    fn test_unmatched_error_is_unknown() {
        let classified = ErrorClassifier::with_default_rules()
            .classify(&RawWorkerError::process(Some(2), "segmentation fault"));
        assert_eq!(classified.classification, ErrorClassification::Unknown);
        assert!(classified.rule.is_none());
    }

    #[test]
    fn test_first_match_wins_and_reports_rule() {
        // Matches both the fatal and the retryable patterns; fatal comes first.
        let classified = ErrorClassifier::with_default_rules()
            .classify(&RawWorkerError::reported("401 unauthorized after 429 rate limit"));
        assert_eq!(
            classified.classification,
            ErrorClassification::FatalTaskFailure
        );
        assert_eq!(classified.rule.as_deref(), Some("auth-or-billing"));
    }

    #[test]
    fn test_configured_rules_take_precedence() {
        let extra = vec![RuleConfig {
            name: "segfault-retry".into(),
            classification: ErrorClassification::RetryableTransient,
            kind: Some(RawErrorKind::Process),
            pattern: Some("(?i)segmentation fault".into()),
        }];
        let classifier = ErrorClassifier::from_config(&extra).unwrap();
        let classified = classifier.classify(&RawWorkerError::process(Some(139), "Segmentation fault"));
        assert_eq!(
            classified.classification,
            ErrorClassification::RetryableTransient
        );
        assert_eq!(classified.rule.as_deref(), Some("segfault-retry"));
    }

    #[test]
    fn test_kind_filter_excludes_other_kinds() {
        let rule = ClassifierRule::new(
            "process-only",
            ErrorClassification::FatalTaskFailure,
            Some(RawErrorKind::Process),
            Some("boom"),
        )
        .unwrap();
        assert!(rule.matches(&RawWorkerError::process(Some(1), "boom")));
        assert!(!rule.matches(&RawWorkerError::reported("boom")));
    }

    #[test]
    fn test_rule_without_constraints_is_rejected() {
        let err = ClassifierRule::new("any", ErrorClassification::RetryableTransient, None, None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRule { .. }));
    }

    #[test]
    fn test_benign_rule_requires_pattern() {
        let err = ClassifierRule::new(
            "all-process-errors",
            ErrorClassification::BenignInfrastructureNoise,
            Some(RawErrorKind::Process),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("benign"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let cfg = RuleConfig {
            name: "broken".into(),
            classification: ErrorClassification::FatalTaskFailure,
            kind: None,
            pattern: Some("(unclosed".into()),
        };
        let err = ErrorClassifier::from_config(&[cfg]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn test_classification_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorClassification::RetryableTransient).unwrap();
        assert_eq!(json, "\"retryable_transient\"");
        assert_eq!(
            ErrorClassification::FatalTaskFailure.to_string(),
            "fatal_task_failure"
        );
    }
}
