//! Failure classification and recovery decisions.
//!
//! The classifier turns a raw worker error into an [`ErrorClassification`]
//! through ordered, auditable rules. The policy turns a classification, the
//! attempt count and the evidence verdict into a [`RecoveryAction`].

mod classifier;
mod policy;

pub use classifier::{
    Classified, ClassifierRule, ErrorClassification, ErrorClassifier, RuleConfig,
    default_rule_configs,
};
pub use policy::{Decision, RecoveryAction, RetryPolicy};
