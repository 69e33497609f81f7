//! Typed error hierarchy for marshal.
//!
//! Four top-level enums cover the subsystems:
//! - `OrchestratorError`: milestone runner and phase state machine failures
//! - `CheckpointError`: durable state persistence and locking
//! - `WorkerError`: starting and controlling a worker invocation
//! - `ConfigError`: rejected configuration (classifier rules, evidence contracts)

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the orchestration subsystem.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Unknown milestone '{name}'")]
    UnknownMilestone { name: String },

    #[error("Phase task panicked: {0}")]
    TaskPanicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the checkpoint store and manager.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint found at {path}")]
    NotFound { path: PathBuf },

    #[error("A checkpoint already exists at {path}; use `resume` or pass --fresh")]
    AlreadyExists { path: PathBuf },

    #[error("Checkpoint at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint format version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Another marshal process holds the lock at {path}")]
    LockHeld { path: PathBuf },

    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Milestone '{milestone}' does not exist in the checkpoint")]
    UnknownMilestone { milestone: String },

    #[error("Phase '{phase}' does not exist in milestone '{milestone}'")]
    UnknownPhase { milestone: String, phase: String },
}

/// Errors from starting or controlling a worker invocation.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker protocol error: {0}")]
    Protocol(String),
}

/// Errors from configuration that cannot be used as written.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid classifier rule '{name}': {message}")]
    InvalidRule { name: String, message: String },

    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_error_spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "claude not found");
        let err = WorkerError::SpawnFailed {
            command: "claude".to_string(),
            source: io_err,
        };
        match &err {
            WorkerError::SpawnFailed { command, source } => {
                assert_eq!(command, "claude");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed variant"),
        }
        assert!(err.to_string().contains("claude"));
    }

    #[test]
    fn checkpoint_error_unsupported_version_carries_versions() {
        let err = CheckpointError::UnsupportedVersion {
            found: 9,
            supported: 1,
        };
        match &err {
            CheckpointError::UnsupportedVersion { found, supported } => {
                assert_eq!(*found, 9);
                assert_eq!(*supported, 1);
            }
            _ => panic!("Expected UnsupportedVersion"),
        }
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn orchestrator_error_converts_from_checkpoint_error() {
        let inner = CheckpointError::LockHeld {
            path: PathBuf::from("/tmp/.marshal/checkpoint.lock"),
        };
        let err: OrchestratorError = inner.into();
        match &err {
            OrchestratorError::Checkpoint(CheckpointError::LockHeld { path }) => {
                assert!(path.ends_with("checkpoint.lock"));
            }
            _ => panic!("Expected OrchestratorError::Checkpoint(LockHeld)"),
        }
    }

    #[test]
    fn config_error_invalid_rule_names_the_rule() {
        let err = ConfigError::InvalidRule {
            name: "catch-all".to_string(),
            message: "needs a pattern or kind".to_string(),
        };
        assert!(err.to_string().contains("catch-all"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::TaskPanicked("boom".into()));
        assert_std_error(&CheckpointError::NotFound {
            path: PathBuf::from("x"),
        });
        assert_std_error(&WorkerError::Protocol("x".into()));
        assert_std_error(&ConfigError::InvalidRule {
            name: "x".into(),
            message: "y".into(),
        });
    }
}
