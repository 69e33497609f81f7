//! Atomic on-disk storage for checkpoints.

use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::snapshot::{CHECKPOINT_VERSION, Checkpoint};
use crate::errors::CheckpointError;

/// Reads and writes `checkpoint.json`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

#[derive(Deserialize)]
struct VersionHeader {
    #[serde(default)]
    version: u32,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the checkpoint.
    ///
    /// Returns `Ok(None)` when no checkpoint exists. An unreadable file is
    /// `Corrupt` and is never repaired here.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        let header: VersionHeader =
            serde_json::from_str(&content).map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        if header.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: header.version,
                supported: CHECKPOINT_VERSION,
            });
        }

        let mut checkpoint: Checkpoint =
            serde_json::from_str(&content).map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        checkpoint.version = CHECKPOINT_VERSION;
        Ok(Some(checkpoint))
    }

    /// Write the checkpoint atomically: temp file in the same directory,
    /// fsync, then rename over the target.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;

        let content = serde_json::to_vec_pretty(checkpoint).map_err(|e| {
            self.io_error(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| self.io_error(e))?;
        temp.write_all(&content).map_err(|e| self.io_error(e))?;
        temp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        temp.persist(&self.path).map_err(|e| self.io_error(e.error))?;

        sync_dir(parent);
        tracing::debug!(
            path = %self.path.display(),
            sequence = checkpoint.sequence,
            "checkpoint written"
        );
        Ok(())
    }

    /// Delete the checkpoint file if present.
    pub fn remove(&self) -> Result<bool, CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
