//! Serialized, lock-guarded access to the checkpoint.
//!
//! The manager is the only writer. Every mutation runs against a copy of the
//! current snapshot; the copy is written durably and only then becomes visible
//! to readers. The async mutex is held across the write, so commits are
//! strictly ordered.

use chrono::Utc;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::snapshot::Checkpoint;
use super::store::CheckpointStore;
use crate::errors::CheckpointError;
use crate::phase::MilestoneSpec;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const LOCK_FILE: &str = "checkpoint.lock";

/// How to treat an existing checkpoint when opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Start a new checkpoint; fail if one exists
    Fresh,
    /// Start a new checkpoint, replacing any existing one
    Overwrite,
    /// Continue from the existing checkpoint; fail if none exists
    Resume,
}

pub struct CheckpointManager {
    store: CheckpointStore,
    state: Mutex<Checkpoint>,
    lock_path: PathBuf,
    _lock: File,
}

impl CheckpointManager {
    /// Take the directory lock and load or create the checkpoint.
    ///
    /// On resume the stored milestones are reconciled with `milestones` and
    /// any phase caught mid-attempt is demoted to a retryable failure; the
    /// result is written before the manager is returned.
    pub fn open(
        dir: &Path,
        project: &str,
        milestones: &[MilestoneSpec],
        mode: OpenMode,
    ) -> Result<Self, CheckpointError> {
        let lock_path = dir.join(LOCK_FILE);
        let lock = acquire_lock(dir, &lock_path)?;
        let store = CheckpointStore::new(dir.join(CHECKPOINT_FILE));

        let checkpoint = match mode {
            OpenMode::Fresh => {
                if store.exists() {
                    return Err(CheckpointError::AlreadyExists {
                        path: store.path().to_path_buf(),
                    });
                }
                Checkpoint::new(project, milestones)
            }
            OpenMode::Overwrite => Checkpoint::new(project, milestones),
            OpenMode::Resume => {
                let mut checkpoint = store.load()?.ok_or_else(|| CheckpointError::NotFound {
                    path: store.path().to_path_buf(),
                })?;
                checkpoint.reconcile(milestones);
                for (milestone, phase) in checkpoint.recover_interrupted() {
                    tracing::warn!(
                        milestone = %milestone,
                        phase = %phase,
                        "phase was in flight at last checkpoint; will re-run"
                    );
                }
                checkpoint
            }
        };

        let mut checkpoint = checkpoint;
        checkpoint.sequence += 1;
        checkpoint.updated_at = Utc::now();
        store.save(&checkpoint)?;

        tracing::info!(
            path = %store.path().display(),
            project_id = %checkpoint.project.id,
            ?mode,
            "checkpoint opened"
        );

        Ok(Self {
            store,
            state: Mutex::new(checkpoint),
            lock_path,
            _lock: lock,
        })
    }

    /// Delete the checkpoint in `dir` while holding the directory lock.
    ///
    /// Works on unreadable checkpoints too. Fails with `LockHeld` while a run
    /// owns the directory.
    pub fn discard(dir: &Path) -> Result<bool, CheckpointError> {
        let lock_path = dir.join(LOCK_FILE);
        let _lock = acquire_lock(dir, &lock_path)?;
        let removed = CheckpointStore::new(dir.join(CHECKPOINT_FILE)).remove()?;
        tracing::info!(dir = %dir.display(), removed, "checkpoint discarded");
        Ok(removed)
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// A copy of the last committed snapshot.
    pub async fn snapshot(&self) -> Checkpoint {
        self.state.lock().await.clone()
    }

    /// Read from the last committed snapshot.
    pub async fn read<R>(&self, f: impl FnOnce(&Checkpoint) -> R) -> R {
        let guard = self.state.lock().await;
        f(&guard)
    }

    /// Apply `f` and durably write the result.
    ///
    /// If `f` fails or the write fails, the committed snapshot is unchanged.
    pub async fn commit<R>(
        &self,
        f: impl FnOnce(&mut Checkpoint) -> Result<R, CheckpointError>,
    ) -> Result<R, CheckpointError> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let result = f(&mut next)?;
        self.publish(&mut guard, next).await?;
        Ok(result)
    }

    /// Like [`commit`](Self::commit), but `f` may decline by returning `None`,
    /// in which case nothing is written.
    pub async fn commit_if<R>(
        &self,
        f: impl FnOnce(&mut Checkpoint) -> Result<Option<R>, CheckpointError>,
    ) -> Result<Option<R>, CheckpointError> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let Some(result) = f(&mut next)? else {
            return Ok(None);
        };
        self.publish(&mut guard, next).await?;
        Ok(Some(result))
    }

    /// Write `next` off the async worker threads, then make it current.
    async fn publish(&self, current: &mut Checkpoint, mut next: Checkpoint) -> Result<(), CheckpointError> {
        next.sequence = current.sequence + 1;
        next.updated_at = Utc::now();
        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || store.save(&next).map(|()| next))
            .await
            .map_err(|e| CheckpointError::Io {
                path: self.store.path().to_path_buf(),
                source: std::io::Error::other(e),
            })??;
        *current = written;
        Ok(())
    }
}

/// Open and exclusively lock `checkpoint.lock` in `dir`.
fn acquire_lock(dir: &Path, lock_path: &Path) -> Result<File, CheckpointError> {
    let io_error = |source| CheckpointError::Io {
        path: lock_path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_error)?;
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .map_err(io_error)?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(CheckpointError::LockHeld {
            path: lock_path.to_path_buf(),
        }),
        Err(e) => Err(io_error(e)),
    }
}
