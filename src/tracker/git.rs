use anyhow::{Context, Result};
use git2::{Oid, Repository};
use std::path::Path;

/// Read-only view of the project repository used for commit evidence.
pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Open the repository if `project_dir` is one, logging otherwise.
    pub fn try_open(project_dir: &Path) -> Option<Self> {
        match Self::new(project_dir) {
            Ok(tracker) => Some(tracker),
            Err(e) => {
                tracing::debug!(dir = %project_dir.display(), error = %e, "no git repository");
                None
            }
        }
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.get_head_commit().map(|c| c.id().to_string())
    }

    /// Number of commits reachable from HEAD but not from `baseline`.
    ///
    /// With no baseline (the branch was unborn when the phase started) every
    /// commit on HEAD counts.
    pub fn commits_since(&self, baseline: Option<&str>) -> Result<usize> {
        let Some(head) = self.get_head_commit() else {
            return Ok(0);
        };
        let mut walk = self.repo.revwalk().context("Failed to walk history")?;
        walk.push(head.id())?;
        if let Some(sha) = baseline {
            let oid = Oid::from_str(sha).with_context(|| format!("Invalid baseline sha: {}", sha))?;
            walk.hide(oid)
                .with_context(|| format!("Baseline commit {} not found", sha))?;
        }
        Ok(walk.count())
    }

    /// Whether at least one commit was created since `baseline`.
    pub fn has_new_commit_since(&self, baseline: Option<&str>) -> Result<bool> {
        Ok(self.commits_since(baseline)? > 0)
    }

    /// Summary line of the HEAD commit.
    pub fn head_summary(&self) -> Option<String> {
        self.get_head_commit()
            .and_then(|c| c.summary().map(str::to_string))
    }
}
