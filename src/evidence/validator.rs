//! The evidence gate between a worker's claim and a phase's `Success`.

use glob::glob;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::checker::{CheckerConfig, run_checker};
use super::contract::{ContractRegistry, EvidenceContract, Predicate};
use crate::tracker::GitTracker;

/// Directories never scanned for placeholder markers.
const SKIPPED_DIRS: &[&str] = &[".git", ".marshal", "target", "node_modules", ".venv", "__pycache__"];

/// Result of validating a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvidenceVerdict {
    Pass,
    Fail { diagnostic: String },
}

impl EvidenceVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, EvidenceVerdict::Pass)
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            EvidenceVerdict::Pass => None,
            EvidenceVerdict::Fail { diagnostic } => Some(diagnostic),
        }
    }
}

/// What the validator needs to know about the attempt being checked.
#[derive(Debug, Clone)]
pub struct EvidenceContext {
    pub workdir: PathBuf,
    /// HEAD when the attempt started, for `GitCommit`
    pub baseline_head: Option<String>,
}

impl EvidenceContext {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            baseline_head: None,
        }
    }

    pub fn with_baseline(mut self, baseline_head: Option<String>) -> Self {
        self.baseline_head = baseline_head;
        self
    }
}

/// Checks a phase's side effects against its evidence contract.
#[derive(Debug, Clone)]
pub struct EvidenceValidator {
    registry: ContractRegistry,
    checkers: BTreeMap<String, CheckerConfig>,
    /// Phases without a contract fail instead of passing vacuously
    require_contract: bool,
}

impl EvidenceValidator {
    pub fn new(registry: ContractRegistry, checkers: BTreeMap<String, CheckerConfig>) -> Self {
        Self {
            registry,
            checkers,
            require_contract: true,
        }
    }

    pub fn with_require_contract(mut self, require: bool) -> Self {
        self.require_contract = require;
        self
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    pub fn contract_for(&self, phase: &str) -> Option<&EvidenceContract> {
        self.registry.get(phase)
    }

    /// Validate `phase` against its contract.
    ///
    /// Every predicate is evaluated; failures are joined into one diagnostic.
    pub async fn validate(&self, phase: &str, ctx: &EvidenceContext) -> EvidenceVerdict {
        let Some(contract) = self.registry.get(phase) else {
            return if self.require_contract {
                EvidenceVerdict::Fail {
                    diagnostic: format!("no evidence contract is configured for phase '{}'", phase),
                }
            } else {
                tracing::debug!(phase, "no evidence contract; passing vacuously");
                EvidenceVerdict::Pass
            };
        };

        let mut failures = Vec::new();
        for predicate in &contract.predicates {
            if let Err(reason) = self.check(predicate, ctx).await {
                failures.push(reason);
            }
        }

        if failures.is_empty() {
            tracing::info!(phase, predicates = contract.predicates.len(), "evidence passed");
            EvidenceVerdict::Pass
        } else {
            let diagnostic = failures.join("; ");
            tracing::info!(phase, %diagnostic, "evidence failed");
            EvidenceVerdict::Fail { diagnostic }
        }
    }

    /// [`validate`](Self::validate), abandoned as soon as `cancel` fires.
    ///
    /// Returns `None` when cancelled. A checker process still running is
    /// killed when its future is dropped.
    pub async fn validate_or_cancel(
        &self,
        phase: &str,
        ctx: &EvidenceContext,
        cancel: &CancellationToken,
    ) -> Option<EvidenceVerdict> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(phase, "evidence validation cancelled");
                None
            }
            verdict = self.validate(phase, ctx) => Some(verdict),
        }
    }

    async fn check(&self, predicate: &Predicate, ctx: &EvidenceContext) -> Result<(), String> {
        if let Predicate::Checker { name } = predicate {
            let Some(config) = self.checkers.get(name) else {
                return Err(format!("checker '{}' is not configured", name));
            };
            let report = run_checker(name, config, &ctx.workdir).await;
            return if report.passed() {
                Ok(())
            } else {
                Err(report.diagnostic())
            };
        }

        // Filesystem and git predicates block; keep them off the async workers.
        let predicate = predicate.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || check_local(&predicate, &ctx))
            .await
            .unwrap_or_else(|e| Err(format!("evidence check did not complete: {}", e)))
    }
}

/// Evaluate a predicate that needs no external process.
fn check_local(predicate: &Predicate, ctx: &EvidenceContext) -> Result<(), String> {
    let workdir = ctx.workdir.as_path();
    match predicate {
        Predicate::FileExists { any_of } => {
            if first_match(workdir, any_of, |_| true).is_some() {
                Ok(())
            } else {
                Err(format!("none of [{}] exists", any_of.join(", ")))
            }
        }
        Predicate::MinSize { path, min_bytes } => check_min_size(&workdir.join(path), path, *min_bytes),
        Predicate::Executable { any_of } => {
            if first_match(workdir, any_of, is_executable).is_some() {
                Ok(())
            } else {
                Err(format!("no executable entry point among [{}]", any_of.join(", ")))
            }
        }
        Predicate::Checker { name } => Err(format!("checker '{}' must run as a process", name)),
        Predicate::PatternAbsent {
            root,
            pattern,
            extensions,
        } => check_pattern_absent(&workdir.join(root), workdir, pattern, extensions),
        Predicate::GitCommit => check_git_commit(workdir, ctx.baseline_head.as_deref()),
    }
}

fn first_match(workdir: &Path, patterns: &[String], accept: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    patterns.iter().find_map(|pattern| {
        let full = workdir.join(pattern);
        glob(&full.to_string_lossy())
            .ok()?
            .filter_map(|entry| entry.ok())
            .find(|path| path.is_file() && accept(path))
    })
}

fn check_min_size(full: &Path, display: &str, min_bytes: u64) -> Result<(), String> {
    let content = match std::fs::read(full) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(format!("{} is missing", display));
        }
        Err(e) => return Err(format!("{} cannot be read: {}", display, e)),
    };
    let len = content.trim_ascii().len() as u64;
    if len >= min_bytes {
        Ok(())
    } else {
        Err(format!(
            "{} is too short ({} bytes, need {})",
            display, len, min_bytes
        ))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn check_pattern_absent(
    root: &Path,
    workdir: &Path,
    pattern: &str,
    extensions: &[String],
) -> Result<(), String> {
    let re = Regex::new(pattern).map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
    let mut hits = Vec::new();

    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !(e.file_type().is_dir() && SKIPPED_DIRS.contains(&name.as_ref()))
        })
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !extensions.is_empty() {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !extensions.iter().any(|allowed| allowed == ext) {
                continue;
            }
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for (lineno, line) in content.lines().enumerate() {
            if re.is_match(line) {
                let rel = path.strip_prefix(workdir).unwrap_or(path);
                hits.push(format!("{}:{}", rel.display(), lineno + 1));
            }
        }
    }

    if hits.is_empty() {
        Ok(())
    } else {
        let shown: Vec<&str> = hits.iter().take(5).map(String::as_str).collect();
        let more = if hits.len() > shown.len() {
            format!(" and {} more", hits.len() - shown.len())
        } else {
            String::new()
        };
        Err(format!(
            "placeholder markers found at {}{}",
            shown.join(", "),
            more
        ))
    }
}

fn check_git_commit(workdir: &Path, baseline: Option<&str>) -> Result<(), String> {
    let tracker = GitTracker::new(workdir).map_err(|e| format!("no git repository: {}", e))?;
    match tracker.has_new_commit_since(baseline) {
        Ok(true) => Ok(()),
        Ok(false) => Err("no commit was created during this phase".to_string()),
        Err(e) => Err(format!("could not inspect git history: {}", e)),
    }
}
