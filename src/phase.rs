//! Phase and milestone definitions for the marshal orchestrator.
//!
//! This module provides:
//! - `PhaseSpec` describing one production phase and its dependencies
//! - `MilestoneSpec` grouping phases into a dependency graph
//! - `MilestonesFile`, the `.marshal/milestones.json` format
//! - The default production pipeline used when no milestones file exists

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Names of the default production phases.
pub mod names {
    pub const RESEARCH: &str = "research";
    pub const PLANNING: &str = "planning";
    pub const IMPLEMENTATION: &str = "implementation";
    pub const ARCHITECTURE_REVIEW: &str = "architecture-review";
    pub const LINT: &str = "lint";
    pub const TYPECHECK: &str = "typecheck";
    pub const TEST: &str = "test";
    pub const INTEGRATION: &str = "integration";
    pub const E2E: &str = "e2e";
    pub const VALIDATE: &str = "validate";
    pub const COMMIT: &str = "commit";
}

/// A single production phase within a milestone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSpec {
    /// Phase name, unique within its milestone
    pub name: String,
    /// Names of phases that must succeed before this one may start
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Instruction handed to the worker; falls back to the built-in text for default phases
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instruction: String,
}

impl PhaseSpec {
    /// Create a phase with the given dependencies and the built-in instruction.
    pub fn new(name: &str, depends_on: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            instruction: String::new(),
        }
    }

    /// Set an explicit instruction.
    pub fn with_instruction(mut self, instruction: &str) -> Self {
        self.instruction = instruction.to_string();
        self
    }

    /// The instruction to send, resolving the built-in default when none is set.
    pub fn effective_instruction(&self) -> String {
        if self.instruction.trim().is_empty() {
            default_instruction(&self.name).to_string()
        } else {
            self.instruction.clone()
        }
    }
}

/// A milestone: a named group of phases forming one dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MilestoneSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_pipeline")]
    pub phases: Vec<PhaseSpec>,
}

impl MilestoneSpec {
    /// Create a milestone running the default pipeline.
    pub fn with_default_pipeline(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            phases: default_pipeline(),
        }
    }

    /// Get a phase by name.
    pub fn phase(&self, name: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.name == name)
    }
}

/// Represents the full milestones.json file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestonesFile {
    /// Project name; defaults to the project directory name when empty
    #[serde(default)]
    pub project: String,
    pub milestones: Vec<MilestoneSpec>,
}

impl MilestonesFile {
    /// Load milestones from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read milestones file: {}", path.display()))?;

        let file: MilestonesFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse milestones JSON: {}", path.display()))?;

        Ok(file)
    }

    /// Save milestones to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize milestones to JSON")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write milestones file: {}", path.display()))?;

        Ok(())
    }

    /// A single default milestone running the standard pipeline.
    pub fn default_for(project: &str) -> Self {
        Self {
            project: project.to_string(),
            milestones: vec![MilestoneSpec::with_default_pipeline("mvp")],
        }
    }

    /// Get a milestone by name.
    pub fn milestone(&self, name: &str) -> Option<&MilestoneSpec> {
        self.milestones.iter().find(|m| m.name == name)
    }
}

/// The default production pipeline:
/// research → planning → implementation → architecture-review → {lint, typecheck}
/// → test → integration → e2e → validate → commit.
pub fn default_pipeline() -> Vec<PhaseSpec> {
    use names::*;
    vec![
        PhaseSpec::new(RESEARCH, &[]),
        PhaseSpec::new(PLANNING, &[RESEARCH]),
        PhaseSpec::new(IMPLEMENTATION, &[PLANNING]),
        PhaseSpec::new(ARCHITECTURE_REVIEW, &[IMPLEMENTATION]),
        PhaseSpec::new(LINT, &[ARCHITECTURE_REVIEW]),
        PhaseSpec::new(TYPECHECK, &[ARCHITECTURE_REVIEW]),
        PhaseSpec::new(TEST, &[LINT, TYPECHECK]),
        PhaseSpec::new(INTEGRATION, &[TEST]),
        PhaseSpec::new(E2E, &[INTEGRATION]),
        PhaseSpec::new(VALIDATE, &[E2E]),
        PhaseSpec::new(COMMIT, &[VALIDATE]),
    ]
}

/// Built-in instruction text for the default phases.
pub fn default_instruction(phase: &str) -> &'static str {
    match phase {
        names::RESEARCH => {
            "Research the problem domain, existing libraries and constraints. Write findings to docs/research.md."
        }
        names::PLANNING => {
            "Produce an implementation plan with modules, interfaces and milestones. Write it to docs/plan.md."
        }
        names::IMPLEMENTATION => {
            "Implement the plan in docs/plan.md. Leave no placeholder code behind."
        }
        names::ARCHITECTURE_REVIEW => {
            "Review the implementation against docs/plan.md and fix structural problems. Record the review in docs/architecture-review.md."
        }
        names::LINT => "Make the project pass its linter with zero warnings.",
        names::TYPECHECK => "Make the project pass its type checker with zero errors.",
        names::TEST => "Write and fix unit tests until the unit test suite passes.",
        names::INTEGRATION => {
            "Write and fix integration tests until the integration suite passes."
        }
        names::E2E => "Write and fix end-to-end tests until the end-to-end suite passes.",
        names::VALIDATE => {
            "Validate the finished work against docs/plan.md. Write the result to docs/validation.md."
        }
        names::COMMIT => "Commit all work to version control with a descriptive message.",
        _ => "Complete this phase of the project.",
    }
}

/// Try to load milestones from a file, falling back to the default milestone if not found.
pub fn load_milestones_or_default(path: Option<&Path>, project: &str) -> Result<MilestonesFile> {
    match path {
        Some(path) if path.exists() => {
            let mut file = MilestonesFile::load(path)?;
            if file.project.is_empty() {
                file.project = project.to_string();
            }
            Ok(file)
        }
        _ => Ok(MilestonesFile::default_for(project)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_pipeline_shape() {
        let phases = default_pipeline();
        assert_eq!(phases.len(), 11);
        assert_eq!(phases[0].name, names::RESEARCH);
        assert!(phases[0].depends_on.is_empty());

        let test = phases.iter().find(|p| p.name == names::TEST).unwrap();
        assert_eq!(test.depends_on, vec![names::LINT, names::TYPECHECK]);
    }

    #[test]
    fn test_effective_instruction_prefers_explicit_text() {
        let phase = PhaseSpec::new("lint", &[]).with_instruction("Run clippy");
        assert_eq!(phase.effective_instruction(), "Run clippy");

        let phase = PhaseSpec::new("lint", &[]);
        assert!(phase.effective_instruction().contains("linter"));
    }

    #[test]
    fn test_milestone_deserialization_defaults_to_pipeline() {
        let json = r#"{"name": "alpha"}"#;
        let milestone: MilestoneSpec = serde_json::from_str(json).unwrap();
        assert_eq!(milestone.phases, default_pipeline());
        assert_eq!(milestone.description, "");
    }

    #[test]
    fn test_milestones_file_roundtrip_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("milestones.json");

        let file = MilestonesFile {
            project: "demo".to_string(),
            milestones: vec![MilestoneSpec {
                name: "core".to_string(),
                description: "core features".to_string(),
                phases: vec![PhaseSpec::new("a", &[]), PhaseSpec::new("b", &["a"])],
            }],
        };
        file.save(&path).unwrap();

        let loaded = MilestonesFile::load(&path).unwrap();
        assert_eq!(loaded.project, "demo");
        assert_eq!(loaded.milestone("core").unwrap().phases.len(), 2);
        assert!(loaded.milestone("missing").is_none());
    }

    #[test]
    fn test_load_milestones_or_default_without_file() {
        let dir = tempdir().unwrap();
        let file =
            load_milestones_or_default(Some(&dir.path().join("missing.json")), "demo").unwrap();
        assert_eq!(file.project, "demo");
        assert_eq!(file.milestones.len(), 1);
        assert_eq!(file.milestones[0].name, "mvp");
    }

    #[test]
    fn test_load_milestones_fills_empty_project_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("milestones.json");
        std::fs::write(&path, r#"{"milestones": [{"name": "m1"}]}"#).unwrap();

        let file = load_milestones_or_default(Some(&path), "fallback").unwrap();
        assert_eq!(file.project, "fallback");
    }

    #[test]
    fn test_load_milestones_rejects_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("milestones.json");
        std::fs::write(&path, "not json").unwrap();

        let err = load_milestones_or_default(Some(&path), "x").unwrap_err();
        assert!(err.to_string().contains("parse"));
    }
}
