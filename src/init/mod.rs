//! `marshal init`: create the `.marshal/` directory in a project.
//!
//! ```text
//! .marshal/
//! ├── marshal.toml      # Configuration (defaults written out)
//! ├── milestones.json   # Milestones and their phase graphs
//! └── logs/             # Rolling run logs and per-attempt prompts
//! ```
//!
//! The checkpoint file and its lock are created by the first `marshal run`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::marshal_config::{CONFIG_FILE, MARSHAL_DIR, MarshalToml};
use crate::phase::MilestonesFile;

/// Result of initializing a project.
#[derive(Debug)]
pub struct InitResult {
    pub marshal_dir: PathBuf,
    /// False when `.marshal/` already existed
    pub created: bool,
    /// Files written by this call; existing files are never overwritten
    pub written: Vec<PathBuf>,
}

/// Initialize `.marshal/` in `project_dir` for a project called `project`.
pub fn init_project(project_dir: &Path, project: &str) -> Result<InitResult> {
    let marshal_dir = project_dir.join(MARSHAL_DIR);
    let created = !marshal_dir.exists();
    std::fs::create_dir_all(marshal_dir.join("logs"))
        .with_context(|| format!("Failed to create directory: {}", marshal_dir.display()))?;

    let mut written = Vec::new();

    let config_file = marshal_dir.join(CONFIG_FILE);
    if !config_file.exists() {
        let mut toml = MarshalToml::default();
        toml.project.name = Some(project.to_string());
        toml.save(&config_file)?;
        written.push(config_file);
    }

    let milestones_file = marshal_dir.join("milestones.json");
    if !milestones_file.exists() {
        MilestonesFile::default_for(project).save(&milestones_file)?;
        written.push(milestones_file);
    }

    tracing::debug!(dir = %marshal_dir.display(), created, files = written.len(), "project initialized");
    Ok(InitResult {
        marshal_dir,
        created,
        written,
    })
}

/// Whether `project_dir` has a `.marshal/` directory.
pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(MARSHAL_DIR).is_dir()
}
