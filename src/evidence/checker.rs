//! External checker processes (linters, type checkers, test runners).
//!
//! A checker is an opaque command. It passes only when it exits zero and its
//! output, parsed with the configured [`DefectParser`], reports no defects.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::phase::names;

/// How defects are counted from a checker's stdout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum DefectParser {
    /// Only the exit status matters
    #[default]
    ExitCode,
    /// Stdout is a JSON array; each element is a defect
    JsonArray,
    /// A JSON pointer selects a number (the count) or an array (the defects)
    JsonField { pointer: String },
    /// Every stdout line matching the regex is a defect
    LineRegex { pattern: String },
}

/// A checker as configured under `[checkers.<name>]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// Program and arguments
    pub command: Vec<String>,
    #[serde(default)]
    pub defects: DefectParser,
    /// Timeout in seconds; the process is killed when it expires
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Working directory relative to the project; defaults to the project root
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    600
}

impl CheckerConfig {
    pub fn new(command: &[&str]) -> Self {
        Self {
            command: command.iter().map(|s| s.to_string()).collect(),
            defects: DefectParser::ExitCode,
            timeout_secs: default_timeout(),
            working_dir: None,
        }
    }

    pub fn with_defects(mut self, defects: DefectParser) -> Self {
        self.defects = defects;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Checkers for the default pipeline: `make <phase>`.
pub fn default_checkers() -> BTreeMap<String, CheckerConfig> {
    [
        names::LINT,
        names::TYPECHECK,
        names::TEST,
        names::INTEGRATION,
        names::E2E,
    ]
    .iter()
    .map(|name| (name.to_string(), CheckerConfig::new(&["make", name])))
    .collect()
}

/// Outcome of one checker run.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckerReport {
    pub name: String,
    pub exit_code: Option<i32>,
    pub defects: usize,
    pub timed_out: bool,
    /// Why the run could not be judged (spawn or parse failure)
    pub error: Option<String>,
    /// Tail of the checker's output
    pub excerpt: String,
}

impl CheckerReport {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.error.is_none() && self.exit_code == Some(0) && self.defects == 0
    }

    /// Operator-facing description of a failed run.
    pub fn diagnostic(&self) -> String {
        let mut msg = if self.timed_out {
            format!("checker '{}' timed out", self.name)
        } else if let Some(err) = &self.error {
            format!("checker '{}' {}", self.name, err)
        } else {
            let exit = self
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            format!(
                "checker '{}' exited {} with {} defect(s)",
                self.name, exit, self.defects
            )
        };
        if !self.excerpt.is_empty() {
            msg.push_str(": ");
            msg.push_str(&self.excerpt);
        }
        msg
    }

    fn failed(name: &str, error: String) -> Self {
        Self {
            name: name.to_string(),
            exit_code: None,
            defects: 0,
            timed_out: false,
            error: Some(error),
            excerpt: String::new(),
        }
    }
}

/// Count defects in checker stdout.
pub fn count_defects(parser: &DefectParser, stdout: &str) -> Result<usize, String> {
    match parser {
        DefectParser::ExitCode => Ok(0),
        DefectParser::JsonArray => {
            if stdout.trim().is_empty() {
                return Ok(0);
            }
            let value: serde_json::Value = serde_json::from_str(stdout.trim())
                .map_err(|e| format!("output is not JSON: {}", e))?;
            value
                .as_array()
                .map(Vec::len)
                .ok_or_else(|| "output is not a JSON array".to_string())
        }
        DefectParser::JsonField { pointer } => {
            let value: serde_json::Value = serde_json::from_str(stdout.trim())
                .map_err(|e| format!("output is not JSON: {}", e))?;
            match value.pointer(pointer) {
                Some(serde_json::Value::Number(n)) => n
                    .as_u64()
                    .map(|n| n as usize)
                    .ok_or_else(|| format!("'{}' is not a non-negative integer", pointer)),
                Some(serde_json::Value::Array(items)) => Ok(items.len()),
                Some(_) => Err(format!("'{}' is neither a count nor an array", pointer)),
                None => Err(format!("'{}' not found in output", pointer)),
            }
        }
        DefectParser::LineRegex { pattern } => {
            let re = Regex::new(pattern).map_err(|e| format!("invalid defect pattern: {}", e))?;
            Ok(stdout.lines().filter(|line| re.is_match(line)).count())
        }
    }
}

/// Run a checker in `workdir` and judge its output.
pub async fn run_checker(name: &str, config: &CheckerConfig, workdir: &Path) -> CheckerReport {
    let Some((program, args)) = config.command.split_first() else {
        return CheckerReport::failed(name, "has no command configured".to_string());
    };

    let dir = match &config.working_dir {
        Some(p) if p.is_absolute() => p.clone(),
        Some(p) => workdir.join(p),
        None => workdir.to_path_buf(),
    };

    tracing::debug!(checker = name, command = ?config.command, dir = %dir.display(), "running checker");

    let child = Command::new(program)
        .args(args)
        .current_dir(&dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return CheckerReport::failed(name, format!("could not start '{}': {}", program, e));
        }
    };

    let limit = Duration::from_secs(config.timeout_secs);
    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return CheckerReport::failed(name, format!("failed while running: {}", e)),
        Err(_) => {
            tracing::warn!(checker = name, timeout_secs = config.timeout_secs, "checker timed out");
            return CheckerReport {
                name: name.to_string(),
                exit_code: None,
                defects: 0,
                timed_out: true,
                error: None,
                excerpt: String::new(),
            };
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let (defects, error) = match count_defects(&config.defects, &stdout) {
        Ok(n) => (n, None),
        Err(e) => (0, Some(e)),
    };

    let combined = format!("{}\n{}", stdout.trim(), stderr.trim());
    let report = CheckerReport {
        name: name.to_string(),
        exit_code: output.status.code(),
        defects,
        timed_out: false,
        error,
        excerpt: tail(combined.trim(), 300),
    };

    tracing::info!(
        checker = name,
        exit_code = ?report.exit_code,
        defects = report.defects,
        passed = report.passed(),
        "checker finished"
    );
    report
}

/// Last `max_chars` characters of `s`.
fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().skip(count - max_chars).collect();
    format!("...{}", kept)
}
