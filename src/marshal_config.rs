//! Configuration for marshal, read from `.marshal/marshal.toml`.
//!
//! Every section is optional and falls back to defaults. Settings are layered
//! file → environment → CLI by [`MarshalConfig`].
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-service"
//!
//! [worker]
//! command = "claude"
//! skip_permissions = true
//!
//! [execution]
//! max_concurrent = 2
//! phase_timeout_secs = 1800
//! max_cost_usd = 25.0
//!
//! [retry]
//! max_attempts = 6
//! unknown_max_attempts = 2
//! max_step_backs = 2
//!
//! [poller]
//! floor_secs = 5.0
//! factor = 1.5
//! ceiling_secs = 30.0
//!
//! [patterns]
//! window = 3
//! similarity = 0.85
//!
//! [phases.overrides."e2e"]
//! timeout_secs = 3600
//! max_attempts = 3
//!
//! [checkers.lint]
//! command = ["ruff", "check", "--output-format", "json", "."]
//! defects = { format = "json_array" }
//!
//! [evidence.commit]
//! predicates = [{ type = "git_commit" }]
//!
//! [[classifier.rules]]
//! name = "flaky-proxy"
//! classification = "retryable_transient"
//! pattern = "proxy error"
//!
//! [step_back]
//! test = "implementation"
//!
//! [logging]
//! level = "info"
//! format = "plain"
//! file = true
//! ```

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::evidence::{
    CheckerConfig, ContractRegistry, DefectParser, EvidenceContract, EvidenceValidator, Predicate,
    default_checkers,
};
use crate::orchestrator::RunSettings;
use crate::patterns::LearnerConfig;
use crate::phase::{MilestonesFile, load_milestones_or_default, names};
use crate::poller::PollerConfig;
use crate::recovery::{ErrorClassifier, RetryPolicy, RuleConfig};
use crate::worker::claude::ClaudeGateway;

/// Name of the config file inside `.marshal/`.
pub const CONFIG_FILE: &str = "marshal.toml";
/// Name of the state directory inside the project.
pub const MARSHAL_DIR: &str = ".marshal";

/// Longest poll interval accepted; larger values are capped.
pub const MAX_POLL_INTERVAL_SECS: f64 = 86_400.0;
/// Growth factors above this are flagged by `validate`.
pub const MAX_POLL_FACTOR: f64 = 100.0;
/// Phase deadlines above thirty days are flagged by `validate`.
pub const MAX_PHASE_TIMEOUT_SECS: u64 = 30 * 86_400;

/// Project-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
}

/// How the worker CLI is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Worker command (default: "claude")
    #[serde(default)]
    pub command: Option<String>,
    /// Pass `--dangerously-skip-permissions`
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    /// Extra flags appended after the stream-json flags
    #[serde(default)]
    pub extra_flags: Vec<String>,
    /// Write each attempt's payload under `.marshal/logs/prompts/`
    #[serde(default = "default_true")]
    pub log_prompts: bool,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: None,
            skip_permissions: true,
            extra_flags: Vec::new(),
            log_prompts: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Concurrency, time and cost bounds for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-attempt worker deadline
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// Halt once the run's reported cost exceeds this
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Phases without an evidence contract fail instead of passing vacuously
    #[serde(default = "default_true")]
    pub require_contract: bool,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_phase_timeout_secs() -> u64 {
    1800
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            phase_timeout_secs: default_phase_timeout_secs(),
            max_cost_usd: None,
            require_contract: true,
        }
    }
}

/// Attempt and step-back ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_unknown_max_attempts")]
    pub unknown_max_attempts: u32,
    /// Step-backs allowed per milestone before the loop is treated as fatal
    #[serde(default = "default_max_step_backs")]
    pub max_step_backs: u32,
}

fn default_max_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}

fn default_unknown_max_attempts() -> u32 {
    RetryPolicy::default().unknown_max_attempts
}

fn default_max_step_backs() -> u32 {
    2
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            unknown_max_attempts: default_unknown_max_attempts(),
            max_step_backs: default_max_step_backs(),
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            unknown_max_attempts: self.unknown_max_attempts,
        }
    }
}

/// Completion poller bounds, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSection {
    #[serde(default = "default_floor_secs")]
    pub floor_secs: f64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_ceiling_secs")]
    pub ceiling_secs: f64,
}

fn default_floor_secs() -> f64 {
    5.0
}

fn default_factor() -> f64 {
    1.5
}

fn default_ceiling_secs() -> f64 {
    30.0
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            floor_secs: default_floor_secs(),
            factor: default_factor(),
            ceiling_secs: default_ceiling_secs(),
        }
    }
}

impl PollerSection {
    /// Convert to a poller config. Non-finite or negative values fall back to
    /// defaults; intervals are capped at [`MAX_POLL_INTERVAL_SECS`].
    pub fn to_poller_config(&self) -> PollerConfig {
        let secs = |v: f64, fallback: f64| {
            let v = if v.is_finite() && v >= 0.0 { v } else { fallback };
            Duration::try_from_secs_f64(v.min(MAX_POLL_INTERVAL_SECS))
                .unwrap_or(Duration::from_secs_f64(fallback))
        };
        PollerConfig::new(
            secs(self.floor_secs, default_floor_secs()),
            self.factor,
            secs(self.ceiling_secs, default_ceiling_secs()),
        )
    }
}

/// Phase-specific override settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverride {
    /// Worker deadline for matching phases
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Attempt ceiling for matching phases
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Replacement instruction for matching phases
    #[serde(default)]
    pub instruction: Option<String>,
}

/// Phase override configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasesSection {
    /// Pattern-based overrides (e.g., "e2e" or "*-review" -> PhaseOverride)
    #[serde(default)]
    pub overrides: BTreeMap<String, PhaseOverride>,
}

/// Extra classifier rules, evaluated before the built-in ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierSection {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Console log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG`/`MARSHAL_LOG` are unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write JSON logs to `.marshal/logs/`
    #[serde(default = "default_true")]
    pub file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Plain,
            file: true,
        }
    }
}

/// Default step-back targets: verification phases re-open implementation.
pub fn default_step_back_map() -> BTreeMap<String, String> {
    [
        names::LINT,
        names::TYPECHECK,
        names::TEST,
        names::INTEGRATION,
        names::E2E,
        names::VALIDATE,
    ]
    .iter()
    .map(|p| (p.to_string(), names::IMPLEMENTATION.to_string()))
    .collect()
}

/// Root configuration structure for marshal.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarshalToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub patterns: LearnerConfig,
    #[serde(default)]
    pub phases: PhasesSection,
    /// Checker commands, merged over the `make <phase>` defaults
    #[serde(default)]
    pub checkers: BTreeMap<String, CheckerConfig>,
    /// Evidence contracts replacing the defaults per phase
    #[serde(default)]
    pub evidence: BTreeMap<String, EvidenceContract>,
    #[serde(default)]
    pub classifier: ClassifierSection,
    /// Phase → phase it steps back to when stuck in a loop
    #[serde(default = "default_step_back_map")]
    pub step_back: BTreeMap<String, String>,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Default for MarshalToml {
    fn default() -> Self {
        Self {
            project: ProjectSection::default(),
            worker: WorkerSection::default(),
            execution: ExecutionSection::default(),
            retry: RetrySection::default(),
            poller: PollerSection::default(),
            patterns: LearnerConfig::default(),
            phases: PhasesSection::default(),
            checkers: BTreeMap::new(),
            evidence: BTreeMap::new(),
            classifier: ClassifierSection::default(),
            step_back: default_step_back_map(),
            logging: LoggingSection::default(),
        }
    }
}

impl MarshalToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse marshal.toml")
    }

    /// Load `marshal.toml` from `marshal_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(marshal_dir: &Path) -> Result<Self> {
        let config_path = marshal_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize marshal.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Checkers after merging `[checkers.*]` over the defaults.
    pub fn checkers(&self) -> BTreeMap<String, CheckerConfig> {
        let mut checkers = default_checkers();
        checkers.extend(self.checkers.clone());
        checkers
    }

    /// Check the configuration and return human-readable warnings.
    ///
    /// `known_phases` are the phase names of the loaded milestones; step-back
    /// entries naming anything else are reported.
    pub fn validate(&self, known_phases: &[String]) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.execution.max_concurrent == 0 {
            warnings.push("execution.max_concurrent is 0; no phase could ever start".to_string());
        }
        if let Some(limit) = self.execution.max_cost_usd
            && !(limit.is_finite() && limit > 0.0)
        {
            warnings.push(format!("execution.max_cost_usd must be positive, got {}", limit));
        }
        if self.retry.max_attempts == 0 || self.retry.unknown_max_attempts == 0 {
            warnings.push("retry ceilings must allow at least one attempt".to_string());
        }
        let loop_budget = 2 * self.patterns.window.max(1);
        if (self.retry.max_attempts as usize) < loop_budget {
            warnings.push(format!(
                "retry.max_attempts ({}) is below 2 x patterns.window ({}); a failure loop hits the ceiling before it can step back",
                self.retry.max_attempts, loop_budget
            ));
        }

        let timeouts = std::iter::once(("execution.phase_timeout_secs".to_string(), self.execution.phase_timeout_secs))
            .chain(self.phases.overrides.iter().filter_map(|(pattern, over)| {
                over.timeout_secs
                    .map(|secs| (format!("phases.overrides.{}.timeout_secs", pattern), secs))
            }));
        for (key, secs) in timeouts {
            if secs > MAX_PHASE_TIMEOUT_SECS {
                warnings.push(format!(
                    "{} ({}) exceeds {} seconds; the phase effectively never times out",
                    key, secs, MAX_PHASE_TIMEOUT_SECS
                ));
            }
        }

        let p = &self.poller;
        if !(p.floor_secs.is_finite() && p.floor_secs > 0.0) {
            warnings.push(format!("poller.floor_secs must be positive, got {}", p.floor_secs));
        }
        if !(p.factor.is_finite() && p.factor >= 1.0) {
            warnings.push(format!("poller.factor must be at least 1.0, got {}", p.factor));
        } else if p.factor > MAX_POLL_FACTOR {
            warnings.push(format!(
                "poller.factor ({}) exceeds {}; the interval jumps straight to the ceiling",
                p.factor, MAX_POLL_FACTOR
            ));
        }
        for (key, secs) in [("poller.floor_secs", p.floor_secs), ("poller.ceiling_secs", p.ceiling_secs)] {
            if secs > MAX_POLL_INTERVAL_SECS {
                warnings.push(format!(
                    "{} ({}) exceeds {} seconds and is capped",
                    key, secs, MAX_POLL_INTERVAL_SECS
                ));
            }
        }
        if p.ceiling_secs < p.floor_secs {
            warnings.push(format!(
                "poller.ceiling_secs ({}) is below poller.floor_secs ({})",
                p.ceiling_secs, p.floor_secs
            ));
        }
        if !(0.0..=1.0).contains(&self.patterns.similarity) {
            warnings.push(format!(
                "patterns.similarity must be within 0.0..=1.0, got {}",
                self.patterns.similarity
            ));
        }
        if self.patterns.window < 2 {
            warnings.push(format!(
                "patterns.window of {} flags every single failure as a loop",
                self.patterns.window
            ));
        }

        if !known_phases.is_empty() {
            let known = |name: &str| known_phases.iter().any(|k| k == name);
            // Entries for phases no milestone declares are inert.
            for (from, to) in self.step_back.iter().filter(|(from, _)| known(from)) {
                if !known(to) {
                    warnings.push(format!("step_back: '{}' targets unknown phase '{}'", from, to));
                }
                if from == to {
                    warnings.push(format!("step_back: '{}' targets itself", from));
                }
            }
            for pattern in self.phases.overrides.keys() {
                if !known_phases.iter().any(|k| pattern_matches(pattern, k)) {
                    warnings.push(format!("phases.overrides: '{}' matches no phase", pattern));
                }
            }
        }

        if let Err(e) = ErrorClassifier::from_config(&self.classifier.rules) {
            warnings.push(e.to_string());
        }

        for (name, checker) in &self.checkers {
            if checker.command.is_empty() {
                warnings.push(format!("checkers.{}: command is empty", name));
            }
            if let DefectParser::LineRegex { pattern } = &checker.defects
                && let Err(e) = Regex::new(pattern)
            {
                warnings.push(format!("checkers.{}: invalid defect pattern: {}", name, e));
            }
        }

        let checkers = self.checkers();
        for (phase, contract) in &self.evidence {
            for predicate in &contract.predicates {
                match predicate {
                    Predicate::PatternAbsent { pattern, .. } => {
                        if let Err(e) = Regex::new(pattern) {
                            warnings.push(format!("evidence.{}: invalid pattern: {}", phase, e));
                        }
                    }
                    Predicate::Checker { name } if !checkers.contains_key(name) => {
                        warnings.push(format!(
                            "evidence.{}: checker '{}' is not configured",
                            phase, name
                        ));
                    }
                    _ => {}
                }
            }
        }

        warnings
    }
}

/// Check if a glob-style pattern matches a phase name. Case-insensitive;
/// `*` matches any run of characters and `?` exactly one.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(&pattern.to_lowercase())
        .map(|p| p.matches(&name.to_lowercase()))
        .unwrap_or(false)
}

/// Resolved marshal configuration.
///
/// It merges settings from:
/// 1. marshal.toml
/// 2. Environment variables (`MARSHAL_*`, `.env` is loaded by the binary)
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct MarshalConfig {
    /// Path to the project directory
    pub project_dir: PathBuf,
    /// Path to the .marshal directory
    pub marshal_dir: PathBuf,
    /// Parsed marshal.toml
    pub toml: MarshalToml,
    /// CLI override for max_concurrent
    pub cli_max_concurrent: Option<usize>,
    /// CLI override for max_cost_usd
    pub cli_max_cost_usd: Option<f64>,
}

impl MarshalConfig {
    /// Create a MarshalConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let marshal_dir = project_dir.join(MARSHAL_DIR);
        let toml = MarshalToml::load_or_default(&marshal_dir)?;

        Ok(Self {
            project_dir,
            marshal_dir,
            toml,
            cli_max_concurrent: None,
            cli_max_cost_usd: None,
        })
    }

    /// Create a MarshalConfig with CLI overrides.
    pub fn with_cli_args(
        project_dir: PathBuf,
        max_concurrent: Option<usize>,
        max_cost_usd: Option<f64>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_max_concurrent = max_concurrent;
        config.cli_max_cost_usd = max_cost_usd;
        Ok(config)
    }

    /// Project name (file → directory name).
    pub fn project_name(&self) -> String {
        self.toml.project.name.clone().unwrap_or_else(|| {
            self.project_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string())
        })
    }

    /// Worker command (env → file → default).
    pub fn worker_cmd(&self) -> String {
        std::env::var("MARSHAL_WORKER_CMD")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.toml.worker.command.clone())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Concurrency bound (CLI → env → file).
    pub fn max_concurrent(&self) -> usize {
        self.cli_max_concurrent
            .or_else(|| env_parse("MARSHAL_MAX_CONCURRENT"))
            .unwrap_or(self.toml.execution.max_concurrent)
            .max(1)
    }

    /// Cost bound (CLI → env → file).
    pub fn max_cost_usd(&self) -> Option<f64> {
        self.cli_max_cost_usd
            .or_else(|| env_parse("MARSHAL_MAX_COST_USD"))
            .or(self.toml.execution.max_cost_usd)
    }

    /// Get path to the config file.
    pub fn config_file(&self) -> PathBuf {
        self.marshal_dir.join(CONFIG_FILE)
    }

    /// Get path to milestones.json.
    pub fn milestones_file(&self) -> PathBuf {
        self.marshal_dir.join("milestones.json")
    }

    /// Get path to the checkpoint file.
    pub fn checkpoint_file(&self) -> PathBuf {
        self.marshal_dir.join(crate::checkpoint::CHECKPOINT_FILE)
    }

    /// Get path to log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.marshal_dir.join("logs")
    }

    /// Get path to the per-attempt prompt log directory.
    pub fn prompt_dir(&self) -> PathBuf {
        self.log_dir().join("prompts")
    }

    /// Milestones from `milestones.json`, or the single default milestone.
    pub fn load_milestones(&self) -> Result<MilestonesFile> {
        load_milestones_or_default(Some(&self.milestones_file()), &self.project_name())
    }

    /// Validate configuration against the loaded milestones and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let known: Vec<String> = match self.load_milestones() {
            Ok(file) => {
                let mut names: Vec<String> = file
                    .milestones
                    .iter()
                    .flat_map(|m| m.phases.iter().map(|p| p.name.clone()))
                    .collect();
                names.sort();
                names.dedup();
                names
            }
            Err(e) => {
                warnings.push(format!("{:#}", e));
                Vec::new()
            }
        };
        warnings.extend(self.toml.validate(&known));
        warnings
    }

    /// Generate CLI flags for the worker invocation.
    pub fn worker_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.toml.worker.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        flags.extend(self.toml.worker.extra_flags.iter().cloned());
        flags
    }

    /// The worker gateway for real runs.
    pub fn gateway(&self) -> Result<ClaudeGateway> {
        let gateway = ClaudeGateway::new(self.worker_cmd(), self.worker_flags());
        if !self.toml.worker.log_prompts {
            return Ok(gateway);
        }
        let dir = self.prompt_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create prompt log dir: {}", dir.display()))?;
        Ok(gateway.with_log_dir(dir))
    }

    /// Classifier with configured rules ahead of the defaults.
    pub fn classifier(&self) -> Result<ErrorClassifier> {
        ErrorClassifier::from_config(&self.toml.classifier.rules)
            .context("Invalid [classifier] configuration")
    }

    /// Evidence validator with configured contracts and checkers.
    pub fn validator(&self) -> EvidenceValidator {
        let registry = ContractRegistry::with_defaults().with_overrides(&self.toml.evidence);
        EvidenceValidator::new(registry, self.toml.checkers())
            .with_require_contract(self.toml.execution.require_contract)
    }

    /// Runner settings after layering.
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            workdir: self.project_dir.clone(),
            max_concurrent: self.max_concurrent(),
            max_cost_usd: self.max_cost_usd(),
            phase_timeout: Duration::from_secs(self.toml.execution.phase_timeout_secs),
            retry: self.toml.retry.policy(),
            max_step_backs: self.toml.retry.max_step_backs,
            poller: self.toml.poller.to_poller_config(),
            learner: self.toml.patterns,
            step_back: self.toml.step_back.clone(),
            overrides: self.toml.phases.overrides.clone(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring unparsable environment override");
            None
        }
    }
}
