//! Evidence contracts: what "phase actually done" means for each phase.
//!
//! A contract is a list of [`Predicate`]s. Defaults exist for every phase of
//! the standard pipeline; `[evidence.<phase>]` in `marshal.toml` replaces the
//! contract for that phase.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::phase::names;

/// Markers that must not remain in delivered source.
pub const PLACEHOLDER_PATTERN: &str =
    r"\b(TODO|FIXME|XXX)\b|todo!\(|unimplemented!\(|NotImplementedError|lorem ipsum";

/// Extensions scanned for placeholders by the default contracts.
pub const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "rb", "c", "h", "cpp", "cs", "swift",
];

/// One externally verifiable condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// At least one path matching any of the globs exists
    FileExists { any_of: Vec<String> },
    /// The file exists and its trimmed content is at least `min_bytes` long
    MinSize { path: String, min_bytes: u64 },
    /// At least one matching file exists and is executable
    Executable { any_of: Vec<String> },
    /// The named external checker exits zero and reports no defects
    Checker { name: String },
    /// No file under `root` (optionally filtered by extension) matches `pattern`
    PatternAbsent {
        #[serde(default = "default_root")]
        root: String,
        pattern: String,
        #[serde(default)]
        extensions: Vec<String>,
    },
    /// A commit was created since the phase attempt started
    GitCommit,
}

fn default_root() -> String {
    ".".to_string()
}

impl Predicate {
    /// One-line human description, used in worker payloads.
    pub fn describe(&self) -> String {
        match self {
            Predicate::FileExists { any_of } => format!("one of {} exists", any_of.join(", ")),
            Predicate::MinSize { path, min_bytes } => {
                format!("{} exists with at least {} bytes", path, min_bytes)
            }
            Predicate::Executable { any_of } => {
                format!("an executable entry point exists ({})", any_of.join(", "))
            }
            Predicate::Checker { name } => {
                format!("the '{}' checker passes with zero defects", name)
            }
            Predicate::PatternAbsent { root, .. } => {
                format!("no placeholder or unfinished markers remain under {}", root)
            }
            Predicate::GitCommit => "a git commit is created".to_string(),
        }
    }
}

/// The predicates one phase must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceContract {
    #[serde(default)]
    pub predicates: Vec<Predicate>,
}

impl EvidenceContract {
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self { predicates }
    }

    /// Names of checkers this contract runs.
    pub fn checker_names(&self) -> Vec<&str> {
        self.predicates
            .iter()
            .filter_map(|p| match p {
                Predicate::Checker { name } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Phase name → contract. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: BTreeMap<String, EvidenceContract>,
}

impl ContractRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Contracts for every phase of the default pipeline.
    pub fn with_defaults() -> Self {
        let mut contracts = BTreeMap::new();
        let doc = |path: &str, min_bytes: u64| Predicate::MinSize {
            path: path.to_string(),
            min_bytes,
        };
        let checker = |name: &str| {
            EvidenceContract::new(vec![Predicate::Checker {
                name: name.to_string(),
            }])
        };
        let no_placeholders = || Predicate::PatternAbsent {
            root: ".".to_string(),
            pattern: PLACEHOLDER_PATTERN.to_string(),
            extensions: SOURCE_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        };

        contracts.insert(
            names::RESEARCH.to_string(),
            EvidenceContract::new(vec![doc("docs/research.md", 500)]),
        );
        contracts.insert(
            names::PLANNING.to_string(),
            EvidenceContract::new(vec![doc("docs/plan.md", 500)]),
        );
        contracts.insert(
            names::IMPLEMENTATION.to_string(),
            EvidenceContract::new(vec![
                Predicate::FileExists {
                    any_of: [
                        "src/main.*",
                        "src/lib.*",
                        "src/index.*",
                        "main.*",
                        "app.*",
                        "index.*",
                        "cmd/*/main.go",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                },
                no_placeholders(),
            ]),
        );
        contracts.insert(
            names::ARCHITECTURE_REVIEW.to_string(),
            EvidenceContract::new(vec![doc("docs/architecture-review.md", 300)]),
        );
        for name in [
            names::LINT,
            names::TYPECHECK,
            names::TEST,
            names::INTEGRATION,
            names::E2E,
        ] {
            contracts.insert(name.to_string(), checker(name));
        }
        contracts.insert(
            names::VALIDATE.to_string(),
            EvidenceContract::new(vec![doc("docs/validation.md", 200), no_placeholders()]),
        );
        contracts.insert(
            names::COMMIT.to_string(),
            EvidenceContract::new(vec![Predicate::GitCommit]),
        );

        Self { contracts }
    }

    /// Replace contracts for the phases named in `overrides`.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, EvidenceContract>) -> Self {
        for (phase, contract) in overrides {
            self.contracts.insert(phase.clone(), contract.clone());
        }
        self
    }

    pub fn insert(&mut self, phase: &str, contract: EvidenceContract) {
        self.contracts.insert(phase.to_string(), contract);
    }

    pub fn get(&self, phase: &str) -> Option<&EvidenceContract> {
        self.contracts.get(phase)
    }

    pub fn phases(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }
}
