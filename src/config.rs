//! Workflow configuration: phases, execution mode, and risk/validation settings.
//!
//! A `WorkflowConfig` is loaded from a JSON file and is immutable for the
//! duration of a run. `save(load(x))` round-trips to an equivalent document.
//! When no config file exists, `WorkflowConfig::default()` provides a usable
//! built-in pipeline.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Directory under the manifest's work dir where run state is persisted.
pub const DEFAULT_STATE_DIR: &str = ".foreman";

/// Execution mode selecting a [`ModeConfig`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Quick,
    #[default]
    Standard,
    Full,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Quick => "quick",
            Mode::Standard => "standard",
            Mode::Full => "full",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse risk classification scaling how many reviewers validate a component.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How independent operation invocations within one dispatch are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelizationStrategy {
    Sequential,
    #[default]
    Parallel,
}

/// Per-mode execution settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    #[serde(default)]
    pub parallelization_strategy: ParallelizationStrategy,
    #[serde(default = "default_mode_reviewers")]
    pub default_reviewers: u32,
}

fn default_mode_reviewers() -> u32 {
    2
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            parallelization_strategy: ParallelizationStrategy::Parallel,
            default_reviewers: default_mode_reviewers(),
        }
    }
}

/// Risk level → reviewer count lookup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_low_reviewers")]
    pub low: u32,
    #[serde(default = "default_medium_reviewers")]
    pub medium: u32,
    #[serde(default = "default_high_reviewers")]
    pub high: u32,
    #[serde(default = "default_critical_reviewers")]
    pub critical: u32,
}

fn default_low_reviewers() -> u32 {
    1
}
fn default_medium_reviewers() -> u32 {
    2
}
fn default_high_reviewers() -> u32 {
    3
}
fn default_critical_reviewers() -> u32 {
    4
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            low: default_low_reviewers(),
            medium: default_medium_reviewers(),
            high: default_high_reviewers(),
            critical: default_critical_reviewers(),
        }
    }
}

impl RiskConfig {
    /// Pure lookup: how many reviewers a component at this risk level gets.
    pub fn reviewers_for(&self, risk: RiskLevel) -> u32 {
        match risk {
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
            RiskLevel::Critical => self.critical,
        }
    }
}

/// Validation loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Maximum validate → fix cycles before escalating.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pool of reviewer operation identifiers to draw from.
    #[serde(default = "default_reviewer_pool")]
    pub reviewers: Vec<String>,
    /// Identical issue descriptions across this many consecutive attempts escalate.
    #[serde(default = "default_same_issue_threshold")]
    pub same_issue_threshold: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_reviewer_pool() -> Vec<String> {
    vec![
        "code-review".to_string(),
        "design-review".to_string(),
        "test-review".to_string(),
        "integration-review".to_string(),
    ]
}

fn default_same_issue_threshold() -> u32 {
    2
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            reviewers: default_reviewer_pool(),
            same_issue_threshold: default_same_issue_threshold(),
        }
    }
}

/// A single named phase of the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    /// Operation identifiers dispatched by the default handler.
    #[serde(default)]
    pub operations: Vec<String>,
    /// When true, operations fan out concurrently; otherwise they run one at
    /// a time and the first failure aborts the phase.
    #[serde(default)]
    pub parallel: bool,
    /// Declarative skip condition; empty means never skip.
    #[serde(default)]
    pub skip_condition: String,
}

impl PhaseConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            operations: Vec::new(),
            parallel: false,
            skip_condition: String::new(),
        }
    }

    pub fn with_operations(mut self, operations: &[&str]) -> Self {
        self.operations = operations.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn with_skip_condition(mut self, condition: &str) -> Self {
        self.skip_condition = condition.to_string();
        self
    }
}

/// The full workflow configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    pub phases: Vec<PhaseConfig>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_mode_table")]
    pub modes: BTreeMap<Mode, ModeConfig>,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_state_dir() -> String {
    DEFAULT_STATE_DIR.to_string()
}

fn default_mode_table() -> BTreeMap<Mode, ModeConfig> {
    let mut modes = BTreeMap::new();
    modes.insert(
        Mode::Quick,
        ModeConfig {
            parallelization_strategy: ParallelizationStrategy::Parallel,
            default_reviewers: 1,
        },
    );
    modes.insert(
        Mode::Standard,
        ModeConfig {
            parallelization_strategy: ParallelizationStrategy::Parallel,
            default_reviewers: 2,
        },
    );
    modes.insert(
        Mode::Full,
        ModeConfig {
            parallelization_strategy: ParallelizationStrategy::Sequential,
            default_reviewers: 3,
        },
    );
    modes
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            phases: default_phases(),
            mode: Mode::Standard,
            modes: default_mode_table(),
            risk: RiskConfig::default(),
            validation: ValidationConfig::default(),
            dry_run: false,
            state_dir: default_state_dir(),
        }
    }
}

/// Built-in pipeline used when no config file exists.
fn default_phases() -> Vec<PhaseConfig> {
    vec![
        PhaseConfig::new("parse"),
        PhaseConfig::new("analyze")
            .with_operations(&["analyze"])
            .parallel(),
        PhaseConfig::new("implement"),
        PhaseConfig::new("finalize").with_operations(&["report"]),
    ]
}

impl WorkflowConfig {
    /// Load a config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save the config as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .expect("workflow config serializes to JSON");
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from a file if one is given and exists, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => Ok(Self::default()),
        }
    }

    /// Settings for the active mode.
    pub fn mode_config(&self) -> ModeConfig {
        self.modes.get(&self.mode).copied().unwrap_or_default()
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn has_phase(&self, name: &str) -> bool {
        self.phase_index(name).is_some()
    }
}
