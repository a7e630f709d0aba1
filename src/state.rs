//! Durable run state and its persistence manager.
//!
//! `State` is the single source of truth for resumability: it records the
//! current phase, an ordered per-phase history, per-component progress, and
//! free-text discoveries. `StateManager` owns the state for a run and
//! persists it atomically (temp file + rename) before any mutating call
//! returns, so a crash can always resume from the last durably recorded
//! point. Every field tolerates absence in older state files.

use crate::config::{Mode, RiskLevel};
use crate::errors::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Sentinel phase name recorded when the workflow has finished.
pub const COMPLETE_PHASE: &str = "complete";

/// Name of the persisted state document inside the state directory.
pub const STATE_FILE_NAME: &str = "STATE.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    InProgress,
    Complete,
    Skipped,
    Blocked,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::NotStarted => "not_started",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Complete => "complete",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    #[default]
    NotStarted,
    Skeleton,
    Implementing,
    Validating,
    Fixing,
    Complete,
    Blocked,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::NotStarted => "not_started",
            ComponentStatus::Skeleton => "skeleton",
            ComponentStatus::Implementing => "implementing",
            ComponentStatus::Validating => "validating",
            ComponentStatus::Fixing => "fixing",
            ComponentStatus::Complete => "complete",
            ComponentStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the ordered per-phase history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Tracked progress of a single component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub status: ComponentStatus,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub previous_issues: Vec<String>,
    #[serde(default)]
    pub error: String,
}

/// Durable record of a run. The only mutable shared object during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub current_phase: String,
    #[serde(default)]
    pub phase_status: PhaseStatus,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentState>,
    #[serde(default)]
    pub discoveries: Vec<String>,
    #[serde(default)]
    pub error: String,
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub spec_path: String,
    #[serde(default)]
    pub work_dir: String,
}

impl State {
    /// Fresh state for a new run.
    pub fn new(
        spec_path: &str,
        work_dir: &str,
        mode: Mode,
        risk_level: RiskLevel,
        dry_run: bool,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            current_phase: String::new(),
            phase_status: PhaseStatus::NotStarted,
            phases: Vec::new(),
            components: BTreeMap::new(),
            discoveries: Vec::new(),
            error: String::new(),
            started_at: Utc::now(),
            completed_at: None,
            risk_level,
            mode,
            dry_run,
            spec_path: spec_path.to_string(),
            work_dir: work_dir.to_string(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_phase == COMPLETE_PHASE
    }

    /// Recorded status of a phase, `NotStarted` when never visited.
    pub fn phase_status_of(&self, name: &str) -> PhaseStatus {
        self.phases
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub fn component(&self, id: &str) -> Option<&ComponentState> {
        self.components.get(id)
    }
}

/// Partial update applied to one component; unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ComponentUpdate {
    pub status: Option<ComponentStatus>,
    pub issues: Option<Vec<String>>,
    pub previous_issues: Option<Vec<String>>,
    pub error: Option<String>,
}

impl ComponentUpdate {
    pub fn status(status: ComponentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_issues(mut self, issues: Vec<String>) -> Self {
        self.issues = Some(issues);
        self
    }

    pub fn with_previous_issues(mut self, previous: Vec<String>) -> Self {
        self.previous_issues = Some(previous);
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Owns a run's state and persists every mutation before returning.
pub struct StateManager {
    path: PathBuf,
    state: State,
}

impl StateManager {
    /// Canonical location of the state document for a run.
    pub fn state_path(work_dir: &Path, state_dir: &str) -> PathBuf {
        work_dir.join(state_dir).join(STATE_FILE_NAME)
    }

    /// Load persisted state, or initialize (and persist) a fresh one.
    pub fn load_or_init(
        path: PathBuf,
        init: impl FnOnce() -> State,
    ) -> Result<Self, StateError> {
        let state = if path.exists() {
            Self::read_state(&path)?
        } else {
            init()
        };
        let manager = Self { path, state };
        manager.save()?;
        Ok(manager)
    }

    /// Start from the given state unconditionally, persisting it immediately.
    pub fn init_fresh(path: PathBuf, state: State) -> Result<Self, StateError> {
        let manager = Self { path, state };
        manager.save()?;
        Ok(manager)
    }

    /// Read persisted state without taking ownership of the file (used by
    /// the `status` command).
    pub fn read_state(path: &Path) -> Result<State, StateError> {
        if !path.exists() {
            return Err(StateError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|source| StateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a phase transition. Updates the current-phase mirror and the
    /// ordered history, then persists.
    pub fn update_phase(&mut self, name: &str, status: PhaseStatus) -> Result<(), StateError> {
        self.state.current_phase = name.to_string();
        self.state.phase_status = status;
        match self.state.phases.iter_mut().find(|r| r.name == name) {
            Some(record) => {
                record.status = status;
                record.updated_at = Utc::now();
            }
            None => self.state.phases.push(PhaseRecord {
                name: name.to_string(),
                status,
                updated_at: Utc::now(),
            }),
        }
        self.save()
    }

    /// Apply a partial update to one component, creating the entry when it
    /// does not exist yet, then persist.
    pub fn update_component(
        &mut self,
        id: &str,
        update: ComponentUpdate,
    ) -> Result<(), StateError> {
        let entry = self.state.components.entry(id.to_string()).or_default();
        if let Some(status) = update.status {
            entry.status = status;
        }
        if let Some(issues) = update.issues {
            entry.issues = issues;
        }
        if let Some(previous) = update.previous_issues {
            entry.previous_issues = previous;
        }
        if let Some(error) = update.error {
            entry.error = error;
        }
        self.save()
    }

    /// Seed a component entry from its spec unless one already exists
    /// (resume keeps recorded progress).
    pub fn ensure_component(
        &mut self,
        id: &str,
        file: &str,
        purpose: &str,
        depends_on: &[String],
    ) -> Result<(), StateError> {
        if self.state.components.contains_key(id) {
            return Ok(());
        }
        self.state.components.insert(
            id.to_string(),
            ComponentState {
                file: file.to_string(),
                status: ComponentStatus::NotStarted,
                purpose: purpose.to_string(),
                depends_on: depends_on.to_vec(),
                issues: Vec::new(),
                previous_issues: Vec::new(),
                error: String::new(),
            },
        );
        self.save()
    }

    /// Append a discovery. Duplicates are ignored so a resumed run cannot
    /// record the same fact twice.
    pub fn add_discovery(&mut self, text: &str) -> Result<(), StateError> {
        if self.state.discoveries.iter().any(|d| d == text) {
            return Ok(());
        }
        self.state.discoveries.push(text.to_string());
        self.save()
    }

    pub fn set_error(&mut self, message: &str) -> Result<(), StateError> {
        self.state.error = message.to_string();
        self.save()
    }

    pub fn clear_error(&mut self) -> Result<(), StateError> {
        self.state.error.clear();
        self.save()
    }

    /// Mark the whole workflow finished.
    pub fn mark_complete(&mut self) -> Result<(), StateError> {
        self.state.current_phase = COMPLETE_PHASE.to_string();
        self.state.phase_status = PhaseStatus::Complete;
        self.state.completed_at = Some(Utc::now());
        self.save()
    }

    /// Atomic write: serialize to a sibling temp file, then rename over the
    /// target so a crash mid-write never leaves a torn document.
    fn save(&self) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(&self.state)
            .expect("run state serializes to JSON");
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|source| StateError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
