//! Manifest loading, validation, and discovery.
//!
//! A manifest is produced upstream by a separate formalizer and is read-only
//! input for the engine: project identity, the components to build, a risk
//! classification, and execution overrides. Manifests live under
//! `<root>/specs/<project>/<name>.json` and are discovered by glob.

use crate::config::{Mode, RiskLevel};
use crate::errors::ConfigError;
use glob::glob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// One unit of work tracked through skeleton → implement → validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub id: String,
    pub file: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Execution overrides carried by the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Overrides the config's mode when set.
    #[serde(default)]
    pub mode: Option<Mode>,
    /// Replaces the risk-derived reviewer count when set.
    #[serde(default)]
    pub reviewers_override: Option<u32>,
    /// Adds a test reviewer to every component's pool.
    #[serde(default)]
    pub require_tests: bool,
}

/// The manifest document supplied by the upstream formalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub project: String,
    pub work_dir: String,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
    #[serde(default)]
    pub complexity: String,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub execution: ExecutionSettings,
}

impl Manifest {
    /// Load a manifest from a JSON file.
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

    /// Save the manifest as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).expect("manifest serializes to JSON");
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Structural validation: non-empty identity fields, unique component
    /// ids, known dependencies, and an acyclic dependency graph.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidManifest("name is empty".into()));
        }
        if self.project.trim().is_empty() {
            return Err(ConfigError::InvalidManifest("project is empty".into()));
        }
        if self.work_dir.trim().is_empty() {
            return Err(ConfigError::InvalidManifest("work_dir is empty".into()));
        }

        let mut seen = BTreeSet::new();
        for component in &self.components {
            if component.id.trim().is_empty() {
                return Err(ConfigError::InvalidManifest(format!(
                    "component for file '{}' has an empty id",
                    component.file
                )));
            }
            if component.file.trim().is_empty() {
                return Err(ConfigError::InvalidManifest(format!(
                    "component '{}' has an empty file",
                    component.id
                )));
            }
            if !seen.insert(component.id.as_str()) {
                return Err(ConfigError::InvalidManifest(format!(
                    "duplicate component id '{}'",
                    component.id
                )));
            }
        }

        for component in &self.components {
            for dep in &component.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(ConfigError::InvalidManifest(format!(
                        "component '{}' depends on unknown component '{}'",
                        component.id, dep
                    )));
                }
            }
        }

        // Cycle check doubles as the topological ordering
        self.ordered_components().map(|_| ())
    }

    /// Components in dependency order: a component appears only after every
    /// component it depends on. Manifest order is preserved among peers.
    pub fn ordered_components(&self) -> Result<Vec<&ComponentSpec>, ConfigError> {
        let mut ordered: Vec<&ComponentSpec> = Vec::with_capacity(self.components.len());
        let mut emitted: BTreeSet<&str> = BTreeSet::new();
        let mut remaining: Vec<&ComponentSpec> = self.components.iter().collect();

        while !remaining.is_empty() {
            let before = ordered.len();
            remaining.retain(|component| {
                let ready = component
                    .depends_on
                    .iter()
                    .all(|dep| emitted.contains(dep.as_str()));
                if ready {
                    emitted.insert(component.id.as_str());
                    ordered.push(component);
                }
                !ready
            });
            if ordered.len() == before {
                let stuck: Vec<&str> = remaining.iter().map(|c| c.id.as_str()).collect();
                return Err(ConfigError::InvalidManifest(format!(
                    "dependency cycle among components: {}",
                    stuck.join(", ")
                )));
            }
        }

        Ok(ordered)
    }

    /// Number of edges in the transitive closure of the dependency graph.
    /// Exposed to skip conditions as `transitive_deps`.
    pub fn transitive_dependency_count(&self) -> usize {
        let mut count = 0;
        for component in &self.components {
            let mut reachable: BTreeSet<&str> = BTreeSet::new();
            let mut stack: Vec<&str> = component.depends_on.iter().map(String::as_str).collect();
            while let Some(id) = stack.pop() {
                if reachable.insert(id)
                    && let Some(dep) = self.components.iter().find(|c| c.id == id)
                {
                    stack.extend(dep.depends_on.iter().map(String::as_str));
                }
            }
            count += reachable.len();
        }
        count
    }

    pub fn component(&self, id: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.id == id)
    }
}

/// Resolve a manifest reference: an existing path is used directly,
/// otherwise `<root>/specs/**/<ref>.json` is searched.
pub fn find_manifest(root: &Path, reference: &str) -> Result<PathBuf, ConfigError> {
    let direct = PathBuf::from(reference);
    if direct.exists() {
        return Ok(direct);
    }

    let pattern = root
        .join("specs")
        .join("**")
        .join(format!("{reference}.json"))
        .to_string_lossy()
        .to_string();

    let mut matches: Vec<PathBuf> = glob(&pattern)
        .map_err(|e| ConfigError::InvalidManifest(format!("bad manifest glob: {e}")))?
        .filter_map(|entry| entry.ok())
        .collect();
    matches.sort();

    matches
        .into_iter()
        .next()
        .ok_or_else(|| ConfigError::ManifestNotFound {
            reference: reference.to_string(),
        })
}

/// All manifests under `<root>/specs/`, optionally filtered by project.
pub fn list_manifests(
    root: &Path,
    project: Option<&str>,
) -> Result<Vec<(PathBuf, Manifest)>, ConfigError> {
    let pattern = root
        .join("specs")
        .join("**")
        .join("*.json")
        .to_string_lossy()
        .to_string();

    let mut found = Vec::new();
    let entries =
        glob(&pattern).map_err(|e| ConfigError::InvalidManifest(format!("bad manifest glob: {e}")))?;
    for entry in entries.filter_map(|e| e.ok()) {
        match Manifest::load(&entry) {
            Ok(manifest) => {
                if project.is_none_or(|p| manifest.project == p) {
                    found.push((entry, manifest));
                }
            }
            Err(e) => {
                tracing::warn!("skipping unparseable manifest {}: {}", entry.display(), e);
            }
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

/// Write a starter manifest for `new --project X --name Y`.
pub fn scaffold(root: &Path, project: &str, name: &str) -> Result<PathBuf, ConfigError> {
    let dir = root.join("specs").join(project);
    std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Write {
        path: dir.clone(),
        source,
    })?;

    let path = dir.join(format!("{name}.json"));
    if path.exists() {
        return Err(ConfigError::InvalidManifest(format!(
            "manifest already exists at {}",
            path.display()
        )));
    }

    let manifest = Manifest {
        name: name.to_string(),
        project: project.to_string(),
        work_dir: root
            .join("work")
            .join(project)
            .join(name)
            .to_string_lossy()
            .to_string(),
        components: vec![ComponentSpec {
            id: "core".to_string(),
            file: "src/core.rs".to_string(),
            purpose: "Describe what this component does".to_string(),
            depends_on: Vec::new(),
        }],
        complexity: "medium".to_string(),
        risk_level: RiskLevel::Medium,
        execution: ExecutionSettings::default(),
    };
    manifest.save(&path)?;
    Ok(path)
}
