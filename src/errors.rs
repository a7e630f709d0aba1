//! Typed error hierarchy for the foreman orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `ConfigError` — malformed workflow config or manifest input
//! - `StateError` — persisted run state unreadable, corrupt, or unwritable
//! - `EngineError` — phase execution, validation escalation, and user-decision
//!   failures raised by the workflow engine

use std::path::PathBuf;
use thiserror::Error;

/// Errors from loading or validating configuration and manifest input.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Handler registered for unknown phase '{phase}'")]
    UnknownHandlerPhase { phase: String },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("No manifest found for '{reference}'")]
    ManifestNotFound { reference: String },
}

/// Errors from the run-state persistence layer.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read state file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write state file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No persisted state found at {path}")]
    NotFound { path: PathBuf },
}

/// Errors raised by the workflow engine while driving phases.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Phase '{phase}' failed: {message}")]
    PhaseExecution { phase: String, message: String },

    #[error("Validation of '{component}' escalated: {reason}")]
    ValidationEscalation { component: String, reason: String },

    #[error("User decision required: {prompt}")]
    UserDecisionRequired { prompt: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
