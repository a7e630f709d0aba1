//! Phase handler dispatch.
//!
//! A handler owns the execution of one named phase. Phases without a
//! registered handler fall back to the engine's default operation dispatch.
//! Registration is validated against the loaded config, so a handler bound
//! to a phase name the config does not declare fails before the run starts.

use super::{ExecutionContext, PhaseResult};
use crate::config::{PhaseConfig, WorkflowConfig};
use crate::errors::ConfigError;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// One method, one phase execution.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn handle(&self, ctx: &mut ExecutionContext, phase: &PhaseConfig)
    -> Result<PhaseResult>;
}

/// Phase name → handler table, validated at registration time.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Box<dyn PhaseHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to a phase name. Unknown names are rejected here, at
    /// load time, rather than surfacing as a silent fallback during the run.
    pub fn register(
        &mut self,
        config: &WorkflowConfig,
        phase: &str,
        handler: Box<dyn PhaseHandler>,
    ) -> Result<(), ConfigError> {
        if !config.has_phase(phase) {
            return Err(ConfigError::UnknownHandlerPhase {
                phase: phase.to_string(),
            });
        }
        self.handlers.insert(phase.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, phase: &str) -> Option<&dyn PhaseHandler> {
        self.handlers.get(phase).map(|h| h.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;

    struct Trivial;

    #[async_trait]
    impl PhaseHandler for Trivial {
        async fn handle(
            &self,
            _ctx: &mut ExecutionContext,
            _phase: &PhaseConfig,
        ) -> Result<PhaseResult> {
            Ok(PhaseResult::ok())
        }
    }

    #[test]
    fn register_accepts_declared_phase() {
        let config = WorkflowConfig::default();
        let mut registry = HandlerRegistry::new();
        registry
            .register(&config, "implement", Box::new(Trivial))
            .unwrap();
        assert!(registry.get("implement").is_some());
        assert!(registry.get("parse").is_none());
    }

    #[test]
    fn register_rejects_unknown_phase_at_load_time() {
        let config = WorkflowConfig::default();
        let mut registry = HandlerRegistry::new();
        let err = registry
            .register(&config, "deploy", Box::new(Trivial))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownHandlerPhase { .. }));
        assert!(registry.is_empty());
    }
}
