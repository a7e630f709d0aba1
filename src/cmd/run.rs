//! Workflow execution — `foreman run`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use foreman::config::WorkflowConfig;
use foreman::engine::{ComponentPhaseHandler, EngineCallbacks, WorkflowEngine};
use foreman::manifest::{self, Manifest};
use foreman::runner::{AgentRunner, DryRunRunner, OperationRunner};
use foreman::ui::RunReporter;

/// Default config file name looked up under the root directory.
pub const CONFIG_FILE_NAME: &str = "foreman.json";

/// Phase name the component pipeline handler is bound to when the config
/// declares it.
const COMPONENT_PHASE: &str = "implement";

pub async fn cmd_run(
    root: &Path,
    spec_ref: &str,
    config_path: Option<&Path>,
    fresh: bool,
    verbose: bool,
) -> Result<bool> {
    let manifest_path = manifest::find_manifest(root, spec_ref)?;
    let manifest = Manifest::load(&manifest_path)?;
    manifest.validate()?;

    let config = load_config(root, config_path)?;

    std::fs::create_dir_all(&manifest.work_dir)
        .with_context(|| format!("Failed to create work dir {}", manifest.work_dir))?;

    let runner: Arc<dyn OperationRunner> = if config.dry_run {
        Arc::new(DryRunRunner::new())
    } else {
        Arc::new(
            AgentRunner::new(manifest.work_dir.clone().into()).with_verbose(verbose),
        )
    };

    let reporter = Arc::new(RunReporter::new(config.phases.len() as u64, verbose));
    let status_reporter = Arc::clone(&reporter);
    let callbacks = EngineCallbacks::new()
        .with_status(move |phase, status| status_reporter.phase_status(phase, status));

    let workflow_name = config.name.clone();
    let mut engine = WorkflowEngine::new(
        config.clone(),
        manifest,
        manifest_path.to_string_lossy().as_ref(),
        runner,
    )
    .with_callbacks(callbacks);

    if config.has_phase(COMPONENT_PHASE) {
        engine.register_handler(COMPONENT_PHASE, Box::new(ComponentPhaseHandler))?;
    }

    reporter.log_step(&format!(
        "spec: {} (resume: {})",
        manifest_path.display(),
        !fresh
    ));

    // An interrupt must not lose progress: state is persisted after every
    // transition, so stopping here leaves the last completed point on disk
    let outcome = tokio::select! {
        outcome = engine.run(!fresh) => outcome,
        _ = tokio::signal::ctrl_c() => {
            reporter.finish_interrupted();
            return Ok(false);
        }
    };

    match outcome {
        Ok(true) => {
            reporter.finish_success(&workflow_name);
            Ok(true)
        }
        Ok(false) => {
            let state = foreman::state::StateManager::read_state(&engine.state_path())
                .map(|s| s.error)
                .unwrap_or_default();
            reporter.finish_failure(&workflow_name, &state);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn load_config(root: &Path, config_path: Option<&Path>) -> Result<WorkflowConfig> {
    let config = match config_path {
        Some(path) => WorkflowConfig::load(path)?,
        None => {
            let default_path = root.join(CONFIG_FILE_NAME);
            WorkflowConfig::load_or_default(Some(&default_path))?
        }
    };
    Ok(config)
}
