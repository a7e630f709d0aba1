//! Inspection commands — `foreman list`, `foreman status`, `foreman validate`.

use anyhow::Result;
use console::style;
use std::path::Path;

use foreman::config::WorkflowConfig;
use foreman::manifest::{self, Manifest};
use foreman::state::{PhaseStatus, StateManager};

/// List manifests under `<root>/specs/`, with a one-line run summary each.
pub fn cmd_list(root: &Path, project: Option<&str>) -> Result<()> {
    let manifests = manifest::list_manifests(root, project)?;
    if manifests.is_empty() {
        match project {
            Some(p) => println!("No specs found for project '{p}'"),
            None => println!("No specs found under {}", root.join("specs").display()),
        }
        return Ok(());
    }

    for (path, manifest) in manifests {
        let run_note = run_summary(&manifest);
        println!(
            "{:<20} {:<16} {:<10} {:>3} component(s)  {}",
            manifest.project,
            manifest.name,
            manifest.risk_level,
            manifest.components.len(),
            run_note,
        );
        println!("  {}", style(path.display()).dim());
    }
    Ok(())
}

fn run_summary(manifest: &Manifest) -> String {
    let state_path = StateManager::state_path(
        Path::new(&manifest.work_dir),
        foreman::config::DEFAULT_STATE_DIR,
    );
    match StateManager::read_state(&state_path) {
        Ok(state) if state.is_complete() => format!("{}", style("complete").green()),
        Ok(state) => format!(
            "{} {}",
            style("at").dim(),
            style(&state.current_phase).yellow()
        ),
        Err(_) => format!("{}", style("not started").dim()),
    }
}

/// Show the persisted state of a run without executing anything.
pub fn cmd_status(root: &Path, spec_ref: &str) -> Result<()> {
    let manifest_path = manifest::find_manifest(root, spec_ref)?;
    let manifest = Manifest::load(&manifest_path)?;

    let state_path = StateManager::state_path(
        Path::new(&manifest.work_dir),
        foreman::config::DEFAULT_STATE_DIR,
    );
    let state = match StateManager::read_state(&state_path) {
        Ok(state) => state,
        Err(foreman::errors::StateError::NotFound { .. }) => {
            println!(
                "No run state for '{}' — start one with: foreman run --spec {}",
                manifest.name, spec_ref
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "{} {} ({})",
        style("Workflow:").bold(),
        manifest.name,
        manifest.project
    );
    println!(
        "{} {} [{}]",
        style("Current phase:").bold(),
        state.current_phase,
        state.phase_status
    );
    if !state.error.is_empty() {
        println!("{} {}", style("Error:").red().bold(), state.error);
    }

    if !state.phases.is_empty() {
        println!("\n{}", style("Phases:").bold());
        for record in &state.phases {
            let marker = match record.status {
                PhaseStatus::Complete => style("✓").green(),
                PhaseStatus::Skipped => style("⊘").dim(),
                PhaseStatus::Blocked => style("✗").red(),
                _ => style("…").yellow(),
            };
            println!("  {} {:<16} {}", marker, record.name, record.status);
        }
    }

    if !state.components.is_empty() {
        println!("\n{}", style("Components:").bold());
        for (id, component) in &state.components {
            println!("  {:<16} {:<12} {}", id, component.status.as_str(), component.file);
            if !component.error.is_empty() {
                println!("    {} {}", style("error:").red(), component.error);
            }
            for issue in &component.issues {
                println!("    {} {}", style("issue:").yellow(), issue);
            }
        }
    }

    if !state.discoveries.is_empty() {
        println!("\n{}", style("Recent discoveries:").bold());
        for discovery in state.discoveries.iter().rev().take(5) {
            println!("  - {discovery}");
        }
    }

    Ok(())
}

/// Validate a manifest (and the config, when one is present) without running.
pub fn cmd_validate(root: &Path, spec_ref: &str, config_path: Option<&Path>) -> Result<bool> {
    let manifest_path = manifest::find_manifest(root, spec_ref)?;
    let manifest = Manifest::load(&manifest_path)?;

    if let Err(e) = manifest.validate() {
        println!("{} {}", style("✗").red().bold(), e);
        return Ok(false);
    }

    // A malformed config file is a validation failure too; absence is not
    let default_path = root.join(super::run::CONFIG_FILE_NAME);
    let config_path = config_path.or(Some(default_path.as_path()));
    if let Err(e) = WorkflowConfig::load_or_default(config_path) {
        println!("{} {}", style("✗").red().bold(), e);
        return Ok(false);
    }

    println!(
        "{} {} valid: {} component(s), risk {}",
        style("✓").green().bold(),
        manifest.name,
        manifest.components.len(),
        manifest.risk_level
    );
    Ok(true)
}
