//! The workflow engine: drives configured phases to completion.
//!
//! The engine's own control flow is single-threaded. Phases execute one at a
//! time; "parallel" phases fan out operation invocations through the runner
//! and wait for every result before touching state again. State is persisted
//! before any status callback fires, so an observer can never see a report
//! ahead of what is durably on disk.

pub mod component;
pub mod handler;
pub mod validation;

pub use component::ComponentPhaseHandler;
pub use handler::{HandlerRegistry, PhaseHandler};
pub use validation::{Issue, LoopResult, ValidationLoop, VotingOutcome};

use crate::condition::{self, ConditionContext, Value as CondValue};
use crate::config::{Mode, ModeConfig, PhaseConfig, WorkflowConfig};
use crate::errors::ConfigError;
use crate::manifest::Manifest;
use crate::runner::{ContextMap, OperationRequest, OperationRunner};
use crate::state::{COMPLETE_PHASE, PhaseStatus, State, StateManager};
use anyhow::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a phase dispatch reported back to the engine.
#[derive(Debug, Clone, Default)]
pub struct PhaseResult {
    pub success: bool,
    /// Advisory only; logged when it disagrees with the natural next phase.
    pub next_phase: Option<String>,
    /// Effective forward jump to a named later phase.
    pub skip_to: Option<String>,
    pub error: Option<String>,
    pub needs_user_input: bool,
    pub user_prompt: Option<String>,
    pub data: ContextMap,
}

impl PhaseResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn fail(error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn with_skip_to(mut self, phase: &str) -> Self {
        self.skip_to = Some(phase.to_string());
        self
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

type StatusCallback = Box<dyn Fn(&str, PhaseStatus) + Send + Sync>;
type PromptCallback = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Observer hooks for a run. The status callback fires after the matching
/// state mutation is persisted. The prompt callback blocks the run; without
/// one, the engine falls back to an interactive terminal prompt.
#[derive(Default)]
pub struct EngineCallbacks {
    status: Option<StatusCallback>,
    user_prompt: Option<PromptCallback>,
}

impl EngineCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, f: impl Fn(&str, PhaseStatus) + Send + Sync + 'static) -> Self {
        self.status = Some(Box::new(f));
        self
    }

    pub fn with_user_prompt(
        mut self,
        f: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.user_prompt = Some(Box::new(f));
        self
    }

    pub fn notify_status(&self, phase: &str, status: PhaseStatus) {
        if let Some(f) = &self.status {
            f(phase, status);
        }
    }

    pub fn prompt_user(&self, prompt: &str) -> String {
        match &self.user_prompt {
            Some(f) => f(prompt),
            None => dialoguer::Input::<String>::new()
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()
                .unwrap_or_default(),
        }
    }
}

/// Everything phase logic operates on. Owned exclusively by one run; no
/// collection inside is ever shared with another run.
pub struct ExecutionContext {
    pub config: WorkflowConfig,
    pub manifest: Manifest,
    pub state: StateManager,
    pub runner: Arc<dyn OperationRunner>,
    pub callbacks: EngineCallbacks,
}

impl ExecutionContext {
    /// Mode after applying the manifest's execution override.
    pub fn effective_mode(&self) -> Mode {
        self.manifest.execution.mode.unwrap_or(self.config.mode)
    }

    pub fn mode_config(&self) -> ModeConfig {
        self.config
            .modes
            .get(&self.effective_mode())
            .copied()
            .unwrap_or_default()
    }

    /// Read-only context map built fresh per dispatch. Operations never see
    /// the state object itself.
    pub fn base_context(&self) -> ContextMap {
        let state = self.state.state();
        let mut context = ContextMap::new();
        context.insert("spec_path".into(), Value::String(state.spec_path.clone()));
        context.insert("work_dir".into(), Value::String(state.work_dir.clone()));
        context.insert(
            "project".into(),
            Value::String(self.manifest.project.clone()),
        );
        context.insert("mode".into(), Value::String(state.mode.to_string()));
        context.insert(
            "risk_level".into(),
            Value::String(state.risk_level.to_string()),
        );
        context.insert("dry_run".into(), Value::Bool(state.dry_run));
        context.insert(
            "discoveries".into(),
            Value::Array(
                state
                    .discoveries
                    .iter()
                    .map(|d| Value::String(d.clone()))
                    .collect(),
            ),
        );
        context
    }
}

/// Top-level driver: iterates phases, dispatches handlers, and manages
/// transitions, failure, and escalation.
pub struct WorkflowEngine {
    config: WorkflowConfig,
    manifest: Manifest,
    spec_path: String,
    runner: Arc<dyn OperationRunner>,
    callbacks: EngineCallbacks,
    handlers: HandlerRegistry,
}

impl WorkflowEngine {
    pub fn new(
        config: WorkflowConfig,
        manifest: Manifest,
        spec_path: &str,
        runner: Arc<dyn OperationRunner>,
    ) -> Self {
        Self {
            config,
            manifest,
            spec_path: spec_path.to_string(),
            runner,
            callbacks: EngineCallbacks::new(),
            handlers: HandlerRegistry::new(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: EngineCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Bind a custom handler to a declared phase name. Fails for names the
    /// config does not declare.
    pub fn register_handler(
        &mut self,
        phase: &str,
        handler: Box<dyn PhaseHandler>,
    ) -> Result<(), ConfigError> {
        self.handlers.register(&self.config, phase, handler)
    }

    /// Where this run's state lives.
    pub fn state_path(&self) -> PathBuf {
        StateManager::state_path(Path::new(&self.manifest.work_dir), &self.config.state_dir)
    }

    fn fresh_state(&self) -> State {
        let mode = self.manifest.execution.mode.unwrap_or(self.config.mode);
        State::new(
            &self.spec_path,
            &self.manifest.work_dir,
            mode,
            self.manifest.risk_level,
            self.config.dry_run,
        )
    }

    /// Drive the workflow to completion. Returns `true` when every phase
    /// finished; `false` when the run aborted (the persisted state carries
    /// the error and the phase it stopped at).
    pub async fn run(&mut self, resume: bool) -> Result<bool> {
        let path = self.state_path();
        let state = if resume {
            StateManager::load_or_init(path, || self.fresh_state())?
        } else {
            StateManager::init_fresh(path, self.fresh_state())?
        };

        let mut ctx = ExecutionContext {
            config: self.config.clone(),
            manifest: self.manifest.clone(),
            state,
            runner: Arc::clone(&self.runner),
            callbacks: std::mem::take(&mut self.callbacks),
        };

        let outcome = self.drive(&mut ctx).await;
        self.callbacks = std::mem::take(&mut ctx.callbacks);
        outcome
    }

    async fn drive(&self, ctx: &mut ExecutionContext) -> Result<bool> {
        if ctx.state.state().is_complete() {
            tracing::debug!("workflow already complete, nothing to do");
            return Ok(true);
        }

        // Seed component entries; resume keeps recorded progress
        for component in &self.manifest.components {
            ctx.state.ensure_component(
                &component.id,
                &component.file,
                &component.purpose,
                &component.depends_on,
            )?;
        }

        let phases = self.config.phases.clone();
        let start = self
            .config
            .phase_index(&ctx.state.state().current_phase)
            .unwrap_or(0);

        let mut idx = start;
        while idx < phases.len() {
            let phase = phases[idx].clone();

            // Idempotent resume: a phase durably recorded complete is never
            // re-dispatched
            if ctx.state.state().phase_status_of(&phase.name) == PhaseStatus::Complete {
                idx += 1;
                continue;
            }

            if !phase.skip_condition.trim().is_empty() {
                let cond_ctx = condition_context(ctx.state.state(), &ctx.manifest);
                match condition::evaluate(&phase.skip_condition, &cond_ctx) {
                    Ok(true) => {
                        ctx.state.update_phase(&phase.name, PhaseStatus::Skipped)?;
                        ctx.callbacks.notify_status(&phase.name, PhaseStatus::Skipped);
                        idx += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        // An unevaluable condition never skips the phase
                        tracing::warn!(
                            phase = %phase.name,
                            "skip condition failed to evaluate, not skipping: {e}"
                        );
                    }
                }
            }

            ctx.state.update_phase(&phase.name, PhaseStatus::InProgress)?;
            ctx.callbacks
                .notify_status(&phase.name, PhaseStatus::InProgress);

            let dispatch = match self.handlers.get(&phase.name) {
                Some(custom) => custom.handle(ctx, &phase).await,
                None => default_dispatch(ctx, &phase).await,
            };

            let result = match dispatch {
                Ok(result) => result,
                Err(e) => {
                    // A raised failure is recorded and aborts the run; the
                    // engine never continues past an exceptional phase
                    ctx.state
                        .set_error(&format!("Phase '{}' raised: {e:#}", phase.name))?;
                    return Ok(false);
                }
            };

            if !result.success {
                if result.needs_user_input {
                    let prompt = result.user_prompt.clone().unwrap_or_else(|| {
                        format!("Phase '{}' needs a decision to continue", phase.name)
                    });
                    let response = ctx.callbacks.prompt_user(&prompt);
                    if !response.trim().is_empty() {
                        ctx.state.add_discovery(&response)?;
                    }
                }
                let message = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("Phase '{}' failed", phase.name));
                ctx.state.set_error(&message)?;
                ctx.state.update_phase(&phase.name, PhaseStatus::Blocked)?;
                ctx.callbacks.notify_status(&phase.name, PhaseStatus::Blocked);
                return Ok(false);
            }

            // A phase succeeding after an earlier aborted run supersedes the
            // recorded error
            if !ctx.state.state().error.is_empty() {
                ctx.state.clear_error()?;
            }
            ctx.state.update_phase(&phase.name, PhaseStatus::Complete)?;
            ctx.callbacks
                .notify_status(&phase.name, PhaseStatus::Complete);

            if let Some(target) = &result.skip_to {
                match self.config.phase_index(target) {
                    Some(t) if t > idx => {
                        tracing::debug!(from = %phase.name, to = %target, "forward jump");
                        idx = t;
                        continue;
                    }
                    Some(_) => {
                        tracing::warn!(
                            "skip_to '{target}' is not a forward jump; continuing in order"
                        );
                    }
                    None => {
                        tracing::warn!(
                            "skip_to names unknown phase '{target}'; continuing in order"
                        );
                    }
                }
            } else if let Some(next) = &result.next_phase {
                let natural = phases.get(idx + 1).map(|p| p.name.as_str());
                if natural != Some(next.as_str()) {
                    tracing::debug!(
                        "advisory next_phase '{next}' ignored; proceeding in declared order"
                    );
                }
            }

            idx += 1;
        }

        ctx.state.mark_complete()?;
        ctx.callbacks
            .notify_status(COMPLETE_PHASE, PhaseStatus::Complete);
        Ok(true)
    }
}

/// Default handler: run the phase's configured operations. A phase with no
/// operations trivially succeeds. Parallel phases fan out every invocation,
/// wait for all results, and aggregate every failure message; sequential
/// phases stop at the first failure without running later operations.
async fn default_dispatch(
    ctx: &mut ExecutionContext,
    phase: &PhaseConfig,
) -> Result<PhaseResult> {
    if phase.operations.is_empty() {
        return Ok(PhaseResult::ok());
    }

    let context = ctx.base_context();
    let request = |operation: &str| {
        OperationRequest::new(
            operation,
            &format!("Execute operation '{}' for phase '{}'", operation, phase.name),
        )
        .with_context(context.clone())
    };

    if phase.parallel {
        let requests: Vec<OperationRequest> =
            phase.operations.iter().map(|op| request(op)).collect();
        let results = ctx.runner.run_parallel(&requests).await?;

        let mut outcome = PhaseResult::ok();
        let mut failures = Vec::new();
        for (operation, result) in phase.operations.iter().zip(&results) {
            // Every result is reported, success or not; a clean operation
            // does not hide a failed sibling
            outcome
                .data
                .insert(operation.clone(), Value::String(result.status.clone()));
            if !result.success {
                failures.push(format!(
                    "Agent {} failed: {}",
                    operation,
                    result.error_message()
                ));
            }
        }
        if !failures.is_empty() {
            outcome.success = false;
            outcome.error = Some(failures.join("; "));
        }
        Ok(outcome)
    } else {
        for operation in &phase.operations {
            let result = ctx.runner.run(&request(operation)).await?;
            if !result.success {
                return Ok(PhaseResult::fail(&format!(
                    "Agent {} failed: {}",
                    operation,
                    result.error_message()
                )));
            }
        }
        Ok(PhaseResult::ok())
    }
}

/// The fixed read-only variable set skip conditions are evaluated against.
fn condition_context(state: &State, manifest: &Manifest) -> ConditionContext {
    let mut ctx = ConditionContext::new();
    ctx.set("risk_level", CondValue::Str(state.risk_level.to_string()));
    ctx.set("mode", CondValue::Str(state.mode.to_string()));
    ctx.set("dry_run", CondValue::Bool(state.dry_run));
    ctx.set(
        "components",
        CondValue::Num(manifest.components.len() as f64),
    );
    ctx.set(
        "transitive_deps",
        CondValue::Num(manifest.transitive_dependency_count() as f64),
    );
    let no_progress = state
        .components
        .values()
        .all(|c| c.status == crate::state::ComponentStatus::NotStarted)
        && !state
            .phases
            .iter()
            .any(|r| r.status == PhaseStatus::Complete);
    ctx.set("is_new_project", CondValue::Bool(no_progress));
    ctx.set(
        "state.current_phase",
        CondValue::Str(state.current_phase.clone()),
    );
    ctx.set("state.error", CondValue::Str(state.error.clone()));
    ctx
}
