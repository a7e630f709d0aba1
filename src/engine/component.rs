//! Per-component pipeline: skeleton → implement → validate.
//!
//! Each component moves forward through its statuses; only the
//! validating → fixing → validating cycle may repeat, and that cycle lives
//! inside the validation loop. The number of reviewers scales with the
//! manifest's risk level, and a dedicated security review is appended when
//! the component's purpose touches sensitive surface area.

use super::validation::{Issue, ValidationLoop, ValidationObserver};
use super::{ExecutionContext, PhaseResult};
use crate::config::{RiskLevel, WorkflowConfig};
use crate::manifest::{ComponentSpec, ExecutionSettings};
use crate::runner::{ContextMap, OperationRequest, OperationResult};
use crate::state::{ComponentStatus, ComponentUpdate, StateManager};
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::LazyLock;

pub const SKELETON_OPERATION: &str = "skeleton";
pub const IMPLEMENT_OPERATION: &str = "implement";
pub const SECURITY_REVIEW_OPERATION: &str = "security-review";
pub const TEST_REVIEW_OPERATION: &str = "test-review";

/// Purposes matching this pattern get the dedicated security review.
static SENSITIVE_PURPOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(api|endpoint|public|auth)\b").unwrap());

/// Handler that drives every manifest component through the pipeline, in
/// dependency order. Components already recorded complete are skipped, so a
/// resumed run picks up exactly where it stopped.
pub struct ComponentPhaseHandler;

#[async_trait]
impl super::PhaseHandler for ComponentPhaseHandler {
    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        _phase: &crate::config::PhaseConfig,
    ) -> Result<PhaseResult> {
        let ordered: Vec<ComponentSpec> = ctx
            .manifest
            .ordered_components()?
            .into_iter()
            .cloned()
            .collect();

        for spec in ordered {
            ctx.state
                .ensure_component(&spec.id, &spec.file, &spec.purpose, &spec.depends_on)?;
            let recorded = ctx.state.state().component(&spec.id).map(|c| c.status);
            if recorded == Some(ComponentStatus::Complete) {
                continue;
            }

            let result = run_component(ctx, &spec).await?;
            if !result.success {
                return Ok(result);
            }
        }

        Ok(PhaseResult::ok())
    }
}

/// Select reviewer operations for a component.
///
/// The count comes from the risk lookup, floored by the active mode and
/// replaced entirely by the manifest's override when one is set. The
/// configured pool is drawn in order and padded with generated reviewer ids
/// when it is too small. `require_tests` and a sensitive purpose append
/// their dedicated reviewers on top.
pub fn reviewer_operations(
    config: &WorkflowConfig,
    execution: &ExecutionSettings,
    risk: RiskLevel,
    purpose: &str,
) -> Vec<String> {
    let mode = config
        .modes
        .get(&execution.mode.unwrap_or(config.mode))
        .copied()
        .unwrap_or_default();
    let count = execution
        .reviewers_override
        .unwrap_or_else(|| config.risk.reviewers_for(risk).max(mode.default_reviewers))
        as usize;

    let mut operations: Vec<String> = Vec::with_capacity(count + 2);
    for i in 0..count {
        match config.validation.reviewers.get(i) {
            Some(op) => operations.push(op.clone()),
            None => operations.push(format!("reviewer-{}", i + 1)),
        }
    }

    if execution.require_tests && !operations.iter().any(|op| op == TEST_REVIEW_OPERATION) {
        operations.push(TEST_REVIEW_OPERATION.to_string());
    }
    if SENSITIVE_PURPOSE.is_match(purpose)
        && !operations.iter().any(|op| op == SECURITY_REVIEW_OPERATION)
    {
        operations.push(SECURITY_REVIEW_OPERATION.to_string());
    }

    operations
}

/// Context an operation receives when working on a component: the shared
/// base context plus the component's identity, purpose, and the files of
/// its already-completed dependencies.
fn component_context(ctx: &ExecutionContext, spec: &ComponentSpec) -> ContextMap {
    let mut context = ctx.base_context();
    context.insert("component".into(), Value::String(spec.id.clone()));
    context.insert("file".into(), Value::String(spec.file.clone()));
    context.insert("purpose".into(), Value::String(spec.purpose.clone()));
    context.insert(
        "depends_on".into(),
        Value::Array(
            spec.depends_on
                .iter()
                .map(|d| Value::String(d.clone()))
                .collect(),
        ),
    );

    let completed: Vec<Value> = spec
        .depends_on
        .iter()
        .filter_map(|dep| ctx.state.state().component(dep))
        .filter(|c| c.status == ComponentStatus::Complete)
        .map(|c| Value::String(c.file.clone()))
        .collect();
    context.insert("completed_dependencies".into(), Value::Array(completed));
    context
}

/// Persists validation-loop progress into the component's state entry.
struct ComponentProgress<'a> {
    state: &'a mut StateManager,
    component_id: &'a str,
}

impl ValidationObserver for ComponentProgress<'_> {
    fn on_issues(&mut self, _attempt: u32, issues: &[Issue]) -> Result<()> {
        let previous = self
            .state
            .state()
            .component(self.component_id)
            .map(|c| c.issues.clone())
            .unwrap_or_default();
        let descriptions: Vec<String> =
            issues.iter().map(|i| i.description.clone()).collect();
        self.state.update_component(
            self.component_id,
            ComponentUpdate::default()
                .with_issues(descriptions)
                .with_previous_issues(previous),
        )?;
        Ok(())
    }

    fn on_fixing(&mut self, _attempt: u32) -> Result<()> {
        self.state.update_component(
            self.component_id,
            ComponentUpdate::status(ComponentStatus::Fixing),
        )?;
        Ok(())
    }

    fn on_revalidating(&mut self, _attempt: u32) -> Result<()> {
        self.state.update_component(
            self.component_id,
            ComponentUpdate::status(ComponentStatus::Validating),
        )?;
        Ok(())
    }
}

/// Drive one component through skeleton → implement → validate.
pub async fn run_component(
    ctx: &mut ExecutionContext,
    spec: &ComponentSpec,
) -> Result<PhaseResult> {
    let context = component_context(ctx, spec);

    // Skeleton
    ctx.state
        .update_component(&spec.id, ComponentUpdate::status(ComponentStatus::Skeleton))?;
    let result = ctx
        .runner
        .run(&stage_request(SKELETON_OPERATION, spec, &context))
        .await?;
    if let Some(failure) = stage_failure(ctx, spec, SKELETON_OPERATION, &result)? {
        return Ok(failure);
    }

    // Implementation
    ctx.state.update_component(
        &spec.id,
        ComponentUpdate::status(ComponentStatus::Implementing),
    )?;
    let result = ctx
        .runner
        .run(&stage_request(IMPLEMENT_OPERATION, spec, &context))
        .await?;
    if let Some(failure) = stage_failure(ctx, spec, IMPLEMENT_OPERATION, &result)? {
        return Ok(failure);
    }
    for discovery in result.discoveries() {
        ctx.state.add_discovery(&discovery)?;
    }

    // Validation
    ctx.state.update_component(
        &spec.id,
        ComponentUpdate::status(ComponentStatus::Validating),
    )?;
    let reviewers = reviewer_operations(
        &ctx.config,
        &ctx.manifest.execution,
        ctx.state.state().risk_level,
        &spec.purpose,
    );
    let strategy = ctx.mode_config().parallelization_strategy;
    let validation = ValidationLoop::new(&ctx.config.validation, strategy);
    let runner = Arc::clone(&ctx.runner);

    let loop_result = {
        let mut observer = ComponentProgress {
            state: &mut ctx.state,
            component_id: &spec.id,
        };
        validation
            .run(
                runner.as_ref(),
                &spec.id,
                &context,
                &reviewers,
                &mut observer,
            )
            .await?
    };

    if loop_result.passed {
        let resolved = ctx
            .state
            .state()
            .component(&spec.id)
            .map(|c| c.issues.clone())
            .unwrap_or_default();
        ctx.state.update_component(
            &spec.id,
            ComponentUpdate::status(ComponentStatus::Complete)
                .with_issues(Vec::new())
                .with_previous_issues(resolved)
                .with_error(""),
        )?;
        return Ok(PhaseResult::ok());
    }

    if loop_result.escalated {
        let reason = loop_result
            .escalation_reason
            .clone()
            .unwrap_or_else(|| "validation escalated".to_string());
        ctx.state.update_component(
            &spec.id,
            ComponentUpdate::status(ComponentStatus::Blocked).with_error(&reason),
        )?;
        let mut result = PhaseResult::fail(&format!(
            "Validation of component '{}' escalated: {reason}",
            spec.id
        ));
        if loop_result.voting.needs_user_decision {
            result.needs_user_input = true;
            result.user_prompt = loop_result.voting.user_prompt.clone();
        }
        return Ok(result);
    }

    ctx.state.update_component(
        &spec.id,
        ComponentUpdate::status(ComponentStatus::Blocked).with_error("validation failed"),
    )?;
    Ok(PhaseResult::fail(&format!(
        "Validation of component '{}' failed",
        spec.id
    )))
}

fn stage_request(
    operation: &str,
    spec: &ComponentSpec,
    context: &ContextMap,
) -> OperationRequest {
    let instruction = match operation {
        SKELETON_OPERATION => format!(
            "Build the skeleton for component '{}' in {}",
            spec.id, spec.file
        ),
        IMPLEMENT_OPERATION => format!(
            "Implement component '{}' in {} to fulfill its purpose",
            spec.id, spec.file
        ),
        other => format!("Run '{other}' for component '{}'", spec.id),
    };
    OperationRequest::new(operation, &instruction).with_context(context.clone())
}

/// Shared failure handling for the skeleton and implementation stages: a
/// reported failure or an explicit blocked result marks the component
/// blocked and aborts the pipeline for this component.
fn stage_failure(
    ctx: &mut ExecutionContext,
    spec: &ComponentSpec,
    operation: &str,
    result: &OperationResult,
) -> Result<Option<PhaseResult>> {
    if result.success {
        return Ok(None);
    }
    let verb = if result.is_blocked() { "blocked" } else { "failed" };
    let message = format!("Agent {operation} {verb}: {}", result.error_message());
    ctx.state.update_component(
        &spec.id,
        ComponentUpdate::status(ComponentStatus::Blocked).with_error(&message),
    )?;
    Ok(Some(PhaseResult::fail(&message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, PhaseConfig, ValidationConfig, WorkflowConfig};
    use crate::engine::test_support::ScriptedRunner;
    use crate::engine::{EngineCallbacks, PhaseHandler};
    use crate::manifest::Manifest;
    use crate::state::{State, StateManager};
    use tempfile::tempdir;

    fn component(id: &str, purpose: &str, deps: &[&str]) -> ComponentSpec {
        ComponentSpec {
            id: id.to_string(),
            file: format!("src/{id}.rs"),
            purpose: purpose.to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn context_for(
        dir: &std::path::Path,
        components: Vec<ComponentSpec>,
        risk: RiskLevel,
        runner: Arc<ScriptedRunner>,
    ) -> ExecutionContext {
        let manifest = Manifest {
            name: "svc".to_string(),
            project: "demo".to_string(),
            work_dir: dir.to_string_lossy().to_string(),
            components,
            complexity: "medium".to_string(),
            risk_level: risk,
            execution: ExecutionSettings::default(),
        };
        let state = State::new("specs/demo/svc.json", &manifest.work_dir, Mode::Standard, risk, false);
        let state = StateManager::init_fresh(
            StateManager::state_path(dir, crate::config::DEFAULT_STATE_DIR),
            state,
        )
        .unwrap();
        let mut ctx = ExecutionContext {
            config: WorkflowConfig::default(),
            manifest,
            state,
            runner,
            callbacks: EngineCallbacks::new(),
        };
        for spec in ctx.manifest.components.clone() {
            ctx.state
                .ensure_component(&spec.id, &spec.file, &spec.purpose, &spec.depends_on)
                .unwrap();
        }
        ctx
    }

    // ── reviewer selection ────────────────────────────────────────────────

    #[test]
    fn reviewer_count_scales_with_risk() {
        let config = WorkflowConfig::default();
        let execution = ExecutionSettings::default();

        // Low risk maps to 1 reviewer but the standard mode floors at 2
        assert_eq!(
            reviewer_operations(&config, &execution, RiskLevel::Low, "storage helper").len(),
            2
        );
        assert_eq!(
            reviewer_operations(&config, &execution, RiskLevel::High, "storage helper").len(),
            3
        );
        assert_eq!(
            reviewer_operations(&config, &execution, RiskLevel::Critical, "storage helper").len(),
            4
        );
    }

    #[test]
    fn sensitive_purpose_appends_security_review() {
        let mut config = WorkflowConfig::default();
        config.risk.critical = 3;
        let execution = ExecutionSettings::default();

        let reviewers = reviewer_operations(
            &config,
            &execution,
            RiskLevel::Critical,
            "serves the public API endpoint",
        );
        // 3 risk-mandated reviewers plus the dedicated security review
        assert_eq!(reviewers.len(), 4);
        assert!(reviewers.contains(&SECURITY_REVIEW_OPERATION.to_string()));
        let distinct: std::collections::BTreeSet<&String> = reviewers.iter().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn sensitive_keywords_match_case_insensitively_on_word_boundaries() {
        let config = WorkflowConfig::default();
        let execution = ExecutionSettings::default();
        let has_security = |purpose: &str| {
            reviewer_operations(&config, &execution, RiskLevel::Low, purpose)
                .contains(&SECURITY_REVIEW_OPERATION.to_string())
        };

        assert!(has_security("handles Auth tokens"));
        assert!(has_security("REST API surface"));
        assert!(has_security("public entry point"));
        assert!(!has_security("apiary bee tracker"));
        assert!(!has_security("internal storage helper"));
    }

    #[test]
    fn reviewers_override_replaces_risk_count() {
        let config = WorkflowConfig::default();
        let execution = ExecutionSettings {
            mode: None,
            reviewers_override: Some(1),
            require_tests: false,
        };
        let reviewers =
            reviewer_operations(&config, &execution, RiskLevel::Critical, "storage helper");
        assert_eq!(reviewers.len(), 1);
    }

    #[test]
    fn require_tests_appends_test_review_once() {
        let mut config = WorkflowConfig::default();
        config.validation.reviewers = vec!["code-review".to_string()];
        let execution = ExecutionSettings {
            mode: None,
            reviewers_override: Some(1),
            require_tests: true,
        };
        let reviewers =
            reviewer_operations(&config, &execution, RiskLevel::Low, "storage helper");
        assert_eq!(reviewers, vec!["code-review", TEST_REVIEW_OPERATION]);
    }

    #[test]
    fn small_pool_is_padded_with_generated_reviewers() {
        let mut config = WorkflowConfig::default();
        config.validation.reviewers = vec!["code-review".to_string()];
        let execution = ExecutionSettings::default();
        let reviewers =
            reviewer_operations(&config, &execution, RiskLevel::High, "storage helper");
        assert_eq!(reviewers, vec!["code-review", "reviewer-2", "reviewer-3"]);
    }

    // ── component pipeline ────────────────────────────────────────────────

    #[tokio::test]
    async fn component_passes_through_all_stages() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::all_ok());
        let spec = component("core", "internal storage helper", &[]);
        let mut ctx = context_for(dir.path(), vec![spec.clone()], RiskLevel::Low, Arc::clone(&runner));

        let result = run_component(&mut ctx, &spec).await.unwrap();
        assert!(result.success);
        assert_eq!(
            ctx.state.state().component("core").unwrap().status,
            ComponentStatus::Complete
        );
        // skeleton, implement, then the risk-scaled reviewer fan-out
        assert_eq!(runner.invocations_of(SKELETON_OPERATION), 1);
        assert_eq!(runner.invocations_of(IMPLEMENT_OPERATION), 1);
        assert_eq!(runner.invocations_of("code-review"), 1);
        assert_eq!(runner.invocations_of("design-review"), 1);
    }

    #[tokio::test]
    async fn skeleton_failure_blocks_component_immediately() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::all_ok());
        runner.script(SKELETON_OPERATION, OperationResult::failure("disk full"));
        let spec = component("core", "internal storage helper", &[]);
        let mut ctx = context_for(dir.path(), vec![spec.clone()], RiskLevel::Low, Arc::clone(&runner));

        let result = run_component(&mut ctx, &spec).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Agent skeleton failed: disk full"));
        assert_eq!(
            ctx.state.state().component("core").unwrap().status,
            ComponentStatus::Blocked
        );
        assert_eq!(runner.invocations_of(IMPLEMENT_OPERATION), 0);
    }

    #[tokio::test]
    async fn blocked_implementation_reports_blocked_verb() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::all_ok());
        runner.script(
            IMPLEMENT_OPERATION,
            OperationResult::blocked("needs credentials"),
        );
        let spec = component("core", "internal storage helper", &[]);
        let mut ctx = context_for(dir.path(), vec![spec.clone()], RiskLevel::Low, Arc::clone(&runner));

        let result = run_component(&mut ctx, &spec).await.unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Agent implement blocked: needs credentials")
        );
    }

    #[tokio::test]
    async fn implementation_discoveries_are_persisted() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::all_ok());
        runner.script(
            IMPLEMENT_OPERATION,
            OperationResult::ok()
                .with_field("discoveries", serde_json::json!(["uses sqlite", "needs index"])),
        );
        let spec = component("core", "internal storage helper", &[]);
        let mut ctx = context_for(dir.path(), vec![spec.clone()], RiskLevel::Low, Arc::clone(&runner));

        run_component(&mut ctx, &spec).await.unwrap();
        assert!(ctx.state.state().discoveries.contains(&"uses sqlite".to_string()));
        assert!(ctx.state.state().discoveries.contains(&"needs index".to_string()));
    }

    #[tokio::test]
    async fn escalated_validation_blocks_component_with_reason() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::all_ok());
        let issue = OperationResult::ok().with_field(
            "issues",
            serde_json::json!([{"description": "unsafe cast", "severity": "error"}]),
        );
        // Same issue on two consecutive attempts with threshold 2; the
        // second reviewer stays clean so the gate needs a human
        runner.script("code-review", issue.clone());
        runner.script("code-review", issue);
        let spec = component("core", "internal storage helper", &[]);
        let mut ctx = context_for(dir.path(), vec![spec.clone()], RiskLevel::Low, Arc::clone(&runner));

        let result = run_component(&mut ctx, &spec).await.unwrap();
        assert!(!result.success);
        assert!(result.needs_user_input);
        assert!(result.user_prompt.is_some());

        let recorded = ctx.state.state().component("core").unwrap();
        assert_eq!(recorded.status, ComponentStatus::Blocked);
        assert!(recorded.error.contains("unsafe cast"));
        // The issue history survived the loop
        assert_eq!(recorded.issues, vec!["unsafe cast"]);
        assert_eq!(recorded.previous_issues, vec!["unsafe cast"]);
    }

    #[tokio::test]
    async fn handler_skips_components_already_complete() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::all_ok());
        let done = component("done", "already built", &[]);
        let pending = component("pending", "still to build", &["done"]);
        let mut ctx = context_for(
            dir.path(),
            vec![done.clone(), pending.clone()],
            RiskLevel::Low,
            Arc::clone(&runner),
        );
        ctx.state
            .update_component("done", ComponentUpdate::status(ComponentStatus::Complete))
            .unwrap();

        let handler = ComponentPhaseHandler;
        let phase = PhaseConfig::new("implement");
        let result = handler.handle(&mut ctx, &phase).await.unwrap();
        assert!(result.success);

        // Only the pending component went through the pipeline
        assert_eq!(runner.invocations_of(SKELETON_OPERATION), 1);
        assert_eq!(
            ctx.state.state().component("pending").unwrap().status,
            ComponentStatus::Complete
        );
    }

    #[tokio::test]
    async fn handler_processes_components_in_dependency_order() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::all_ok());
        let base = component("base", "foundation", &[]);
        let top = component("top", "built on base", &["base"]);
        // Manifest lists them out of order
        let mut ctx = context_for(
            dir.path(),
            vec![top, base],
            RiskLevel::Low,
            Arc::clone(&runner),
        );

        let handler = ComponentPhaseHandler;
        let phase = PhaseConfig::new("implement");
        assert!(handler.handle(&mut ctx, &phase).await.unwrap().success);

        // base completed before top started, so top saw its dependency done
        assert_eq!(
            ctx.state.state().component("base").unwrap().status,
            ComponentStatus::Complete
        );
        assert_eq!(
            ctx.state.state().component("top").unwrap().status,
            ComponentStatus::Complete
        );
    }

    #[tokio::test]
    async fn handler_stops_at_first_failed_component() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::all_ok());
        runner.script(SKELETON_OPERATION, OperationResult::failure("disk full"));
        let first = component("first", "one", &[]);
        let second = component("second", "two", &[]);
        let mut ctx = context_for(
            dir.path(),
            vec![first, second],
            RiskLevel::Low,
            Arc::clone(&runner),
        );

        let handler = ComponentPhaseHandler;
        let phase = PhaseConfig::new("implement");
        let result = handler.handle(&mut ctx, &phase).await.unwrap();
        assert!(!result.success);
        // The second component was never touched
        assert_eq!(runner.invocations_of(SKELETON_OPERATION), 1);
        assert_eq!(
            ctx.state.state().component("second").unwrap().status,
            ComponentStatus::NotStarted
        );
    }

    #[tokio::test]
    async fn completed_dependencies_flow_into_the_context() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::all_ok());
        let base = component("base", "foundation", &[]);
        let top = component("top", "built on base", &["base"]);
        let mut ctx = context_for(
            dir.path(),
            vec![base, top.clone()],
            RiskLevel::Low,
            Arc::clone(&runner),
        );
        ctx.state
            .update_component("base", ComponentUpdate::status(ComponentStatus::Complete))
            .unwrap();

        let context = component_context(&ctx, &top);
        let completed = context
            .get("completed_dependencies")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0], "src/base.rs");
    }

    #[tokio::test]
    async fn validation_uses_quick_mode_reviewer_floor() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::all_ok());
        let spec = component("core", "internal storage helper", &[]);
        let mut ctx = context_for(dir.path(), vec![spec.clone()], RiskLevel::Low, Arc::clone(&runner));
        ctx.manifest.execution.mode = Some(Mode::Quick);
        ctx.config.validation = ValidationConfig::default();

        run_component(&mut ctx, &spec).await.unwrap();
        // Quick mode floor is 1, low risk maps to 1: a single reviewer
        assert_eq!(runner.invocations_of("code-review"), 1);
        assert_eq!(runner.invocations_of("design-review"), 0);
    }
}
