//! Validation loop and voting gate.
//!
//! A component under validation is reviewed by a set of reviewer operations.
//! Issues trigger a fix operation and a re-review, up to `max_attempts`
//! cycles. Two situations escalate to the voting gate instead of retrying
//! forever: the identical issue description recurring across
//! `same_issue_threshold` consecutive attempts, and attempts running out.
//! The gate turns a split reviewer verdict into a request for a human
//! decision; a unanimous failure escalates without one.

use crate::config::{ParallelizationStrategy, ValidationConfig};
use crate::runner::{ContextMap, OperationRequest, OperationResult, OperationRunner};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Operation invoked between attempts to address reported issues.
pub const FIX_OPERATION: &str = "fix";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Info,
    #[default]
    Warning,
    Error,
    Critical,
}

/// A structured validation finding produced by a reviewer operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub description: String,
    #[serde(default)]
    pub severity: IssueSeverity,
    #[serde(default)]
    pub source: String,
}

/// Outcome of the voting gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VotingOutcome {
    pub needs_user_decision: bool,
    #[serde(default)]
    pub user_prompt: Option<String>,
}

/// What the validation loop concluded for one component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopResult {
    pub passed: bool,
    pub escalated: bool,
    pub escalation_reason: Option<String>,
    pub voting: VotingOutcome,
}

impl LoopResult {
    pub fn passed() -> Self {
        Self {
            passed: true,
            ..Self::default()
        }
    }

    pub fn escalated(reason: String, voting: VotingOutcome) -> Self {
        Self {
            passed: false,
            escalated: true,
            escalation_reason: Some(reason),
            voting,
        }
    }
}

/// Seam through which the loop reports progress for persistence. The caller
/// decides where issues and status transitions are recorded.
pub trait ValidationObserver: Send {
    fn on_issues(&mut self, attempt: u32, issues: &[Issue]) -> Result<()>;

    fn on_fixing(&mut self, _attempt: u32) -> Result<()> {
        Ok(())
    }

    fn on_revalidating(&mut self, _attempt: u32) -> Result<()> {
        Ok(())
    }
}

/// Observer that records nothing.
pub struct NoopObserver;

impl ValidationObserver for NoopObserver {
    fn on_issues(&mut self, _attempt: u32, _issues: &[Issue]) -> Result<()> {
        Ok(())
    }
}

/// Converts an automated impasse into a request for a human decision.
pub struct VotingGate;

impl VotingGate {
    /// Tally the final attempt's reviewer verdicts. A split (some reviewers
    /// reporting issues, some clean) needs a human; unanimity does not.
    pub fn resolve(
        component_id: &str,
        reviewers: &[String],
        results: &[OperationResult],
    ) -> VotingOutcome {
        let mut reporting: Vec<&str> = Vec::new();
        let mut clean: Vec<&str> = Vec::new();
        for (op, result) in reviewers.iter().zip(results) {
            if result.success && result_issues(result).is_empty() {
                clean.push(op);
            } else {
                reporting.push(op);
            }
        }

        if reporting.is_empty() || clean.is_empty() {
            return VotingOutcome::default();
        }

        VotingOutcome {
            needs_user_decision: true,
            user_prompt: Some(format!(
                "Reviewers disagree on '{component_id}': {} found issues, {} found none. \
                 Accept the component as-is, or describe how to proceed?",
                reporting.join(", "),
                clean.join(", ")
            )),
        }
    }
}

/// Drives validate → fix cycles for one component.
pub struct ValidationLoop {
    max_attempts: u32,
    same_issue_threshold: u32,
    strategy: ParallelizationStrategy,
}

impl ValidationLoop {
    pub fn new(validation: &ValidationConfig, strategy: ParallelizationStrategy) -> Self {
        Self {
            max_attempts: validation.max_attempts.max(1),
            same_issue_threshold: validation.same_issue_threshold.max(1),
            strategy,
        }
    }

    pub async fn run(
        &self,
        runner: &dyn OperationRunner,
        component_id: &str,
        context: &ContextMap,
        reviewers: &[String],
        observer: &mut dyn ValidationObserver,
    ) -> Result<LoopResult> {
        // Consecutive-attempt recurrence count per issue description
        let mut recurrence: BTreeMap<String, u32> = BTreeMap::new();

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                observer.on_revalidating(attempt)?;
            }

            let requests: Vec<OperationRequest> = reviewers
                .iter()
                .map(|op| review_request(op, component_id, context, attempt))
                .collect();

            let results = match self.strategy {
                ParallelizationStrategy::Parallel => runner.run_parallel(&requests).await?,
                ParallelizationStrategy::Sequential => {
                    let mut results = Vec::with_capacity(requests.len());
                    for request in &requests {
                        results.push(runner.run(request).await?);
                    }
                    results
                }
            };

            let issues = collect_issues(reviewers, &results);
            if issues.is_empty() {
                return Ok(LoopResult::passed());
            }
            observer.on_issues(attempt, &issues)?;

            let seen: BTreeSet<&str> = issues.iter().map(|i| i.description.as_str()).collect();
            recurrence.retain(|description, _| seen.contains(description.as_str()));
            for description in &seen {
                *recurrence.entry((*description).to_string()).or_insert(0) += 1;
            }

            if let Some((description, count)) = recurrence
                .iter()
                .find(|(_, count)| **count >= self.same_issue_threshold)
            {
                let reason = format!(
                    "issue '{description}' recurred across {count} consecutive attempts"
                );
                return Ok(LoopResult::escalated(
                    reason,
                    VotingGate::resolve(component_id, reviewers, &results),
                ));
            }

            if attempt == self.max_attempts {
                let reason =
                    format!("validation attempts exhausted after {}", self.max_attempts);
                return Ok(LoopResult::escalated(
                    reason,
                    VotingGate::resolve(component_id, reviewers, &results),
                ));
            }

            observer.on_fixing(attempt)?;
            let fix = runner
                .run(&fix_request(component_id, context, &issues))
                .await?;
            if !fix.success {
                let reason = format!("fix operation failed: {}", fix.error_message());
                return Ok(LoopResult::escalated(
                    reason,
                    VotingGate::resolve(component_id, reviewers, &results),
                ));
            }
        }

        unreachable!("validation loop returns from inside the attempt loop")
    }
}

fn review_request(
    operation: &str,
    component_id: &str,
    context: &ContextMap,
    attempt: u32,
) -> OperationRequest {
    OperationRequest::new(
        operation,
        &format!("Review component '{component_id}' and report any issues found"),
    )
    .with_context(context.clone())
    .context_value("component", Value::String(component_id.to_string()))
    .context_value("attempt", Value::from(attempt))
}

fn fix_request(component_id: &str, context: &ContextMap, issues: &[Issue]) -> OperationRequest {
    OperationRequest::new(
        FIX_OPERATION,
        &format!("Fix the reported issues in component '{component_id}'"),
    )
    .with_context(context.clone())
    .context_value("component", Value::String(component_id.to_string()))
    .context_value(
        "issues",
        serde_json::to_value(issues).expect("issues serialize to JSON"),
    )
}

fn result_issues(result: &OperationResult) -> Vec<Issue> {
    result
        .fields
        .get("issues")
        .cloned()
        .and_then(|v| serde_json::from_value::<Vec<Issue>>(v).ok())
        .unwrap_or_default()
}

/// Flatten reviewer results into issues. A reviewer that ran and reported
/// structured issues contributes them; a reviewer that failed outright
/// contributes its error as a finding so the failure is not silently lost.
fn collect_issues(reviewers: &[String], results: &[OperationResult]) -> Vec<Issue> {
    let mut issues = Vec::new();
    for (op, result) in reviewers.iter().zip(results) {
        let mut found = result_issues(result);
        for issue in &mut found {
            if issue.source.is_empty() {
                issue.source = op.clone();
            }
        }
        if found.is_empty() && !result.success {
            found.push(Issue {
                description: result.error_message().to_string(),
                severity: IssueSeverity::Error,
                source: op.clone(),
            });
        }
        issues.extend(found);
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::ScriptedRunner;

    fn loop_with(max_attempts: u32, threshold: u32) -> ValidationLoop {
        let validation = ValidationConfig {
            max_attempts,
            reviewers: vec![],
            same_issue_threshold: threshold,
        };
        ValidationLoop::new(&validation, ParallelizationStrategy::Parallel)
    }

    fn issue_result(description: &str) -> OperationResult {
        OperationResult::ok().with_field(
            "issues",
            serde_json::json!([{"description": description, "severity": "error"}]),
        )
    }

    #[tokio::test]
    async fn passes_when_no_reviewer_reports_issues() {
        let runner = ScriptedRunner::all_ok();
        let reviewers = vec!["code-review".to_string(), "design-review".to_string()];

        let result = loop_with(3, 2)
            .run(
                &runner,
                "core",
                &ContextMap::new(),
                &reviewers,
                &mut NoopObserver,
            )
            .await
            .unwrap();

        assert!(result.passed);
        assert!(!result.escalated);
        // Both reviewers invoked, no fix attempted
        assert_eq!(runner.invocations_of("code-review"), 1);
        assert_eq!(runner.invocations_of("design-review"), 1);
        assert_eq!(runner.invocations_of(FIX_OPERATION), 0);
    }

    #[tokio::test]
    async fn fix_cycle_runs_until_reviewers_are_clean() {
        let runner = ScriptedRunner::all_ok();
        // First attempt finds an issue, second is clean
        runner.script("code-review", issue_result("missing null check"));
        runner.script("code-review", OperationResult::ok());

        let reviewers = vec!["code-review".to_string()];
        let result = loop_with(3, 2)
            .run(
                &runner,
                "core",
                &ContextMap::new(),
                &reviewers,
                &mut NoopObserver,
            )
            .await
            .unwrap();

        assert!(result.passed);
        assert_eq!(runner.invocations_of("code-review"), 2);
        assert_eq!(runner.invocations_of(FIX_OPERATION), 1);
    }

    #[tokio::test]
    async fn identical_issue_on_consecutive_attempts_escalates_at_threshold() {
        let runner = ScriptedRunner::all_ok();
        runner.script("code-review", issue_result("missing null check"));
        runner.script("code-review", issue_result("missing null check"));
        // A third clean result must never be requested
        runner.script("code-review", OperationResult::ok());

        let reviewers = vec!["code-review".to_string()];
        let result = loop_with(5, 2)
            .run(
                &runner,
                "core",
                &ContextMap::new(),
                &reviewers,
                &mut NoopObserver,
            )
            .await
            .unwrap();

        assert!(!result.passed);
        assert!(result.escalated);
        assert!(
            result
                .escalation_reason
                .as_deref()
                .unwrap()
                .contains("missing null check")
        );
        // Escalated after the second attempt, not retried a third time
        assert_eq!(runner.invocations_of("code-review"), 2);
    }

    #[tokio::test]
    async fn changing_issues_reset_the_recurrence_count() {
        let runner = ScriptedRunner::all_ok();
        runner.script("code-review", issue_result("issue a"));
        runner.script("code-review", issue_result("issue b"));
        runner.script("code-review", OperationResult::ok());

        let reviewers = vec!["code-review".to_string()];
        let result = loop_with(5, 2)
            .run(
                &runner,
                "core",
                &ContextMap::new(),
                &reviewers,
                &mut NoopObserver,
            )
            .await
            .unwrap();

        // Different descriptions each attempt: the loop keeps fixing
        assert!(result.passed);
        assert_eq!(runner.invocations_of("code-review"), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_escalate() {
        let runner = ScriptedRunner::all_ok();
        runner.script("code-review", issue_result("issue a"));
        runner.script("code-review", issue_result("issue b"));

        let reviewers = vec!["code-review".to_string()];
        let result = loop_with(2, 5)
            .run(
                &runner,
                "core",
                &ContextMap::new(),
                &reviewers,
                &mut NoopObserver,
            )
            .await
            .unwrap();

        assert!(result.escalated);
        assert!(
            result
                .escalation_reason
                .as_deref()
                .unwrap()
                .contains("exhausted")
        );
    }

    #[tokio::test]
    async fn split_reviewer_verdict_needs_a_user_decision() {
        let runner = ScriptedRunner::all_ok();
        // code-review keeps finding the same issue; design-review is clean
        runner.script("code-review", issue_result("unsafe cast"));
        runner.script("code-review", issue_result("unsafe cast"));

        let reviewers = vec!["code-review".to_string(), "design-review".to_string()];
        let result = loop_with(5, 2)
            .run(
                &runner,
                "core",
                &ContextMap::new(),
                &reviewers,
                &mut NoopObserver,
            )
            .await
            .unwrap();

        assert!(result.escalated);
        assert!(result.voting.needs_user_decision);
        let prompt = result.voting.user_prompt.unwrap();
        assert!(prompt.contains("core"));
        assert!(prompt.contains("code-review"));
    }

    #[tokio::test]
    async fn unanimous_failure_escalates_without_user_decision() {
        let runner = ScriptedRunner::all_ok();
        for _ in 0..2 {
            runner.script("code-review", issue_result("unsafe cast"));
            runner.script("design-review", issue_result("unsafe cast"));
        }

        let reviewers = vec!["code-review".to_string(), "design-review".to_string()];
        let result = loop_with(5, 2)
            .run(
                &runner,
                "core",
                &ContextMap::new(),
                &reviewers,
                &mut NoopObserver,
            )
            .await
            .unwrap();

        assert!(result.escalated);
        assert!(!result.voting.needs_user_decision);
    }

    #[tokio::test]
    async fn failed_reviewer_contributes_its_error_as_a_finding() {
        let runner = ScriptedRunner::all_ok();
        runner.script("code-review", OperationResult::failure("reviewer crashed"));
        runner.script("code-review", OperationResult::ok());

        let mut recorded: Vec<Issue> = Vec::new();
        struct Capture<'a>(&'a mut Vec<Issue>);
        impl ValidationObserver for Capture<'_> {
            fn on_issues(&mut self, _attempt: u32, issues: &[Issue]) -> Result<()> {
                self.0.extend(issues.to_vec());
                Ok(())
            }
        }

        let reviewers = vec!["code-review".to_string()];
        let result = loop_with(3, 3)
            .run(
                &runner,
                "core",
                &ContextMap::new(),
                &reviewers,
                &mut Capture(&mut recorded),
            )
            .await
            .unwrap();

        assert!(result.passed);
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].description, "reviewer crashed");
        assert_eq!(recorded[0].source, "code-review");
        assert_eq!(recorded[0].severity, IssueSeverity::Error);
    }

    #[tokio::test]
    async fn failed_fix_operation_escalates() {
        let runner = ScriptedRunner::all_ok();
        runner.script("code-review", issue_result("issue a"));
        runner.script(FIX_OPERATION, OperationResult::failure("fix agent offline"));

        let reviewers = vec!["code-review".to_string()];
        let result = loop_with(5, 5)
            .run(
                &runner,
                "core",
                &ContextMap::new(),
                &reviewers,
                &mut NoopObserver,
            )
            .await
            .unwrap();

        assert!(result.escalated);
        assert!(
            result
                .escalation_reason
                .as_deref()
                .unwrap()
                .contains("fix agent offline")
        );
    }

    #[test]
    fn issue_deserializes_with_defaults() {
        let issue: Issue = serde_json::from_str(r#"{"description": "x"}"#).unwrap();
        assert_eq!(issue.severity, IssueSeverity::Warning);
        assert!(issue.source.is_empty());
    }
}
