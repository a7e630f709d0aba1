//! The operation runner boundary.
//!
//! The engine never knows what an operation computes. It hands the runner an
//! operation identifier, an instruction, and a read-only context map, and
//! gets back a result. `run_parallel` fans out independent invocations and
//! returns results in submission order.
//!
//! Two implementations ship with the crate:
//! - [`DryRunRunner`] — synthetic successes, used to validate control flow
//! - [`agent::AgentRunner`] — spawns an external agent process per operation

pub mod agent;

pub use agent::AgentRunner;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Read-only context handed to an operation.
pub type ContextMap = BTreeMap<String, Value>;

/// A single operation invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation: String,
    pub instruction: String,
    #[serde(default)]
    pub context: ContextMap,
}

impl OperationRequest {
    pub fn new(operation: &str, instruction: &str) -> Self {
        Self {
            operation: operation.to_string(),
            instruction: instruction.to_string(),
            context: ContextMap::new(),
        }
    }

    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = context;
        self
    }

    pub fn context_value(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// What an operation reported back. `fields` carries operation-specific
/// payload such as `issues` (reviewers) or `discoveries` (implementers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: ContextMap,
}

impl OperationResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            status: "ok".to_string(),
            error: None,
            fields: ContextMap::new(),
        }
    }

    pub fn failure(error: &str) -> Self {
        Self {
            success: false,
            status: "failed".to_string(),
            error: Some(error.to_string()),
            fields: ContextMap::new(),
        }
    }

    pub fn blocked(reason: &str) -> Self {
        Self {
            success: false,
            status: "blocked".to_string(),
            error: Some(reason.to_string()),
            fields: ContextMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// An operation can succeed or fail; "blocked" is an explicit refusal
    /// that aborts the surrounding pipeline immediately.
    pub fn is_blocked(&self) -> bool {
        self.status == "blocked"
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown error")
    }

    /// Free-text discoveries reported by the operation, if any.
    pub fn discoveries(&self) -> Vec<String> {
        self.fields
            .get("discoveries")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Executes named operations, singly or in parallel batches.
///
/// A returned `Err` models a raised failure (process could not run at all);
/// an `Ok` result with `success == false` models an operation that ran and
/// reported failure. The engine treats the two differently.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    async fn run(&self, request: &OperationRequest) -> Result<OperationResult>;

    /// Fan out independent invocations and collect results in submission
    /// order. The default implementation runs everything concurrently on the
    /// current task set; implementations may override with their own pool.
    async fn run_parallel(
        &self,
        requests: &[OperationRequest],
    ) -> Result<Vec<OperationResult>> {
        use futures::future::join_all;

        let futures: Vec<_> = requests.iter().map(|r| self.run(r)).collect();
        join_all(futures).await.into_iter().collect()
    }
}

/// Runner that substitutes synthetic results for real work. Reviewer
/// operations report no issues, so a dry run exercises the full happy path
/// of the control flow.
#[derive(Debug, Clone, Default)]
pub struct DryRunRunner;

impl DryRunRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OperationRunner for DryRunRunner {
    async fn run(&self, request: &OperationRequest) -> Result<OperationResult> {
        tracing::debug!(operation = %request.operation, "dry run");
        Ok(OperationResult {
            success: true,
            status: "dry_run".to_string(),
            error: None,
            fields: ContextMap::new(),
        }
        .with_field(
            "operation",
            Value::String(request.operation.clone()),
        ))
    }
}
