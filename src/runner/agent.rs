//! Process-backed operation runner.
//!
//! Each invocation spawns the configured agent command, writes the request
//! as a JSON document to its stdin, and reads its stdout line by line. The
//! last line that parses as a JSON object is taken as the result; everything
//! else is agent chatter and is ignored (logged in verbose mode). A process
//! that cannot be spawned is a raised failure; a process that exits without
//! producing a parseable result is a reported failure.

use super::{OperationRequest, OperationResult, OperationRunner};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Default timeout for a single operation.
const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 600;

/// Environment variable naming the agent command.
pub const AGENT_CMD_ENV: &str = "FOREMAN_AGENT_CMD";

/// Default agent command when the environment does not name one.
pub const DEFAULT_AGENT_CMD: &str = "foreman-agent";

pub struct AgentRunner {
    cmd: String,
    work_dir: PathBuf,
    timeout: Duration,
    verbose: bool,
}

impl AgentRunner {
    /// Create a runner using the command from `FOREMAN_AGENT_CMD`, falling
    /// back to the default.
    pub fn new(work_dir: PathBuf) -> Self {
        let cmd = std::env::var(AGENT_CMD_ENV).unwrap_or_else(|_| DEFAULT_AGENT_CMD.to_string());
        Self {
            cmd,
            work_dir,
            timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            verbose: false,
        }
    }

    pub fn with_cmd(mut self, cmd: &str) -> Self {
        self.cmd = cmd.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    async fn run_process(&self, request: &OperationRequest) -> Result<OperationResult> {
        let start = Instant::now();
        let payload = serde_json::to_string(request).expect("request serializes to JSON");

        if self.verbose {
            eprintln!("[runner] {} <- {}", self.cmd, request.operation);
        }

        let mut child = Command::new(&self.cmd)
            .arg(&request.operation)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .current_dir(&self.work_dir)
            .spawn()
            .with_context(|| format!("Failed to spawn agent process '{}'", self.cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.shutdown().await.context("Failed to close agent stdin")?;
        }

        let stdout = child.stdout.take().context("Failed to get agent stdout")?;
        let mut reader = BufReader::new(stdout).lines();

        let mut last_result: Option<OperationResult> = None;
        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OperationResult>(&line) {
                Ok(result) => last_result = Some(result),
                Err(_) => {
                    if self.verbose {
                        eprintln!("[runner] {}", line);
                    }
                }
            }
        }

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(-1);

        if self.verbose {
            eprintln!(
                "[runner] {} -> exit {} in {:.1}s",
                request.operation,
                exit_code,
                start.elapsed().as_secs_f64()
            );
        }

        match last_result {
            Some(result) => Ok(result),
            None => Ok(OperationResult::failure(&format!(
                "agent produced no result (exit code {exit_code})"
            ))),
        }
    }
}

#[async_trait]
impl OperationRunner for AgentRunner {
    async fn run(&self, request: &OperationRequest) -> Result<OperationResult> {
        match tokio::time::timeout(self.timeout, self.run_process(request)).await {
            Ok(result) => result,
            Err(_) => Ok(OperationResult::failure(&format!(
                "operation '{}' timed out after {}s",
                request.operation,
                self.timeout.as_secs()
            ))),
        }
    }
}
