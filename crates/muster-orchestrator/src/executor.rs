use crate::types::{Agent, Task};
use async_trait::async_trait;
use muster_core::MusterResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// What an executor reports back for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Whether the task succeeded.
    pub success: bool,
    /// Result data on success.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    /// A successful outcome carrying `data`.
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// A failed outcome.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Runs a task on an agent. Implementations must not touch engine state.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one task on one agent.
    async fn execute(&self, task: &Task, agent: &Agent) -> MusterResult<ExecutionOutcome>;
}

/// Succeeds immediately, echoing the task and agent ids. Used for dry runs.
pub struct NoopExecutor;

#[async_trait]
impl TaskExecutor for NoopExecutor {
    async fn execute(&self, task: &Task, agent: &Agent) -> MusterResult<ExecutionOutcome> {
        Ok(ExecutionOutcome::success(serde_json::json!({
            "task": task.id,
            "agent": agent.id,
        })))
    }
}

const DANGEROUS_PATTERNS: [&str; 4] = ["rm -rf /", "mkfs", "dd if=", ":(){ :|:& };:"];

/// Runs `payload.command` through `sh -c`.
///
/// The child sees `MUSTER_TASK_ID`, `MUSTER_AGENT_ID` and, for sub-tasks,
/// `MUSTER_CHUNK_START` / `MUSTER_CHUNK_END`. `payload.timeoutSecs`
/// overrides the default timeout, capped at `max_timeout`.
pub struct ShellExecutor {
    default_timeout: Duration,
    max_timeout: Duration,
}

impl ShellExecutor {
    /// Create an executor with a per-task default timeout.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            max_timeout: Duration::from_secs(3600).max(default_timeout),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, task: &Task, agent: &Agent) -> MusterResult<ExecutionOutcome> {
        let command = task.payload["command"].as_str().unwrap_or_default();
        if command.trim().is_empty() {
            return Ok(ExecutionOutcome::failure(format!(
                "task '{}' has no payload.command",
                task.id
            )));
        }
        if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| command.contains(*p)) {
            warn!(task_id = %task.id, command = %command, "Blocked dangerous command");
            return Ok(ExecutionOutcome::failure(format!(
                "Command blocked: contains dangerous pattern '{pattern}'"
            )));
        }

        let timeout = task.payload["timeoutSecs"]
            .as_u64()
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout);

        info!(task_id = %task.id, agent_id = %agent.id, command = %command, "Executing shell task");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("MUSTER_TASK_ID", &task.id)
            .env("MUSTER_AGENT_ID", &agent.id)
            .kill_on_drop(true);
        if let Some(chunk) = task.chunk {
            cmd.env("MUSTER_CHUNK_START", chunk.start.to_string())
                .env("MUSTER_CHUNK_END", chunk.end.to_string());
        }

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let exit_code = output.status.code().unwrap_or(-1);
                let data = serde_json::json!({
                    "exitCode": exit_code,
                    "stdout": truncate_output(&stdout, 50_000),
                    "stderr": truncate_output(&stderr, 10_000),
                });
                if output.status.success() {
                    Ok(ExecutionOutcome::success(data))
                } else {
                    Ok(ExecutionOutcome {
                        success: false,
                        data: Some(data),
                        error: Some(format!("command exited with status {exit_code}")),
                    })
                }
            }
            Ok(Err(e)) => Ok(ExecutionOutcome::failure(format!(
                "Failed to execute command: {e}"
            ))),
            Err(_) => Ok(ExecutionOutcome::failure(format!(
                "Command timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..end], s.len())
}
