use async_trait::async_trait;
use std::time::Duration;
use taskflow_core::{Task, TaskResult, TaskflowResult};
use taskflow_orchestrator::{Executor, ExecutorDescriptor};
use tracing::{info, warn};

/// Longest a single command may run, whatever the task asks for.
const MAX_TIMEOUT_SECS: u64 = 3600;

const DANGEROUS_PATTERNS: [&str; 4] = ["rm -rf /", "mkfs", "dd if=", ":(){ :|:& };:"];

/// Runs `parameters.command` through `sh -c`, bounded by the task's
/// `timeout_seconds`.
pub struct ShellExecutor {
    descriptor: ExecutorDescriptor,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::with_id("shell-local")
    }

    pub fn with_id(executor_id: &str) -> Self {
        Self {
            descriptor: ExecutorDescriptor::new(executor_id, "shell")
                .with_description("Execute a shell command in a subprocess.")
                .with_capabilities(&["shell", "process"])
                .with_task_types(&["shell"])
                .with_max_concurrent_tasks(4),
        }
    }

    pub fn with_max_concurrent_tasks(mut self, n: u32) -> Self {
        self.descriptor = self.descriptor.with_max_concurrent_tasks(n);
        self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn descriptor(&self) -> &ExecutorDescriptor {
        &self.descriptor
    }

    async fn execute_task(&self, task: &Task) -> TaskflowResult<TaskResult> {
        let command = task
            .parameters
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if command.is_empty() {
            return Ok(TaskResult::failure(&task.task_id, "Empty command"));
        }

        if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| command.contains(*p)) {
            warn!(task_id = %task.task_id, command = %command, "Blocked dangerous command");
            return Ok(TaskResult::failure(
                &task.task_id,
                format!("Command blocked: contains dangerous pattern '{pattern}'"),
            ));
        }

        let timeout_secs = task.timeout_seconds.clamp(1, MAX_TIMEOUT_SECS);
        info!(task_id = %task.task_id, command = %command, timeout = timeout_secs, "Executing shell command");

        let result = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let exit_code = output.status.code().unwrap_or(-1);
                let payload = serde_json::json!({
                    "exit_code": exit_code,
                    "stdout": truncate_output(&stdout, 50_000),
                    "stderr": truncate_output(&stderr, 10_000),
                });

                if output.status.success() {
                    Ok(TaskResult::success(&task.task_id, payload))
                } else {
                    let mut failed = TaskResult::failure(
                        &task.task_id,
                        format!("Command exited with status {exit_code}"),
                    );
                    failed.payload = payload;
                    Ok(failed)
                }
            }
            Ok(Err(e)) => Ok(TaskResult::failure(
                &task.task_id,
                format!("Failed to execute command: {e}"),
            )),
            Err(_) => Ok(TaskResult::failure(
                &task.task_id,
                format!("Command timed out after {timeout_secs}s"),
            )),
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
