use async_trait::async_trait;
use serde_json::json;
use taskflow_core::{Task, TaskResult, TaskflowResult};
use taskflow_orchestrator::{Executor, ExecutorDescriptor};
use tracing::debug;

/// Completes `generic` and `function` tasks by echoing what they were given.
pub struct EchoExecutor {
    descriptor: ExecutorDescriptor,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self {
            descriptor: ExecutorDescriptor::new("echo-local", "echo")
                .with_description("Echo task parameters back as the result payload.")
                .with_task_types(&["generic", "function"])
                .with_max_concurrent_tasks(8),
        }
    }
}

impl Default for EchoExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for EchoExecutor {
    fn descriptor(&self) -> &ExecutorDescriptor {
        &self.descriptor
    }

    async fn execute_task(&self, task: &Task) -> TaskflowResult<TaskResult> {
        debug!(task_id = %task.task_id, task_type = %task.task_type, "Echoing task");
        Ok(TaskResult::success(
            &task.task_id,
            json!({
                "name": task.name,
                "description": task.description,
                "parameters": task.parameters,
            }),
        ))
    }
}
