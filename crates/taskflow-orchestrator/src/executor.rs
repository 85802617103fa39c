use crate::types::{ExecutorInfo, ANY_TASK_TYPE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taskflow_core::{Task, TaskResult, TaskflowResult};

/// Static description of an executor's identity and what it accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorDescriptor {
    pub executor_id: String,
    pub executor_type: String,
    pub description: String,
    pub capabilities: Vec<String>,
    /// Task types this executor runs; `*` accepts any type.
    pub supported_task_types: Vec<String>,
    pub max_concurrent_tasks: u32,
}

impl ExecutorDescriptor {
    pub fn new(executor_id: impl Into<String>, executor_type: impl Into<String>) -> Self {
        Self {
            executor_id: executor_id.into(),
            executor_type: executor_type.into(),
            description: String::new(),
            capabilities: Vec::new(),
            supported_task_types: Vec::new(),
            max_concurrent_tasks: 1,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_task_types(mut self, types: &[&str]) -> Self {
        self.supported_task_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, n: u32) -> Self {
        self.max_concurrent_tasks = n.max(1);
        self
    }

    /// Registry entry for this executor with a neutral performance score.
    pub fn to_info(&self) -> ExecutorInfo {
        ExecutorInfo::new(self.executor_id.clone(), self.executor_type.clone())
            .with_capacity(self.max_concurrent_tasks)
            .with_capabilities(self.capabilities.iter().cloned())
            .with_task_types(self.supported_task_types.iter().cloned())
    }
}

/// A swappable worker that performs tasks.
///
/// Executors own their side effects. Cancellation of a task while it runs is
/// cooperative, and `timeout_seconds` on the task is for the executor to honor.
#[async_trait]
pub trait Executor: Send + Sync {
    fn descriptor(&self) -> &ExecutorDescriptor;

    fn supported_task_types(&self) -> &[String] {
        &self.descriptor().supported_task_types
    }

    fn can_handle_task(&self, task: &Task) -> bool {
        self.supported_task_types()
            .iter()
            .any(|t| t == &task.task_type || t == ANY_TASK_TYPE)
    }

    fn is_available(&self) -> bool {
        true
    }

    /// Run the task. An `Ok` result with `success == false` and an `Err` are
    /// both treated as task failures by the workflow.
    async fn execute_task(&self, task: &Task) -> TaskflowResult<TaskResult>;
}
