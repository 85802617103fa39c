use crate::{TaskflowError, TaskflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its dependencies and an executor.
    Pending,
    /// Handed to an executor.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Failed with retries exhausted. Terminal.
    Failed,
    /// Cancelled before finishing. Terminal.
    Cancelled,
    /// Held back until manually unblocked.
    Blocked,
}

impl TaskState {
    /// Whether no further transition is possible from this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// The allowed edge set of the task lifecycle.
    ///
    /// `Failed -> Pending` is only taken inside [`Task::fail`] while retries
    /// remain, so an observed `Failed` state is always terminal.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Blocked)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
                | (Blocked, Pending)
                | (Blocked, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
            TaskState::Blocked => write!(f, "blocked"),
        }
    }
}

/// Priority levels, ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Numeric weight (1 = low .. 4 = critical).
    pub fn value(self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 2,
            TaskPriority::High => 3,
            TaskPriority::Critical => 4,
        }
    }

    /// Whether this priority is above `Normal`.
    pub fn is_elevated(self) -> bool {
        self > TaskPriority::Normal
    }
}

/// How a task relates to one of its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    /// Must complete before the dependent starts.
    Sequential,
    /// May run alongside, but must finish before the dependent finishes.
    Parallel,
    /// Shares a resource with the dependent.
    Resource,
    /// Produces data the dependent consumes.
    Data,
}

/// A dependency edge from a task to another task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub dependency_id: String,
    pub dependency_type: DependencyType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub condition: Option<String>,
}

fn default_required() -> bool {
    true
}

impl TaskDependency {
    /// A required sequential dependency, the common case.
    pub fn sequential(dependency_id: impl Into<String>) -> Self {
        Self {
            dependency_id: dependency_id.into(),
            dependency_type: DependencyType::Sequential,
            required: true,
            condition: None,
        }
    }

    pub fn new(dependency_id: impl Into<String>, dependency_type: DependencyType) -> Self {
        Self {
            dependency_id: dependency_id.into(),
            dependency_type,
            required: true,
            condition: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Whether this edge gates the dependent's start.
    pub fn gates_start(&self) -> bool {
        self.required && self.dependency_type == DependencyType::Sequential
    }
}

/// Outcome of one task execution as reported by an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Wall-clock seconds spent executing.
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            payload,
            metadata: HashMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            execution_time: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            payload: serde_json::Value::Null,
            metadata: HashMap::new(),
            errors: vec![error.into()],
            warnings: Vec::new(),
            execution_time: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_execution_time(mut self, seconds: f64) -> Self {
        self.execution_time = seconds;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// First error message, or a generic one when the executor gave none.
    pub fn error_message(&self) -> String {
        self.errors
            .first()
            .cloned()
            .unwrap_or_else(|| "task reported failure without an error message".to_string())
    }
}

/// Timing information collected across a task's lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between the last start and the end.
    pub execution_time: f64,
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub at: DateTime<Utc>,
}

/// A unit of work tracked through an explicit lifecycle.
///
/// State only changes through the lifecycle methods ([`start`](Task::start),
/// [`complete`](Task::complete), [`fail`](Task::fail), [`cancel`](Task::cancel),
/// [`block`](Task::block), [`unblock`](Task::unblock)); each change is checked
/// against [`TaskState::can_transition_to`] and appended to the transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub name: String,
    pub description: String,
    pub task_type: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub priority: TaskPriority,
    state: TaskState,
    pub dependencies: Vec<TaskDependency>,
    pub dependents: BTreeSet<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Advisory only; enforced by executors or a supervisor, never here.
    pub timeout_seconds: u64,
    pub tags: Vec<String>,
    pub metrics: TaskMetrics,
    pub result: Option<TaskResult>,
    pub assigned_executor: Option<String>,
    pub last_error: Option<String>,
    pub blocked_reason: Option<String>,
    transitions: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task of the given type with a fresh id.
    pub fn new(task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            name: String::new(),
            description: String::new(),
            task_type: task_type.into(),
            parameters: HashMap::new(),
            priority: TaskPriority::Normal,
            state: TaskState::Pending,
            dependencies: Vec::new(),
            dependents: BTreeSet::new(),
            retry_count: 0,
            max_retries: 3,
            timeout_seconds: 300,
            tags: Vec::new(),
            metrics: TaskMetrics::default(),
            result: None,
            assigned_executor: None,
            last_error: None,
            blocked_reason: None,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, serde_json::Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_dependency(mut self, dependency: TaskDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Every state change this task went through, oldest first.
    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn add_dependency(&mut self, dependency: TaskDependency) {
        self.dependencies.push(dependency);
        self.touch();
    }

    /// Remove a dependency by id. Returns `true` if one was removed.
    pub fn remove_dependency(&mut self, dependency_id: &str) -> bool {
        let before = self.dependencies.len();
        self.dependencies.retain(|d| d.dependency_id != dependency_id);
        let removed = self.dependencies.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    pub fn add_dependent(&mut self, task_id: impl Into<String>) {
        self.dependents.insert(task_id.into());
        self.touch();
    }

    pub fn remove_dependent(&mut self, task_id: &str) -> bool {
        let removed = self.dependents.remove(task_id);
        if removed {
            self.touch();
        }
        removed
    }

    /// Ids of the dependencies that gate this task's start.
    pub fn gating_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| d.gates_start())
            .map(|d| d.dependency_id.as_str())
    }

    /// Whether the task is pending and every required sequential dependency
    /// is in `completed`.
    pub fn can_start(&self, completed: &HashSet<String>) -> bool {
        self.state == TaskState::Pending
            && self.gating_dependencies().all(|dep| completed.contains(dep))
    }

    /// Move to `Running` on the given executor.
    ///
    /// Fails unless [`can_start`](Task::can_start) holds for `completed`.
    pub fn start(
        &mut self,
        executor_id: impl Into<String>,
        completed: &HashSet<String>,
    ) -> TaskflowResult<()> {
        if self.state != TaskState::Pending {
            return Err(self.invalid("start"));
        }
        if let Some(missing) = self
            .gating_dependencies()
            .find(|dep| !completed.contains(*dep))
        {
            return Err(TaskflowError::Task(format!(
                "task {} cannot start: dependency {missing} has not completed",
                self.task_id
            )));
        }
        self.transition(TaskState::Running);
        self.assigned_executor = Some(executor_id.into());
        self.metrics.start_time = Some(Utc::now());
        self.metrics.end_time = None;
        Ok(())
    }

    /// Move from `Running` to `Completed`, recording the result.
    ///
    /// A result that reports failure is rejected and the task stays
    /// `Running`; failures go through [`fail`](Task::fail).
    pub fn complete(&mut self, mut result: TaskResult) -> TaskflowResult<()> {
        if self.state != TaskState::Running {
            return Err(self.invalid("complete"));
        }
        if !result.success {
            return Err(TaskflowError::Task(format!(
                "task {} cannot complete with a failed result",
                self.task_id
            )));
        }
        self.transition(TaskState::Completed);
        self.close_metrics();
        result.task_id.clone_from(&self.task_id);
        result.execution_time = self.metrics.execution_time;
        result.timestamp = self.metrics.end_time.unwrap_or_else(Utc::now);
        self.result = Some(result);
        Ok(())
    }

    /// Record a failure.
    ///
    /// Always increments `retry_count`. With `retry` set and
    /// `retry_count <= max_retries` the task goes back to `Pending` (through
    /// `Failed`) and its dependencies must be re-checked before the next run.
    /// Otherwise it stays in terminal `Failed` with the error recorded.
    pub fn fail(&mut self, error: impl Into<String>, retry: bool) -> TaskflowResult<()> {
        if !matches!(self.state, TaskState::Pending | TaskState::Running) {
            return Err(self.invalid("fail"));
        }
        let error = error.into();
        self.last_error = Some(error.clone());
        self.retry_count += 1;
        self.transition(TaskState::Failed);

        if retry && self.retry_count <= self.max_retries {
            self.transition(TaskState::Pending);
            self.assigned_executor = None;
            return Ok(());
        }

        self.close_metrics();
        let mut result = TaskResult::failure(&self.task_id, error)
            .with_execution_time(self.metrics.execution_time)
            .with_metadata("retry_count", serde_json::json!(self.retry_count));
        result.timestamp = self.metrics.end_time.unwrap_or_else(Utc::now);
        self.result = Some(result);
        Ok(())
    }

    /// Cancel from any non-terminal state. Cooperative: an executor already
    /// running this task is not interrupted.
    pub fn cancel(&mut self, reason: impl Into<String>) -> TaskflowResult<()> {
        if self.state.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        let reason = reason.into();
        self.transition(TaskState::Cancelled);
        self.close_metrics();
        let mut result = TaskResult::failure(&self.task_id, format!("cancelled: {reason}"))
            .with_execution_time(self.metrics.execution_time)
            .with_metadata("cancelled", serde_json::json!(true))
            .with_metadata("reason", serde_json::json!(reason));
        result.timestamp = self.metrics.end_time.unwrap_or_else(Utc::now);
        self.result = Some(result);
        Ok(())
    }

    /// Hold a pending task back until [`unblock`](Task::unblock) is called.
    pub fn block(&mut self, reason: impl Into<String>) -> TaskflowResult<()> {
        if self.state != TaskState::Pending {
            return Err(self.invalid("block"));
        }
        self.transition(TaskState::Blocked);
        self.blocked_reason = Some(reason.into());
        Ok(())
    }

    pub fn unblock(&mut self) -> TaskflowResult<()> {
        if self.state != TaskState::Blocked {
            return Err(self.invalid("unblock"));
        }
        self.transition(TaskState::Pending);
        self.blocked_reason = None;
        Ok(())
    }

    fn transition(&mut self, to: TaskState) {
        debug_assert!(
            self.state.can_transition_to(to),
            "illegal transition {} -> {}",
            self.state,
            to
        );
        let at = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state,
            to,
            at,
        });
        self.state = to;
        self.updated_at = at;
    }

    fn close_metrics(&mut self) {
        let end = Utc::now();
        self.metrics.end_time = Some(end);
        if let Some(start) = self.metrics.start_time {
            self.metrics.execution_time = (end - start).num_milliseconds().max(0) as f64 / 1000.0;
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn invalid(&self, action: &str) -> TaskflowError {
        TaskflowError::InvalidTransition {
            task_id: self.task_id.clone(),
            from: self.state,
            action: action.to_string(),
        }
    }
}
