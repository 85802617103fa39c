use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use taskflow_core::{Task, TaskDependency, TaskPriority};
use uuid::Uuid;

/// Marker for executors that accept any task type.
pub const ANY_TASK_TYPE: &str = "*";

// --- Planning ---

/// How the planner shapes dependencies between the tasks it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningStrategy {
    /// Each task depends on the one before it.
    Sequential,
    /// No dependencies between tasks.
    Parallel,
    /// Tasks grouped by type, sequential within a group only.
    Optimized,
    /// Declared dependencies are kept as given.
    Custom,
}

impl std::fmt::Display for PlanningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanningStrategy::Sequential => write!(f, "sequential"),
            PlanningStrategy::Parallel => write!(f, "parallel"),
            PlanningStrategy::Optimized => write!(f, "optimized"),
            PlanningStrategy::Custom => write!(f, "custom"),
        }
    }
}

/// The planner's pre-assignment description of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub task_id: String,
    pub task_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Seconds.
    #[serde(default)]
    pub estimated_duration: f64,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl TaskPlan {
    pub fn new(task_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            name: name.into(),
            description: String::new(),
            parameters: HashMap::new(),
            priority: TaskPriority::Normal,
            estimated_duration: 0.0,
            required_capabilities: Vec::new(),
            required_tools: Vec::new(),
            dependencies: Vec::new(),
            tags: Vec::new(),
            max_retries: None,
            timeout_seconds: None,
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.required_capabilities = caps;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_estimated_duration(mut self, seconds: f64) -> Self {
        self.estimated_duration = seconds;
        self
    }

    /// Whether every dependency is in `completed`.
    pub fn is_ready(&self, completed: &std::collections::HashSet<String>) -> bool {
        self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Build the runtime [`Task`]; plan dependencies become required
    /// sequential edges.
    pub fn to_task(&self, default_max_retries: u32, default_timeout_secs: u64) -> Task {
        let mut task = Task::new(self.task_type.clone())
            .with_id(self.task_id.clone())
            .with_name(self.name.clone())
            .with_description(self.description.clone())
            .with_parameters(self.parameters.clone())
            .with_priority(self.priority)
            .with_max_retries(self.max_retries.unwrap_or(default_max_retries))
            .with_timeout(self.timeout_seconds.unwrap_or(default_timeout_secs))
            .with_tags(self.tags.clone());
        for dep in &self.dependencies {
            task.add_dependency(TaskDependency::sequential(dep.clone()));
        }
        task
    }
}

/// Output of a planner run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningResult {
    pub plan_id: String,
    pub tasks: Vec<TaskPlan>,
    pub strategy: PlanningStrategy,
    /// Seconds.
    pub estimated_total_time: f64,
    pub confidence: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Task ids ordered by earliest start.
    #[serde(default)]
    pub critical_path: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// --- Executors ---

/// Registry-side status of an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Available,
    /// At capacity.
    Busy,
    /// Above capacity, e.g. after its capacity was lowered.
    Overloaded,
    Offline,
    Maintenance,
}

impl std::fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorStatus::Available => write!(f, "available"),
            ExecutorStatus::Busy => write!(f, "busy"),
            ExecutorStatus::Overloaded => write!(f, "overloaded"),
            ExecutorStatus::Offline => write!(f, "offline"),
            ExecutorStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Catalog entry for one executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: String,
    pub executor_type: String,
    pub capabilities: BTreeSet<String>,
    pub current_load: u32,
    pub max_capacity: u32,
    pub status: ExecutorStatus,
    /// Historical success rate in `[0, 1]`.
    pub performance_score: f64,
    pub preferred_task_types: Vec<String>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub total_tasks: u64,
    #[serde(default)]
    pub successful_tasks: u64,
}

impl ExecutorInfo {
    pub fn new(executor_id: impl Into<String>, executor_type: impl Into<String>) -> Self {
        Self {
            executor_id: executor_id.into(),
            executor_type: executor_type.into(),
            capabilities: BTreeSet::new(),
            current_load: 0,
            max_capacity: 1,
            status: ExecutorStatus::Available,
            performance_score: 0.5,
            preferred_task_types: Vec::new(),
            last_active: Utc::now(),
            total_tasks: 0,
            successful_tasks: 0,
        }
    }

    pub fn with_capacity(mut self, max_capacity: u32) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_task_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_task_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_performance_score(mut self, score: f64) -> Self {
        self.performance_score = score.clamp(0.0, 1.0);
        self
    }

    /// `1 - load/capacity` for the given load, floored at zero.
    pub fn headroom_at(&self, load: u32) -> f64 {
        if self.max_capacity == 0 {
            return 0.0;
        }
        (1.0 - f64::from(load) / f64::from(self.max_capacity)).max(0.0)
    }

    pub fn load_headroom(&self) -> f64 {
        self.headroom_at(self.current_load)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_capacity
    }

    /// Accepts any task type (no listed types, or the `*` wildcard).
    pub fn is_generalist(&self) -> bool {
        self.preferred_task_types.is_empty()
            || self.preferred_task_types.iter().any(|t| t == ANY_TASK_TYPE)
    }

    /// Lists `task_type` explicitly.
    pub fn prefers(&self, task_type: &str) -> bool {
        self.preferred_task_types.iter().any(|t| t == task_type)
    }
}

// --- Dispatch ---

/// How the dispatcher picks among candidate executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    RoundRobin,
    LoadBalance,
    CapabilityMatch,
    PriorityFirst,
    OptimalAssignment,
}

impl DispatchStrategy {
    pub fn reason(self) -> &'static str {
        match self {
            DispatchStrategy::PriorityFirst => {
                "High priority tasks or deadline constraints detected"
            }
            DispatchStrategy::LoadBalance => "Heavy task load requires load balancing",
            DispatchStrategy::CapabilityMatch => "Tasks with dependencies require capability matching",
            DispatchStrategy::OptimalAssignment => "Optimization enabled for best overall assignment",
            DispatchStrategy::RoundRobin => "Simple round-robin distribution",
        }
    }
}

impl std::fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchStrategy::RoundRobin => write!(f, "round_robin"),
            DispatchStrategy::LoadBalance => write!(f, "load_balance"),
            DispatchStrategy::CapabilityMatch => write!(f, "capability_match"),
            DispatchStrategy::PriorityFirst => write!(f, "priority_first"),
            DispatchStrategy::OptimalAssignment => write!(f, "optimal_assignment"),
        }
    }
}

/// Caller-supplied context for one dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchContext {
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub preferences: HashMap<String, serde_json::Value>,
}

impl DispatchContext {
    pub fn for_plan(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: Some(plan_id.into()),
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A task bound to an executor. Reassignment creates a new assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorAssignment {
    pub assignment_id: String,
    pub task_id: String,
    pub executor_id: String,
    pub task_type: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    pub assigned_at: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
    pub priority: TaskPriority,
    pub confidence: f64,
    #[serde(default)]
    pub backup_executors: Vec<String>,
    pub strategy: DispatchStrategy,
    /// Executor this assignment replaced, if it is a reassignment.
    #[serde(default)]
    pub reassigned_from: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Output of one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub dispatch_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    pub assignments: Vec<ExecutorAssignment>,
    pub unassigned_tasks: Vec<String>,
    /// Tasks held back because their dependencies are not complete yet.
    #[serde(default)]
    pub deferred_tasks: Vec<String>,
    pub strategy: DispatchStrategy,
    pub strategy_reason: String,
    pub confidence: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Seconds of work queued on the busiest executor.
    pub total_estimated_time: f64,
    pub created_at: DateTime<Utc>,
}

impl DispatchResult {
    pub fn assignment_for(&self, task_id: &str) -> Option<&ExecutorAssignment> {
        self.assignments.iter().find(|a| a.task_id == task_id)
    }
}

// --- Workflow ---

/// Lifecycle of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowState::Pending => write!(f, "pending"),
            WorkflowState::Running => write!(f, "running"),
            WorkflowState::Paused => write!(f, "paused"),
            WorkflowState::Completed => write!(f, "completed"),
            WorkflowState::Failed => write!(f, "failed"),
            WorkflowState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final outcome of a workflow run. Always returned, never an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub success: bool,
    pub result: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Seconds.
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Point-in-time view of a running workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: String,
    pub state: WorkflowState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use taskflow_core::TaskState;

    #[test]
    fn test_task_plan_to_task() {
        let plan = TaskPlan::new("http", "fetch")
            .with_id("p1")
            .with_dependencies(vec!["p0".into()])
            .with_priority(TaskPriority::High);
        let task = plan.to_task(3, 300);
        assert_eq!(task.task_id, "p1");
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.gating_dependencies().collect::<Vec<_>>(), vec!["p0"]);
    }

    #[test]
    fn test_task_plan_overrides_defaults() {
        let mut plan = TaskPlan::new("shell", "build");
        plan.max_retries = Some(0);
        plan.timeout_seconds = Some(10);
        let task = plan.to_task(3, 300);
        assert_eq!(task.max_retries, 0);
        assert_eq!(task.timeout_seconds, 10);
    }

    #[test]
    fn test_executor_info_headroom() {
        let info = ExecutorInfo::new("e1", "http").with_capacity(4);
        assert!((info.load_headroom() - 1.0).abs() < f64::EPSILON);
        assert!((info.headroom_at(3) - 0.25).abs() < 1e-9);
        assert_eq!(info.headroom_at(5), 0.0);
    }

    #[test]
    fn test_generalist_detection() {
        assert!(ExecutorInfo::new("a", "generic").is_generalist());
        assert!(ExecutorInfo::new("b", "any")
            .with_task_types(["*"])
            .is_generalist());
        let specialist = ExecutorInfo::new("c", "http").with_task_types(["http"]);
        assert!(!specialist.is_generalist());
        assert!(specialist.prefers("http"));
    }

    #[test]
    fn test_task_plan_deserialize_defaults() {
        let plan: TaskPlan =
            serde_json::from_str(r#"{"task_id":"x","task_type":"shell","name":"n"}"#).unwrap();
        assert_eq!(plan.priority, TaskPriority::Normal);
        assert!(plan.dependencies.is_empty());
        assert!(plan.max_retries.is_none());
    }

    #[test]
    fn test_workflow_state_terminal() {
        assert!(WorkflowState::Cancelled.is_terminal());
        assert!(!WorkflowState::Paused.is_terminal());
    }
}
