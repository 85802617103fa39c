use crate::config::PlannerConfig;
use crate::graph;
use crate::types::{PlanningResult, PlanningStrategy, TaskPlan};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use taskflow_core::{TaskPriority, TaskflowResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Base duration in seconds for task types without an entry below.
pub const DEFAULT_BASE_DURATION: f64 = 60.0;

/// Base duration in seconds for a known task type.
pub fn base_duration(task_type: &str) -> f64 {
    match task_type {
        "python" => 30.0,
        "shell" => 60.0,
        "http" => 10.0,
        "function" => 15.0,
        "generic" => 30.0,
        _ => DEFAULT_BASE_DURATION,
    }
}

/// A task as declared in requirements. Unset fields take planner defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default, alias = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    /// Overrides the duration heuristic when set.
    #[serde(default)]
    pub estimated_duration: Option<f64>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// A command entry: a bare shell string, or a structured spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Structured(TaskSpec),
}

/// Heterogeneous work description accepted by the planner.
///
/// Exactly one shape is used, in order of precedence: `tasks`, `goals`,
/// `commands`, and otherwise a single generic task built from `name`,
/// `description`, `parameters` and `priority`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub tasks: Option<Vec<TaskSpec>>,
    #[serde(default)]
    pub goals: Option<Vec<String>>,
    #[serde(default)]
    pub commands: Option<Vec<CommandSpec>>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub optimize: bool,
    #[serde(default)]
    pub strategy: Option<PlanningStrategy>,
}

impl Requirements {
    pub fn from_tasks(tasks: Vec<TaskSpec>) -> Self {
        Self {
            tasks: Some(tasks),
            ..Self::default()
        }
    }

    pub fn from_goals<I, S>(goals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            goals: Some(goals.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn from_commands<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: Some(
                commands
                    .into_iter()
                    .map(|c| CommandSpec::Shell(c.into()))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: PlanningStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Optional limits checked against the finished plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningConstraints {
    /// Seconds; exceeding it only produces a warning.
    #[serde(default)]
    pub max_time: Option<f64>,
}

/// Turns requirements into a dependency-shaped list of task plans.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(
        &self,
        requirements: &Requirements,
        constraints: &PlanningConstraints,
    ) -> TaskflowResult<PlanningResult>;

    /// Structural problems of a plan as human-readable messages. Empty
    /// means valid.
    fn validate_plan(&self, plan: &PlanningResult) -> Vec<String>;
}

/// Rule-based planner.
pub struct SimplePlanner {
    planner_id: String,
    config: PlannerConfig,
    history: Mutex<VecDeque<PlanningResult>>,
}

impl Default for SimplePlanner {
    fn default() -> Self {
        Self::new(PlannerConfig::default())
    }
}

impl SimplePlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            planner_id: format!("simple-planner-{}", Uuid::new_v4()),
            config,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn planner_id(&self) -> &str {
        &self.planner_id
    }

    /// Most recent plans, newest last.
    pub fn planning_history(&self, limit: usize) -> Vec<PlanningResult> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn select_strategy(&self, requirements: &Requirements) -> PlanningStrategy {
        if let Some(strategy) = requirements.strategy {
            return strategy;
        }
        if requirements.parallel {
            return PlanningStrategy::Parallel;
        }
        if requirements.optimize {
            return PlanningStrategy::Optimized;
        }
        let declares_dependencies = requirements
            .tasks
            .as_ref()
            .is_some_and(|tasks| tasks.iter().any(|t| !t.dependencies.is_empty()));
        if declares_dependencies {
            PlanningStrategy::Custom
        } else {
            PlanningStrategy::Sequential
        }
    }

    /// Base duration for the type, ×1.2 with more than five parameters,
    /// ×1.1 with more than two dependencies.
    pub fn estimate_task_duration(&self, task: &TaskPlan) -> f64 {
        let mut duration = base_duration(&task.task_type);
        if task.parameters.len() > 5 {
            duration *= 1.2;
        }
        if task.dependencies.len() > 2 {
            duration *= 1.1;
        }
        duration
    }

    /// Remove dependency references to ids outside the plan. Returns one
    /// warning per removed reference.
    pub fn resolve_dependencies(&self, tasks: &mut [TaskPlan]) -> Vec<String> {
        let dangling = graph::dangling_dependencies(tasks);
        if dangling.is_empty() {
            return Vec::new();
        }
        let known: HashSet<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
        for task in tasks.iter_mut() {
            task.dependencies.retain(|d| known.contains(d));
        }
        dangling
            .into_iter()
            .map(|(task_id, dep)| {
                warn!(task_id = %task_id, dependency = %dep, "Dropping unknown dependency");
                format!("Task {task_id} referenced unknown dependency {dep}; it was removed")
            })
            .collect()
    }

    fn extract_tasks(&self, requirements: &Requirements) -> (Vec<TaskPlan>, HashSet<String>) {
        let mut declared_durations = HashSet::new();
        let tasks = if let Some(specs) = &requirements.tasks {
            specs
                .iter()
                .enumerate()
                .map(|(i, spec)| {
                    let plan = plan_from_spec(spec, i, "generic", format!("Task {}", i + 1));
                    if spec.estimated_duration.is_some() {
                        declared_durations.insert(plan.task_id.clone());
                    }
                    plan
                })
                .collect()
        } else if let Some(goals) = &requirements.goals {
            goals
                .iter()
                .enumerate()
                .map(|(i, goal)| {
                    let mut plan = TaskPlan::new("generic", format!("Goal {}", i + 1));
                    plan.description.clone_from(goal);
                    plan.parameters
                        .insert("goal".into(), serde_json::Value::String(goal.clone()));
                    plan
                })
                .collect()
        } else if let Some(commands) = &requirements.commands {
            commands
                .iter()
                .enumerate()
                .map(|(i, command)| match command {
                    CommandSpec::Shell(cmd) => {
                        let mut plan = TaskPlan::new("shell", format!("Command {}", i + 1));
                        plan.description = format!("Execute: {cmd}");
                        plan.parameters
                            .insert("command".into(), serde_json::Value::String(cmd.clone()));
                        plan
                    }
                    CommandSpec::Structured(spec) => {
                        let plan =
                            plan_from_spec(spec, i, "shell", format!("Command {}", i + 1));
                        if spec.estimated_duration.is_some() {
                            declared_durations.insert(plan.task_id.clone());
                        }
                        plan
                    }
                })
                .collect()
        } else {
            let mut plan = TaskPlan::new(
                "generic",
                requirements
                    .name
                    .clone()
                    .unwrap_or_else(|| "Generic Task".to_string()),
            );
            plan.description = requirements
                .description
                .clone()
                .unwrap_or_else(|| "Generated generic task".to_string());
            plan.parameters.clone_from(&requirements.parameters);
            plan.priority = requirements.priority.unwrap_or_default();
            vec![plan]
        };
        (tasks, declared_durations)
    }

    fn shape_dependencies(&self, tasks: &mut [TaskPlan], strategy: PlanningStrategy) {
        match strategy {
            PlanningStrategy::Sequential => {
                let ids: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
                for (i, task) in tasks.iter_mut().enumerate() {
                    task.dependencies = if i == 0 {
                        Vec::new()
                    } else {
                        vec![ids[i - 1].clone()]
                    };
                }
            }
            PlanningStrategy::Parallel => {
                for task in tasks.iter_mut() {
                    task.dependencies.clear();
                }
            }
            PlanningStrategy::Optimized => {
                let mut last_of_type: HashMap<String, String> = HashMap::new();
                for task in tasks.iter_mut() {
                    task.dependencies = last_of_type
                        .insert(task.task_type.clone(), task.task_id.clone())
                        .into_iter()
                        .collect();
                }
            }
            PlanningStrategy::Custom => {}
        }
    }

    fn total_time(&self, tasks: &[TaskPlan], strategy: PlanningStrategy) -> f64 {
        if tasks.is_empty() {
            return 0.0;
        }
        match strategy {
            PlanningStrategy::Parallel => tasks
                .iter()
                .map(|t| t.estimated_duration)
                .fold(0.0, f64::max),
            PlanningStrategy::Sequential => tasks.iter().map(|t| t.estimated_duration).sum(),
            PlanningStrategy::Optimized | PlanningStrategy::Custom => graph::makespan(tasks),
        }
    }

    fn confidence(&self, tasks: &[TaskPlan]) -> f64 {
        let mut confidence = 0.8;
        if tasks.len() > 10 {
            confidence -= 0.1;
        }
        let complex = tasks.iter().filter(|t| t.dependencies.len() > 3).count();
        confidence -= complex as f64 * 0.05;
        if !tasks.is_empty() && tasks.iter().all(|t| t.task_type == "generic") {
            confidence += 0.1;
        }
        confidence.clamp(0.1, 1.0)
    }

    fn plan_warnings(&self, tasks: &[TaskPlan], constraints: &PlanningConstraints) -> Vec<String> {
        let mut warnings = Vec::new();

        let long = tasks
            .iter()
            .filter(|t| t.estimated_duration > self.config.long_task_threshold_secs)
            .count();
        if long > 0 {
            warnings.push(format!("{long} tasks have very long estimated durations"));
        }

        let widest = tasks.iter().map(|t| t.dependencies.len()).max().unwrap_or(0);
        if widest > 5 {
            warnings.push(format!("Maximum dependency fan-in is {widest}"));
        }

        if let Some(max_time) = constraints.max_time {
            let total: f64 = tasks.iter().map(|t| t.estimated_duration).sum();
            if total > max_time {
                warnings.push(format!(
                    "Total estimated time ({total}s) exceeds constraint ({max_time}s)"
                ));
            }
        }
        warnings
    }

    fn remember(&self, result: &PlanningResult) {
        let mut history = self.history.lock();
        history.push_back(result.clone());
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }
}

fn plan_from_spec(spec: &TaskSpec, index: usize, default_type: &str, default_name: String) -> TaskPlan {
    let mut plan = TaskPlan::new(
        spec.task_type.clone().unwrap_or_else(|| default_type.to_string()),
        spec.name.clone().unwrap_or(default_name),
    );
    if let Some(id) = &spec.task_id {
        plan.task_id.clone_from(id);
    }
    debug!(index, task_id = %plan.task_id, "Planning declared task");
    plan.description = spec.description.clone().unwrap_or_default();
    plan.parameters.clone_from(&spec.parameters);
    plan.priority = spec.priority.unwrap_or_default();
    plan.estimated_duration = spec.estimated_duration.unwrap_or(0.0);
    plan.required_capabilities.clone_from(&spec.required_capabilities);
    plan.required_tools.clone_from(&spec.required_tools);
    plan.dependencies.clone_from(&spec.dependencies);
    plan.tags.clone_from(&spec.tags);
    plan.max_retries = spec.max_retries;
    plan.timeout_seconds = spec.timeout_seconds;
    plan
}

#[async_trait]
impl Planner for SimplePlanner {
    async fn create_plan(
        &self,
        requirements: &Requirements,
        constraints: &PlanningConstraints,
    ) -> TaskflowResult<PlanningResult> {
        let (mut tasks, declared_durations) = self.extract_tasks(requirements);
        let strategy = self.select_strategy(requirements);
        self.shape_dependencies(&mut tasks, strategy);
        let mut warnings = self.resolve_dependencies(&mut tasks);

        for task in tasks.iter_mut() {
            if !declared_durations.contains(&task.task_id) {
                task.estimated_duration = self.estimate_task_duration(task);
            }
        }

        let estimated_total_time = self.total_time(&tasks, strategy);
        let mut confidence = self.confidence(&tasks);
        warnings.extend(self.plan_warnings(&tasks, constraints));
        let critical_path = graph::critical_path(&tasks);

        let mut metadata = HashMap::new();
        metadata.insert("planner".to_string(), serde_json::json!(self.planner_id));
        metadata.insert(
            "requirements".to_string(),
            serde_json::to_value(requirements)?,
        );
        if let Some(max_time) = constraints.max_time {
            metadata.insert("max_time".to_string(), serde_json::json!(max_time));
        }

        let mut result = PlanningResult {
            plan_id: Uuid::new_v4().to_string(),
            tasks,
            strategy,
            estimated_total_time,
            confidence,
            warnings,
            critical_path,
            metadata,
            created_at: Utc::now(),
        };

        let errors = self.validate_plan(&result);
        if !errors.is_empty() {
            warn!(plan_id = %result.plan_id, errors = errors.len(), "Plan failed validation");
            confidence *= 0.7;
            result.confidence = confidence;
            result.warnings.extend(errors);
        }

        info!(
            plan_id = %result.plan_id,
            tasks = result.tasks.len(),
            strategy = %strategy,
            estimated_total_time = result.estimated_total_time,
            confidence = result.confidence,
            "Plan created"
        );
        self.remember(&result);
        Ok(result)
    }

    fn validate_plan(&self, plan: &PlanningResult) -> Vec<String> {
        let mut errors = Vec::new();
        if plan.tasks.is_empty() {
            errors.push("Plan contains no tasks".to_string());
            return errors;
        }

        let cycle = graph::detect_circular_dependencies(&plan.tasks);
        if !cycle.is_empty() {
            errors.push(format!(
                "Circular dependency detected between tasks: {}",
                cycle.join(", ")
            ));
        }

        let mut seen = HashSet::new();
        for task in &plan.tasks {
            if !seen.insert(task.task_id.as_str()) {
                errors.push(format!("Duplicate task id {}", task.task_id));
            }
            if task.task_type.is_empty() {
                errors.push(format!("Task {} has no task_type", task.task_id));
            }
            if task.name.is_empty() {
                errors.push(format!("Task {} has no name", task.task_id));
            }
        }

        for (task_id, dep) in graph::dangling_dependencies(&plan.tasks) {
            errors.push(format!("Task {task_id} has invalid dependency {dep}"));
        }
        errors
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn spec(id: &str, task_type: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            task_id: Some(id.to_string()),
            task_type: Some(task_type.to_string()),
            name: Some(id.to_uppercase()),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..TaskSpec::default()
        }
    }

    async fn plan(requirements: Requirements) -> PlanningResult {
        SimplePlanner::default()
            .create_plan(&requirements, &PlanningConstraints::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sequential_chains_tasks() {
        let result = plan(
            Requirements::from_tasks(vec![
                spec("a", "shell", &[]),
                spec("b", "shell", &[]),
                spec("c", "shell", &[]),
            ])
            .with_strategy(PlanningStrategy::Sequential),
        )
        .await;
        let deps: Vec<_> = result.tasks.iter().map(|t| t.dependencies.clone()).collect();
        assert_eq!(deps, vec![vec![], vec!["a".to_string()], vec!["b".to_string()]]);
        assert_eq!(result.estimated_total_time, 180.0);
        assert_eq!(result.critical_path, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_parallel_clears_dependencies() {
        let mut requirements =
            Requirements::from_tasks(vec![spec("a", "http", &[]), spec("b", "shell", &["a"])]);
        requirements.parallel = true;
        let result = plan(requirements).await;
        assert_eq!(result.strategy, PlanningStrategy::Parallel);
        assert!(result.tasks.iter().all(|t| t.dependencies.is_empty()));
        assert_eq!(result.estimated_total_time, 60.0);
    }

    #[tokio::test]
    async fn test_optimized_chains_within_type() {
        let mut requirements = Requirements::from_tasks(vec![
            spec("h1", "http", &[]),
            spec("s1", "shell", &[]),
            spec("h2", "http", &[]),
            spec("s2", "shell", &[]),
        ]);
        requirements.optimize = true;
        let result = plan(requirements).await;
        let by_id: HashMap<_, _> = result
            .tasks
            .iter()
            .map(|t| (t.task_id.as_str(), t.dependencies.clone()))
            .collect();
        assert!(by_id["h1"].is_empty());
        assert!(by_id["s1"].is_empty());
        assert_eq!(by_id["h2"], vec!["h1".to_string()]);
        assert_eq!(by_id["s2"], vec!["s1".to_string()]);
        // Two independent chains: 10+10 and 60+60.
        assert_eq!(result.estimated_total_time, 120.0);
    }

    #[tokio::test]
    async fn test_declared_dependencies_select_custom() {
        let result = plan(Requirements::from_tasks(vec![
            spec("a", "http", &[]),
            spec("b", "http", &[]),
            spec("c", "http", &["a", "b"]),
        ]))
        .await;
        assert_eq!(result.strategy, PlanningStrategy::Custom);
        assert_eq!(result.tasks[2].dependencies, vec!["a", "b"]);
        assert_eq!(result.estimated_total_time, 20.0);
    }

    #[tokio::test]
    async fn test_cycle_reduces_confidence() {
        let result = plan(Requirements::from_tasks(vec![
            spec("a", "http", &["c"]),
            spec("b", "http", &["a"]),
            spec("c", "http", &["b"]),
        ]))
        .await;
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("Circular dependency")));
        assert!((result.confidence - 0.8 * 0.7).abs() < 1e-9);
        assert!(result.confidence > 0.0);
    }

    #[tokio::test]
    async fn test_unknown_dependencies_pruned_with_warning() {
        let result = plan(Requirements::from_tasks(vec![
            spec("a", "http", &["ghost"]),
            spec("b", "http", &["a"]),
        ]))
        .await;
        assert!(result.tasks[0].dependencies.is_empty());
        assert!(result.warnings.iter().any(|w| w.contains("ghost")));
        // Pruning fixes the plan, so validation passes.
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_goals_and_commands() {
        let goals = plan(Requirements::from_goals(["find docs", "summarize"])).await;
        assert_eq!(goals.tasks.len(), 2);
        assert_eq!(goals.tasks[0].task_type, "generic");
        assert_eq!(goals.tasks[1].parameters["goal"], "summarize");
        assert!((goals.confidence - 0.9).abs() < 1e-9);

        let commands = plan(Requirements::from_commands(["echo hi"])).await;
        assert_eq!(commands.tasks[0].task_type, "shell");
        assert_eq!(commands.tasks[0].parameters["command"], "echo hi");
    }

    #[tokio::test]
    async fn test_generic_fallback() {
        let requirements = Requirements {
            name: Some("report".into()),
            priority: Some(TaskPriority::High),
            ..Requirements::default()
        };
        let result = plan(requirements).await;
        assert_eq!(result.tasks.len(), 1);
        assert_eq!(result.tasks[0].name, "report");
        assert_eq!(result.tasks[0].priority, TaskPriority::High);
    }

    #[tokio::test]
    async fn test_empty_task_list_is_flagged() {
        let result = plan(Requirements::from_tasks(vec![])).await;
        assert!(result.tasks.is_empty());
        assert!(result.warnings.iter().any(|w| w == "Plan contains no tasks"));
        assert_eq!(result.estimated_total_time, 0.0);
    }

    #[test]
    fn test_duration_heuristics() {
        let planner = SimplePlanner::default();
        let mut task = TaskPlan::new("http", "x");
        assert_eq!(planner.estimate_task_duration(&task), 10.0);
        for i in 0..6 {
            task.parameters.insert(format!("p{i}"), serde_json::json!(i));
        }
        task.dependencies = vec!["a".into(), "b".into(), "c".into()];
        assert!((planner.estimate_task_duration(&task) - 10.0 * 1.2 * 1.1).abs() < 1e-9);
        assert_eq!(planner.estimate_task_duration(&TaskPlan::new("mystery", "m")), 60.0);
    }

    #[tokio::test]
    async fn test_max_time_constraint_warns() {
        let planner = SimplePlanner::default();
        let result = planner
            .create_plan(
                &Requirements::from_commands(["a", "b"]),
                &PlanningConstraints {
                    max_time: Some(90.0),
                },
            )
            .await
            .unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("exceeds constraint")));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let planner = SimplePlanner::new(PlannerConfig {
            max_history: 2,
            ..PlannerConfig::default()
        });
        for _ in 0..3 {
            planner
                .create_plan(&Requirements::default(), &PlanningConstraints::default())
                .await
                .unwrap();
        }
        assert_eq!(planner.planning_history(10).len(), 2);
        assert_eq!(planner.planning_history(1).len(), 1);
    }

    #[tokio::test]
    async fn test_declared_duration_kept() {
        let mut declared = spec("a", "shell", &[]);
        declared.estimated_duration = Some(5.0);
        let result = plan(Requirements::from_tasks(vec![declared])).await;
        assert_eq!(result.tasks[0].estimated_duration, 5.0);
    }

    #[test]
    fn test_requirements_deserialize_mixed_commands() {
        let req: Requirements = serde_json::from_str(
            r#"{"commands": ["ls", {"type": "python", "name": "script", "parameters": {"code": "1"}}]}"#,
        )
        .unwrap();
        let commands = req.commands.unwrap();
        assert!(matches!(commands[0], CommandSpec::Shell(_)));
        match &commands[1] {
            CommandSpec::Structured(spec) => assert_eq!(spec.task_type.as_deref(), Some("python")),
            CommandSpec::Shell(_) => panic!("expected structured command"),
        }
    }
}
