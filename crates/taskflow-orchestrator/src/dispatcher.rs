use crate::config::DispatcherConfig;
use crate::registry::ExecutorRegistry;
use crate::types::{
    DispatchContext, DispatchResult, DispatchStrategy, ExecutorAssignment, ExecutorInfo, TaskPlan,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use taskflow_core::{TaskflowError, TaskflowResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maps batches of task plans onto executors.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Assign every task in `tasks`. Tasks without a suitable executor are
    /// reported in `unassigned_tasks`; that is never an error.
    async fn dispatch(
        &self,
        tasks: &[TaskPlan],
        ctx: &DispatchContext,
    ) -> TaskflowResult<DispatchResult>;

    /// Like [`dispatch`](Self::dispatch), but only for tasks whose
    /// dependencies are all in `completed`. The rest are returned in
    /// `deferred_tasks`.
    async fn dispatch_ready(
        &self,
        tasks: &[TaskPlan],
        completed: &HashSet<String>,
        ctx: &DispatchContext,
    ) -> TaskflowResult<DispatchResult> {
        let (ready, deferred): (Vec<TaskPlan>, Vec<TaskPlan>) =
            tasks.iter().cloned().partition(|t| t.is_ready(completed));
        let mut result = self.dispatch(&ready, ctx).await?;
        result.deferred_tasks = deferred.into_iter().map(|t| t.task_id).collect();
        Ok(result)
    }

    /// Move an existing assignment to another executor. Returns `None` when
    /// no alternative exists. On success one unit of load moves from the
    /// old executor to the new one.
    async fn reassign_task(
        &self,
        assignment_id: &str,
        reason: &str,
    ) -> TaskflowResult<Option<ExecutorAssignment>>;
}

/// Aggregates over the dispatch history.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStatistics {
    pub total_dispatches: usize,
    pub average_confidence: f64,
    pub strategy_distribution: BTreeMap<String, usize>,
    /// Share of dispatches that assigned at least 80% of their tasks.
    pub success_rate: f64,
    pub total_reassignments: usize,
}

struct Candidate<'a> {
    info: &'a ExecutorInfo,
    load: u32,
    suitability: f64,
}

fn pick_max(candidates: &[Candidate<'_>], key: impl Fn(&Candidate<'_>) -> f64) -> usize {
    let mut best = 0;
    for (i, c) in candidates.iter().enumerate().skip(1) {
        if key(c) > key(&candidates[best]) {
            best = i;
        }
    }
    best
}

/// Registry-backed dispatcher with strategy selection and suitability
/// scoring.
pub struct TaskDispatcher {
    dispatcher_id: String,
    registry: Arc<ExecutorRegistry>,
    config: DispatcherConfig,
    history: Mutex<VecDeque<DispatchResult>>,
    reassignments: Mutex<VecDeque<ExecutorAssignment>>,
}

impl TaskDispatcher {
    pub fn new(registry: Arc<ExecutorRegistry>, config: DispatcherConfig) -> Self {
        Self {
            dispatcher_id: format!("dispatcher-{}", Uuid::new_v4()),
            registry,
            config,
            history: Mutex::new(VecDeque::new()),
            reassignments: Mutex::new(VecDeque::new()),
        }
    }

    pub fn dispatcher_id(&self) -> &str {
        &self.dispatcher_id
    }

    /// Strategy precedence: elevated priority or a deadline, then heavy load
    /// (more than two tasks per available executor), then declared
    /// dependencies, then configured optimization, then round-robin.
    pub fn select_dispatch_strategy(
        &self,
        tasks: &[TaskPlan],
        available_executors: usize,
        ctx: &DispatchContext,
    ) -> DispatchStrategy {
        if ctx.deadline.is_some() || tasks.iter().any(|t| t.priority.is_elevated()) {
            DispatchStrategy::PriorityFirst
        } else if tasks.len() > 2 * available_executors {
            DispatchStrategy::LoadBalance
        } else if tasks.iter().any(|t| !t.dependencies.is_empty()) {
            DispatchStrategy::CapabilityMatch
        } else if self.config.use_optimization {
            DispatchStrategy::OptimalAssignment
        } else {
            DispatchStrategy::RoundRobin
        }
    }

    /// `0.4·capability_match + 0.2·headroom + 0.2·performance
    /// + 0.1·type_preference + 0.1·type_match`, evaluated at `load`.
    pub fn calculate_suitability(&self, task: &TaskPlan, info: &ExecutorInfo, load: u32) -> f64 {
        let capability_match = if task.required_capabilities.is_empty() {
            1.0
        } else {
            let matched = task
                .required_capabilities
                .iter()
                .filter(|c| info.capabilities.contains(*c))
                .count();
            matched as f64 / task.required_capabilities.len() as f64
        };
        let preferred = info.prefers(&task.task_type);
        let type_preference = if preferred { 1.0 } else { 0.5 };
        let type_match = if preferred || info.executor_type == task.task_type {
            1.0
        } else {
            0.5
        };
        0.4 * capability_match
            + 0.2 * info.headroom_at(load)
            + 0.2 * info.performance_score
            + 0.1 * type_preference
            + 0.1 * type_match
    }

    fn accepts_type(&self, info: &ExecutorInfo, task_type: &str) -> bool {
        info.prefers(task_type) || (self.config.allow_generalists && info.is_generalist())
    }

    fn candidates<'a>(
        &self,
        task: &TaskPlan,
        executors: &'a [ExecutorInfo],
        loads: &HashMap<String, u32>,
    ) -> Vec<Candidate<'a>> {
        executors
            .iter()
            .filter_map(|info| {
                let load = loads
                    .get(&info.executor_id)
                    .copied()
                    .unwrap_or(info.current_load);
                if load >= info.max_capacity || !self.accepts_type(info, &task.task_type) {
                    return None;
                }
                let suitability = self.calculate_suitability(task, info, load);
                (suitability > self.config.min_suitability).then_some(Candidate {
                    info,
                    load,
                    suitability,
                })
            })
            .collect()
    }

    /// Index of the chosen candidate. Ties keep the earliest candidate.
    fn select(strategy: DispatchStrategy, candidates: &[Candidate<'_>]) -> usize {
        match strategy {
            DispatchStrategy::CapabilityMatch => pick_max(candidates, |c| c.suitability),
            DispatchStrategy::LoadBalance => pick_max(candidates, |c| -f64::from(c.load)),
            DispatchStrategy::PriorityFirst => pick_max(candidates, |c| c.info.performance_score),
            DispatchStrategy::RoundRobin => 0,
            DispatchStrategy::OptimalAssignment => pick_max(candidates, |c| {
                0.6 * c.suitability
                    + 0.2 * c.info.performance_score
                    + 0.2 * c.info.headroom_at(c.load)
            }),
        }
    }

    /// Check a batch against the task list and fresh registry state.
    /// Returns one message per violation.
    pub fn validate_assignments(
        &self,
        assignments: &[ExecutorAssignment],
        tasks: &[TaskPlan],
    ) -> Vec<String> {
        let mut errors = Vec::new();
        let known_tasks: HashSet<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        let mut seen = HashSet::new();
        let mut per_executor: BTreeMap<&str, u32> = BTreeMap::new();

        for assignment in assignments {
            if !known_tasks.contains(assignment.task_id.as_str()) {
                errors.push(format!(
                    "Assignment {} references unknown task {}",
                    assignment.assignment_id, assignment.task_id
                ));
            }
            if !seen.insert(assignment.task_id.as_str()) {
                errors.push(format!("Task {} is assigned more than once", assignment.task_id));
            }
            *per_executor.entry(assignment.executor_id.as_str()).or_insert(0) += 1;
        }

        for (executor_id, count) in per_executor {
            match self.registry.info(executor_id) {
                None => errors.push(format!("Assignment references unknown executor {executor_id}")),
                Some(info) if info.current_load + count > info.max_capacity => {
                    errors.push(format!(
                        "Executor {executor_id} would exceed capacity ({}/{})",
                        info.current_load + count,
                        info.max_capacity
                    ));
                }
                Some(_) => {}
            }
        }
        errors
    }

    /// 0.0 when nothing could be assigned; otherwise 0.8, minus half the
    /// unassigned share, plus a fifth of the mean assignment confidence's
    /// distance from 0.5, clamped to `[0.1, 1.0]`.
    fn confidence(assignments: &[ExecutorAssignment], unassigned: usize) -> f64 {
        if assignments.is_empty() && unassigned > 0 {
            return 0.0;
        }
        let mut confidence = 0.8;
        let total = assignments.len() + unassigned;
        if unassigned > 0 {
            confidence -= unassigned as f64 / total as f64 * 0.5;
        }
        if !assignments.is_empty() {
            let mean =
                assignments.iter().map(|a| a.confidence).sum::<f64>() / assignments.len() as f64;
            confidence += (mean - 0.5) * 0.2;
        }
        confidence.clamp(0.1, 1.0)
    }

    fn bottleneck_time(assignments: &[ExecutorAssignment], tasks: &[TaskPlan]) -> f64 {
        let durations: HashMap<&str, f64> = tasks
            .iter()
            .map(|t| (t.task_id.as_str(), t.estimated_duration))
            .collect();
        let mut per_executor: HashMap<&str, f64> = HashMap::new();
        for a in assignments {
            *per_executor.entry(a.executor_id.as_str()).or_insert(0.0) +=
                durations.get(a.task_id.as_str()).copied().unwrap_or(0.0);
        }
        per_executor.values().copied().fold(0.0, f64::max)
    }

    fn remember(&self, result: &DispatchResult) {
        let mut history = self.history.lock();
        history.push_back(result.clone());
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }

    /// Most recent dispatches, newest last.
    pub fn dispatch_history(&self, limit: usize) -> Vec<DispatchResult> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn dispatch_statistics(&self) -> DispatchStatistics {
        let history = self.history.lock();
        let total = history.len();
        let mut strategy_distribution = BTreeMap::new();
        let mut confidence_sum = 0.0;
        let mut successes = 0;
        for result in history.iter() {
            *strategy_distribution
                .entry(result.strategy.to_string())
                .or_insert(0) += 1;
            confidence_sum += result.confidence;
            let attempted = result.assignments.len() + result.unassigned_tasks.len();
            if attempted == 0 || result.assignments.len() as f64 >= 0.8 * attempted as f64 {
                successes += 1;
            }
        }
        DispatchStatistics {
            total_dispatches: total,
            average_confidence: if total == 0 { 0.0 } else { confidence_sum / total as f64 },
            strategy_distribution,
            success_rate: if total == 0 { 0.0 } else { successes as f64 / total as f64 },
            total_reassignments: self.reassignments.lock().len(),
        }
    }

    fn find_assignment(&self, assignment_id: &str) -> Option<ExecutorAssignment> {
        if let Some(found) = self
            .reassignments
            .lock()
            .iter()
            .rev()
            .find(|a| a.assignment_id == assignment_id)
        {
            return Some(found.clone());
        }
        self.history
            .lock()
            .iter()
            .rev()
            .flat_map(|r| r.assignments.iter())
            .find(|a| a.assignment_id == assignment_id)
            .cloned()
    }
}

#[async_trait]
impl Dispatcher for TaskDispatcher {
    async fn dispatch(
        &self,
        tasks: &[TaskPlan],
        ctx: &DispatchContext,
    ) -> TaskflowResult<DispatchResult> {
        let dispatch_id = Uuid::new_v4().to_string();
        let available = self.registry.get_available(&[]);
        let strategy = self.select_dispatch_strategy(tasks, available.len(), ctx);

        if available.is_empty() && !tasks.is_empty() {
            warn!(dispatch_id = %dispatch_id, tasks = tasks.len(), "No executors available");
            let result = DispatchResult {
                dispatch_id,
                plan_id: ctx.plan_id.clone(),
                assignments: Vec::new(),
                unassigned_tasks: tasks.iter().map(|t| t.task_id.clone()).collect(),
                deferred_tasks: Vec::new(),
                strategy,
                strategy_reason: strategy.reason().to_string(),
                confidence: 0.0,
                warnings: vec!["No executors available for task assignment".to_string()],
                total_estimated_time: 0.0,
                created_at: Utc::now(),
            };
            self.remember(&result);
            return Ok(result);
        }

        let mut ordered: Vec<&TaskPlan> = tasks.iter().collect();
        ordered.sort_by_key(|t| (t.dependencies.len(), Reverse(t.priority)));

        let mut loads: HashMap<String, u32> = available
            .iter()
            .map(|e| (e.executor_id.clone(), e.current_load))
            .collect();
        let mut assignments = Vec::new();
        let mut unassigned = Vec::new();
        let now = Utc::now();

        for task in ordered {
            let candidates = self.candidates(task, &available, &loads);
            if candidates.is_empty() {
                debug!(task_id = %task.task_id, task_type = %task.task_type, "No candidate executor");
                unassigned.push(task.task_id.clone());
                continue;
            }
            let chosen = Self::select(strategy, &candidates);
            let mut backups: Vec<&Candidate<'_>> = candidates
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != chosen)
                .map(|(_, c)| c)
                .collect();
            backups.sort_by(|a, b| b.suitability.total_cmp(&a.suitability));

            let selected = &candidates[chosen];
            let executor_id = selected.info.executor_id.clone();
            *loads.entry(executor_id.clone()).or_insert(0) += 1;
            assignments.push(ExecutorAssignment {
                assignment_id: Uuid::new_v4().to_string(),
                task_id: task.task_id.clone(),
                executor_id,
                task_type: task.task_type.clone(),
                required_capabilities: task.required_capabilities.clone(),
                assigned_at: now,
                estimated_completion: now
                    + Duration::milliseconds((task.estimated_duration * 1000.0) as i64),
                priority: task.priority,
                confidence: selected.suitability.clamp(0.0, 1.0),
                backup_executors: backups
                    .iter()
                    .take(2)
                    .map(|c| c.info.executor_id.clone())
                    .collect(),
                strategy,
                reassigned_from: None,
                reason: None,
            });
        }

        let mut warnings = Vec::new();
        if !unassigned.is_empty() {
            warnings.push(format!(
                "{} tasks could not be assigned to executors",
                unassigned.len()
            ));
        }
        let mut confidence = Self::confidence(&assignments, unassigned.len());
        let validation = self.validate_assignments(&assignments, tasks);
        if !validation.is_empty() {
            warn!(dispatch_id = %dispatch_id, errors = validation.len(), "Assignment validation failed");
            confidence *= 0.8;
            warnings.extend(validation);
        }

        let result = DispatchResult {
            dispatch_id,
            plan_id: ctx.plan_id.clone(),
            total_estimated_time: Self::bottleneck_time(&assignments, tasks),
            assignments,
            unassigned_tasks: unassigned,
            deferred_tasks: Vec::new(),
            strategy,
            strategy_reason: strategy.reason().to_string(),
            confidence,
            warnings,
            created_at: Utc::now(),
        };
        info!(
            dispatch_id = %result.dispatch_id,
            strategy = %strategy,
            assigned = result.assignments.len(),
            unassigned = result.unassigned_tasks.len(),
            confidence = result.confidence,
            "Dispatch complete"
        );
        self.remember(&result);
        Ok(result)
    }

    async fn reassign_task(
        &self,
        assignment_id: &str,
        reason: &str,
    ) -> TaskflowResult<Option<ExecutorAssignment>> {
        let original = self.find_assignment(assignment_id).ok_or_else(|| {
            TaskflowError::Dispatch(format!("Unknown assignment: {assignment_id}"))
        })?;

        let mut best: Option<(ExecutorInfo, f64)> = None;
        for info in self.registry.get_available(&original.required_capabilities) {
            if info.executor_id == original.executor_id
                || !info.has_capacity()
                || !self.accepts_type(&info, &original.task_type)
            {
                continue;
            }
            let fresh = if original.backup_executors.contains(&info.executor_id) {
                0.0
            } else {
                0.2
            };
            let score = 0.5 * info.performance_score + 0.3 * info.load_headroom() + fresh;
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((info, score));
            }
        }

        let Some((target, _)) = best else {
            warn!(assignment_id, task_id = %original.task_id, "No alternative executor for reassignment");
            return Ok(None);
        };

        self.registry.acquire(&target.executor_id)?;
        if self
            .registry
            .info(&original.executor_id)
            .is_some_and(|old| old.current_load > 0)
        {
            self.registry.release(&original.executor_id)?;
        }

        let now = Utc::now();
        let remaining = original.estimated_completion - original.assigned_at;
        let assignment = ExecutorAssignment {
            assignment_id: Uuid::new_v4().to_string(),
            task_id: original.task_id.clone(),
            executor_id: target.executor_id.clone(),
            task_type: original.task_type.clone(),
            required_capabilities: original.required_capabilities.clone(),
            assigned_at: now,
            estimated_completion: now + remaining,
            priority: original.priority,
            confidence: original.confidence * 0.9,
            backup_executors: original
                .backup_executors
                .iter()
                .filter(|id| **id != target.executor_id)
                .cloned()
                .collect(),
            strategy: original.strategy,
            reassigned_from: Some(original.executor_id.clone()),
            reason: Some(reason.to_string()),
        };
        info!(
            task_id = %assignment.task_id,
            from = %original.executor_id,
            to = %assignment.executor_id,
            reason,
            "Task reassigned"
        );

        let mut reassignments = self.reassignments.lock();
        reassignments.push_back(assignment.clone());
        while reassignments.len() > self.config.max_history {
            reassignments.pop_front();
        }
        Ok(Some(assignment))
    }
}
