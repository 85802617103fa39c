use crate::config::WorkflowConfig;
use crate::dispatcher::Dispatcher;
use crate::executor::Executor;
use crate::planner::{Planner, PlanningConstraints, Requirements};
use crate::registry::ExecutorRegistry;
use crate::task_queue::TaskQueue;
use crate::types::{
    DispatchContext, DispatchResult, ExecutorAssignment, PlanningResult, TaskPlan, WorkflowResult,
    WorkflowState, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use taskflow_core::{TaskState, TaskflowError, TaskflowResult};
use taskflow_events::{Event, EventBus, EventPriority, EventType};
use taskflow_storage::Storage;
use tokio::sync::{Notify, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

struct Control {
    state: WorkflowState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// What the execute phase produced, for composition.
struct RunRecord {
    plan: PlanningResult,
    dispatches: Vec<DispatchResult>,
}

/// Drives one run: plan, dispatch in waves, execute, compose.
///
/// Each `Workflow` runs at most once. [`pause`](Workflow::pause),
/// [`resume`](Workflow::resume) and [`cancel`](Workflow::cancel) may be called
/// from other tasks while [`execute`](Workflow::execute) is in flight; they
/// take effect before the next assignment.
pub struct Workflow {
    workflow_id: String,
    planner: Arc<dyn Planner>,
    dispatcher: Arc<dyn Dispatcher>,
    registry: Arc<ExecutorRegistry>,
    events: EventBus,
    storage: Option<Arc<dyn Storage>>,
    config: WorkflowConfig,
    control: Mutex<Control>,
    wakeup: Notify,
    queue: RwLock<TaskQueue>,
}

impl Workflow {
    pub fn new(
        planner: Arc<dyn Planner>,
        dispatcher: Arc<dyn Dispatcher>,
        registry: Arc<ExecutorRegistry>,
        events: EventBus,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            workflow_id: Uuid::new_v4().to_string(),
            planner,
            dispatcher,
            registry,
            events,
            storage: None,
            config,
            control: Mutex::new(Control {
                state: WorkflowState::Pending,
                started_at: None,
                finished_at: None,
            }),
            wakeup: Notify::new(),
            queue: RwLock::new(TaskQueue::new()),
        }
    }

    pub fn with_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = workflow_id.into();
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn state(&self) -> WorkflowState {
        self.control.lock().state
    }

    /// Run the whole pipeline. Failures of any phase come back as a
    /// `WorkflowResult` with `success == false`.
    pub async fn execute(
        &self,
        requirements: &Requirements,
        constraints: &PlanningConstraints,
    ) -> WorkflowResult {
        let start = Instant::now();
        {
            let mut control = self.control.lock();
            if control.state != WorkflowState::Pending {
                let state = control.state;
                drop(control);
                return self.failed_result(
                    start,
                    vec![format!("workflow {} is already {state}", self.workflow_id)],
                );
            }
            control.state = WorkflowState::Running;
            control.started_at = Some(Utc::now());
        }

        info!(workflow_id = %self.workflow_id, "Workflow: starting pipeline");
        self.emit(Event::workflow(EventType::WORKFLOW_STARTED, &self.workflow_id));

        let mut result = match self.run(requirements, constraints).await {
            Ok(record) => self.compose(record, start).await,
            Err(e) => {
                error!(workflow_id = %self.workflow_id, error = %e, "Workflow failed");
                self.cancel_remaining("workflow failed").await;
                self.failed_result(start, vec![e.to_string()])
            }
        };

        let final_state = {
            let mut control = self.control.lock();
            if control.state != WorkflowState::Cancelled {
                control.state = if result.success {
                    WorkflowState::Completed
                } else {
                    WorkflowState::Failed
                };
            }
            control.finished_at = Some(Utc::now());
            control.state
        };
        result
            .metadata
            .insert("state".into(), json!(final_state.to_string()));

        if self.config.persist_results {
            self.persist(&result).await;
        }

        let (event_type, priority) = if result.success {
            (EventType::WORKFLOW_COMPLETED, EventPriority::Normal)
        } else {
            (EventType::WORKFLOW_FAILED, EventPriority::High)
        };
        self.emit(
            Event::workflow(event_type, &self.workflow_id)
                .with_priority(priority)
                .with_data("success", result.success)
                .with_data("execution_time", result.execution_time)
                .with_data("errors", result.errors.len()),
        );
        info!(
            workflow_id = %self.workflow_id,
            success = result.success,
            execution_time = result.execution_time,
            "Workflow: pipeline complete"
        );
        result
    }

    /// Stop taking new assignments until [`resume`](Workflow::resume).
    /// Returns `false` unless the workflow was running.
    pub fn pause(&self) -> bool {
        {
            let mut control = self.control.lock();
            if control.state != WorkflowState::Running {
                return false;
            }
            control.state = WorkflowState::Paused;
        }
        info!(workflow_id = %self.workflow_id, "Workflow paused");
        self.emit(Event::workflow(EventType::WORKFLOW_PAUSED, &self.workflow_id));
        true
    }

    pub fn resume(&self) -> bool {
        {
            let mut control = self.control.lock();
            if control.state != WorkflowState::Paused {
                return false;
            }
            control.state = WorkflowState::Running;
        }
        self.wakeup.notify_waiters();
        info!(workflow_id = %self.workflow_id, "Workflow resumed");
        self.emit(Event::workflow(EventType::WORKFLOW_RESUMED, &self.workflow_id));
        true
    }

    /// Cancel the run. A task already handed to an executor finishes; nothing
    /// after it starts. Returns `false` if the workflow already finished.
    pub fn cancel(&self) -> bool {
        {
            let mut control = self.control.lock();
            if control.state.is_terminal() {
                return false;
            }
            control.state = WorkflowState::Cancelled;
        }
        self.wakeup.notify_waiters();
        warn!(workflow_id = %self.workflow_id, "Workflow cancelled");
        self.emit(
            Event::workflow(EventType::WORKFLOW_CANCELLED, &self.workflow_id)
                .with_priority(EventPriority::High),
        );
        true
    }

    pub async fn status(&self) -> WorkflowStatus {
        let (state, started_at, finished_at) = {
            let control = self.control.lock();
            (control.state, control.started_at, control.finished_at)
        };
        let queue = self.queue.read().await;
        WorkflowStatus {
            workflow_id: self.workflow_id.clone(),
            state,
            started_at,
            finished_at,
            total_tasks: queue.total_count(),
            pending_tasks: queue.pending_count(),
            running_tasks: queue.count_in(TaskState::Running),
            completed_tasks: queue.completed_count(),
            failed_tasks: queue.count_in(TaskState::Failed),
            cancelled_tasks: queue.count_in(TaskState::Cancelled),
        }
    }

    fn emit(&self, event: Event) {
        let event = event.with_correlation_id(self.workflow_id.clone());
        self.events.publish(event);
    }

    /// Wait out a pause. Returns `false` once the workflow is cancelled.
    async fn checkpoint(&self) -> bool {
        loop {
            let notified = self.wakeup.notified();
            let state = self.control.lock().state;
            match state {
                WorkflowState::Paused => notified.await,
                WorkflowState::Cancelled => return false,
                _ => return true,
            }
        }
    }

    async fn run(
        &self,
        requirements: &Requirements,
        constraints: &PlanningConstraints,
    ) -> TaskflowResult<RunRecord> {
        // Phase 1: plan
        let plan = self.planner.create_plan(requirements, constraints).await?;
        if plan.tasks.is_empty() {
            return Err(TaskflowError::Planning("plan contains no tasks".into()));
        }
        self.emit(
            Event::workflow(EventType::PLAN_CREATED, &self.workflow_id)
                .with_data("plan_id", plan.plan_id.clone())
                .with_data("tasks", plan.tasks.len())
                .with_data("strategy", plan.strategy.to_string())
                .with_data("confidence", plan.confidence),
        );
        info!(
            workflow_id = %self.workflow_id,
            plan_id = %plan.plan_id,
            tasks = plan.tasks.len(),
            strategy = %plan.strategy,
            "Workflow: plan complete"
        );

        {
            let mut queue = self.queue.write().await;
            for task_plan in &plan.tasks {
                let task = task_plan.to_task(
                    self.config.default_max_retries,
                    self.config.default_timeout_secs,
                );
                queue.add(task)?;
            }
            if queue.has_cycle() {
                return Err(TaskflowError::Planning(
                    "Dependency cycle detected in task graph".into(),
                ));
            }
        }
        for task_plan in &plan.tasks {
            self.emit(
                Event::task(EventType::TASK_CREATED, &task_plan.task_id)
                    .with_data("task_type", task_plan.task_type.clone()),
            );
        }

        // Phase 2: dispatch and execute in waves
        let plans: HashMap<&str, &TaskPlan> = plan
            .tasks
            .iter()
            .map(|t| (t.task_id.as_str(), t))
            .collect();
        let ctx = DispatchContext::for_plan(plan.plan_id.clone());
        let mut dispatches = Vec::new();

        while self.checkpoint().await {
            self.cancel_unreachable().await;

            let (pending, completed) = {
                let queue = self.queue.read().await;
                if queue.is_done() {
                    break;
                }
                let pending: Vec<TaskPlan> = queue
                    .pending()
                    .iter()
                    .filter_map(|t| plans.get(t.task_id.as_str()).map(|p| (*p).clone()))
                    .collect();
                (pending, queue.completed_ids().clone())
            };
            if pending.is_empty() {
                break;
            }

            let dispatch = self
                .dispatcher
                .dispatch_ready(&pending, &completed, &ctx)
                .await?;
            self.emit(
                Event::workflow(EventType::DISPATCH_COMPLETED, &self.workflow_id)
                    .with_data("dispatch_id", dispatch.dispatch_id.clone())
                    .with_data("strategy", dispatch.strategy.to_string())
                    .with_data("assigned", dispatch.assignments.len())
                    .with_data("unassigned", dispatch.unassigned_tasks.len())
                    .with_data("deferred", dispatch.deferred_tasks.len()),
            );

            if dispatch.assignments.is_empty() {
                if dispatch.unassigned_tasks.is_empty() {
                    // Everything left waits on tasks that will never finish.
                    for task_id in &dispatch.deferred_tasks {
                        self.cancel_task(task_id, "dependencies can never complete")
                            .await;
                    }
                } else {
                    for task_id in &dispatch.unassigned_tasks {
                        self.fail_task(task_id, "no suitable executor", false).await;
                    }
                }
            } else {
                for assignment in &dispatch.assignments {
                    if !self.checkpoint().await {
                        break;
                    }
                    self.run_assignment(assignment.clone()).await;
                }
            }
            dispatches.push(dispatch);
        }

        if self.state() == WorkflowState::Cancelled {
            self.cancel_remaining("workflow cancelled").await;
        }
        Ok(RunRecord { plan, dispatches })
    }

    /// Cancel pending tasks that wait on failed, cancelled or missing tasks,
    /// until none are left.
    async fn cancel_unreachable(&self) {
        loop {
            let unreachable = self.queue.read().await.unreachable();
            if unreachable.is_empty() {
                return;
            }
            for task_id in unreachable {
                self.cancel_task(&task_id, "a required dependency did not complete")
                    .await;
            }
        }
    }

    async fn cancel_remaining(&self, reason: &str) {
        let open: Vec<String> = self
            .queue
            .read()
            .await
            .all_tasks()
            .iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.task_id.clone())
            .collect();
        for task_id in open {
            self.cancel_task(&task_id, reason).await;
        }
    }

    async fn cancel_task(&self, task_id: &str, reason: &str) {
        let cancelled = self.queue.write().await.cancel(task_id, reason);
        match cancelled {
            Ok(()) => {
                info!(task_id, reason, "Task cancelled");
                self.emit(Event::task(EventType::TASK_CANCELLED, task_id).with_data("reason", reason));
            }
            Err(e) => warn!(task_id, error = %e, "Could not cancel task"),
        }
    }

    /// Record a task failure and announce either the retry or the terminal
    /// failure.
    async fn fail_task(&self, task_id: &str, error: &str, retry: bool) {
        let outcome = {
            let mut queue = self.queue.write().await;
            queue.fail(task_id, error, retry).map(|state| {
                let retry_count = queue.get(task_id).map_or(0, |t| t.retry_count);
                (state, retry_count)
            })
        };
        match outcome {
            Ok((TaskState::Pending, retry_count)) => {
                warn!(task_id, retry_count, error, "Task failed, will retry");
                self.emit(
                    Event::task(EventType::TASK_RETRYING, task_id)
                        .with_data("retry_count", retry_count)
                        .with_data("error", error),
                );
            }
            Ok((_, retry_count)) => {
                error!(task_id, retry_count, error, "Task failed");
                self.emit(
                    Event::task(EventType::TASK_FAILED, task_id)
                        .with_priority(EventPriority::High)
                        .with_data("retry_count", retry_count)
                        .with_data("error", error),
                );
            }
            Err(e) => warn!(task_id, error = %e, "Could not record task failure"),
        }
    }

    /// Take a unit of load on the assigned executor and resolve its handle.
    /// A catalog-only or unavailable executor triggers a reassignment, which
    /// moves the held load along with the task.
    async fn claim(
        &self,
        assignment: ExecutorAssignment,
    ) -> Option<(ExecutorAssignment, Arc<dyn Executor>)> {
        if let Err(e) = self.registry.acquire(&assignment.executor_id) {
            warn!(
                task_id = %assignment.task_id,
                executor_id = %assignment.executor_id,
                error = %e,
                "Executor refused the task"
            );
            return None;
        }
        if let Some(executor) = self
            .registry
            .executor(&assignment.executor_id)
            .filter(|e| e.is_available())
        {
            return Some((assignment, executor));
        }

        match self
            .dispatcher
            .reassign_task(&assignment.assignment_id, "executor unavailable")
            .await
        {
            Ok(Some(moved)) => match self.registry.executor(&moved.executor_id) {
                Some(executor) => Some((moved, executor)),
                None => {
                    self.release(&moved.executor_id);
                    None
                }
            },
            Ok(None) => {
                self.release(&assignment.executor_id);
                None
            }
            Err(e) => {
                warn!(assignment_id = %assignment.assignment_id, error = %e, "Reassignment failed");
                self.release(&assignment.executor_id);
                None
            }
        }
    }

    fn release(&self, executor_id: &str) {
        if let Err(e) = self.registry.release(executor_id) {
            warn!(executor_id, error = %e, "Could not release executor load");
        }
    }

    fn record_outcome(&self, executor_id: &str, success: bool) {
        if let Err(e) = self.registry.record_outcome(executor_id, success) {
            warn!(executor_id, error = %e, "Could not record executor outcome");
        }
    }

    async fn run_assignment(&self, assignment: ExecutorAssignment) {
        let task_id = assignment.task_id.clone();
        let Some((assignment, executor)) = self.claim(assignment).await else {
            self.fail_task(&task_id, "no available executor", true).await;
            return;
        };
        let executor_id = assignment.executor_id.clone();

        let task = {
            let mut queue = self.queue.write().await;
            match queue.start(&task_id, &executor_id) {
                Ok(()) => queue.get(&task_id).cloned(),
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Task could not start");
                    None
                }
            }
        };
        let Some(task) = task else {
            self.release(&executor_id);
            self.fail_task(&task_id, "task could not start", true).await;
            return;
        };

        info!(task_id = %task_id, executor_id = %executor_id, task_type = %task.task_type, "Executing task");
        self.emit(
            Event::task(EventType::TASK_STARTED, &task_id)
                .with_data("executor_id", executor_id.clone())
                .with_data("assignment_id", assignment.assignment_id.clone()),
        );

        let outcome = executor.execute_task(&task).await;
        self.release(&executor_id);

        let failure = match outcome {
            Ok(result) if result.success => {
                let completed = self.queue.write().await.complete(&task_id, result);
                match completed {
                    Ok(()) => None,
                    Err(e) => Some(e.to_string()),
                }
            }
            Ok(result) => Some(result.error_message()),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                self.record_outcome(&executor_id, true);
                let execution_time = self
                    .queue
                    .read()
                    .await
                    .get(&task_id)
                    .map_or(0.0, |t| t.metrics.execution_time);
                info!(task_id = %task_id, executor_id = %executor_id, execution_time, "Task completed");
                self.emit(
                    Event::task(EventType::TASK_COMPLETED, &task_id)
                        .with_data("executor_id", executor_id)
                        .with_data("execution_time", execution_time),
                );
            }
            Some(error) => {
                self.record_outcome(&executor_id, false);
                self.fail_task(&task_id, &error, true).await;
            }
        }
    }

    // Phase 3: compose
    async fn compose(&self, record: RunRecord, start: Instant) -> WorkflowResult {
        let RunRecord { plan, dispatches } = record;
        let queue = self.queue.read().await;

        let mut payloads = Map::new();
        let mut errors = Vec::new();
        for task in queue.all_tasks() {
            match task.state() {
                TaskState::Completed => {
                    let payload = task.result.as_ref().map_or(Value::Null, |r| r.payload.clone());
                    payloads.insert(task.task_id.clone(), payload);
                }
                TaskState::Failed => {
                    let reason = task.last_error.clone().unwrap_or_default();
                    errors.push(format!("task {} failed: {reason}", task.task_id));
                }
                TaskState::Cancelled => {
                    let reason = task
                        .result
                        .as_ref()
                        .and_then(|r| r.metadata.get("reason"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    errors.push(format!("task {} cancelled: {reason}", task.task_id));
                }
                _ => {}
            }
        }

        let total = queue.total_count();
        let completed = queue.completed_count();
        let failed = queue.count_in(TaskState::Failed);
        let cancelled = queue.count_in(TaskState::Cancelled);
        drop(queue);

        if self.state() == WorkflowState::Cancelled {
            errors.insert(0, format!("workflow {} was cancelled", self.workflow_id));
        }

        let summary = format!(
            "Workflow complete: {completed}/{total} tasks completed, {failed} failed, {cancelled} cancelled"
        );
        let mut warnings = plan.warnings.clone();
        for dispatch in &dispatches {
            warnings.extend(dispatch.warnings.iter().cloned());
        }

        let mut metadata = HashMap::new();
        metadata.insert("plan_id".into(), json!(plan.plan_id));
        metadata.insert("planning_strategy".into(), json!(plan.strategy.to_string()));
        metadata.insert("plan_confidence".into(), json!(plan.confidence));
        metadata.insert("estimated_total_time".into(), json!(plan.estimated_total_time));
        metadata.insert("critical_path".into(), json!(plan.critical_path));
        metadata.insert(
            "dispatch_strategies".into(),
            json!(dispatches.iter().map(|d| d.strategy.to_string()).collect::<Vec<_>>()),
        );
        metadata.insert(
            "dispatch_confidences".into(),
            json!(dispatches.iter().map(|d| d.confidence).collect::<Vec<_>>()),
        );
        metadata.insert("warnings".into(), json!(warnings));
        metadata.insert("total_tasks".into(), json!(total));
        metadata.insert("completed_tasks".into(), json!(completed));
        metadata.insert("failed_tasks".into(), json!(failed));
        metadata.insert("cancelled_tasks".into(), json!(cancelled));

        WorkflowResult {
            workflow_id: self.workflow_id.clone(),
            success: errors.is_empty(),
            result: json!({ "tasks": payloads, "summary": summary }),
            metadata,
            execution_time: start.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
            errors,
        }
    }

    fn failed_result(&self, start: Instant, errors: Vec<String>) -> WorkflowResult {
        WorkflowResult {
            workflow_id: self.workflow_id.clone(),
            success: false,
            result: Value::Null,
            metadata: HashMap::new(),
            execution_time: start.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
            errors,
        }
    }

    /// Store the result and every task. Storage problems are logged and do
    /// not change the outcome.
    async fn persist(&self, result: &WorkflowResult) {
        let Some(storage) = &self.storage else {
            return;
        };
        let key = format!("workflows/{}", self.workflow_id);
        match serde_json::to_value(result) {
            Ok(value) => {
                if let Err(e) = storage.store(&key, &value).await {
                    warn!(workflow_id = %self.workflow_id, error = %e, "Failed to persist workflow result");
                }
            }
            Err(e) => warn!(workflow_id = %self.workflow_id, error = %e, "Failed to serialize workflow result"),
        }

        let tasks: Vec<(String, TaskflowResult<Value>)> = self
            .queue
            .read()
            .await
            .all_tasks()
            .iter()
            .map(|t| (t.task_id.clone(), serde_json::to_value(t).map_err(Into::into)))
            .collect();
        for (task_id, value) in tasks {
            let stored = match value {
                Ok(value) => storage.store(&format!("{key}/tasks/{task_id}"), &value).await,
                Err(e) => Err(e),
            };
            if let Err(e) = stored {
                warn!(task_id = %task_id, error = %e, "Failed to persist task");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{DispatcherConfig, PlannerConfig};
    use crate::dispatcher::TaskDispatcher;
    use crate::executor::ExecutorDescriptor;
    use crate::planner::{SimplePlanner, TaskSpec};
    use crate::types::PlanningStrategy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use taskflow_core::{Task, TaskResult};
    use taskflow_storage::MemoryStorage;

    /// Fails the first `failures` calls, then echoes the task id.
    struct Flaky {
        descriptor: ExecutorDescriptor,
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(id: &str, types: &[&str], failures: u32) -> Arc<Self> {
            Arc::new(Self {
                descriptor: ExecutorDescriptor::new(id, "test")
                    .with_task_types(types)
                    .with_max_concurrent_tasks(4),
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Executor for Flaky {
        fn descriptor(&self) -> &ExecutorDescriptor {
            &self.descriptor
        }

        async fn execute_task(&self, task: &Task) -> TaskflowResult<TaskResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(TaskflowError::Executor(format!("attempt {} failed", call + 1)));
            }
            Ok(TaskResult::success(&task.task_id, json!({ "echo": task.task_id })))
        }
    }

    fn workflow(registry: Arc<ExecutorRegistry>, bus: EventBus) -> Workflow {
        let planner = Arc::new(SimplePlanner::new(PlannerConfig::default()));
        let dispatcher = Arc::new(TaskDispatcher::new(
            registry.clone(),
            DispatcherConfig::default(),
        ));
        Workflow::new(planner, dispatcher, registry, bus, WorkflowConfig::default())
    }

    fn spec(id: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            task_id: Some(id.into()),
            task_type: Some("http".into()),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..TaskSpec::default()
        }
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let registry = Arc::new(ExecutorRegistry::new());
        registry
            .register_executor(Flaky::new("e1", &["http"], 0))
            .unwrap();
        let bus = EventBus::new();
        bus.start().unwrap();
        let wf = workflow(registry.clone(), bus.clone());

        let requirements = Requirements::from_tasks(vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["b"]),
        ]);
        let result = wf.execute(&requirements, &PlanningConstraints::default()).await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.result["tasks"]["c"]["echo"], "c");
        assert_eq!(result.metadata["planning_strategy"], "custom");
        assert_eq!(wf.state(), WorkflowState::Completed);

        bus.wait_idle().await;
        let started: Vec<String> = bus
            .event_history(Some(EventType::TASK_STARTED), 10)
            .iter()
            .map(|e| e.data["task_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(started, vec!["a", "b", "c"]);
        assert_eq!(bus.event_history(Some(EventType::WORKFLOW_COMPLETED), 10).len(), 1);
        assert_eq!(registry.info("e1").unwrap().current_load, 0);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let registry = Arc::new(ExecutorRegistry::new());
        let flaky = Flaky::new("e1", &["http"], 2);
        registry.register_executor(flaky.clone()).unwrap();
        let bus = EventBus::new();
        bus.start().unwrap();
        let wf = workflow(registry.clone(), bus.clone());

        let result = wf
            .execute(
                &Requirements::from_tasks(vec![spec("a", &[])]),
                &PlanningConstraints::default(),
            )
            .await;
        assert!(result.success);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        bus.wait_idle().await;
        assert_eq!(bus.event_history(Some(EventType::TASK_RETRYING), 10).len(), 2);
        let info = registry.info("e1").unwrap();
        assert_eq!(info.total_tasks, 3);
        assert!((info.performance_score - 1.0 / 3.0).abs() < 1e-9);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_cancel_dependents() {
        let registry = Arc::new(ExecutorRegistry::new());
        registry
            .register_executor(Flaky::new("e1", &["http"], u32::MAX))
            .unwrap();
        let wf = workflow(registry, EventBus::new());

        let mut failing = spec("a", &[]);
        failing.max_retries = Some(1);
        let requirements = Requirements::from_tasks(vec![failing, spec("b", &["a"])]);
        let result = wf.execute(&requirements, &PlanningConstraints::default()).await;

        assert!(!result.success);
        assert_eq!(result.metadata["failed_tasks"], 1);
        assert_eq!(result.metadata["cancelled_tasks"], 1);
        let status = wf.status().await;
        assert_eq!(status.state, WorkflowState::Failed);
        assert_eq!(status.failed_tasks, 1);
        assert_eq!(status.cancelled_tasks, 1);
    }

    #[tokio::test]
    async fn test_no_executor_fails_tasks_without_error() {
        let registry = Arc::new(ExecutorRegistry::new());
        let wf = workflow(registry, EventBus::new());
        let result = wf
            .execute(
                &Requirements::from_goals(["summarize the logs"]),
                &PlanningConstraints::default(),
            )
            .await;
        assert!(!result.success);
        assert!(result.errors[0].contains("no suitable executor"));
    }

    #[tokio::test]
    async fn test_cycle_is_a_failed_result() {
        let registry = Arc::new(ExecutorRegistry::new());
        registry
            .register_executor(Flaky::new("e1", &["http"], 0))
            .unwrap();
        let wf = workflow(registry, EventBus::new());
        let requirements = Requirements::from_tasks(vec![spec("a", &["b"]), spec("b", &["a"])])
            .with_strategy(PlanningStrategy::Custom);
        let result = wf.execute(&requirements, &PlanningConstraints::default()).await;
        assert!(!result.success);
        assert!(result.errors[0].contains("cycle"));
        assert_eq!(wf.state(), WorkflowState::Failed);
    }

    #[tokio::test]
    async fn test_single_use() {
        let registry = Arc::new(ExecutorRegistry::new());
        registry
            .register_executor(Flaky::new("e1", &["*"], 0))
            .unwrap();
        let wf = workflow(registry, EventBus::new());
        let requirements = Requirements::default();
        assert!(wf.execute(&requirements, &PlanningConstraints::default()).await.success);
        let again = wf.execute(&requirements, &PlanningConstraints::default()).await;
        assert!(!again.success);
        assert!(again.errors[0].contains("already completed"));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let wf = workflow(Arc::new(ExecutorRegistry::new()), EventBus::new());
        assert!(!wf.pause());
        assert!(wf.cancel());
        assert!(!wf.cancel());
        let result = wf
            .execute(&Requirements::default(), &PlanningConstraints::default())
            .await;
        assert!(!result.success);
        assert_eq!(wf.state(), WorkflowState::Cancelled);
    }

    #[tokio::test]
    async fn test_results_are_persisted() {
        let registry = Arc::new(ExecutorRegistry::new());
        registry
            .register_executor(Flaky::new("e1", &["http"], 0))
            .unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let wf = workflow(registry, EventBus::new())
            .with_id("wf-1")
            .with_storage(storage.clone());
        let result = wf
            .execute(
                &Requirements::from_tasks(vec![spec("a", &[]), spec("b", &[])]),
                &PlanningConstraints::default(),
            )
            .await;
        assert!(result.success);
        assert_eq!(
            storage.list_keys("workflows/wf-1").await.unwrap(),
            vec![
                "workflows/wf-1",
                "workflows/wf-1/tasks/a",
                "workflows/wf-1/tasks/b"
            ]
        );
        let stored = storage.retrieve("workflows/wf-1").await.unwrap().unwrap();
        assert_eq!(stored["success"], true);
    }
}
