//! End-to-end workflow tests.
//!
//! Drives planner, dispatcher, registry, event bus and storage together with
//! mock executors. Checks dependency gating, capacity limits, confidence
//! behavior, cooperative pause/resume and result persistence.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskflow_core::{Task, TaskResult, TaskflowResult};
use taskflow_events::{EventBus, EventType};
use taskflow_orchestrator::*;
use taskflow_storage::{MemoryStorage, Storage};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Mock executors
// ---------------------------------------------------------------------------

/// Returns the task parameters as payload and counts invocations.
struct Recorder {
    descriptor: ExecutorDescriptor,
    calls: AtomicUsize,
}

impl Recorder {
    fn new(id: &str, types: &[&str], capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            descriptor: ExecutorDescriptor::new(id, "recorder")
                .with_task_types(types)
                .with_max_concurrent_tasks(capacity),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Executor for Recorder {
    fn descriptor(&self) -> &ExecutorDescriptor {
        &self.descriptor
    }

    async fn execute_task(&self, task: &Task) -> TaskflowResult<TaskResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TaskResult::success(&task.task_id, json!(task.parameters)))
    }
}

/// Signals when a task starts, then waits to be released.
struct Gate {
    descriptor: ExecutorDescriptor,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl Executor for Gate {
    fn descriptor(&self) -> &ExecutorDescriptor {
        &self.descriptor
    }

    async fn execute_task(&self, task: &Task) -> TaskflowResult<TaskResult> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(TaskResult::success(&task.task_id, json!("done")))
    }
}

fn pipeline(registry: &Arc<ExecutorRegistry>, bus: &EventBus) -> Workflow {
    let planner = Arc::new(SimplePlanner::new(PlannerConfig::default()));
    let dispatcher = Arc::new(TaskDispatcher::new(
        registry.clone(),
        DispatcherConfig::default(),
    ));
    Workflow::new(
        planner,
        dispatcher,
        registry.clone(),
        bus.clone(),
        WorkflowConfig::default(),
    )
}

fn http_plan(id: &str) -> TaskPlan {
    TaskPlan::new("http", id)
        .with_id(id)
        .with_estimated_duration(10.0)
}

// ---------------------------------------------------------------------------
// 1. Sequential plan: B is not dispatched before A completes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_plan_gates_dispatch() {
    let planner = SimplePlanner::new(PlannerConfig::default());
    let specs = ["a", "b", "c"]
        .iter()
        .map(|id| TaskSpec {
            task_id: Some(id.to_string()),
            task_type: Some("http".into()),
            ..TaskSpec::default()
        })
        .collect();
    let requirements =
        Requirements::from_tasks(specs).with_strategy(PlanningStrategy::Sequential);
    let plan = planner
        .create_plan(&requirements, &PlanningConstraints::default())
        .await
        .unwrap();
    assert_eq!(plan.tasks[1].dependencies, vec!["a"]);
    assert_eq!(plan.tasks[2].dependencies, vec!["b"]);

    let registry = Arc::new(ExecutorRegistry::new());
    registry
        .register_executor(Recorder::new("e1", &["http"], 5))
        .unwrap();
    let dispatcher = TaskDispatcher::new(registry, DispatcherConfig::default());
    let ctx = DispatchContext::for_plan(plan.plan_id.clone());

    let mut completed = HashSet::new();
    for expected in ["a", "b", "c"] {
        let result = dispatcher
            .dispatch_ready(&plan.tasks, &completed, &ctx)
            .await
            .unwrap();
        let assigned: Vec<&str> = result
            .assignments
            .iter()
            .map(|a| a.task_id.as_str())
            .collect();
        assert!(assigned.contains(&expected));
        for assignment in &result.assignments {
            let task = plan
                .tasks
                .iter()
                .find(|t| t.task_id == assignment.task_id)
                .unwrap();
            assert!(task.is_ready(&completed));
        }
        completed.insert(expected.to_string());
    }
}

// ---------------------------------------------------------------------------
// 2. Capacity shortfall and capacity safety
// ---------------------------------------------------------------------------

#[tokio::test]
async fn capacity_shortfall_is_reported() {
    let registry = Arc::new(ExecutorRegistry::new());
    registry
        .register(
            ExecutorInfo::new("h1", "http")
                .with_capacity(2)
                .with_task_types(["http"]),
        )
        .unwrap();
    let dispatcher = TaskDispatcher::new(registry, DispatcherConfig::default());
    let tasks = vec![http_plan("a"), http_plan("b"), http_plan("c")];
    let result = dispatcher
        .dispatch(&tasks, &DispatchContext::default())
        .await
        .unwrap();
    assert_eq!(result.assignments.len(), 2);
    assert_eq!(result.unassigned_tasks.len(), 1);
    assert!(!result.warnings.is_empty());
}

#[tokio::test]
async fn no_executor_exceeds_capacity() {
    let capacities = [1u32, 2, 3];
    for use_optimization in [false, true] {
        for task_count in 1..12 {
            let registry = Arc::new(ExecutorRegistry::new());
            for (i, cap) in capacities.iter().enumerate() {
                registry
                    .register(
                        ExecutorInfo::new(format!("e{i}"), "http")
                            .with_capacity(*cap)
                            .with_task_types(["http"])
                            .with_performance_score(0.3 + 0.2 * i as f64),
                    )
                    .unwrap();
            }
            let dispatcher = TaskDispatcher::new(
                registry.clone(),
                DispatcherConfig {
                    use_optimization,
                    ..DispatcherConfig::default()
                },
            );
            let tasks: Vec<TaskPlan> = (0..task_count)
                .map(|i| http_plan(&format!("t{i}")))
                .collect();
            let result = dispatcher
                .dispatch(&tasks, &DispatchContext::default())
                .await
                .unwrap();

            let mut per_executor: HashMap<&str, u32> = HashMap::new();
            for a in &result.assignments {
                *per_executor.entry(a.executor_id.as_str()).or_default() += 1;
            }
            for (id, count) in per_executor {
                let info = registry.info(id).unwrap();
                assert!(count <= info.max_capacity, "{id} got {count}");
            }
            assert_eq!(
                result.assignments.len() + result.unassigned_tasks.len(),
                task_count
            );
            assert_eq!(result.assignments.len(), task_count.min(6));
        }
    }
}

// ---------------------------------------------------------------------------
// 3. Confidence never rises with unassigned tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confidence_is_monotonic_in_unassigned_tasks() {
    let registry = Arc::new(ExecutorRegistry::new());
    registry
        .register(
            ExecutorInfo::new("h1", "http")
                .with_capacity(50)
                .with_task_types(["http"]),
        )
        .unwrap();
    let dispatcher = TaskDispatcher::new(registry, DispatcherConfig::default());
    let base = vec![http_plan("a"), http_plan("b")];

    let mut previous = dispatcher
        .dispatch(&base, &DispatchContext::default())
        .await
        .unwrap()
        .confidence;
    for extra in 1..8 {
        let mut tasks = base.clone();
        tasks.extend((0..extra).map(|i| TaskPlan::new("gpu", "render").with_id(format!("g{i}"))));
        let result = dispatcher
            .dispatch(&tasks, &DispatchContext::default())
            .await
            .unwrap();
        assert_eq!(result.unassigned_tasks.len(), extra);
        assert!(result.confidence <= previous);
        previous = result.confidence;
    }
}

// ---------------------------------------------------------------------------
// 4. Full workflow with events and persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn workflow_runs_mixed_plan_end_to_end() {
    let registry = Arc::new(ExecutorRegistry::new());
    let http = Recorder::new("http-1", &["http"], 2);
    let generic = Recorder::new("z-any", &["*"], 1);
    registry.register_executor(http.clone()).unwrap();
    registry.register_executor(generic.clone()).unwrap();

    let bus = EventBus::new();
    bus.start().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let workflow = pipeline(&registry, &bus)
        .with_id("wf-e2e")
        .with_storage(storage.clone());

    let requirements: Requirements = serde_json::from_value(json!({
        "tasks": [
            { "task_id": "fetch", "type": "http", "parameters": { "url": "https://example.com" } },
            { "task_id": "parse", "type": "function", "dependencies": ["fetch"] },
            { "task_id": "report", "type": "generic", "dependencies": ["parse"] }
        ]
    }))
    .unwrap();
    let result = workflow
        .execute(&requirements, &PlanningConstraints::default())
        .await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(
        result.result["tasks"]["fetch"]["url"],
        "https://example.com"
    );
    assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    assert_eq!(generic.calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.metadata["completed_tasks"], 3);

    bus.wait_idle().await;
    let completed = bus.event_history(Some(EventType::TASK_COMPLETED), 10);
    assert_eq!(completed.len(), 3);
    assert!(completed
        .iter()
        .all(|e| e.correlation_id.as_deref() == Some("wf-e2e")));
    assert_eq!(bus.event_history(Some(EventType::WORKFLOW_STARTED), 10).len(), 1);
    assert_eq!(bus.event_history(Some(EventType::PLAN_CREATED), 10).len(), 1);

    assert!(storage.exists("workflows/wf-e2e").await.unwrap());
    let report = storage
        .retrieve("workflows/wf-e2e/tasks/report")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report["state"], "completed");

    let stats = registry.statistics();
    assert_eq!(stats.total_load, 0);
    assert!(registry.check_index_consistency().is_empty());
    bus.stop().await;
}

// ---------------------------------------------------------------------------
// 5. Catalog-only executor forces a reassignment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn catalog_entry_without_handle_is_reassigned() {
    let registry = Arc::new(ExecutorRegistry::new());
    // Sorts first, so round-robin picks it.
    registry
        .register(
            ExecutorInfo::new("a-catalog", "http")
                .with_capacity(4)
                .with_task_types(["http"]),
        )
        .unwrap();
    let live = Recorder::new("b-live", &["http"], 4);
    registry.register_executor(live.clone()).unwrap();

    let workflow = pipeline(&registry, &EventBus::new());
    let requirements = Requirements::from_tasks(vec![TaskSpec {
        task_id: Some("only".into()),
        task_type: Some("http".into()),
        ..TaskSpec::default()
    }]);
    let result = workflow
        .execute(&requirements, &PlanningConstraints::default())
        .await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(live.calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.info("a-catalog").unwrap().current_load, 0);
    assert_eq!(registry.info("b-live").unwrap().current_load, 0);
}

// ---------------------------------------------------------------------------
// 6. Cooperative pause / resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pause_holds_next_assignment_until_resume() {
    let registry = Arc::new(ExecutorRegistry::new());
    let gate = Arc::new(Gate {
        descriptor: ExecutorDescriptor::new("gate", "gate")
            .with_task_types(&["http"])
            .with_max_concurrent_tasks(2),
        started: Notify::new(),
        release: Notify::new(),
    });
    registry.register_executor(gate.clone()).unwrap();
    let bus = EventBus::new();
    bus.start().unwrap();

    let workflow = Arc::new(pipeline(&registry, &bus));
    let requirements = Requirements::from_tasks(vec![
        TaskSpec {
            task_id: Some("first".into()),
            task_type: Some("http".into()),
            ..TaskSpec::default()
        },
        TaskSpec {
            task_id: Some("second".into()),
            task_type: Some("http".into()),
            dependencies: vec!["first".into()],
            ..TaskSpec::default()
        },
    ]);

    let runner = {
        let workflow = workflow.clone();
        tokio::spawn(async move {
            workflow
                .execute(&requirements, &PlanningConstraints::default())
                .await
        })
    };

    gate.started.notified().await;
    assert!(workflow.pause());
    gate.release.notify_one();

    let mut status = workflow.status().await;
    for _ in 0..200 {
        if status.completed_tasks == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        status = workflow.status().await;
    }
    assert_eq!(status.completed_tasks, 1);
    assert_eq!(status.state, WorkflowState::Paused);
    assert_eq!(status.pending_tasks, 1);

    assert!(workflow.resume());
    gate.started.notified().await;
    gate.release.notify_one();

    let result = runner.await.unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(workflow.state(), WorkflowState::Completed);

    bus.wait_idle().await;
    assert_eq!(bus.event_history(Some(EventType::WORKFLOW_PAUSED), 10).len(), 1);
    assert_eq!(bus.event_history(Some(EventType::WORKFLOW_RESUMED), 10).len(), 1);
    bus.stop().await;
}

#[tokio::test]
async fn cancel_stops_remaining_tasks() {
    let registry = Arc::new(ExecutorRegistry::new());
    let gate = Arc::new(Gate {
        descriptor: ExecutorDescriptor::new("gate", "gate")
            .with_task_types(&["http"])
            .with_max_concurrent_tasks(2),
        started: Notify::new(),
        release: Notify::new(),
    });
    registry.register_executor(gate.clone()).unwrap();

    let workflow = Arc::new(pipeline(&registry, &EventBus::new()));
    let requirements = Requirements::from_tasks(vec![
        TaskSpec {
            task_id: Some("first".into()),
            task_type: Some("http".into()),
            ..TaskSpec::default()
        },
        TaskSpec {
            task_id: Some("second".into()),
            task_type: Some("http".into()),
            dependencies: vec!["first".into()],
            ..TaskSpec::default()
        },
    ]);
    let runner = {
        let workflow = workflow.clone();
        tokio::spawn(async move {
            workflow
                .execute(&requirements, &PlanningConstraints::default())
                .await
        })
    };

    gate.started.notified().await;
    assert!(workflow.cancel());
    gate.release.notify_one();

    let result = runner.await.unwrap();
    assert!(!result.success);
    assert!(result.errors[0].contains("cancelled"));
    assert_eq!(result.metadata["completed_tasks"], 1);
    assert_eq!(result.metadata["cancelled_tasks"], 1);
    assert_eq!(workflow.state(), WorkflowState::Cancelled);
}
