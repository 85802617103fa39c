#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use taskflow_core::*;

// ---------------------------------------------------------------------------
// 1. Dependency gating across a small chain
// ---------------------------------------------------------------------------

#[test]
fn chain_starts_in_dependency_order() {
    let mut a = Task::new("shell").with_id("a");
    let mut b = Task::new("shell")
        .with_id("b")
        .with_dependency(TaskDependency::sequential("a"));

    let mut done = HashSet::new();
    assert!(a.can_start(&done));
    assert!(!b.can_start(&done));

    a.start("worker", &done).unwrap();
    a.complete(TaskResult::success("a", serde_json::json!("ok")))
        .unwrap();
    done.insert(a.task_id.clone());

    assert!(b.can_start(&done));
    b.start("worker", &done).unwrap();
    assert_eq!(b.state(), TaskState::Running);
}

// ---------------------------------------------------------------------------
// 2. Retry exhaustion (max_retries = 2)
// ---------------------------------------------------------------------------

#[test]
fn retry_exhaustion_matches_counts() {
    let mut task = Task::new("generic").with_max_retries(2);
    let mut states = Vec::new();
    for i in 0..3 {
        task.fail(format!("attempt {i}"), true).unwrap();
        states.push(task.state());
    }
    assert_eq!(
        states,
        vec![TaskState::Pending, TaskState::Pending, TaskState::Failed]
    );
    assert_eq!(task.retry_count, 3);
    assert!(task.is_terminal());
}

// ---------------------------------------------------------------------------
// 3. Terminal states reject every lifecycle call
// ---------------------------------------------------------------------------

#[test]
fn terminal_states_reject_transitions() {
    let mut completed = Task::new("generic");
    completed.start("e", &HashSet::new()).unwrap();
    completed
        .complete(TaskResult::success("x", serde_json::Value::Null))
        .unwrap();

    let mut cancelled = Task::new("generic");
    cancelled.cancel("stop").unwrap();

    let mut failed = Task::new("generic");
    failed.fail("fatal", false).unwrap();

    for task in [&mut completed, &mut cancelled, &mut failed] {
        let before = task.transitions().len();
        assert!(task.start("e", &HashSet::new()).is_err());
        assert!(task.fail("x", true).is_err());
        assert!(task.cancel("x").is_err());
        assert!(task.block("x").is_err());
        assert!(task
            .complete(TaskResult::success("x", serde_json::Value::Null))
            .is_err());
        assert_eq!(task.transitions().len(), before);
    }
}

// ---------------------------------------------------------------------------
// 4. Error formatting
// ---------------------------------------------------------------------------

#[test]
fn invalid_transition_error_message() {
    let mut task = Task::new("generic").with_id("t-9");
    let err = task.unblock().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid transition for task t-9: cannot unblock from pending"
    );
}

#[test]
fn json_error_converts() {
    let err: TaskflowError = serde_json::from_str::<Task>("not json").unwrap_err().into();
    assert!(matches!(err, TaskflowError::Json(_)));
}

// ---------------------------------------------------------------------------
// 5. Serialized shape
// ---------------------------------------------------------------------------

#[test]
fn dependency_deserializes_with_defaults() {
    let dep: TaskDependency =
        serde_json::from_str(r#"{"dependency_id":"a","dependency_type":"data"}"#).unwrap();
    assert!(dep.required);
    assert_eq!(dep.dependency_type, DependencyType::Data);
    assert!(!dep.gates_start());
}
