//! Core types and error definitions for the taskflow orchestration engine.
//!
//! This crate provides the foundational types shared across all taskflow
//! crates: the unified error enum and the [`Task`] entity with its explicit
//! lifecycle state machine.
//!
//! # Main types
//!
//! - [`TaskflowError`]: Unified error enum for all taskflow subsystems.
//! - [`TaskflowResult`]: Convenience alias for `Result<T, TaskflowError>`.
//! - [`Task`]: A unit of work with dependencies, retries, and lifecycle state.
//! - [`TaskState`]: Lifecycle states and the allowed transition edges.
//! - [`TaskResult`]: Outcome reported by an executor for one task run.

/// Task entity, dependency types, and the lifecycle state machine.
pub mod task;

pub use task::{
    DependencyType, StateTransition, Task, TaskDependency, TaskMetrics, TaskPriority, TaskResult,
    TaskState,
};

// --- Error types ---

/// Top-level error type for taskflow.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskflowError {
    /// A task-level error (unknown task, malformed parameters).
    #[error("Task error: {0}")]
    Task(String),

    /// A lifecycle method was called from a state that does not allow it.
    #[error("Invalid transition for task {task_id}: cannot {action} from {from}")]
    InvalidTransition {
        /// The task whose transition was rejected.
        task_id: String,
        /// State the task was in when the call was made.
        from: TaskState,
        /// The attempted lifecycle action.
        action: String,
    },

    /// An error raised while building or validating a plan.
    #[error("Planning error: {0}")]
    Planning(String),

    /// An error raised while assigning tasks to executors.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// An error reported by an executor while running a task.
    #[error("Executor error: {0}")]
    Executor(String),

    /// An error from the event bus.
    #[error("Event error: {0}")]
    Event(String),

    /// An error from a storage backend.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An error from the workflow driver.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`TaskflowError`].
pub type TaskflowResult<T> = Result<T, TaskflowError>;
