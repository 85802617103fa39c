//! Planning, dispatch, and workflow orchestration for taskflow.
//!
//! Requirements are turned into a dependency-shaped plan, each plan task is
//! matched to an executor by a scoring strategy, and a [`Workflow`] drives the
//! tasks through their lifecycle while announcing every step on the event bus.
//!
//! # Main types
//!
//! - [`Workflow`]: Plan → dispatch → execute → compose driver with pause/resume/cancel.
//! - [`SimplePlanner`]: Rule-based [`Planner`] with cycle detection and critical-path estimation.
//! - [`TaskDispatcher`]: Strategy-selecting [`Dispatcher`] with suitability scoring and reassignment.
//! - [`ExecutorRegistry`]: Catalog of executors with capability and task-type indices.
//! - [`Executor`]: Trait implemented by anything that can run a task.
//! - [`TaskQueue`]: A workflow's runtime tasks with dependency resolution.
//! - [`OrchestratorConfig`]: TOML configuration for all of the above.

/// TOML configuration.
pub mod config;
/// Batch assignment of task plans to executors.
pub mod dispatcher;
/// The executor trait and its descriptor.
pub mod executor;
/// Cycle detection and schedule analysis over task plans.
pub mod graph;
/// Requirements and the rule-based planner.
pub mod planner;
/// Executor catalog, indices, load and performance tracking.
pub mod registry;
/// Runtime task set of one workflow.
pub mod task_queue;
/// Shared plan, dispatch, executor and workflow types.
pub mod types;
/// The orchestration driver.
pub mod workflow;

pub use config::{
    DispatcherConfig, EventBusConfig, OrchestratorConfig, PlannerConfig, WorkflowConfig,
};
pub use dispatcher::{DispatchStatistics, Dispatcher, TaskDispatcher};
pub use executor::{Executor, ExecutorDescriptor};
pub use graph::{critical_path, detect_circular_dependencies};
pub use planner::{
    CommandSpec, Planner, PlanningConstraints, Requirements, SimplePlanner, TaskSpec,
};
pub use registry::{ExecutorRegistry, RegistryStatistics};
pub use task_queue::TaskQueue;
pub use types::{
    DispatchContext, DispatchResult, DispatchStrategy, ExecutorAssignment, ExecutorInfo,
    ExecutorStatus, PlanningResult, PlanningStrategy, TaskPlan, WorkflowResult, WorkflowState,
    WorkflowStatus, ANY_TASK_TYPE,
};
pub use workflow::Workflow;
