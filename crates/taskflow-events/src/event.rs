use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Delivery priority of an event.
///
/// Only matters when the bus buffer is full: `High` and `Critical` events
/// make room by evicting the oldest queued event, the others are dropped.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl EventPriority {
    /// Whether this event may evict a queued one on overflow.
    pub fn may_evict(self) -> bool {
        self >= EventPriority::High
    }
}

/// Well-known event type names published by the orchestration pipeline.
pub struct EventType;

impl EventType {
    pub const TASK_CREATED: &'static str = "task.created";
    pub const TASK_STARTED: &'static str = "task.started";
    pub const TASK_COMPLETED: &'static str = "task.completed";
    pub const TASK_FAILED: &'static str = "task.failed";
    pub const TASK_CANCELLED: &'static str = "task.cancelled";
    pub const TASK_RETRYING: &'static str = "task.retrying";
    pub const EXECUTOR_REGISTERED: &'static str = "executor.registered";
    pub const EXECUTOR_UNREGISTERED: &'static str = "executor.unregistered";
    pub const WORKFLOW_STARTED: &'static str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &'static str = "workflow.completed";
    pub const WORKFLOW_FAILED: &'static str = "workflow.failed";
    pub const WORKFLOW_PAUSED: &'static str = "workflow.paused";
    pub const WORKFLOW_RESUMED: &'static str = "workflow.resumed";
    pub const WORKFLOW_CANCELLED: &'static str = "workflow.cancelled";
    pub const DISPATCH_COMPLETED: &'static str = "dispatch.completed";
    pub const PLAN_CREATED: &'static str = "plan.created";
}

/// A single message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: EventPriority,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            data: HashMap::new(),
            timestamp: Utc::now(),
            priority: EventPriority::Normal,
            correlation_id: None,
        }
    }

    /// Event about a task; `source` is `task.<id>` and `data.task_id` is set.
    pub fn task(event_type: impl Into<String>, task_id: &str) -> Self {
        Self::new(event_type, format!("task.{task_id}")).with_data("task_id", task_id)
    }

    /// Event about an executor; `source` is `executor.<id>`.
    pub fn executor(event_type: impl Into<String>, executor_id: &str) -> Self {
        Self::new(event_type, format!("executor.{executor_id}"))
            .with_data("executor_id", executor_id)
    }

    /// Event about a workflow; `source` is `workflow.<id>` and the workflow
    /// id doubles as correlation id.
    pub fn workflow(event_type: impl Into<String>, workflow_id: &str) -> Self {
        Self::new(event_type, format!("workflow.{workflow_id}"))
            .with_data("workflow_id", workflow_id)
            .with_correlation_id(workflow_id)
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}
