use serde::{Deserialize, Serialize};
use std::path::Path;
use taskflow_core::{TaskflowError, TaskflowResult};
use taskflow_events::EventBus;

/// Top-level configuration, usually read from `taskflow.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_history")]
    pub history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            history_size: default_history(),
        }
    }
}

impl EventBusConfig {
    pub fn build(&self) -> EventBus {
        EventBus::with_capacity(self.capacity, self.history_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_history")]
    pub max_history: usize,
    /// Tasks estimated above this many seconds produce a warning.
    #[serde(default = "default_long_task_threshold")]
    pub long_task_threshold_secs: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_history: default_history(),
            long_task_threshold_secs: default_long_task_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Select `OptimalAssignment` when no higher-precedence strategy applies.
    #[serde(default)]
    pub use_optimization: bool,
    #[serde(default = "default_history")]
    pub max_history: usize,
    /// Candidates scoring at or below this are discarded.
    #[serde(default = "default_min_suitability")]
    pub min_suitability: f64,
    /// Let executors without listed task types take any task.
    #[serde(default = "default_true")]
    pub allow_generalists: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            use_optimization: false,
            max_history: default_history(),
            min_suitability: default_min_suitability(),
            allow_generalists: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_true")]
    pub persist_results: bool,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            persist_results: true,
            default_max_retries: default_max_retries(),
            default_timeout_secs: default_timeout(),
        }
    }
}

fn default_capacity() -> usize {
    1000
}
fn default_history() -> usize {
    1000
}
fn default_long_task_threshold() -> f64 {
    3600.0
}
fn default_min_suitability() -> f64 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout() -> u64 {
    300
}

impl OrchestratorConfig {
    pub fn from_toml_str(content: &str) -> TaskflowResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TaskflowError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> TaskflowResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TaskflowError::Config(format!(
                "Failed to read config '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            TaskflowError::Config(msg) => {
                TaskflowError::Config(format!("{msg} (in '{}')", path.display()))
            }
            other => other,
        })
    }

    pub fn validate(&self) -> TaskflowResult<()> {
        if self.event_bus.capacity == 0 {
            return Err(TaskflowError::Config(
                "event_bus.capacity must be above zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dispatcher.min_suitability) {
            return Err(TaskflowError::Config(format!(
                "dispatcher.min_suitability must be within [0, 1], got {}",
                self.dispatcher.min_suitability
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config.event_bus.capacity, 1000);
        assert_eq!(config.event_bus.history_size, 1000);
        assert_eq!(config.planner.max_history, 1000);
        assert_eq!(config.planner.long_task_threshold_secs, 3600.0);
        assert!(!config.dispatcher.use_optimization);
        assert!(config.dispatcher.allow_generalists);
        assert!((config.dispatcher.min_suitability - 0.1).abs() < f64::EPSILON);
        assert!(config.workflow.persist_results);
        assert_eq!(config.workflow.default_max_retries, 3);
        assert_eq!(config.workflow.default_timeout_secs, 300);
    }

    #[test]
    fn test_partial_sections() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [dispatcher]
            use_optimization = true

            [workflow]
            default_max_retries = 1
            "#,
        )
        .unwrap();
        assert!(config.dispatcher.use_optimization);
        assert_eq!(config.dispatcher.max_history, 1000);
        assert_eq!(config.workflow.default_max_retries, 1);
        assert!(config.workflow.persist_results);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = OrchestratorConfig::from_toml_str("[dispatcher\n").unwrap_err();
        assert!(matches!(err, TaskflowError::Config(_)));
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let err = OrchestratorConfig::from_toml_str("[event_bus]\ncapacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "[event_bus]\nhistory_size = 50").unwrap();
        let config = OrchestratorConfig::load(tmp.path()).unwrap();
        assert_eq!(config.event_bus.history_size, 50);
        assert_eq!(config.event_bus.capacity, 1000);
    }

    #[test]
    fn test_load_missing_file() {
        let err = OrchestratorConfig::load(Path::new("/nonexistent/taskflow.toml")).unwrap_err();
        assert!(matches!(err, TaskflowError::Config(_)));
    }
}
