use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskflow_orchestrator::{
    ExecutorRegistry, OrchestratorConfig, Planner, PlanningConstraints, Requirements,
    SimplePlanner, TaskDispatcher, Workflow,
};
use taskflow_storage::FileStorage;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskflow", about = "Taskflow: plan, dispatch and run task workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskflow.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a plan from a requirements file and print it
    Plan {
        /// Requirements file (.toml or .json)
        file: PathBuf,
        /// Warn when the estimated total time exceeds this many seconds
        #[arg(long)]
        max_time: Option<f64>,
    },
    /// Plan, dispatch and execute a requirements file
    Run {
        /// Requirements file (.toml or .json)
        file: PathBuf,
        /// Warn when the estimated total time exceeds this many seconds
        #[arg(long)]
        max_time: Option<f64>,
        /// Persist workflow and task results under this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// List the built-in executors
    Executors,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(OrchestratorConfig::default());
    }
    Ok(OrchestratorConfig::load(path)?)
}

/// Parse a requirements file, choosing the format by extension. Anything
/// other than `.json` is read as TOML.
fn parse_requirements(path: &Path, content: &str) -> anyhow::Result<Requirements> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let requirements = if is_json {
        serde_json::from_str(content).map_err(|e| {
            anyhow::anyhow!("Failed to parse JSON requirements '{}': {e}", path.display())
        })?
    } else {
        toml::from_str(content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML requirements '{}': {e}", path.display())
        })?
    };
    Ok(requirements)
}

async fn load_requirements(path: &Path) -> anyhow::Result<Requirements> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to read requirements file '{}': {}",
            path.display(),
            e
        )
    })?;
    parse_requirements(path, &content)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Plan { file, max_time } => {
            let requirements = load_requirements(&file).await?;
            let planner = SimplePlanner::new(config.planner.clone());
            let plan = planner
                .create_plan(&requirements, &PlanningConstraints { max_time })
                .await?;
            for problem in planner.validate_plan(&plan) {
                warn!(plan_id = %plan.plan_id, "{problem}");
            }
            print_json(&plan)?;
        }
        Commands::Run {
            file,
            max_time,
            data_dir,
        } => {
            let requirements = load_requirements(&file).await?;

            let events = config.event_bus.build();
            events.start()?;

            let registry = Arc::new(ExecutorRegistry::new().with_event_bus(events.clone()));
            taskflow_builtins::register_builtins(&registry)?;
            info!(count = registry.len(), "Built-in executors registered");

            let planner = Arc::new(SimplePlanner::new(config.planner.clone()));
            let dispatcher = Arc::new(TaskDispatcher::new(
                registry.clone(),
                config.dispatcher.clone(),
            ));
            let mut workflow = Workflow::new(
                planner,
                dispatcher,
                registry,
                events.clone(),
                config.workflow.clone(),
            );
            if let Some(dir) = data_dir {
                let storage = FileStorage::new(dir).await?;
                workflow = workflow.with_storage(Arc::new(storage));
            }

            let result = workflow
                .execute(&requirements, &PlanningConstraints { max_time })
                .await;
            events.stop().await;

            print_json(&result)?;
            if !result.success {
                anyhow::bail!(
                    "Workflow {} failed with {} error(s)",
                    result.workflow_id,
                    result.errors.len()
                );
            }
        }
        Commands::Executors => {
            let registry = ExecutorRegistry::new();
            taskflow_builtins::register_builtins(&registry)?;

            let executors = registry.all();
            println!("Built-in executors:");
            for executor in &executors {
                let task_types = if executor.preferred_task_types.is_empty() {
                    "any".to_string()
                } else {
                    executor.preferred_task_types.join(", ")
                };
                println!(
                    "  {} ({}) capacity {} handles: {}",
                    executor.executor_id, executor.executor_type, executor.max_capacity, task_types
                );
                if !executor.capabilities.is_empty() {
                    let caps: Vec<&str> =
                        executor.capabilities.iter().map(String::as_str).collect();
                    println!("    Capabilities: {}", caps.join(", "));
                }
            }
            println!("\nTotal: {} executor(s)", executors.len());
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_toml_commands() {
        let requirements = parse_requirements(
            Path::new("work.toml"),
            r#"
            commands = ["echo one", "echo two"]
            "#,
        )
        .unwrap();
        assert_eq!(requirements.commands.unwrap().len(), 2);
    }

    #[test]
    fn test_parse_json_tasks() {
        let requirements = parse_requirements(
            Path::new("work.JSON"),
            r#"{"tasks": [{"task_id": "a", "type": "function"}, {"task_id": "b", "dependencies": ["a"]}]}"#,
        )
        .unwrap();
        let tasks = requirements.tasks.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].task_type.as_deref(), Some("function"));
        assert_eq!(tasks[1].dependencies, vec!["a".to_string()]);
    }

    #[test]
    fn test_demo_requirements_parse() {
        let requirements = parse_requirements(
            Path::new("build.toml"),
            include_str!("../../../demos/build.toml"),
        )
        .unwrap();
        let tasks = requirements.tasks.unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[2].dependencies, vec!["compile".to_string()]);
        assert_eq!(
            requirements.strategy,
            Some(taskflow_orchestrator::PlanningStrategy::Custom)
        );
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = parse_requirements(Path::new("broken.json"), "{not json").unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[tokio::test]
    async fn test_load_requirements_from_file() {
        let mut tmp = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(tmp, "goals = [\"collect\", \"report\"]").unwrap();
        let requirements = load_requirements(tmp.path()).await.unwrap();
        assert_eq!(requirements.goals.unwrap(), vec!["collect", "report"]);
    }

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let config = load_config(Path::new("/nonexistent/taskflow.toml")).unwrap();
        assert_eq!(config.workflow.default_max_retries, 3);
    }
}
