//! Built-in executors for taskflow.
//!
//! # Main entry points
//!
//! - [`register_builtins()`]: Register the standard set of built-in executors.
//! - [`EchoExecutor`]: Completes `generic` and `function` tasks by echoing them.
//! - [`ShellExecutor`]: Runs `shell` tasks through `sh -c` with a timeout.

/// Echo executor.
pub mod echo;
/// Shell command executor.
pub mod shell;

pub use echo::EchoExecutor;
pub use shell::ShellExecutor;

use std::sync::Arc;
use taskflow_core::TaskflowResult;
use taskflow_orchestrator::ExecutorRegistry;

/// Register every built-in executor into the given registry.
pub fn register_builtins(registry: &ExecutorRegistry) -> TaskflowResult<()> {
    registry.register_executor(Arc::new(EchoExecutor::new()))?;
    registry.register_executor(Arc::new(ShellExecutor::new()))?;
    Ok(())
}
