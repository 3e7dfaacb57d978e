//! Subcommand handlers.
//!
//! Each handler owns one pool for the duration of the command and always
//! tears it down, so no browser process outlives the CLI.

pub mod animate;
pub mod bench;
pub mod config;
pub mod encode;
pub mod eval;
pub mod snapshot;

use crate::config::CliConfig;
use crate::error::{CliError, CliResult};
use serde::Serialize;
use std::sync::Arc;
use vizhost::{EngineInstance, EngineLauncher, InstancePool, MockLauncher, MockOptions};

/// Launcher for the configured engine
///
/// # Errors
///
/// Returns `Config` when the real engine is requested from a build without
/// the `browser` feature
pub fn launcher(config: &CliConfig) -> CliResult<Arc<dyn EngineLauncher>> {
    if config.use_mock {
        return Ok(Arc::new(MockLauncher::new(MockOptions::animated_by("t"))));
    }
    #[cfg(feature = "browser")]
    {
        Ok(Arc::new(vizhost::ChromiumLauncher::new()))
    }
    #[cfg(not(feature = "browser"))]
    {
        Err(CliError::config(
            "built without the `browser` feature; rerun with --mock",
        ))
    }
}

/// Pool for one CLI invocation
///
/// # Errors
///
/// See [`launcher`]
pub fn open_pool(config: &CliConfig) -> CliResult<InstancePool> {
    Ok(InstancePool::from_config(&config.settings, launcher(config)?))
}

/// Run setup commands, failing on the first rejection
///
/// # Errors
///
/// Returns the engine error for the first command that fails
pub async fn apply_commands(instance: &EngineInstance, commands: &[String]) -> CliResult<()> {
    for command in commands {
        instance.eval_command(command).await?;
    }
    Ok(())
}

/// Multi-threaded runtime for one command
///
/// # Errors
///
/// Returns `Runtime` if tokio cannot start
pub fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CliError::runtime(format!("failed to start async runtime: {e}")))
}

/// Pretty-print a value as JSON on stdout
///
/// # Errors
///
/// Returns `Json` on serialization failure
pub fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
