//! Subscriber setup for the `vizhost` binary.
//!
//! `RUST_LOG` wins when set; otherwise the level follows `-q`/`-v`. Logs go
//! to stderr so stdout stays machine-readable.

use crate::config::Verbosity;
use crate::error::{CliError, CliResult};
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
#[must_use]
pub fn default_directive(verbosity: Verbosity) -> String {
    let level = verbosity.log_level();
    format!("{level},vizhost={level},vizhost_cli={level}")
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns `Config` if a subscriber is already installed
pub fn init(verbosity: Verbosity, json: bool) -> CliResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbosity == Verbosity::Debug);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| CliError::config(format!("failed to install logger: {e}")))
}
