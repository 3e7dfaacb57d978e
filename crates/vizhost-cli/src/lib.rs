//! vizhost CLI library
//!
//! Argument parsing, configuration loading, logging setup, and the
//! subcommand handlers behind the `vizhost` binary.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)] // Error types are self-documenting

mod commands;
mod config;
mod error;
pub mod handlers;
pub mod logging;

pub use commands::{
    AnimateArgs, AnimateFormat, BenchArgs, Cli, Commands, ConfigArgs, EncodeArgs, EncodeFormat,
    EvalArgs, SnapshotArgs, SnapshotFormat,
};
pub use config::{CliConfig, Verbosity};
pub use error::{CliError, CliResult};
