//! CLI configuration

use crate::error::{CliError, CliResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use vizhost::VizhostConfig;

/// CLI verbosity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Verbosity {
    /// Quiet - errors only
    Quiet,
    /// Normal - default output
    #[default]
    Normal,
    /// Verbose - lifecycle events
    Verbose,
    /// Debug - every engine call
    Debug,
}

impl Verbosity {
    /// Verbosity for `-q` and a `-v` count
    #[must_use]
    pub const fn from_flags(quiet: bool, verbose: u8) -> Self {
        if quiet {
            return Self::Quiet;
        }
        match verbose {
            0 => Self::Normal,
            1 => Self::Verbose,
            _ => Self::Debug,
        }
    }

    /// Check if quiet mode
    #[must_use]
    pub const fn is_quiet(self) -> bool {
        matches!(self, Self::Quiet)
    }

    /// Check if verbose or higher
    #[must_use]
    pub const fn is_verbose(self) -> bool {
        matches!(self, Self::Verbose | Self::Debug)
    }

    /// Log level used when `RUST_LOG` is unset
    #[must_use]
    pub const fn log_level(self) -> &'static str {
        match self {
            Self::Quiet => "error",
            Self::Normal => "warn",
            Self::Verbose => "info",
            Self::Debug => "debug",
        }
    }
}

/// CLI configuration
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    /// Verbosity level
    pub verbosity: Verbosity,
    /// Emit logs as JSON lines
    pub log_json: bool,
    /// Use the simulated engine instead of Chromium
    pub use_mock: bool,
    /// Library settings
    pub settings: VizhostConfig,
}

impl CliConfig {
    /// Create new default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set verbosity
    #[must_use]
    pub const fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set JSON logging
    #[must_use]
    pub const fn with_log_json(mut self, log_json: bool) -> Self {
        self.log_json = log_json;
        self
    }

    /// Use the simulated engine
    #[must_use]
    pub const fn with_mock(mut self, use_mock: bool) -> Self {
        self.use_mock = use_mock;
        self
    }

    /// Load library settings: YAML file (if any), then `VIZHOST_*` overrides.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed, or the result
    /// does not validate
    pub fn with_settings_from(mut self, path: Option<&Path>) -> CliResult<Self> {
        let settings = match path {
            Some(path) => VizhostConfig::from_yaml_file(path).map_err(|e| {
                CliError::config(format!("failed to load {}: {e}", path.display()))
            })?,
            None => VizhostConfig::default(),
        };
        self.settings = settings.apply_env();
        self.settings
            .validate()
            .map_err(|e| CliError::config(e.to_string()))?;
        Ok(self)
    }
}
