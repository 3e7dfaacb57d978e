//! Result and error types for vizhost.

use thiserror::Error;

/// Result type for vizhost operations
pub type VizhostResult<T> = Result<T, VizhostError>;

/// Errors that can occur while hosting engine instances or producing media
#[derive(Debug, Error)]
pub enum VizhostError {
    /// Instance not ready, handshake timed out, or instance already closed.
    ///
    /// Not retryable without a fresh `initialize`.
    #[error("Engine connection error: {message}")]
    Connection {
        /// Error message
        message: String,
    },

    /// A textual command was rejected or threw inside the engine
    #[error("Command `{command}` failed: {message}")]
    Command {
        /// The offending command, verbatim
        command: String,
        /// Error message reported by the engine
        message: String,
    },

    /// Raster, vector, or animation export failed
    #[error("Export failed: {message}")]
    Export {
        /// Error message
        message: String,
    },

    /// External encoder exited non-zero or produced no output
    #[error("Encoding failed: {message}{}", format_stderr(.stderr))]
    Encoding {
        /// Error message
        message: String,
        /// Encoder diagnostic output, verbatim
        stderr: String,
    },

    /// Operation exceeded its time allowance
    #[error("{operation} timed out after {ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Timeout in milliseconds
        ms: u64,
    },

    /// Script exception raised inside the hosting page
    #[error("Script evaluation failed: {message}")]
    Script {
        /// Error message
        message: String,
    },

    /// Hosting runtime could not be launched
    #[error("Failed to launch engine runtime: {message}")]
    Launch {
        /// Error message
        message: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{trimmed}")
    }
}

impl VizhostError {
    /// Create a connection error
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a command error carrying the offending command
    #[must_use]
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create an export error
    #[must_use]
    pub fn export(message: impl Into<String>) -> Self {
        Self::Export {
            message: message.into(),
        }
    }

    /// Create an encoding error with the encoder's stderr
    #[must_use]
    pub fn encoding(message: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            ms,
        }
    }

    /// Create a script error
    #[must_use]
    pub fn script(message: impl Into<String>) -> Self {
        Self::Script {
            message: message.into(),
        }
    }

    /// Create a launch error
    #[must_use]
    pub fn launch(message: impl Into<String>) -> Self {
        Self::Launch {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether a fresh attempt may succeed without changing the input.
    ///
    /// Command errors are never retryable: they almost always mean bad input.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Launch { .. })
    }

    /// Whether this error means the instance is unusable
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}
