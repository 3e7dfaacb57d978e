//! Configuration for engine instances, the pool, frame capture, and encoding.
//!
//! Every section has working defaults; a deployment usually only overrides
//! paths. [`VizhostConfig`] aggregates the sections and can be read from YAML,
//! then patched from `VIZHOST_*` environment variables.

use crate::result::{VizhostError, VizhostResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default engine bundle loaded into the hosting page
pub const DEFAULT_BUNDLE_URL: &str = "https://www.geogebra.org/apps/deployggb.js";

/// Default name of the engine's global scripting object
pub const DEFAULT_APPLET_GLOBAL: &str = "ggbApplet";

/// Engine instance configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run the hosting browser without a window
    pub headless: bool,
    /// Viewport width in CSS pixels
    pub viewport_width: u32,
    /// Viewport height in CSS pixels
    pub viewport_height: u32,
    /// Engine app flavour (e.g. "classic", "graphing", "geometry")
    pub app_name: String,
    /// Show the engine toolbar
    pub show_toolbar: bool,
    /// Show the algebra input bar
    pub show_algebra_input: bool,
    /// Show the menu bar
    pub show_menu_bar: bool,
    /// Engine UI locale
    pub locale: String,
    /// Script URL of the engine bundle
    pub bundle_url: String,
    /// Global object exposing the engine API once loaded
    pub applet_global: String,
    /// Path to chromium binary (None = auto-detect)
    pub chromium_path: Option<PathBuf>,
    /// Sandbox mode (disable for containers)
    pub sandbox: bool,
    /// Extra command-line arguments for the hosting browser
    pub extra_launch_args: Vec<String>,
    /// Readiness handshake budget
    pub startup_timeout_ms: u64,
    /// Interval between readiness polls
    pub poll_interval_ms: u64,
    /// Budget for a single command or introspection call
    pub command_timeout_ms: u64,
    /// Budget for raster or vector export
    pub export_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: 800,
            viewport_height: 600,
            app_name: "classic".to_string(),
            show_toolbar: false,
            show_algebra_input: false,
            show_menu_bar: false,
            locale: "en".to_string(),
            bundle_url: DEFAULT_BUNDLE_URL.to_string(),
            applet_global: DEFAULT_APPLET_GLOBAL.to_string(),
            chromium_path: None,
            sandbox: true,
            extra_launch_args: Vec::new(),
            startup_timeout_ms: 30_000,
            poll_interval_ms: 100,
            command_timeout_ms: 10_000,
            export_timeout_ms: 60_000,
        }
    }
}

impl EngineConfig {
    /// Create a new config with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set viewport dimensions
    #[must_use]
    pub const fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport_width = width;
        self.viewport_height = height;
        self
    }

    /// Set headless mode
    #[must_use]
    pub const fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Set chromium path
    #[must_use]
    pub fn with_chromium_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.chromium_path = Some(path.into());
        self
    }

    /// Disable sandbox (for containers/CI)
    #[must_use]
    pub const fn with_no_sandbox(mut self) -> Self {
        self.sandbox = false;
        self
    }

    /// Set the engine UI locale
    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Append an extra browser launch argument
    #[must_use]
    pub fn with_launch_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_launch_args.push(arg.into());
        self
    }

    /// Set the readiness handshake budget in milliseconds
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout_ms: u64) -> Self {
        self.startup_timeout_ms = timeout_ms;
        self
    }

    /// Set the readiness poll interval in milliseconds
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    /// Set the per-command budget in milliseconds
    #[must_use]
    pub const fn with_command_timeout(mut self, timeout_ms: u64) -> Self {
        self.command_timeout_ms = timeout_ms;
        self
    }

    /// Set the export budget in milliseconds
    #[must_use]
    pub const fn with_export_timeout(mut self, timeout_ms: u64) -> Self {
        self.export_timeout_ms = timeout_ms;
        self
    }

    /// Readiness handshake budget
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Readiness poll interval
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-command budget
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Export budget
    #[must_use]
    pub const fn export_timeout(&self) -> Duration {
        Duration::from_millis(self.export_timeout_ms)
    }

    /// Check the configuration for values that can never work
    ///
    /// # Errors
    ///
    /// Returns `Config` for zero viewport dimensions or zero timeouts
    pub fn validate(&self) -> VizhostResult<()> {
        if self.viewport_width == 0 || self.viewport_height == 0 {
            return Err(VizhostError::config("viewport width/height must be non-zero"));
        }
        if self.startup_timeout_ms == 0 || self.command_timeout_ms == 0 || self.export_timeout_ms == 0
        {
            return Err(VizhostError::config("engine timeouts must be non-zero"));
        }
        if self.poll_interval_ms == 0 {
            return Err(VizhostError::config("poll interval must be non-zero"));
        }
        if self.applet_global.is_empty() {
            return Err(VizhostError::config("applet global name must not be empty"));
        }
        Ok(())
    }
}

/// Instance pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on live instances, the default instance included
    pub max_instances: usize,
    /// Upper bound on instances created by a single warm-up request
    pub warm_up_limit: usize,
    /// Checkouts before an instance is retired (0 = unlimited)
    pub max_reuse: u32,
    /// Idle time after which `reap_idle` closes an instance
    pub idle_timeout_ms: u64,
    /// How long `acquire` waits for a free slot
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 4,
            warm_up_limit: 2,
            max_reuse: 0,
            idle_timeout_ms: 300_000,
            acquire_timeout_ms: 60_000,
        }
    }
}

impl PoolConfig {
    /// Set the instance bound
    #[must_use]
    pub const fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    /// Set the warm-up bound
    #[must_use]
    pub const fn with_warm_up_limit(mut self, limit: usize) -> Self {
        self.warm_up_limit = limit;
        self
    }

    /// Set the reuse bound
    #[must_use]
    pub const fn with_max_reuse(mut self, max_reuse: u32) -> Self {
        self.max_reuse = max_reuse;
        self
    }

    /// Set the idle timeout in milliseconds
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout_ms: u64) -> Self {
        self.idle_timeout_ms = timeout_ms;
        self
    }

    /// Set the acquire timeout in milliseconds
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = timeout_ms;
        self
    }

    /// Idle timeout as Duration
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Acquire timeout as Duration
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns `Config` when no instance could ever be created
    pub fn validate(&self) -> VizhostResult<()> {
        if self.max_instances == 0 {
            return Err(VizhostError::config("max_instances must be at least 1"));
        }
        Ok(())
    }
}

/// Frame-capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Pause between setting the parameter and capturing
    pub settle_delay_ms: u64,
    /// Parameter names tried, in order, when the caller names none
    pub parameter_candidates: Vec<String>,
    /// Raster scale used when no explicit size is requested
    pub scale: f64,
    /// Raster DPI
    pub dpi: u32,
    /// Capture with a transparent background
    pub transparent: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 100,
            parameter_candidates: ["t", "a", "k", "n", "s", "time", "slider"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            scale: 1.0,
            dpi: 72,
            transparent: false,
        }
    }
}

impl CaptureConfig {
    /// Set the settle delay in milliseconds
    #[must_use]
    pub const fn with_settle_delay(mut self, delay_ms: u64) -> Self {
        self.settle_delay_ms = delay_ms;
        self
    }

    /// Replace the candidate parameter names
    #[must_use]
    pub fn with_candidates<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_candidates = names.into_iter().map(Into::into).collect();
        self
    }

    /// Settle delay as Duration
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Frame encoder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// ffmpeg executable
    pub ffmpeg_path: PathBuf,
    /// ffprobe executable
    pub ffprobe_path: PathBuf,
    /// Directory receiving encoded artifacts
    pub output_dir: PathBuf,
    /// Parent directory for per-job staging directories (None = system temp)
    pub staging_root: Option<PathBuf>,
    /// Budget for one encoder invocation
    pub encode_timeout_ms: u64,
    /// Reported size when neither frames nor the artifact reveal one
    pub fallback_canvas: (u32, u32),
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            output_dir: std::env::temp_dir().join("vizhost-exports"),
            staging_root: None,
            encode_timeout_ms: 120_000,
            fallback_canvas: (800, 600),
        }
    }
}

impl EncoderConfig {
    /// Set the output directory
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set the ffmpeg executable
    #[must_use]
    pub fn with_ffmpeg(mut self, path: impl Into<PathBuf>) -> Self {
        self.ffmpeg_path = path.into();
        self
    }

    /// Set the staging root
    #[must_use]
    pub fn with_staging_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(dir.into());
        self
    }

    /// Set the encode timeout in milliseconds
    #[must_use]
    pub const fn with_encode_timeout(mut self, timeout_ms: u64) -> Self {
        self.encode_timeout_ms = timeout_ms;
        self
    }

    /// Encode timeout as Duration
    #[must_use]
    pub const fn encode_timeout(&self) -> Duration {
        Duration::from_millis(self.encode_timeout_ms)
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VizhostConfig {
    /// Engine instances
    pub engine: EngineConfig,
    /// Instance pool
    pub pool: PoolConfig,
    /// Frame capture
    pub capture: CaptureConfig,
    /// Frame encoder
    pub encoder: EncoderConfig,
}

impl VizhostConfig {
    /// Parse a YAML document
    ///
    /// # Errors
    ///
    /// Returns `Yaml` if the document does not match the schema
    pub fn from_yaml_str(yaml: &str) -> VizhostResult<Self> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    /// Read a YAML file
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file is unreadable, `Yaml` if it is malformed
    pub fn from_yaml_file(path: &Path) -> VizhostResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Serialize to YAML
    ///
    /// # Errors
    ///
    /// Returns `Yaml` on serialization failure
    pub fn to_yaml(&self) -> VizhostResult<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    /// Apply `VIZHOST_*` environment overrides
    #[must_use]
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (environment in production)
    #[must_use]
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup("VIZHOST_CHROMIUM_PATH") {
            self.engine.chromium_path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("VIZHOST_BUNDLE_URL") {
            self.engine.bundle_url = url;
        }
        if let Some(headless) = lookup("VIZHOST_HEADLESS") {
            self.engine.headless = !matches!(headless.as_str(), "0" | "false" | "no");
        }
        if let Some(path) = lookup("VIZHOST_FFMPEG") {
            self.encoder.ffmpeg_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("VIZHOST_FFPROBE") {
            self.encoder.ffprobe_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("VIZHOST_OUTPUT_DIR") {
            self.encoder.output_dir = PathBuf::from(dir);
        }
        self
    }

    /// Validate every section
    ///
    /// # Errors
    ///
    /// Returns the first section error found
    pub fn validate(&self) -> VizhostResult<()> {
        self.engine.validate()?;
        self.pool.validate()?;
        if self.encoder.encode_timeout_ms == 0 {
            return Err(VizhostError::config("encode timeout must be non-zero"));
        }
        Ok(())
    }
}
