//! vizhost: headless hosting for a string-driven math visualization engine
//!
//! The engine runs inside a headless Chromium page and is driven entirely by
//! textual commands (`evalCommand("f(x) = x^2")`). vizhost keeps engine
//! sessions alive across many short requests, sweeps parameters to capture
//! animation frames, and hands the frames to `ffmpeg`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   lease / default   ┌────────────────┐   applet calls   ┌──────────────┐
//! │ InstancePool │ ──────────────────► │ EngineInstance │ ───────────────► │ EngineDriver │
//! └──────────────┘                     └────────────────┘                  │ (chromium /  │
//!                                              │                           │  mock)       │
//!                                              ▼                           └──────────────┘
//!                                      ┌────────────────┐   frames   ┌──────────────┐
//!                                      │ FrameCapturer  │ ─────────► │ FrameEncoder │──► ffmpeg
//!                                      └────────────────┘            └──────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vizhost::{InstancePool, MockLauncher, MockOptions, VizhostConfig};
//!
//! # async fn demo() -> vizhost::VizhostResult<()> {
//! // `ChromiumLauncher` (feature `browser`) hosts the real engine
//! let config = VizhostConfig::default().apply_env();
//! let launcher = MockLauncher::new(MockOptions::default());
//! let pool = InstancePool::from_config(&config, Arc::new(launcher));
//!
//! let engine = pool.get_default_instance().await?;
//! engine.eval_command("f(x) = sin(x)").await?;
//! let png = engine.export_raster(Default::default()).await?;
//! println!("{}x{}", png.width(), png.height());
//!
//! pool.cleanup().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::large_stack_arrays, clippy::large_stack_frames))]

pub mod capture;
#[cfg(feature = "browser")]
pub mod chromium;
pub mod config;
pub mod driver;
pub mod encoder;
pub mod export;
pub mod frame;
pub mod instance;
pub mod mock;
pub mod pool;
pub mod probe;
mod result;

pub use capture::{
    candidate_order, sample_schedule, AnimationCapture, CaptureWarning, FrameCapturer, Sample,
    SweepPlan,
};
#[cfg(feature = "browser")]
pub use chromium::{ChromiumDriver, ChromiumLauncher};
pub use config::{
    CaptureConfig, EncoderConfig, EngineConfig, PoolConfig, VizhostConfig, DEFAULT_APPLET_GLOBAL,
    DEFAULT_BUNDLE_URL,
};
pub use driver::{EngineDriver, EngineLauncher, Readiness};
pub use encoder::{
    even_down, is_ffmpeg_on_path, video_scale, ArtifactFormat, Crf, EncodedArtifact, FrameEncoder,
    GifOptions, GifQuality, ScaleTarget, VideoContainer, VideoOptions,
};
pub use export::{
    export_animation, run_command, AnimationExport, AnimationRequest, CommandResult,
    ExportSummary, OutputFormat,
};
pub use frame::{checksum, Frame, FrameSummary, RasterImage, RasterOptions};
pub use instance::{EngineInstance, EngineSession, InstanceId, InstanceState, ObjectInfo};
pub use mock::{MockEngine, MockHandle, MockLauncher, MockOptions};
pub use pool::{InstancePool, PoolLease, PoolStats};
pub use probe::{probe_media, MediaProbe};
pub use result::{VizhostError, VizhostResult};
