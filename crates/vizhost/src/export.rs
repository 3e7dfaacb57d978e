//! Animation export entry point and the command result envelope.

use crate::capture::{AnimationCapture, CaptureWarning, FrameCapturer, SweepPlan};
use crate::config::CaptureConfig;
use crate::encoder::{
    Crf, EncodedArtifact, FrameEncoder, GifOptions, GifQuality, VideoContainer, VideoOptions,
};
use crate::frame::{FrameSummary, RasterOptions};
use crate::instance::EngineInstance;
use crate::result::{VizhostError, VizhostResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Frame delay used when neither a delay nor a rate is given (10 fps)
pub const DEFAULT_FRAME_DELAY_MS: u64 = 100;

/// Frame count used when neither a count nor a duration is given
pub const DEFAULT_FRAME_COUNT: usize = 30;

/// What an animation export should produce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Frames only, no encoding
    #[default]
    Frames,
    /// Animated GIF
    Gif,
    /// H.264 MP4
    Mp4,
    /// VP9 WebM
    Webm,
}

/// Animation export job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationRequest {
    /// Frames to capture (wins over `duration_ms`)
    pub frame_count: Option<usize>,
    /// Total duration, used to derive the frame count
    pub duration_ms: Option<u64>,
    /// Frames per second (used when `frame_delay_ms` is absent)
    pub frame_rate: Option<u32>,
    /// Delay between frames
    pub frame_delay_ms: Option<u64>,
    /// Output width
    pub width: Option<u32>,
    /// Output height
    pub height: Option<u32>,
    /// GIF quality (1-100) or video CRF (0-51), depending on `format`
    pub quality: Option<u8>,
    /// Output kind
    pub format: OutputFormat,
    /// Parameter to sweep before trying conventional names
    pub parameter: Option<String>,
    /// Final parameter value
    pub sweep_end: f64,
}

impl Default for AnimationRequest {
    fn default() -> Self {
        Self {
            frame_count: None,
            duration_ms: None,
            frame_rate: None,
            frame_delay_ms: None,
            width: None,
            height: None,
            quality: None,
            format: OutputFormat::Frames,
            parameter: None,
            sweep_end: 1.0,
        }
    }
}

impl AnimationRequest {
    /// `frame_count` frames, `frame_delay_ms` apart
    #[must_use]
    pub fn frames(frame_count: usize, frame_delay_ms: u64) -> Self {
        Self {
            frame_count: Some(frame_count),
            frame_delay_ms: Some(frame_delay_ms),
            ..Self::default()
        }
    }

    /// Set the output format
    #[must_use]
    pub const fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the output size
    #[must_use]
    pub const fn with_size(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the sweep end value
    #[must_use]
    pub const fn with_sweep_end(mut self, sweep_end: f64) -> Self {
        self.sweep_end = sweep_end;
        self
    }

    /// Name the swept parameter
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>) -> Self {
        self.parameter = Some(name.into());
        self
    }

    /// Set the quality value
    #[must_use]
    pub const fn with_quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Delay between frames: explicit, else from the rate, else 100ms
    #[must_use]
    pub fn frame_delay_ms(&self) -> u64 {
        self.frame_delay_ms
            .or_else(|| {
                self.frame_rate
                    .filter(|fps| *fps > 0)
                    .map(|fps| (1000 / u64::from(fps)).max(1))
            })
            .unwrap_or(DEFAULT_FRAME_DELAY_MS)
    }

    /// Frames to capture: explicit, else duration / delay, else 30
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frame_count
            .or_else(|| {
                let delay = self.frame_delay_ms().max(1);
                self.duration_ms
                    .map(|d| usize::try_from(d.div_ceil(delay)).unwrap_or(usize::MAX).max(1))
            })
            .unwrap_or(DEFAULT_FRAME_COUNT)
    }

    /// Encoder frame rate: explicit, else derived from the delay
    #[must_use]
    pub fn fps(&self) -> u32 {
        self.frame_rate.filter(|fps| *fps > 0).unwrap_or_else(|| {
            let delay = self.frame_delay_ms().max(1);
            u32::try_from((1000 + delay / 2) / delay).unwrap_or(1).max(1)
        })
    }

    /// Sweep plan for the capture driver
    #[must_use]
    pub fn plan(&self, capture: &CaptureConfig) -> SweepPlan {
        let raster = RasterOptions {
            scale: capture.scale,
            transparent: capture.transparent,
            dpi: capture.dpi,
            width: self.width,
            height: self.height,
        };
        let mut plan = SweepPlan::new(self.frame_count(), self.frame_delay_ms())
            .with_sweep_end(self.sweep_end)
            .with_raster(raster);
        plan.parameter = self.parameter.clone();
        plan
    }

    /// GIF encoder options
    ///
    /// # Errors
    ///
    /// `Config` if `quality` is outside 1-100
    pub fn gif_options(&self) -> VizhostResult<GifOptions> {
        Ok(GifOptions {
            fps: self.fps(),
            quality: self.quality.map(GifQuality::new).transpose()?.unwrap_or_default(),
            width: self.width,
            height: self.height,
            loop_count: 0,
        })
    }

    /// Video encoder options
    ///
    /// # Errors
    ///
    /// `Config` if `quality` is above 51
    pub fn video_options(&self, container: VideoContainer) -> VizhostResult<VideoOptions> {
        Ok(VideoOptions {
            fps: self.fps(),
            crf: self.quality.map(Crf::new).transpose()?.unwrap_or_default(),
            width: self.width,
            height: self.height,
            container,
        })
    }
}

/// Outcome of an animation export
#[derive(Debug, Clone, PartialEq)]
pub enum AnimationExport {
    /// Captured frames only
    Frames(AnimationCapture),
    /// Captured frames plus the encoded file
    Artifact {
        /// Captured frames
        capture: AnimationCapture,
        /// Encoded file
        artifact: EncodedArtifact,
    },
}

impl AnimationExport {
    /// The captured frames
    #[must_use]
    pub const fn capture(&self) -> &AnimationCapture {
        match self {
            Self::Frames(capture) | Self::Artifact { capture, .. } => capture,
        }
    }

    /// The encoded file, if one was produced
    #[must_use]
    pub const fn artifact(&self) -> Option<&EncodedArtifact> {
        match self {
            Self::Frames(_) => None,
            Self::Artifact { artifact, .. } => Some(artifact),
        }
    }

    /// Serializable summary without pixel data
    #[must_use]
    pub fn summary(&self) -> ExportSummary {
        let capture = self.capture();
        ExportSummary {
            requested: capture.requested,
            parameter: capture.parameter.clone(),
            frames: capture.summaries(),
            warnings: capture.warnings.clone(),
            artifact: self.artifact().cloned(),
        }
    }
}

/// Pixel-free description of an [`AnimationExport`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSummary {
    /// Frames requested
    pub requested: usize,
    /// Parameter that accepted the sweep
    pub parameter: Option<String>,
    /// Captured frames
    pub frames: Vec<FrameSummary>,
    /// Job-level warnings
    pub warnings: Vec<CaptureWarning>,
    /// Encoded file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<EncodedArtifact>,
}

/// Capture an animation and optionally encode it.
///
/// # Errors
///
/// `Connection` if the instance is unusable, `Export` if no frame could be
/// captured, `Config` for an out-of-range quality, and `Encoding`/`Timeout`
/// from the encoder
#[tracing::instrument(skip_all, fields(instance = %instance.id(), format = ?request.format))]
pub async fn export_animation(
    instance: &EngineInstance,
    request: &AnimationRequest,
    capture_config: &CaptureConfig,
    encoder: &FrameEncoder,
) -> VizhostResult<AnimationExport> {
    // Validate encoder options before spending time on the sweep.
    let gif = matches!(request.format, OutputFormat::Gif)
        .then(|| request.gif_options())
        .transpose()?;
    let video = match request.format {
        OutputFormat::Mp4 => Some(request.video_options(VideoContainer::Mp4)?),
        OutputFormat::Webm => Some(request.video_options(VideoContainer::Webm)?),
        OutputFormat::Frames | OutputFormat::Gif => None,
    };

    let capturer = FrameCapturer::new(capture_config.clone());
    let capture = capturer.capture(instance, &request.plan(capture_config)).await?;
    if capture.frames.is_empty() {
        return Err(VizhostError::export(format!(
            "no frames captured out of {} requested",
            capture.requested
        )));
    }

    let artifact = if let Some(options) = gif {
        encoder.convert_to_gif(&capture.frames, &options).await?
    } else if let Some(options) = video {
        encoder.convert_to_video(&capture.frames, &options).await?
    } else {
        return Ok(AnimationExport::Frames(capture));
    };

    info!(path = %artifact.path.display(), "animation exported");
    Ok(AnimationExport::Artifact { capture, artifact })
}

/// Structured `{success, result | error}` response for a dispatcher.
///
/// Exactly one of `result` and `error` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the operation succeeded
    pub success: bool,
    /// Result value on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    /// Successful result
    #[must_use]
    pub const fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed result
    #[must_use]
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

impl<T: Serialize> From<VizhostResult<T>> for CommandResult {
    fn from(result: VizhostResult<T>) -> Self {
        match result.and_then(|value| serde_json::to_value(value).map_err(VizhostError::from)) {
            Ok(value) => Self::ok(value),
            Err(e) => Self::err(e.to_string()),
        }
    }
}

/// Run one command and wrap the outcome
pub async fn run_command(instance: &EngineInstance, command: &str) -> CommandResult {
    CommandResult::from(instance.eval_command(command).await)
}
