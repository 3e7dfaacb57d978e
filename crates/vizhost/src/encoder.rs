//! Frame sequence encoding through an external ffmpeg.
//!
//! Each job stages its frames as `frame_00000.png ...` in a private
//! temporary directory. The directory is removed when the job finishes,
//! fails, or is dropped mid-flight, and a dropped job also kills the
//! encoder process.
//!
//! GIF and video quality run in opposite directions: [`GifQuality`] is
//! higher-is-better, [`Crf`] is lower-is-better. They are separate types so
//! one cannot be passed where the other is expected.

use crate::config::EncoderConfig;
use crate::frame::Frame;
use crate::probe::probe_media;
use crate::result::{VizhostError, VizhostResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the staged file for the `position`-th frame
#[must_use]
pub fn staged_frame_name(position: usize) -> String {
    format!("frame_{position:05}.png")
}

const FRAME_PATTERN: &str = "frame_%05d.png";
const PALETTE_NAME: &str = "palette.png";

/// GIF quality, 1-100, higher is better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct GifQuality(u8);

impl GifQuality {
    /// Validate a quality value
    ///
    /// # Errors
    ///
    /// Returns `Config` outside 1-100
    pub fn new(value: u8) -> VizhostResult<Self> {
        if (1..=100).contains(&value) {
            Ok(Self(value))
        } else {
            Err(VizhostError::config(format!(
                "GIF quality must be 1-100, got {value}"
            )))
        }
    }

    /// Raw value
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Palette size: 16 colours at quality 1, 256 at quality 100
    #[must_use]
    pub const fn max_colors(self) -> u32 {
        16 + (self.0 as u32 - 1) * 240 / 99
    }

    /// Dithering used when applying the palette
    #[must_use]
    pub const fn dither(self) -> &'static str {
        match self.0 {
            75..=u8::MAX => "sierra2_4a",
            40..=74 => "bayer:bayer_scale=3",
            _ => "none",
        }
    }
}

impl Default for GifQuality {
    fn default() -> Self {
        Self(80)
    }
}

impl TryFrom<u8> for GifQuality {
    type Error = VizhostError;

    fn try_from(value: u8) -> VizhostResult<Self> {
        Self::new(value)
    }
}

impl From<GifQuality> for u8 {
    fn from(quality: GifQuality) -> Self {
        quality.0
    }
}

/// x264/VP9 constant rate factor, 0-51, lower is better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Crf(u8);

impl Crf {
    /// Validate a CRF value
    ///
    /// # Errors
    ///
    /// Returns `Config` above 51
    pub fn new(value: u8) -> VizhostResult<Self> {
        if value <= 51 {
            Ok(Self(value))
        } else {
            Err(VizhostError::config(format!("CRF must be 0-51, got {value}")))
        }
    }

    /// Raw value
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for Crf {
    fn default() -> Self {
        Self(23)
    }
}

impl TryFrom<u8> for Crf {
    type Error = VizhostError;

    fn try_from(value: u8) -> VizhostResult<Self> {
        Self::new(value)
    }
}

impl From<Crf> for u8 {
    fn from(crf: Crf) -> Self {
        crf.0
    }
}

/// Video container and codec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoContainer {
    /// H.264 in MP4
    #[default]
    Mp4,
    /// VP9 in WebM
    Webm,
}

impl VideoContainer {
    /// File extension
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
        }
    }

    fn codec_args(self, crf: Crf) -> Vec<String> {
        let crf = crf.get().to_string();
        let args: Vec<&str> = match self {
            Self::Mp4 => vec![
                "-c:v", "libx264", "-preset", "medium", "-crf", crf.as_str(), "-pix_fmt", "yuv420p",
                "-movflags", "+faststart",
            ],
            Self::Webm => vec![
                "-c:v", "libvpx-vp9", "-crf", crf.as_str(), "-b:v", "0", "-pix_fmt", "yuv420p",
            ],
        };
        args.into_iter().map(String::from).collect()
    }
}

/// Kind of encoded artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// Animated GIF
    Gif,
    /// MP4 video
    Mp4,
    /// WebM video
    Webm,
}

impl ArtifactFormat {
    /// File extension
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Gif => "gif",
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
        }
    }
}

impl From<VideoContainer> for ArtifactFormat {
    fn from(container: VideoContainer) -> Self {
        match container {
            VideoContainer::Mp4 => Self::Mp4,
            VideoContainer::Webm => Self::Webm,
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// GIF encoding options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GifOptions {
    /// Frames per second
    pub fps: u32,
    /// Palette quality
    pub quality: GifQuality,
    /// Output width
    pub width: Option<u32>,
    /// Output height
    pub height: Option<u32>,
    /// Loop count (0 = forever)
    pub loop_count: u16,
}

impl Default for GifOptions {
    fn default() -> Self {
        Self {
            fps: 10,
            quality: GifQuality::default(),
            width: None,
            height: None,
            loop_count: 0,
        }
    }
}

/// Video encoding options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoOptions {
    /// Frames per second
    pub fps: u32,
    /// Constant rate factor
    pub crf: Crf,
    /// Output width (rounded down to even)
    pub width: Option<u32>,
    /// Output height (rounded down to even)
    pub height: Option<u32>,
    /// Container
    pub container: VideoContainer,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            fps: 30,
            crf: Crf::default(),
            width: None,
            height: None,
            container: VideoContainer::Mp4,
        }
    }
}

/// Encoded output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedArtifact {
    /// Location of the file
    pub path: PathBuf,
    /// File size
    pub size_bytes: u64,
    /// Encoded width
    pub width: u32,
    /// Encoded height
    pub height: u32,
    /// Format
    pub format: ArtifactFormat,
}

/// Output size for a video encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleTarget {
    /// Known even dimensions
    Exact(u32, u32),
    /// Fixed even width, height from aspect ratio
    Width(u32),
    /// Fixed even height, width from aspect ratio
    Height(u32),
    /// Source size unknown: ffmpeg rounds the larger side down to even and
    /// keeps the aspect ratio
    Expression,
}

impl ScaleTarget {
    /// ffmpeg `scale` filter for this target
    #[must_use]
    pub fn filter(self) -> String {
        match self {
            Self::Exact(w, h) => format!("scale={w}:{h}"),
            Self::Width(w) => format!("scale={w}:-2"),
            Self::Height(h) => format!("scale=-2:{h}"),
            Self::Expression => {
                "scale='if(gte(iw,ih),trunc(iw/2)*2,-2)':'if(gte(iw,ih),-2,trunc(ih/2)*2)'"
                    .to_string()
            }
        }
    }

    /// Dimensions, when known before encoding
    #[must_use]
    pub const fn dimensions(self) -> Option<(u32, u32)> {
        match self {
            Self::Exact(w, h) => Some((w, h)),
            _ => None,
        }
    }
}

/// Round down to even, never below 2
#[must_use]
pub const fn even_down(value: u32) -> u32 {
    let even = value & !1;
    if even < 2 {
        2
    } else {
        even
    }
}

fn scaled(other: u32, target: u32, basis: u32) -> u32 {
    (f64::from(other) * f64::from(target) / f64::from(basis.max(1))).round() as u32
}

/// Even output dimensions for a video encode.
///
/// Explicit dimensions are each rounded down to even. Without them, the
/// larger side of `source` is rounded down to even and the other side is
/// scaled to keep the aspect ratio, then rounded down to even too. An
/// unknown source leaves the computation to ffmpeg.
#[must_use]
pub fn video_scale(width: Option<u32>, height: Option<u32>, source: Option<(u32, u32)>) -> ScaleTarget {
    match (width, height, source) {
        (Some(w), Some(h), _) => ScaleTarget::Exact(even_down(w), even_down(h)),
        (Some(w), None, Some((sw, sh))) => {
            let w = even_down(w);
            ScaleTarget::Exact(w, even_down(scaled(sh, w, sw)))
        }
        (None, Some(h), Some((sw, sh))) => {
            let h = even_down(h);
            ScaleTarget::Exact(even_down(scaled(sw, h, sh)), h)
        }
        (Some(w), None, None) => ScaleTarget::Width(even_down(w)),
        (None, Some(h), None) => ScaleTarget::Height(even_down(h)),
        (None, None, Some((sw, sh))) => {
            if sw >= sh {
                let w = even_down(sw);
                ScaleTarget::Exact(w, even_down(scaled(sh, w, sw)))
            } else {
                let h = even_down(sh);
                ScaleTarget::Exact(even_down(scaled(sw, h, sh)), h)
            }
        }
        (None, None, None) => ScaleTarget::Expression,
    }
}

/// GIF output size; GIF has no parity constraint
fn gif_size(width: Option<u32>, height: Option<u32>, source: Option<(u32, u32)>) -> Option<(u32, u32)> {
    match (width, height, source) {
        (Some(w), Some(h), _) => Some((w.max(1), h.max(1))),
        (Some(w), None, Some((sw, sh))) => Some((w.max(1), scaled(sh, w, sw).max(1))),
        (None, Some(h), Some((sw, sh))) => Some((scaled(sw, h, sh).max(1), h.max(1))),
        (None, None, source) => source,
        _ => None,
    }
}

fn gif_base_filter(options: &GifOptions) -> String {
    let w = options.width.map_or_else(|| "-1".to_string(), |w| w.to_string());
    let h = options.height.map_or_else(|| "-1".to_string(), |h| h.to_string());
    if options.width.is_some() || options.height.is_some() {
        format!("fps={},scale={w}:{h}:flags=lanczos", options.fps)
    } else {
        format!("fps={}", options.fps)
    }
}

fn input_args(staging: &Path, fps: u32) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-framerate".to_string(),
        fps.to_string(),
        "-i".to_string(),
        staging.join(FRAME_PATTERN).to_string_lossy().to_string(),
    ]
}

/// First GIF pass: build a palette from the staged frames
#[must_use]
pub fn gif_palette_args(staging: &Path, options: &GifOptions) -> Vec<String> {
    let mut args = input_args(staging, options.fps);
    args.extend([
        "-vf".to_string(),
        format!(
            "{},palettegen=max_colors={}:stats_mode=diff",
            gif_base_filter(options),
            options.quality.max_colors()
        ),
        staging.join(PALETTE_NAME).to_string_lossy().to_string(),
    ]);
    args
}

/// Second GIF pass: render the frames through the palette
#[must_use]
pub fn gif_render_args(staging: &Path, options: &GifOptions, output: &Path) -> Vec<String> {
    let mut args = input_args(staging, options.fps);
    args.extend([
        "-i".to_string(),
        staging.join(PALETTE_NAME).to_string_lossy().to_string(),
        "-lavfi".to_string(),
        format!(
            "{}[x];[x][1:v]paletteuse=dither={}",
            gif_base_filter(options),
            options.quality.dither()
        ),
        "-loop".to_string(),
        options.loop_count.to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

/// Single-pass video encode
#[must_use]
pub fn video_args(staging: &Path, options: &VideoOptions, scale: ScaleTarget, output: &Path) -> Vec<String> {
    let mut args = input_args(staging, options.fps);
    args.extend(["-an".to_string(), "-vf".to_string(), scale.filter()]);
    args.extend(options.container.codec_args(options.crf));
    args.push(output.to_string_lossy().to_string());
    args
}

/// Size shared by every frame, if they agree
fn common_size(frames: &[Frame]) -> Option<(u32, u32)> {
    let first = frames.first()?;
    let size = (first.width(), first.height());
    (size.0 > 0
        && size.1 > 0
        && frames.iter().all(|f| (f.width(), f.height()) == size))
        .then_some(size)
}

/// Whether an `ffmpeg` binary answers on PATH
#[must_use]
pub fn is_ffmpeg_on_path() -> bool {
    std::process::Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Output file of a job in progress; removed on drop unless kept.
///
/// Covers encoder failures, timeouts and a dropped job future alike, so a
/// truncated artifact never stays in the output directory.
#[derive(Debug)]
struct PartialOutput {
    path: PathBuf,
    kept: bool,
}

impl PartialOutput {
    const fn new(path: PathBuf) -> Self {
        Self { path, kept: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed partial output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove partial output"),
        }
    }
}

/// Turns frame sequences into GIF or video files
#[derive(Debug, Clone, Default)]
pub struct FrameEncoder {
    config: EncoderConfig,
}

impl FrameEncoder {
    /// Create an encoder
    #[must_use]
    pub const fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    /// Encoder configuration
    #[must_use]
    pub const fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Whether the configured ffmpeg can be executed
    pub async fn is_available(&self) -> bool {
        Command::new(&self.config.ffmpeg_path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .is_ok_and(|s| s.success())
    }

    /// Write frames into a fresh staging directory.
    ///
    /// Files are numbered by position, so gaps from skipped captures do not
    /// break the input pattern.
    ///
    /// # Errors
    ///
    /// `Io` if the directory or a file cannot be written
    pub async fn stage(&self, frames: &[Frame]) -> VizhostResult<TempDir> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("vizhost-frames-");
            builder
        };
        let staging = match &self.config.staging_root {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        for (position, frame) in frames.iter().enumerate() {
            tokio::fs::write(staging.path().join(staged_frame_name(position)), frame.png()).await?;
        }
        debug!(dir = %staging.path().display(), frames = frames.len(), "frames staged");
        Ok(staging)
    }

    async fn output_path(&self, prefix: &str, format: ArtifactFormat) -> VizhostResult<PathBuf> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        Ok(self.config.output_dir.join(format!(
            "{prefix}_{}.{}",
            Uuid::new_v4().simple(),
            format.extension()
        )))
    }

    async fn run_ffmpeg(&self, args: &[String]) -> VizhostResult<()> {
        let ffmpeg = &self.config.ffmpeg_path;
        debug!(ffmpeg = %ffmpeg.display(), ?args, "running encoder");

        let child = Command::new(ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VizhostError::encoding(
                    format!("failed to spawn {} (is it installed?): {e}", ffmpeg.display()),
                    "",
                )
            })?;

        let output = tokio::time::timeout(self.config.encode_timeout(), child.wait_with_output())
            .await
            .map_err(|_| VizhostError::timeout("ffmpeg", self.config.encode_timeout_ms))?
            .map_err(|e| VizhostError::encoding(format!("failed to wait for ffmpeg: {e}"), ""))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(VizhostError::encoding(
                format!("ffmpeg exited with {}", output.status),
                String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    async fn finish(
        &self,
        path: PathBuf,
        format: ArtifactFormat,
        planned: Option<(u32, u32)>,
        started: Instant,
    ) -> VizhostResult<EncodedArtifact> {
        let size_bytes = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            Ok(_) => {
                return Err(VizhostError::encoding("ffmpeg produced an empty file", ""));
            }
            Err(e) => {
                return Err(VizhostError::encoding(
                    format!("ffmpeg produced no output at {}: {e}", path.display()),
                    "",
                ))
            }
        };

        let (width, height) = match probe_media(
            &self.config.ffprobe_path,
            &path,
            Duration::from_secs(10),
        )
        .await
        {
            Ok(probe) if probe.width > 0 && probe.height > 0 => (probe.width, probe.height),
            Ok(_) => planned.unwrap_or(self.config.fallback_canvas),
            Err(e) => {
                debug!(error = %e, "ffprobe unavailable, reporting planned size");
                planned.unwrap_or(self.config.fallback_canvas)
            }
        };

        info!(
            path = %path.display(),
            %format,
            size_bytes,
            width,
            height,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "artifact encoded"
        );
        Ok(EncodedArtifact {
            path,
            size_bytes,
            width,
            height,
            format,
        })
    }

    fn check_input(frames: &[Frame], fps: u32) -> VizhostResult<()> {
        if frames.is_empty() {
            return Err(VizhostError::encoding("no frames to encode", ""));
        }
        if fps == 0 {
            return Err(VizhostError::encoding("frame rate must be at least 1", ""));
        }
        Ok(())
    }

    /// Encode frames as an animated GIF with a generated palette.
    ///
    /// # Errors
    ///
    /// `Encoding` with ffmpeg's stderr on failure, `Timeout` if the encoder
    /// overruns `encode_timeout_ms`, `Io` for staging failures
    #[tracing::instrument(skip(self, frames), fields(frames = frames.len()))]
    pub async fn convert_to_gif(&self, frames: &[Frame], options: &GifOptions) -> VizhostResult<EncodedArtifact> {
        Self::check_input(frames, options.fps)?;
        let started = Instant::now();
        let staging = self.stage(frames).await?;
        let output = PartialOutput::new(self.output_path("animation", ArtifactFormat::Gif).await?);

        self.run_ffmpeg(&gif_palette_args(staging.path(), options)).await?;
        self.run_ffmpeg(&gif_render_args(staging.path(), options, output.path())).await?;
        drop(staging);

        let planned = gif_size(options.width, options.height, common_size(frames));
        let artifact = self
            .finish(output.path().to_path_buf(), ArtifactFormat::Gif, planned, started)
            .await?;
        output.keep();
        Ok(artifact)
    }

    /// Encode frames as video with even output dimensions.
    ///
    /// # Errors
    ///
    /// `Encoding` with ffmpeg's stderr on failure, `Timeout` if the encoder
    /// overruns `encode_timeout_ms`, `Io` for staging failures
    #[tracing::instrument(skip(self, frames), fields(frames = frames.len()))]
    pub async fn convert_to_video(&self, frames: &[Frame], options: &VideoOptions) -> VizhostResult<EncodedArtifact> {
        Self::check_input(frames, options.fps)?;
        let started = Instant::now();
        let scale = video_scale(options.width, options.height, common_size(frames));
        let format = ArtifactFormat::from(options.container);

        let staging = self.stage(frames).await?;
        let output = PartialOutput::new(self.output_path("animation", format).await?);
        self.run_ffmpeg(&video_args(staging.path(), options, scale, output.path())).await?;
        drop(staging);

        let artifact = self
            .finish(output.path().to_path_buf(), format, scale.dimensions(), started)
            .await?;
        output.keep();
        Ok(artifact)
    }
}
