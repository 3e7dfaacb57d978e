//! Encoded media probing via ffprobe.
//!
//! Used to report the dimensions an artifact actually came out with, which
//! can differ from the requested ones after even-size normalization.

use crate::result::{VizhostError, VizhostResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Metadata of the first video stream in a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProbe {
    /// Codec name (`h264`, `vp9`, `gif`)
    pub codec: String,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Frame rate
    pub fps: f64,
    /// Duration in seconds (0 when unknown)
    pub duration_secs: f64,
    /// Pixel format
    pub pixel_format: String,
    /// Frame count, when the container records it
    pub frame_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
    pix_fmt: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Arguments for a JSON stream/format probe of `path`
#[must_use]
pub fn build_ffprobe_args(path: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        "error".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_format".to_string(),
        "-show_streams".to_string(),
        path.to_string_lossy().to_string(),
    ]
}

/// Probe a media file.
///
/// # Errors
///
/// Returns `Encoding` if ffprobe cannot run, fails, times out, or reports no
/// video stream
pub async fn probe_media(ffprobe: &Path, path: &Path, timeout: Duration) -> VizhostResult<MediaProbe> {
    let run = Command::new(ffprobe)
        .args(build_ffprobe_args(path))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| {
            VizhostError::encoding(
                format!("ffprobe timed out after {}ms", timeout.as_millis()),
                "",
            )
        })?
        .map_err(|e| VizhostError::encoding(format!("failed to execute ffprobe: {e}"), ""))?;

    if !output.status.success() {
        return Err(VizhostError::encoding(
            format!("ffprobe exited with {}", output.status),
            String::from_utf8_lossy(&output.stderr),
        ));
    }

    parse_ffprobe_json(&String::from_utf8_lossy(&output.stdout))
}

/// Parse ffprobe JSON output.
///
/// # Errors
///
/// Returns `Encoding` if the JSON is malformed or has no video stream
pub fn parse_ffprobe_json(json: &str) -> VizhostResult<MediaProbe> {
    let parsed: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| VizhostError::encoding(format!("failed to parse ffprobe output: {e}"), ""))?;

    let stream = parsed
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| VizhostError::encoding("no video stream found", ""))?;

    let duration_secs = stream
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            parsed
                .format
                .as_ref()
                .and_then(|f| f.duration.as_deref())
                .and_then(|d| d.parse::<f64>().ok())
        })
        .unwrap_or(0.0);

    Ok(MediaProbe {
        codec: stream.codec_name.unwrap_or_else(|| "unknown".to_string()),
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        fps: stream.r_frame_rate.as_deref().map_or(0.0, parse_rate),
        duration_secs,
        pixel_format: stream.pix_fmt.unwrap_or_else(|| "unknown".to_string()),
        frame_count: stream.nb_frames.and_then(|n| n.parse().ok()),
    })
}

/// Parse "30000/1001" or "25" into frames per second
fn parse_rate(rate: &str) -> f64 {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(0.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => rate.parse().unwrap_or(0.0),
    }
}
