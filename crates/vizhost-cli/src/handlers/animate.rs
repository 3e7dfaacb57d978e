//! Animate command handler.
//!
//! Orchestrates: setup commands -> parameter sweep -> frames on disk or an
//! encoded artifact -> JSON summary.

use crate::commands::AnimateArgs;
use crate::config::CliConfig;
use crate::error::CliResult;
use crate::handlers::{apply_commands, open_pool, print_json, runtime};
use serde::Serialize;
use std::path::{Path, PathBuf};
use vizhost::encoder::staged_frame_name;
use vizhost::{
    export_animation, AnimationExport, AnimationRequest, ExportSummary, Frame, FrameEncoder,
    InstancePool, VizhostConfig,
};

/// Summary printed after an animation export
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnimateReport {
    /// Capture and artifact summary
    #[serde(flatten)]
    pub summary: ExportSummary,
    /// Directory the PNG frames were written to (`frames` format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames_dir: Option<PathBuf>,
}

/// Export request from the arguments
#[must_use]
pub fn request(args: &AnimateArgs) -> AnimationRequest {
    AnimationRequest {
        frame_count: args.frames,
        duration_ms: args.duration,
        frame_rate: args.fps,
        frame_delay_ms: args.delay,
        width: args.width,
        height: args.height,
        quality: args.quality,
        format: args.format.into(),
        parameter: args.parameter.clone(),
        sweep_end: args.sweep_end,
    }
}

/// Output directory: the argument, else the encoder's
#[must_use]
pub fn output_dir(settings: &VizhostConfig, args: &AnimateArgs) -> PathBuf {
    args.output
        .clone()
        .unwrap_or_else(|| settings.encoder.output_dir.clone())
}

/// Write frames as `frame_00000.png`, numbered by position
///
/// # Errors
///
/// Returns `Io` if the directory or a file cannot be written
pub async fn write_frames(dir: &Path, frames: &[Frame]) -> CliResult<()> {
    tokio::fs::create_dir_all(dir).await?;
    for (position, frame) in frames.iter().enumerate() {
        tokio::fs::write(dir.join(staged_frame_name(position)), frame.png()).await?;
    }
    Ok(())
}

/// Run the export on the default instance
///
/// # Errors
///
/// Engine errors from setup, capture, or encoding; `Io` for frame output
pub async fn run_animate(
    pool: &InstancePool,
    settings: &VizhostConfig,
    args: &AnimateArgs,
) -> CliResult<AnimateReport> {
    let instance = pool.get_default_instance().await?;
    apply_commands(&instance, &args.commands).await?;

    let dir = output_dir(settings, args);
    let mut encoder_config = settings.encoder.clone();
    encoder_config.output_dir.clone_from(&dir);
    let encoder = FrameEncoder::new(encoder_config);

    let export = export_animation(&instance, &request(args), &settings.capture, &encoder).await?;

    let frames_dir = if let AnimationExport::Frames(capture) = &export {
        write_frames(&dir, &capture.frames).await?;
        Some(dir)
    } else {
        None
    };
    Ok(AnimateReport {
        summary: export.summary(),
        frames_dir,
    })
}

/// Execute the animate command
pub fn execute(config: &CliConfig, args: &AnimateArgs) -> CliResult<()> {
    let pool = open_pool(config)?;
    let report = runtime()?.block_on(async {
        let report = run_animate(&pool, &config.settings, args).await;
        pool.cleanup().await;
        report
    })?;
    if !config.verbosity.is_quiet() {
        print_json(&report)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;
    use vizhost::OutputFormat;

    fn parse(extra: &[&str]) -> AnimateArgs {
        let mut argv = vec!["animate"];
        argv.extend_from_slice(extra);
        AnimateArgs::parse_from(argv)
    }

    fn fast_settings() -> VizhostConfig {
        let mut settings = VizhostConfig::default();
        settings.capture.settle_delay_ms = 0;
        settings.engine.poll_interval_ms = 5;
        settings
    }

    #[test]
    fn test_request_from_args() {
        let args = parse(&["--frames", "12", "--fps", "24", "-p", "k", "--sweep-end", "6.28", "-f", "mp4"]);
        let request = request(&args);
        assert_eq!(request.frame_count(), 12);
        assert_eq!(request.fps(), 24);
        assert_eq!(request.parameter.as_deref(), Some("k"));
        assert_eq!(request.format, OutputFormat::Mp4);
        assert!((request.sweep_end - 6.28).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duration_derives_frame_count() {
        let args = parse(&["--duration", "1000", "--delay", "250"]);
        assert_eq!(request(&args).frame_count(), 4);
    }

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let dir = TempDir::new().unwrap();
        let settings = fast_settings();
        let config = CliConfig {
            settings: settings.clone(),
            ..CliConfig::new().with_mock(true)
        };
        let pool = open_pool(&config).unwrap();
        let out = dir.path().join("frames");
        let args = parse(&["-f", "frames", "--frames", "3", "-o", out.to_str().unwrap()]);

        let report = run_animate(&pool, &settings, &args).await.unwrap();
        pool.cleanup().await;

        assert_eq!(report.frames_dir.as_deref(), Some(out.as_path()));
        assert_eq!(report.summary.frames.len(), 3);
        assert_eq!(report.summary.parameter.as_deref(), Some("t"));
        for position in 0..3 {
            assert!(out.join(staged_frame_name(position)).is_file());
        }

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["requested"], 3);
        assert!(json.get("artifact").is_none());
    }
}
