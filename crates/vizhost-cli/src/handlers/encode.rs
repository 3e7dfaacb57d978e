//! Encode command handler

use crate::commands::{EncodeArgs, EncodeFormat};
use crate::config::CliConfig;
use crate::error::{CliError, CliResult};
use crate::handlers::{print_json, runtime};
use std::path::{Path, PathBuf};
use vizhost::{
    Crf, EncodedArtifact, EncoderConfig, Frame, FrameEncoder, GifOptions, GifQuality, RasterImage,
    VideoContainer, VideoOptions,
};

/// PNG files in `dir`, sorted by file name
///
/// # Errors
///
/// Returns `Io` if the directory cannot be read, `InvalidArgument` if it
/// holds no PNG files
pub fn frame_files(dir: &Path) -> CliResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("png"))
        })
        .collect();
    if files.is_empty() {
        return Err(CliError::invalid_argument(format!(
            "no PNG frames in {}",
            dir.display()
        )));
    }
    files.sort();
    Ok(files)
}

/// Load frames, timestamped `1000 / fps` apart
///
/// # Errors
///
/// Returns `Io` for unreadable files, `Engine` for files that are not PNGs
pub fn load_frames(files: &[PathBuf], fps: u32) -> CliResult<Vec<Frame>> {
    let delay = 1000 / u64::from(fps.max(1));
    files
        .iter()
        .enumerate()
        .map(|(index, path)| -> CliResult<Frame> {
            let image = RasterImage::from_png(std::fs::read(path)?)?;
            Ok(Frame::new(index, index as f64, index as u64 * delay, image))
        })
        .collect()
}

/// Encode the frames with the requested format
///
/// # Errors
///
/// `Engine` for out-of-range quality or encoder failures
pub async fn run_encode(
    encoder: &FrameEncoder,
    frames: &[Frame],
    args: &EncodeArgs,
) -> CliResult<EncodedArtifact> {
    let artifact = match args.format {
        EncodeFormat::Gif => {
            let options = GifOptions {
                fps: args.fps.unwrap_or(GifOptions::default().fps),
                quality: args.quality.map(GifQuality::new).transpose()?.unwrap_or_default(),
                width: args.width,
                height: args.height,
                ..GifOptions::default()
            };
            encoder.convert_to_gif(frames, &options).await?
        }
        EncodeFormat::Mp4 | EncodeFormat::Webm => {
            let container = if args.format == EncodeFormat::Mp4 {
                VideoContainer::Mp4
            } else {
                VideoContainer::Webm
            };
            let options = VideoOptions {
                fps: args.fps.unwrap_or(VideoOptions::default().fps),
                crf: args.quality.map(Crf::new).transpose()?.unwrap_or_default(),
                width: args.width,
                height: args.height,
                container,
            };
            encoder.convert_to_video(frames, &options).await?
        }
    };
    Ok(artifact)
}

/// Encoder configuration with the output override applied
#[must_use]
pub fn encoder_config(config: &CliConfig, args: &EncodeArgs) -> EncoderConfig {
    let mut encoder = config.settings.encoder.clone();
    if let Some(dir) = &args.output {
        encoder.output_dir.clone_from(dir);
    }
    encoder
}

/// Execute the encode command
pub fn execute(config: &CliConfig, args: &EncodeArgs) -> CliResult<()> {
    let files = frame_files(&args.input)?;
    let fps = args.fps.unwrap_or(10);
    let frames = load_frames(&files, fps)?;
    let encoder = FrameEncoder::new(encoder_config(config, args));

    let artifact = runtime()?.block_on(run_encode(&encoder, &frames, args))?;
    if !config.verbosity.is_quiet() {
        print_json(&artifact)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use vizhost::{EngineConfig, EngineInstance, MockLauncher, MockOptions, RasterOptions};

    async fn rendered_png(width: u32, height: u32) -> Vec<u8> {
        let instance = EngineInstance::new(
            EngineConfig::default().with_viewport(width, height).with_poll_interval(5),
            Arc::new(MockLauncher::new(MockOptions::default())),
        );
        instance.initialize().await.unwrap();
        let png = instance.export_raster(RasterOptions::default()).await.unwrap().into_png();
        instance.cleanup().await;
        png
    }

    mod frame_file_tests {
        use super::*;

        #[test]
        fn test_frame_files_sorted_png_only() {
            let dir = TempDir::new().unwrap();
            for name in ["b.png", "a.png", "notes.txt", "c.PNG"] {
                std::fs::write(dir.path().join(name), b"x").unwrap();
            }
            let files = frame_files(dir.path()).unwrap();
            let names: Vec<_> = files
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
                .collect();
            assert_eq!(names, vec!["a.png", "b.png", "c.PNG"]);
        }

        #[test]
        fn test_empty_directory_rejected() {
            let dir = TempDir::new().unwrap();
            assert!(matches!(
                frame_files(dir.path()),
                Err(CliError::InvalidArgument { .. })
            ));
        }
    }

    mod load_tests {
        use super::*;

        #[test]
        fn test_non_png_content_rejected() {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("frame.png"), b"not a png").unwrap();
            let files = frame_files(dir.path()).unwrap();
            assert!(matches!(load_frames(&files, 10), Err(CliError::Engine(_))));
        }

        #[tokio::test]
        async fn test_frames_timestamped_by_fps() {
            let dir = TempDir::new().unwrap();
            let png = rendered_png(6, 4).await;
            for position in 0..3 {
                std::fs::write(dir.path().join(format!("f{position}.png")), &png).unwrap();
            }

            let frames = load_frames(&frame_files(dir.path()).unwrap(), 4).unwrap();
            let stamps: Vec<u64> = frames.iter().map(Frame::timestamp_ms).collect();
            assert_eq!(stamps, vec![0, 250, 500]);
            assert_eq!((frames[0].width(), frames[0].height()), (6, 4));
        }
    }

    mod encode_tests {
        use super::*;
        use clap::Parser;

        #[tokio::test]
        async fn test_out_of_range_quality_rejected_before_encoding() {
            let png = rendered_png(4, 4).await;
            let frame = Frame::new(0, 0.0, 0, RasterImage::from_png(png).unwrap());
            let args = EncodeArgs::parse_from(["encode", "in", "-f", "gif", "--quality", "0"]);
            let encoder = FrameEncoder::new(EncoderConfig::default().with_ffmpeg("/nonexistent/ffmpeg"));

            let err = run_encode(&encoder, &[frame], &args).await.unwrap_err();
            assert!(matches!(err, CliError::Engine(vizhost::VizhostError::Config { .. })));
        }

        #[test]
        fn test_output_override() {
            let args = EncodeArgs::parse_from(["encode", "in", "-o", "/tmp/vizhost-out"]);
            let encoder = encoder_config(&CliConfig::new(), &args);
            assert_eq!(encoder.output_dir, PathBuf::from("/tmp/vizhost-out"));
        }
    }
}
