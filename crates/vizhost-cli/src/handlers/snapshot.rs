//! Snapshot command handler

use crate::commands::{SnapshotArgs, SnapshotFormat};
use crate::config::CliConfig;
use crate::error::CliResult;
use crate::handlers::{apply_commands, open_pool, print_json, runtime};
use serde::Serialize;
use std::path::{Path, PathBuf};
use vizhost::{InstancePool, RasterOptions, VizhostConfig};

/// What was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    /// Output file
    pub path: PathBuf,
    /// Bytes written
    pub size_bytes: u64,
    /// Pixel size (PNG only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Pixel size (PNG only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Raster options from the arguments and capture defaults
#[must_use]
pub fn raster_options(settings: &VizhostConfig, args: &SnapshotArgs) -> RasterOptions {
    RasterOptions {
        scale: args.scale.unwrap_or(settings.capture.scale),
        transparent: args.transparent || settings.capture.transparent,
        dpi: settings.capture.dpi,
        width: args.width,
        height: args.height,
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> CliResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Build the construction on the default instance and export it
///
/// # Errors
///
/// Engine errors from setup or export, `Io` if the file cannot be written
pub async fn run_snapshot(
    pool: &InstancePool,
    settings: &VizhostConfig,
    args: &SnapshotArgs,
) -> CliResult<SnapshotReport> {
    let instance = pool.get_default_instance().await?;
    apply_commands(&instance, &args.commands).await?;

    let (bytes, size) = match args.format {
        SnapshotFormat::Png => {
            let image = instance.export_raster(raster_options(settings, args)).await?;
            let size = (image.width(), image.height());
            (image.into_png(), Some(size))
        }
        SnapshotFormat::Svg => (instance.export_vector().await?.into_bytes(), None),
    };
    write_file(&args.output, &bytes).await?;

    Ok(SnapshotReport {
        path: args.output.clone(),
        size_bytes: bytes.len() as u64,
        width: size.map(|(w, _)| w),
        height: size.map(|(_, h)| h),
    })
}

/// Execute the snapshot command
pub fn execute(config: &CliConfig, args: &SnapshotArgs) -> CliResult<()> {
    let pool = open_pool(config)?;
    let report = runtime()?.block_on(async {
        let report = run_snapshot(&pool, &config.settings, args).await;
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
    use crate::error::CliError;
    use tempfile::TempDir;

    fn args(output: PathBuf, format: SnapshotFormat) -> SnapshotArgs {
        SnapshotArgs {
            commands: vec!["f(x) = x^2".to_string()],
            format,
            output,
            width: None,
            height: None,
            scale: None,
            transparent: false,
        }
    }

    #[test]
    fn test_raster_options_fall_back_to_capture_defaults() {
        let settings = VizhostConfig::default();
        let mut snapshot = args(PathBuf::from("x.png"), SnapshotFormat::Png);
        snapshot.width = Some(400);
        let options = raster_options(&settings, &snapshot);
        assert!((options.scale - settings.capture.scale).abs() < f64::EPSILON);
        assert_eq!(options.width, Some(400));
        assert_eq!(options.dpi, settings.capture.dpi);
    }

    #[tokio::test]
    async fn test_png_snapshot_written() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::new().with_mock(true);
        let pool = open_pool(&config).unwrap();
        let mut snapshot = args(dir.path().join("nested/plot.png"), SnapshotFormat::Png);
        snapshot.scale = Some(0.5);

        let report = run_snapshot(&pool, &config.settings, &snapshot).await.unwrap();
        pool.cleanup().await;

        assert_eq!((report.width, report.height), (Some(400), Some(300)));
        let written = std::fs::read(dir.path().join("nested/plot.png")).unwrap();
        assert_eq!(written.len() as u64, report.size_bytes);
        assert!(written.starts_with(b"\x89PNG"));
    }

    #[tokio::test]
    async fn test_svg_snapshot_written() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::new().with_mock(true);
        let pool = open_pool(&config).unwrap();
        let snapshot = args(dir.path().join("plot.svg"), SnapshotFormat::Svg);

        let report = run_snapshot(&pool, &config.settings, &snapshot).await.unwrap();
        pool.cleanup().await;

        assert!(report.width.is_none());
        let svg = std::fs::read_to_string(dir.path().join("plot.svg")).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[tokio::test]
    async fn test_rejected_setup_aborts() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::new().with_mock(true);
        let pool = open_pool(&config).unwrap();
        let mut snapshot = args(dir.path().join("plot.png"), SnapshotFormat::Png);
        snapshot.commands = vec!["A = (1, 2".to_string()];

        let err = run_snapshot(&pool, &config.settings, &snapshot).await.unwrap_err();
        pool.cleanup().await;

        assert!(matches!(err, CliError::Engine(_)));
        assert!(!dir.path().join("plot.png").exists());
    }
}
