//! CLI command definitions using clap

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// vizhost: drive a headless math visualization engine from the shell
#[derive(Parser, Debug)]
#[command(name = "vizhost")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// YAML configuration file
    #[arg(long, global = true, env = "VIZHOST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Use the simulated engine instead of Chromium
    #[arg(long, global = true)]
    pub mock: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run engine commands and print one JSON result per command
    Eval(EvalArgs),

    /// Build a construction and export it as PNG or SVG
    Snapshot(SnapshotArgs),

    /// Sweep a parameter and export frames, a GIF, or a video
    Animate(AnimateArgs),

    /// Encode a directory of PNG frames into a GIF or video
    Encode(EncodeArgs),

    /// Measure command latency across parallel pooled sessions
    Bench(BenchArgs),

    /// Print the effective configuration as YAML
    Config(ConfigArgs),
}

/// Arguments for the eval command
#[derive(Parser, Debug)]
pub struct EvalArgs {
    /// Commands to run, in order (e.g. "f(x) = x^2")
    pub commands: Vec<String>,

    /// Read additional commands from a file, one per line
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Stop at the first rejected command
    #[arg(long)]
    pub fail_fast: bool,
}

/// Snapshot output format
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SnapshotFormat {
    /// PNG raster
    #[default]
    Png,
    /// SVG vector
    Svg,
}

/// Arguments for the snapshot command
#[derive(Parser, Debug)]
pub struct SnapshotArgs {
    /// Setup command (repeatable)
    #[arg(short, long = "command")]
    pub commands: Vec<String>,

    /// Output format
    #[arg(short, long, default_value = "png")]
    pub format: SnapshotFormat,

    /// Output file path
    #[arg(short, long)]
    pub output: PathBuf,

    /// Output width in pixels
    #[arg(long)]
    pub width: Option<u32>,

    /// Output height in pixels
    #[arg(long)]
    pub height: Option<u32>,

    /// Scale relative to the canvas (ignored with --width/--height)
    #[arg(long)]
    pub scale: Option<f64>,

    /// Transparent background
    #[arg(long)]
    pub transparent: bool,
}

/// Animation output format
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AnimateFormat {
    /// PNG frames only
    Frames,
    /// Animated GIF
    #[default]
    Gif,
    /// H.264 MP4
    Mp4,
    /// VP9 WebM
    Webm,
}

impl From<AnimateFormat> for vizhost::OutputFormat {
    fn from(format: AnimateFormat) -> Self {
        match format {
            AnimateFormat::Frames => Self::Frames,
            AnimateFormat::Gif => Self::Gif,
            AnimateFormat::Mp4 => Self::Mp4,
            AnimateFormat::Webm => Self::Webm,
        }
    }
}

/// Arguments for the animate command
#[derive(Parser, Debug)]
pub struct AnimateArgs {
    /// Setup command (repeatable)
    #[arg(short, long = "command")]
    pub commands: Vec<String>,

    /// Output format
    #[arg(short, long, default_value = "gif")]
    pub format: AnimateFormat,

    /// Number of frames (default: from --duration, else 30)
    #[arg(long)]
    pub frames: Option<usize>,

    /// Animation duration in milliseconds
    #[arg(long)]
    pub duration: Option<u64>,

    /// Frames per second
    #[arg(long)]
    pub fps: Option<u32>,

    /// Delay between frames in milliseconds (wins over --fps)
    #[arg(long)]
    pub delay: Option<u64>,

    /// Parameter to sweep (default: t, a, k, n, s, time, slider)
    #[arg(short, long)]
    pub parameter: Option<String>,

    /// Final parameter value
    #[arg(long, default_value = "1.0")]
    pub sweep_end: f64,

    /// Output width in pixels
    #[arg(long)]
    pub width: Option<u32>,

    /// Output height in pixels
    #[arg(long)]
    pub height: Option<u32>,

    /// GIF quality (1-100) or video CRF (0-51)
    #[arg(long)]
    pub quality: Option<u8>,

    /// Output directory (default: encoder.output_dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Encoded output format
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EncodeFormat {
    /// Animated GIF
    #[default]
    Gif,
    /// H.264 MP4
    Mp4,
    /// VP9 WebM
    Webm,
}

/// Arguments for the encode command
#[derive(Parser, Debug)]
pub struct EncodeArgs {
    /// Directory of PNG frames, encoded in file-name order
    pub input: PathBuf,

    /// Output format
    #[arg(short, long, default_value = "gif")]
    pub format: EncodeFormat,

    /// Frames per second
    #[arg(long)]
    pub fps: Option<u32>,

    /// GIF quality (1-100) or video CRF (0-51)
    #[arg(long)]
    pub quality: Option<u8>,

    /// Output width in pixels
    #[arg(long)]
    pub width: Option<u32>,

    /// Output height in pixels
    #[arg(long)]
    pub height: Option<u32>,

    /// Output directory (default: encoder.output_dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the bench command
#[derive(Parser, Debug)]
pub struct BenchArgs {
    /// Parallel sessions
    #[arg(short, long, default_value = "4")]
    pub sessions: usize,

    /// Commands per session
    #[arg(short, long, default_value = "20")]
    pub iterations: usize,

    /// Command to run; `{i}` is replaced by the iteration number
    #[arg(short, long, default_value = "a = {i}")]
    pub command: String,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Print built-in defaults instead of the effective configuration
    #[arg(long)]
    pub defaults: bool,
}
