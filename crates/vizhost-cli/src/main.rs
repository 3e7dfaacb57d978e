//! vizhost CLI: drive a headless math visualization engine
//!
//! ## Usage
//!
//! ```bash
//! vizhost eval "f(x) = x^2" "A = (1, f(1))"        # JSON result per command
//! vizhost snapshot -c "f(x) = sin(x)" -o plot.png  # Export a PNG
//! vizhost animate -c "t = 0" -c "P = (t, t^2)" --frames 30 -f gif
//! vizhost encode frames/ -f mp4 --fps 24            # PNG directory to video
//! vizhost --mock bench --sessions 4                 # Pool latency, no browser
//! ```

use clap::Parser;
use std::process::ExitCode;
use vizhost_cli::{handlers, logging, Cli, CliConfig, CliResult, Commands, Verbosity};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    logging::init(config.verbosity, config.log_json)?;

    match &cli.command {
        Commands::Eval(args) => handlers::eval::execute(&config, args),
        Commands::Snapshot(args) => handlers::snapshot::execute(&config, args),
        Commands::Animate(args) => handlers::animate::execute(&config, args),
        Commands::Encode(args) => handlers::encode::execute(&config, args),
        Commands::Bench(args) => handlers::bench::execute(&config, args),
        Commands::Config(args) => handlers::config::execute(&config, args),
    }
}

fn build_config(cli: &Cli) -> CliResult<CliConfig> {
    CliConfig::new()
        .with_verbosity(Verbosity::from_flags(cli.quiet, cli.verbose))
        .with_log_json(cli.log_json)
        .with_mock(cli.mock)
        .with_settings_from(cli.config.as_deref())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    mod build_config_tests {
        use super::*;

        #[test]
        fn test_build_config_default() {
            let cli = Cli::parse_from(["vizhost", "config"]);
            let config = build_config(&cli).unwrap();
            assert_eq!(config.verbosity, Verbosity::Normal);
            assert!(!config.use_mock);
        }

        #[test]
        fn test_build_config_flags() {
            let cli = Cli::parse_from(["vizhost", "-v", "--mock", "--log-json", "config"]);
            let config = build_config(&cli).unwrap();
            assert_eq!(config.verbosity, Verbosity::Verbose);
            assert!(config.use_mock);
            assert!(config.log_json);
        }

        #[test]
        fn test_build_config_quiet() {
            let cli = Cli::parse_from(["vizhost", "-q", "config"]);
            assert_eq!(build_config(&cli).unwrap().verbosity, Verbosity::Quiet);
        }

        #[test]
        fn test_build_config_missing_file() {
            let cli = Cli::parse_from(["vizhost", "--config", "/nonexistent/vizhost.yaml", "config"]);
            assert!(build_config(&cli).is_err());
        }
    }
}
