//! Config command handler

use crate::commands::ConfigArgs;
use crate::config::CliConfig;
use crate::error::{CliError, CliResult};
use vizhost::VizhostConfig;

/// YAML for the effective configuration, or the built-in defaults
///
/// # Errors
///
/// Returns `Config` on serialization failure
pub fn render_config(config: &CliConfig, args: &ConfigArgs) -> CliResult<String> {
    let settings = if args.defaults {
        VizhostConfig::default()
    } else {
        config.settings.clone()
    };
    settings
        .to_yaml()
        .map_err(|e| CliError::config(format!("failed to render configuration: {e}")))
}

/// Execute the config command
pub fn execute(config: &CliConfig, args: &ConfigArgs) -> CliResult<()> {
    print!("{}", render_config(config, args)?);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_config_round_trips() {
        let mut config = CliConfig::new();
        config.settings.pool.max_instances = 9;
        let yaml = render_config(&config, &ConfigArgs { defaults: false }).unwrap();

        assert!(yaml.contains("max_instances: 9"));
        assert_eq!(VizhostConfig::from_yaml_str(&yaml).unwrap(), config.settings);
    }

    #[test]
    fn test_defaults_ignore_overrides() {
        let mut config = CliConfig::new();
        config.settings.pool.max_instances = 9;
        let yaml = render_config(&config, &ConfigArgs { defaults: true }).unwrap();
        assert!(yaml.contains(&format!(
            "max_instances: {}",
            VizhostConfig::default().pool.max_instances
        )));
    }
}
