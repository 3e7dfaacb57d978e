//! Eval command handler

use crate::commands::EvalArgs;
use crate::config::CliConfig;
use crate::error::{CliError, CliResult};
use crate::handlers::{open_pool, runtime};
use vizhost::{run_command, CommandResult, InstancePool};

/// Positional commands followed by the file's non-blank lines
///
/// # Errors
///
/// Returns `Io` if the file cannot be read, `InvalidArgument` if there is
/// nothing to run
pub fn collect_commands(args: &EvalArgs) -> CliResult<Vec<String>> {
    let mut commands = args.commands.clone();
    if let Some(path) = &args.file {
        let text = std::fs::read_to_string(path)?;
        commands.extend(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(ToString::to_string),
        );
    }
    if commands.is_empty() {
        return Err(CliError::invalid_argument("no commands given"));
    }
    Ok(commands)
}

/// Run commands on the default instance, one envelope per command
///
/// A failed launch is reported in every envelope rather than aborting, so
/// callers always get one line per command.
pub async fn run_eval(pool: &InstancePool, commands: &[String], fail_fast: bool) -> Vec<CommandResult> {
    let instance = match pool.get_default_instance().await {
        Ok(instance) => instance,
        Err(e) => {
            let message = e.to_string();
            return commands.iter().map(|_| CommandResult::err(message.clone())).collect();
        }
    };

    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let result = run_command(&instance, command).await;
        let failed = !result.success;
        results.push(result);
        if failed && fail_fast {
            break;
        }
    }
    results
}

/// Execute the eval command
pub fn execute(config: &CliConfig, args: &EvalArgs) -> CliResult<()> {
    let commands = collect_commands(args)?;
    let pool = open_pool(config)?;
    let results = runtime()?.block_on(async {
        let results = run_eval(&pool, &commands, args.fail_fast).await;
        pool.cleanup().await;
        results
    });

    for result in &results {
        println!("{}", serde_json::to_string(result)?);
    }

    let failed = results.iter().filter(|r| !r.success).count();
    if failed == 0 {
        Ok(())
    } else {
        Err(CliError::CommandsFailed {
            failed,
            total: results.len(),
        })
    }
}
