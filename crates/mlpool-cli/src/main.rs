use clap::Parser;
use color_eyre::{eyre::eyre, Result};

mod cli;
mod commands;
mod outcome;
mod worker;

use cli::{CommandKind, EnvsCommand, MlpoolCli};
use outcome::{format_status_message, CommandStatus, ExecutionOutcome};

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = MlpoolCli::parse();
    init_tracing(cli.trace, cli.verbose, cli.quiet);

    if matches!(cli.command, CommandKind::Worker) {
        return worker::WorkerLoop::from_env()
            .run()
            .map_err(|err| eyre!("{err:?}"));
    }

    let outcome = execute(&cli)?;
    let code = emit_output(&cli, &outcome)?;
    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn execute(cli: &MlpoolCli) -> Result<ExecutionOutcome> {
    let outcome = match &cli.command {
        CommandKind::Worker => ExecutionOutcome::user_error(
            "the worker subcommand is started by pools, not by hand",
            serde_json::Value::Null,
        ),
        CommandKind::Hash(args) => commands::hash(args),
        CommandKind::Predict(args) => {
            let config = match commands::load_config(cli) {
                Ok(config) => config,
                Err(err) => return Ok(ExecutionOutcome::from_pool_error(&err)),
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(commands::predict(config, args))
        }
        CommandKind::Envs(command) => {
            let config = match commands::load_config(cli) {
                Ok(config) => config,
                Err(err) => return Ok(ExecutionOutcome::from_pool_error(&err)),
            };
            let root = config.environments_dir();
            match command {
                EnvsCommand::List => commands::envs_list(root),
                EnvsCommand::Prune(args) => commands::envs_prune(root, args),
            }
        }
    };
    Ok(outcome)
}

/// Logs always go to stderr; a worker's stdout is its protocol channel.
fn init_tracing(trace: bool, verbose: u8, quiet: bool) {
    let level = if trace {
        "trace"
    } else if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("mlpool={level},mlpool_core={level},mlpool_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn emit_output(cli: &MlpoolCli, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.status.exit_code();
    let command = cli.command.name();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome.to_json(command))?);
    } else if outcome.status != CommandStatus::Ok {
        eprintln!("{}", format_status_message(command, &outcome.message));
        if let Some(reason) = outcome.details.get("reason").and_then(|v| v.as_str()) {
            eprintln!("  reason: {reason}");
        }
    } else if !cli.quiet {
        if is_passthrough(&outcome.details) {
            println!("{}", outcome.message);
        } else {
            println!("{}", format_status_message(command, &outcome.message));
            if let Some(outputs) = outcome.details.get("outputs") {
                println!("{}", serde_json::to_string_pretty(outputs)?);
            }
        }
    }

    Ok(code)
}

fn is_passthrough(details: &serde_json::Value) -> bool {
    details
        .get("passthrough")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}
