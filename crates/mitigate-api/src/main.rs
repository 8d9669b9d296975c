//! `mitigate`: risk mitigation workflow engine CLI.
//!
//! Parses CLI arguments, initializes tracing, storage and configuration, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use mitigate_observe::tracing_setup::{TracingOptions, init_tracing_with, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "mitigate", &mut std::io::stdout());
        return Ok(());
    }

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,mitigate=debug",
        _ => "trace",
    };
    init_tracing_with(&TracingOptions {
        enable_otel: cli.otel,
        default_filter: filter.to_string(),
        json: cli.log_json,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;

    match cli.command {
        Commands::Trigger {
            instruction,
            signals,
            definition,
            triggered_by,
            wait,
        } => {
            let args = cli::trigger::TriggerArgs {
                instruction,
                signals,
                definition,
                triggered_by,
                wait_secs: wait,
            };
            cli::trigger::handle_trigger(args, &state, cli.json).await?;
        }

        Commands::Definitions { action } => {
            cli::definitions::handle_definitions_command(action, &state, cli.json).await?;
        }

        Commands::Executions { action } => {
            cli::executions::handle_executions_command(action, &state, cli.json).await?;
        }

        Commands::Report { hours } => {
            cli::report::handle_report(&state, hours, cli.json).await?;
        }

        Commands::Serve {
            monitor_interval,
            events,
        } => {
            cli::serve::handle_serve(&state, monitor_interval, events, cli.quiet).await?;
        }

        Commands::Completions { .. } => unreachable!("handled before state init"),
    }

    Ok(())
}
