//! CLI command definitions for the `mitigate` binary.
//!
//! Uses clap derive macros for argument parsing. Query commands read the
//! SQLite store directly; `trigger` and `serve` start an engine over it.

pub mod definitions;
pub mod executions;
pub mod report;
pub mod serve;
pub mod trigger;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;

/// Run and inspect risk mitigation workflows.
#[derive(Parser)]
#[command(name = "mitigate", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs to stderr as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "MITIGATE_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Trigger a mitigation workflow for an instruction and run it in-process.
    Trigger {
        /// Instruction the risk event concerns.
        #[arg(long, short = 'i')]
        instruction: String,

        /// Risk signals as a JSON object.
        #[arg(long, short = 's', default_value = "{}")]
        signals: String,

        /// Run this definition (name or UUID) instead of scoring triggers.
        #[arg(long, short = 'd')]
        definition: Option<String>,

        /// Who raised the trigger.
        #[arg(long, default_value = "cli")]
        triggered_by: String,

        /// Seconds to wait for the execution to settle.
        #[arg(long, default_value = "30")]
        wait: u64,
    },

    /// Inspect and validate workflow definitions.
    #[command(alias = "defs")]
    Definitions {
        #[command(subcommand)]
        action: definitions::DefinitionsCommand,
    },

    /// Inspect workflow executions.
    #[command(alias = "exec")]
    Executions {
        #[command(subcommand)]
        action: executions::ExecutionsCommand,
    },

    /// Usage and effectiveness report.
    Report {
        /// Window size in hours, ending now.
        #[arg(long, default_value = "24")]
        hours: u32,
    },

    /// Run the engine and deadline monitor, reading JSON-lines commands from stdin.
    Serve {
        /// Override the deadline monitor sweep interval (seconds).
        #[arg(long)]
        monitor_interval: Option<u64>,

        /// Also write every engine event to stdout.
        #[arg(long)]
        events: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// The serde name of a unit enum value (`in_progress`, `step_failure`, ...).
pub fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Print `value` as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use mitigate_types::escalation::EscalationTrigger;
    use mitigate_types::execution::StepStatus;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn trigger_arguments_parse() {
        let cli = Cli::try_parse_from([
            "mitigate",
            "--json",
            "trigger",
            "-i",
            "INS-1",
            "--signals",
            r#"{"risk_score": 0.9}"#,
            "--wait",
            "5",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Trigger {
                instruction,
                wait,
                definition,
                ..
            } => {
                assert_eq!(instruction, "INS-1");
                assert_eq!(wait, 5);
                assert!(definition.is_none());
            }
            _ => panic!("expected trigger"),
        }
    }

    #[test]
    fn labels_use_serde_names() {
        assert_eq!(label(&StepStatus::InProgress), "in_progress");
        assert_eq!(label(&EscalationTrigger::StepFailure), "step_failure");
    }
}
