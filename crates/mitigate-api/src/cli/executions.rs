//! CLI execution inspection subcommands.
//!
//! Reads checkpoints straight from the repository; never attaches to or
//! alters live executions.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use mitigate_core::repository::MitigationRepository;
use mitigate_types::escalation::EscalationOutcome;
use mitigate_types::execution::{ExecutionStatus, StepStatus, WorkflowExecution};

use super::{label, print_json};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum ExecutionsCommand {
    /// List executions, newest first.
    List {
        /// Only executions for this instruction.
        #[arg(long, short = 'i')]
        instruction: Option<String>,

        /// Only initiated, in-progress and paused executions.
        #[arg(long)]
        active: bool,

        /// Maximum number of executions to display.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one execution with its step and escalation history.
    Show {
        /// Execution UUID.
        id: Uuid,
    },
}

pub async fn handle_executions_command(
    cmd: ExecutionsCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        ExecutionsCommand::List {
            instruction,
            active,
            limit,
        } => handle_list(state, instruction.as_deref(), active, limit, json).await,
        ExecutionsCommand::Show { id } => handle_show(state, id, json).await,
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(
    state: &AppState,
    instruction: Option<&str>,
    active: bool,
    limit: usize,
    json: bool,
) -> Result<()> {
    let mut executions = match instruction {
        Some(instruction) => state.repo.list_executions_for_instruction(instruction).await?,
        None if active => {
            state
                .repo
                .list_executions_by_status(&[
                    ExecutionStatus::Initiated,
                    ExecutionStatus::InProgress,
                    ExecutionStatus::Paused,
                ])
                .await?
        }
        None => {
            state
                .repo
                .list_executions_started_between(DateTime::<Utc>::UNIX_EPOCH, Utc::now())
                .await?
        }
    };
    if active {
        executions.retain(|e| !e.is_terminal());
    }
    executions.reverse();
    executions.truncate(limit);

    if json {
        return print_json(&executions);
    }

    if executions.is_empty() {
        println!();
        println!("  No executions found.");
        println!(
            "  Start one with: {}",
            style("mitigate trigger -i <instruction> -s '<signals json>'").dim()
        );
        println!();
        return Ok(());
    }

    println!();
    println!("{}", executions_table(&executions));
    println!();
    Ok(())
}

pub fn executions_table(executions: &[WorkflowExecution]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Playbook"),
            Cell::new("Instruction"),
            Cell::new("Status"),
            Cell::new("Progress"),
            Cell::new("Started"),
            Cell::new("Effectiveness"),
        ]);

    for e in executions {
        table.add_row(vec![
            Cell::new(short_id(e.id)),
            Cell::new(&e.definition_name),
            Cell::new(&e.instruction_id),
            status_cell(e.status),
            Cell::new(format!("{}/{}", e.completed_step_count(), e.total_steps)),
            Cell::new(e.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(percent(e.effectiveness)),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(state: &AppState, id: Uuid, json: bool) -> Result<()> {
    let execution = state
        .repo
        .get_execution(&id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Execution '{id}' not found"))?;

    if json {
        return print_json(&execution);
    }
    print_execution(&execution);
    Ok(())
}

/// Styled detail view: header, step attempts, escalations.
pub fn print_execution(execution: &WorkflowExecution) {
    println!();
    println!(
        "  {} {} for {}",
        style("Execution").bold(),
        style(&execution.definition_name).cyan(),
        style(&execution.instruction_id).bold()
    );
    println!("  ID:           {}", execution.id);
    println!("  Status:       {}", styled_status(execution.status));
    if let Some(reason) = &execution.status_reason {
        println!("  Reason:       {reason}");
    }
    println!(
        "  Cursor:       {}/{}",
        execution.cursor, execution.total_steps
    );
    println!("  Trigger:      {}", execution.trigger_reason);
    if let Some(score) = execution.match_score {
        println!("  Match score:  {score:.2}");
    }
    println!("  Triggered by: {}", execution.triggered_by);
    println!(
        "  Started:      {}",
        execution.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(completed) = execution.completed_at {
        println!(
            "  Completed:    {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if execution.effectiveness.is_some() {
        println!("  Effectiveness: {}", percent(execution.effectiveness));
    }

    if !execution.steps.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Retry"),
                Cell::new("Started"),
                Cell::new("Duration"),
                Cell::new("Note"),
            ]);
        for record in &execution.steps {
            let duration = match (record.started_at, record.completed_at) {
                (Some(start), Some(end)) => format!("{}ms", (end - start).num_milliseconds()),
                _ => "-".to_string(),
            };
            let note = if let Some(bypass) = &record.bypass {
                format!("bypassed by {}: {}", bypass.bypassed_by, bypass.reason)
            } else if let Some(approver) = &record.approved_by {
                format!("approved by {approver}")
            } else if let Some(error) = &record.error {
                error.clone()
            } else {
                String::new()
            };
            table.add_row(vec![
                Cell::new(&record.step_id),
                step_status_cell(record.status),
                Cell::new(record.retry_count),
                Cell::new(
                    record
                        .started_at
                        .map(|t| t.format("%H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ),
                Cell::new(duration),
                Cell::new(note),
            ]);
        }
        println!();
        println!("{table}");
    }

    if !execution.escalations.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Escalation").fg(Color::Cyan),
                Cell::new("Step"),
                Cell::new("Trigger"),
                Cell::new("Outcome"),
                Cell::new("Levels"),
                Cell::new("Acknowledged by"),
            ]);
        for esc in &execution.escalations {
            let outcome = Cell::new(label(&esc.outcome)).fg(match esc.outcome {
                EscalationOutcome::Resolved => Color::Green,
                EscalationOutcome::Aborted | EscalationOutcome::Unresolved => Color::Red,
                EscalationOutcome::Pending => Color::Yellow,
                EscalationOutcome::Cancelled => Color::DarkGrey,
            });
            let levels: Vec<String> = esc.levels_notified.iter().map(u32::to_string).collect();
            table.add_row(vec![
                Cell::new(short_id(esc.id)),
                Cell::new(&esc.step_id),
                Cell::new(label(&esc.trigger)),
                outcome,
                Cell::new(levels.join(", ")),
                Cell::new(esc.acknowledged_by.as_deref().unwrap_or("-")),
            ]);
        }
        println!();
        println!("{table}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

pub fn short_id(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn percent(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.0}%", v * 100.0))
        .unwrap_or_else(|| "-".to_string())
}

fn status_color(status: ExecutionStatus) -> Color {
    match status {
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Paused => Color::Yellow,
        ExecutionStatus::InProgress => Color::Cyan,
        ExecutionStatus::Initiated | ExecutionStatus::Cancelled => Color::DarkGrey,
    }
}

fn status_cell(status: ExecutionStatus) -> Cell {
    Cell::new(status).fg(status_color(status))
}

pub fn styled_status(status: ExecutionStatus) -> String {
    let s = style(status.as_str());
    match status {
        ExecutionStatus::Completed => s.green().to_string(),
        ExecutionStatus::Failed => s.red().to_string(),
        ExecutionStatus::Paused => s.yellow().to_string(),
        ExecutionStatus::InProgress => s.cyan().to_string(),
        ExecutionStatus::Initiated | ExecutionStatus::Cancelled => s.dim().to_string(),
    }
}

fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::InProgress => Color::Cyan,
        StepStatus::Pending => Color::Yellow,
        StepStatus::Skipped | StepStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(label(&status)).fg(color)
}
