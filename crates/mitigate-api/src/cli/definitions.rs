//! CLI playbook subcommands: list, show, validate, install, rules.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use mitigate_core::workflow::definition::{DefinitionError, load_definition_file};
use mitigate_types::definition::WorkflowDefinition;

use super::{label, print_json};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum DefinitionsCommand {
    /// List registered playbooks (stored and built-in).
    List,

    /// Show a playbook's triggers and steps.
    Show {
        /// Playbook name or UUID.
        reference: String,
    },

    /// Parse and validate a playbook YAML file without installing it.
    Validate {
        /// Path to the playbook YAML file.
        file: PathBuf,
    },

    /// Install (or replace by name) a playbook from a YAML file.
    Install {
        /// Path to the playbook YAML file.
        file: PathBuf,
    },

    /// List escalation rules in selection order.
    Rules,
}

pub async fn handle_definitions_command(
    cmd: DefinitionsCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        DefinitionsCommand::List => handle_list(state, json).await,
        DefinitionsCommand::Show { reference } => handle_show(state, &reference, json).await,
        DefinitionsCommand::Validate { file } => handle_validate(&file, json),
        DefinitionsCommand::Install { file } => handle_install(state, &file, json).await,
        DefinitionsCommand::Rules => handle_rules(state, json).await,
    }
}

fn load_file(file: &PathBuf) -> Result<WorkflowDefinition> {
    load_definition_file(file).map_err(|e| match e {
        DefinitionError::ParseError(msg) => anyhow!("Failed to parse playbook YAML: {msg}"),
        DefinitionError::Io(err) => anyhow!("Failed to read {}: {err}", file.display()),
        other => anyhow!("Playbook validation failed: {other}"),
    })
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let engine = state.loaded_engine().await?;
    let defs = engine.definitions();

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id.to_string(),
                    "name": d.name,
                    "version": d.version,
                    "category": d.category,
                    "priority": d.priority,
                    "active": d.active,
                    "steps": d.steps.len(),
                    "triggers": d.triggers.len(),
                })
            })
            .collect();
        return print_json(&out);
    }

    if defs.is_empty() {
        println!();
        println!("  No playbooks registered.");
        println!(
            "  Install one with: {}",
            style("mitigate definitions install <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Category"),
            Cell::new("Priority"),
            Cell::new("Steps"),
            Cell::new("Triggers"),
            Cell::new("Active"),
        ]);

    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(&d.version),
            Cell::new(label(&d.category)),
            Cell::new(label(&d.priority)),
            Cell::new(d.steps.len()),
            Cell::new(d.triggers.len()),
            if d.active {
                Cell::new("yes").fg(Color::Green)
            } else {
                Cell::new("no").fg(Color::DarkGrey)
            },
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(state: &AppState, reference: &str, json: bool) -> Result<()> {
    let engine = state.loaded_engine().await?;
    let def = engine
        .definition(reference)
        .ok_or_else(|| anyhow!("Playbook '{reference}' not found"))?;

    if json {
        return print_json(&*def);
    }
    print_definition(&def);
    Ok(())
}

fn print_definition(def: &WorkflowDefinition) {
    println!();
    println!(
        "  {} {} v{}",
        style("Playbook").bold(),
        style(&def.name).cyan(),
        def.version
    );
    println!("  ID:       {}", def.id);
    println!("  Category: {}", label(&def.category));
    println!("  Priority: {}", label(&def.priority));
    if let Some(description) = &def.description {
        println!("  {}", style(description).dim());
    }

    if !def.triggers.is_empty() {
        println!();
        println!("  {}", style("Triggers").bold());
        for t in &def.triggers {
            let value = t.value.as_ref().map(|v| v.to_string()).unwrap_or_default();
            println!(
                "    {} {} {} {}",
                style(format!("{:.2}", t.weight)).dim(),
                t.field,
                t.operator,
                value
            );
        }
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Type"),
            Cell::new("Role"),
            Cell::new("Expected"),
            Cell::new("On failure"),
            Cell::new("Depends on"),
        ]);
    for (index, step) in def.steps.iter().enumerate() {
        let on_failure = label(&step.on_failure);
        let on_failure = if step.max_retries > 0 {
            format!("{on_failure} (x{})", step.max_retries)
        } else {
            on_failure
        };
        table.add_row(vec![
            Cell::new(index),
            Cell::new(&step.id),
            Cell::new(step.step_type),
            Cell::new(&step.responsible_role),
            Cell::new(format!("{}s", step.expected_duration_secs)),
            Cell::new(on_failure),
            Cell::new(step.depends_on.join(", ")),
        ]);
    }
    println!();
    println!("{table}");
    println!();
}

// ---------------------------------------------------------------------------
// Validate / install
// ---------------------------------------------------------------------------

fn handle_validate(file: &PathBuf, json: bool) -> Result<()> {
    let def = load_file(file)?;
    if json {
        let out = serde_json::json!({
            "valid": true,
            "name": def.name,
            "steps": def.steps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            "triggers": def.triggers.len(),
        });
        return print_json(&out);
    }
    println!();
    println!(
        "  {} Playbook '{}' is valid",
        style("✓").green().bold(),
        style(&def.name).cyan()
    );
    println!(
        "  Execution order: {}",
        def.steps
            .iter()
            .map(|s| s.id.as_str())
            .collect::<Vec<_>>()
            .join(" → ")
    );
    println!();
    Ok(())
}

async fn handle_install(state: &AppState, file: &PathBuf, json: bool) -> Result<()> {
    let def = load_file(file)?;
    let engine = state.engine();
    engine.load_stored().await?;
    let def = engine.install_definition(def).await?;

    if json {
        let out = serde_json::json!({
            "id": def.id.to_string(),
            "name": def.name,
            "version": def.version,
            "steps": def.steps.len(),
        });
        return print_json(&out);
    }
    println!();
    println!(
        "  {} Installed playbook '{}' v{}",
        style("*").green().bold(),
        style(&def.name).cyan(),
        def.version
    );
    println!("  ID: {}", def.id);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

async fn handle_rules(state: &AppState, json: bool) -> Result<()> {
    let engine = state.loaded_engine().await?;
    let rules = engine.rules();

    if json {
        return print_json(&rules);
    }
    if rules.is_empty() {
        println!();
        println!("  No escalation rules registered.");
        println!();
        return Ok(());
    }

    for rule in &rules {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Level").fg(Color::Cyan),
                Cell::new("Roles"),
                Cell::new("Timeout"),
                Cell::new("Ack"),
                Cell::new("Approve"),
                Cell::new("Abort"),
            ]);
        for level in &rule.levels {
            let flag = |b: bool| if b { "yes" } else { "-" };
            table.add_row(vec![
                Cell::new(level.rank),
                Cell::new(level.roles.join(", ")),
                Cell::new(format!("{}s", level.timeout_secs)),
                Cell::new(flag(level.requires_acknowledgment)),
                Cell::new(flag(level.can_approve)),
                Cell::new(flag(level.can_abort)),
            ]);
        }
        let channels: Vec<String> = rule.channels.iter().map(|c| c.to_string()).collect();
        println!();
        println!(
            "  {} {}{}",
            style(&rule.name).cyan().bold(),
            style(format!("via {}", channels.join(", "))).dim(),
            if rule.active { "" } else { " (inactive)" }
        );
        println!("{table}");
    }
    println!();
    Ok(())
}
