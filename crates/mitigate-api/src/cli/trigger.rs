//! One-shot trigger: start an execution and drive it in this process until it
//! settles or the wait runs out.

use std::time::Duration;

use anyhow::{Context, Result};
use console::style;

use mitigate_core::engine::TriggerRequest;
use mitigate_types::signal::Signals;

use super::executions::{print_execution, styled_status};
use super::print_json;
use crate::state::AppState;

pub struct TriggerArgs {
    pub instruction: String,
    pub signals: String,
    pub definition: Option<String>,
    pub triggered_by: String,
    pub wait_secs: u64,
}

pub fn parse_signals(raw: &str) -> Result<Signals> {
    serde_json::from_str(raw).context("--signals must be a JSON object of signal values")
}

pub async fn handle_trigger(args: TriggerArgs, state: &AppState, json: bool) -> Result<()> {
    let signals = parse_signals(&args.signals)?;
    let engine = state.loaded_engine().await?;

    let mut request = TriggerRequest::new(args.instruction, signals).triggered_by(args.triggered_by);
    if let Some(definition) = args.definition {
        request = request.with_definition(definition);
    }
    let started = engine.trigger_workflow(request).await?;

    if !json {
        println!();
        println!(
            "  {} Triggered '{}' for {}",
            style("*").green().bold(),
            style(&started.definition_name).cyan(),
            style(&started.instruction_id).bold()
        );
        println!("  Execution ID: {}", started.id);
    }

    let settled = tokio::time::timeout(
        Duration::from_secs(args.wait_secs),
        engine.wait_settled(started.id),
    )
    .await
    .is_ok();
    if !settled {
        tracing::warn!(
            execution_id = %started.id,
            wait_secs = args.wait_secs,
            "execution still running; it will be parked on the next `mitigate serve`"
        );
    }

    let execution = engine.get_execution(started.id).await?;
    if json {
        return print_json(&execution);
    }

    if settled {
        println!("  Settled as {}", styled_status(execution.status));
    } else {
        println!(
            "  Still {} after {}s; continue with {}",
            styled_status(execution.status),
            args.wait_secs,
            style("mitigate serve").dim()
        );
    }
    print_execution(&execution);
    Ok(())
}
