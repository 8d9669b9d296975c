//! Long-running engine host.
//!
//! Recovers stored state, runs the deadline monitor, and accepts operator
//! commands as JSON lines on stdin until EOF or a shutdown signal. Each command gets one JSON reply line on
//! stdout; with `--events` every engine event is written there as well.
//!
//! ```text
//! {"command":"trigger","instruction_id":"INS-1","signals":{"risk_score":0.9}}
//! {"command":"approve","execution_id":"...","step_execution_id":"...","approver":"head"}
//! {"command":"acknowledge","escalation_id":"...","by":"cro","decision":"approve"}
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use console::style;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mitigate_core::engine::{MitigationEngine, TriggerRequest};
use mitigate_core::monitor::DeadlineMonitor;
use mitigate_core::repository::MitigationRepository;
use mitigate_types::escalation::AcknowledgmentDecision;

use crate::state::AppState;

/// One operator command read from stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ServeCommand {
    Trigger(TriggerRequest),
    Pause {
        execution_id: Uuid,
        #[serde(default)]
        reason: Option<String>,
    },
    Resume {
        execution_id: Uuid,
    },
    Cancel {
        execution_id: Uuid,
        #[serde(default)]
        reason: Option<String>,
    },
    Bypass {
        execution_id: Uuid,
        step_execution_id: Uuid,
        reason: String,
        by: String,
    },
    Approve {
        execution_id: Uuid,
        step_execution_id: Uuid,
        approver: String,
        #[serde(default = "default_approved")]
        approved: bool,
        #[serde(default)]
        comment: Option<String>,
    },
    Acknowledge {
        escalation_id: Uuid,
        by: String,
        decision: AcknowledgmentDecision,
    },
    Status {
        execution_id: Uuid,
    },
    Pending,
}

fn default_approved() -> bool {
    true
}

fn accepted(ok: bool) -> Value {
    if ok {
        json!({ "ok": true })
    } else {
        json!({ "ok": false, "error": "transition refused" })
    }
}

fn failure(err: impl std::fmt::Display) -> Value {
    json!({ "ok": false, "error": err.to_string() })
}

/// Parse and apply one command line, returning the reply.
pub async fn dispatch<R: MitigationRepository + 'static>(
    engine: &MitigationEngine<R>,
    line: &str,
) -> Value {
    let command = match serde_json::from_str::<ServeCommand>(line) {
        Ok(command) => command,
        Err(e) => return failure(format!("invalid command: {e}")),
    };
    tracing::debug!(?command, "operator command");

    match command {
        ServeCommand::Trigger(request) => match engine.trigger_workflow(request).await {
            Ok(execution) => json!({
                "ok": true,
                "execution_id": execution.id,
                "definition": execution.definition_name,
                "match_score": execution.match_score,
            }),
            Err(e) => failure(e),
        },
        ServeCommand::Pause {
            execution_id,
            reason,
        } => {
            let reason = reason.unwrap_or_else(|| "operator pause".to_string());
            accepted(engine.pause_execution(execution_id, &reason).await)
        }
        ServeCommand::Resume { execution_id } => {
            accepted(engine.resume_execution(execution_id).await)
        }
        ServeCommand::Cancel {
            execution_id,
            reason,
        } => {
            let reason = reason.unwrap_or_else(|| "operator cancel".to_string());
            accepted(engine.cancel_execution(execution_id, &reason).await)
        }
        ServeCommand::Bypass {
            execution_id,
            step_execution_id,
            reason,
            by,
        } => accepted(
            engine
                .bypass_step(execution_id, step_execution_id, &reason, &by)
                .await,
        ),
        ServeCommand::Approve {
            execution_id,
            step_execution_id,
            approver,
            approved,
            comment,
        } => accepted(engine.respond_to_approval(
            execution_id,
            step_execution_id,
            &approver,
            approved,
            comment,
        )),
        ServeCommand::Acknowledge {
            escalation_id,
            by,
            decision,
        } => accepted(engine.acknowledge_escalation(escalation_id, &by, decision)),
        ServeCommand::Status { execution_id } => match engine.get_execution(execution_id).await {
            Ok(execution) => json!({ "ok": true, "execution": execution }),
            Err(e) => failure(e),
        },
        ServeCommand::Pending => json!({
            "ok": true,
            "approvals": engine.pending_approvals(),
            "escalations": engine.pending_escalations(),
        }),
    }
}

pub async fn handle_serve(
    state: &AppState,
    monitor_interval: Option<u64>,
    events: bool,
    quiet: bool,
) -> Result<()> {
    let engine = state.engine();
    let summary = engine.recover().await?;
    state.install_playbooks(&engine).await?;

    let cancel = CancellationToken::new();
    let interval = monitor_interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| engine.config().monitor_interval());
    let monitor = Arc::new(DeadlineMonitor::new(engine.clone()));
    let monitor_handle = monitor.spawn(interval, cancel.clone());
    let events_handle = events.then(|| spawn_event_printer(&engine, cancel.clone()));

    if !quiet {
        eprintln!();
        eprintln!(
            "  {} Mitigation engine running ({} playbooks, {} parked executions)",
            style("⚡").bold(),
            engine.definitions().len(),
            summary.interrupted + summary.reattached
        );
        eprintln!("  Data directory: {}", style(state.data_dir.display()).dim());
        eprintln!(
            "  {}",
            style("Reading JSON commands from stdin. Press Ctrl+C to stop").dim()
        );
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = dispatch(&engine, &line).await;
                    println!("{reply}");
                }
                Ok(None) => {
                    tracing::info!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read stdin");
                    break;
                }
            },
        }
    }

    cancel.cancel();
    if let Err(e) = monitor_handle.await {
        tracing::warn!(error = %e, "deadline monitor task failed");
    }
    if let Some(handle) = events_handle {
        let _ = handle.await;
    }

    let active = engine.list_active().await.len();
    if active > 0 {
        tracing::warn!(active, "stopping with unfinished executions; they will be parked on next start");
    }
    if !quiet {
        eprintln!("\n  Engine stopped.");
    }
    Ok(())
}

fn spawn_event_printer<R: MitigationRepository + 'static>(
    engine: &MitigationEngine<R>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = engine.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event printer lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
