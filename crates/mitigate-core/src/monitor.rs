//! Deadline Monitor: periodic sweep for stalled steps.
//!
//! Runs independently of every execution. A sweep reads snapshots of the
//! live executions and flags the in-flight attempt at the cursor once it has
//! run longer than `deadline_factor × expected_duration`. Flagging publishes
//! `StepDeadlineExceeded` and, for steps whose failure policy escalates,
//! starts a timeout escalation through the engine. The monitor never writes
//! the cursor or step records.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use mitigate_types::definition::{FailurePolicy, StepType};
use mitigate_types::event::MitigationEvent;
use mitigate_types::execution::{ExecutionStatus, StepStatus};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::MitigationEngine;
use crate::repository::MitigationRepository;

/// A step attempt found running past its deadline.
#[derive(Debug, Clone, Serialize)]
pub struct StalledStep {
    pub execution_id: Uuid,
    pub step_execution_id: Uuid,
    pub step_id: String,
    pub elapsed_secs: u64,
    pub deadline_secs: u64,
    /// A timeout escalation was started.
    pub escalated: bool,
}

pub struct DeadlineMonitor<R: MitigationRepository + 'static> {
    engine: MitigationEngine<R>,
    factor: f64,
    /// Attempts already flagged and still stalled.
    flagged: DashSet<Uuid>,
}

impl<R: MitigationRepository + 'static> DeadlineMonitor<R> {
    pub fn new(engine: MitigationEngine<R>) -> Self {
        let factor = engine.config().deadline_factor;
        Self {
            engine,
            factor,
            flagged: DashSet::new(),
        }
    }

    /// Sweep every `period` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            tracing::info!(interval_secs = period.as_secs(), "deadline monitor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stalled = self.sweep().await;
                        tracing::debug!(stalled = stalled.len(), "deadline sweep finished");
                    }
                }
            }
            tracing::info!("deadline monitor stopped");
        })
    }

    pub async fn sweep(&self) -> Vec<StalledStep> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as of `now`. Returns the attempts newly flagged by this sweep.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<StalledStep> {
        let mut still_stalled = Vec::new();
        let mut newly = Vec::new();

        for (execution, definition) in self.engine.active_snapshots().await {
            if execution.status != ExecutionStatus::InProgress {
                continue;
            }
            let Some(step) = definition.steps.get(execution.cursor) else {
                continue;
            };
            let Some(record) = execution
                .latest_for(&step.id)
                .filter(|r| r.status == StepStatus::InProgress)
            else {
                continue;
            };
            let Some(elapsed) = record.elapsed(now) else {
                continue;
            };

            let deadline_ms = (step.expected_duration_secs as f64 * self.factor * 1000.0) as i64;
            if elapsed.num_milliseconds() <= deadline_ms {
                continue;
            }
            still_stalled.push(record.id);
            if !self.flagged.insert(record.id) {
                continue;
            }

            let elapsed_secs = elapsed.num_seconds().max(0) as u64;
            let deadline_secs = (deadline_ms / 1000) as u64;
            let escalated = step.step_type != StepType::Escalation
                && matches!(step.on_failure, FailurePolicy::Escalate | FailurePolicy::Retry);

            tracing::warn!(
                execution_id = %execution.id,
                step_id = %step.id,
                elapsed_secs,
                deadline_secs,
                escalated,
                "step deadline exceeded"
            );
            self.engine
                .event_bus()
                .publish(MitigationEvent::StepDeadlineExceeded {
                    execution_id: execution.id,
                    step_execution_id: record.id,
                    step_id: step.id.clone(),
                    elapsed_secs,
                    deadline_secs,
                });

            if escalated {
                let engine = self.engine.clone();
                let (execution_id, step_execution_id) = (execution.id, record.id);
                let reason = format!(
                    "step '{}' running for {elapsed_secs}s, past its {deadline_secs}s deadline",
                    step.id
                );
                tokio::spawn(async move {
                    engine
                        .escalate_timeout(execution_id, step_execution_id, reason)
                        .await;
                });
            }

            newly.push(StalledStep {
                execution_id: execution.id,
                step_execution_id: record.id,
                step_id: step.id.clone(),
                elapsed_secs,
                deadline_secs,
                escalated,
            });
        }

        self.flagged.retain(|id| still_stalled.contains(id));
        newly
    }
}

impl<R: MitigationRepository + 'static> std::fmt::Debug for DeadlineMonitor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineMonitor")
            .field("factor", &self.factor)
            .field("flagged", &self.flagged.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use mitigate_types::config::EngineConfig;
    use mitigate_types::escalation::{AcknowledgmentDecision, EscalationOutcome, EscalationTrigger};
    use mitigate_types::signal::Signals;
    use serde_json::json;

    use super::*;
    use crate::engine::TriggerRequest;
    use crate::escalation::notifier::BoxNotifier;
    use crate::repository::InMemoryRepository;
    use crate::testing::{GatedHandler, RecordingNotifier, definition, step, three_level_rule};

    fn signals() -> Signals {
        serde_json::from_value(json!({"failure_probability": 0.9, "risk_score": 0.9})).unwrap()
    }

    async fn engine_with(
        gate: GatedHandler,
        on_failure: &str,
    ) -> MitigationEngine<InMemoryRepository> {
        let engine = MitigationEngine::builder(InMemoryRepository::new())
            .config(EngineConfig::default())
            .notifier(BoxNotifier::new(RecordingNotifier::default()))
            .handler(StepType::Action, gate)
            .build();
        engine
            .register_definition(definition(
                "stall",
                vec![
                    step("slow", json!({"expected_duration_secs": 60, "on_failure": on_failure})),
                    step("next", json!({"expected_duration_secs": 60})),
                ],
            ))
            .await
            .unwrap();
        engine.register_rule(three_level_rule()).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn flags_each_stalled_attempt_once() {
        let gate = GatedHandler::default();
        let engine = engine_with(gate.clone(), "abort").await;
        let monitor = DeadlineMonitor::new(engine.clone());
        let mut events = engine.subscribe();

        let execution = engine
            .trigger_workflow(TriggerRequest::new("INS-1", signals()))
            .await
            .unwrap();
        gate.wait_entered(1).await;

        // 60s × 1.5 = 90s deadline.
        assert!(monitor.sweep_at(Utc::now() + ChronoDuration::seconds(80)).await.is_empty());

        let later = Utc::now() + ChronoDuration::seconds(100);
        let stalled = monitor.sweep_at(later).await;
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].step_id, "slow");
        assert_eq!(stalled[0].deadline_secs, 90);
        assert!(!stalled[0].escalated, "abort policy does not escalate");
        assert!(monitor.sweep_at(later).await.is_empty(), "deduplicated");

        let mut saw_deadline = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, MitigationEvent::StepDeadlineExceeded { .. }) {
                saw_deadline = true;
            }
        }
        assert!(saw_deadline);

        // The monitor did not touch the execution.
        let snapshot = engine.get_execution(execution.id).await.unwrap();
        assert_eq!(snapshot.cursor, 0);
        assert_eq!(snapshot.status, ExecutionStatus::InProgress);
        assert!(snapshot.escalations.is_empty());

        gate.release();
        gate.wait_entered(2).await;
        gate.release();
        engine.wait_settled(execution.id).await;
        let done = engine.get_execution(execution.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn escalating_step_starts_timeout_escalation() {
        let gate = GatedHandler::default();
        let engine = engine_with(gate.clone(), "escalate").await;
        let monitor = DeadlineMonitor::new(engine.clone());

        let execution = engine
            .trigger_workflow(TriggerRequest::new("INS-2", signals()))
            .await
            .unwrap();
        gate.wait_entered(1).await;

        let stalled = monitor
            .sweep_at(Utc::now() + ChronoDuration::seconds(120))
            .await;
        assert!(stalled[0].escalated);

        let pending = loop {
            if let Some(p) = engine.pending_escalations().into_iter().next() {
                break p;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        };
        assert_eq!(pending.execution_id, execution.id);
        assert_eq!(pending.rank, 1);

        let snapshot = engine.get_execution(execution.id).await.unwrap();
        assert_eq!(snapshot.escalations.len(), 1);
        assert_eq!(snapshot.escalations[0].trigger, EscalationTrigger::Timeout);
        assert_eq!(snapshot.escalations[0].outcome, EscalationOutcome::Pending);
        assert_eq!(snapshot.cursor, 0, "cursor untouched by the monitor");
    }

    #[tokio::test]
    async fn aborted_timeout_escalation_fails_execution() {
        let gate = GatedHandler::default();
        let engine = engine_with(gate.clone(), "retry").await;
        let monitor = DeadlineMonitor::new(engine.clone());

        let execution = engine
            .trigger_workflow(TriggerRequest::new("INS-3", signals()))
            .await
            .unwrap();
        gate.wait_entered(1).await;
        monitor
            .sweep_at(Utc::now() + ChronoDuration::seconds(120))
            .await;

        for rank in 1..=3 {
            let pending = loop {
                if let Some(p) = engine.pending_escalations().into_iter().find(|p| p.rank == rank) {
                    break p;
                }
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            };
            assert!(engine.acknowledge_escalation(
                pending.escalation_id,
                "ceo",
                AcknowledgmentDecision::Abort
            ));
        }

        engine.wait_settled(execution.id).await;
        let done = engine.get_execution(execution.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.status_reason.unwrap().contains("deadline"));
        assert_eq!(done.escalations[0].outcome, EscalationOutcome::Aborted);
        assert_eq!(done.escalations[0].resolved_level, Some(3));
    }

    #[tokio::test]
    async fn timeout_escalation_ends_with_its_attempt() {
        let gate = GatedHandler::default();
        let engine = engine_with(gate.clone(), "escalate").await;
        let monitor = DeadlineMonitor::new(engine.clone());

        let execution = engine
            .trigger_workflow(TriggerRequest::new("INS-4", signals()))
            .await
            .unwrap();
        gate.wait_entered(1).await;
        monitor
            .sweep_at(Utc::now() + ChronoDuration::seconds(120))
            .await;
        let pending = loop {
            if let Some(p) = engine.pending_escalations().into_iter().next() {
                break p;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        };

        // "slow" finishes on its own and "next" starts.
        gate.release();
        gate.wait_entered(2).await;

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = engine.get_execution(execution.id).await.unwrap();
                if engine.pending_escalations().is_empty()
                    && snapshot.escalations[0].outcome == EscalationOutcome::Cancelled
                {
                    return snapshot;
                }
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("escalation of a finished attempt should be withdrawn");
        assert_eq!(settled.cursor, 1);
        assert_eq!(settled.status, ExecutionStatus::InProgress);
        assert!(!engine.acknowledge_escalation(
            pending.escalation_id,
            "ceo",
            AcknowledgmentDecision::Abort
        ));

        gate.release();
        engine.wait_settled(execution.id).await;
        let done = engine.get_execution(execution.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        let steps: Vec<_> = done.steps.iter().map(|r| (r.step_id.as_str(), r.status)).collect();
        assert_eq!(steps, vec![("slow", StepStatus::Completed), ("next", StepStatus::Completed)]);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_monitor_stops_on_cancel() {
        let engine = engine_with(GatedHandler::default(), "abort").await;
        let monitor = Arc::new(DeadlineMonitor::new(engine));
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&monitor).spawn(Duration::from_secs(300), cancel.clone());

        tokio::time::sleep(Duration::from_secs(900)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
