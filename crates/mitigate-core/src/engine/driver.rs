//! The per-execution driver task.
//!
//! One attempt per loop iteration, in three phases:
//!
//! 1. under the execution lock: honour pause requests, complete past the
//!    last step, check dependencies, then record a new `in_progress`
//!    `StepExecution`
//! 2. without the lock: run the handler (or, for `escalation` steps, the
//!    escalation coordinator)
//! 3. under the lock again: settle the record and route by the step policy
//!
//! Operator operations only ever mutate the execution while holding the same
//! lock, so phase 3 re-checks for cancellation and bypass before touching
//! anything.

use std::sync::Arc;

use mitigate_types::config::DependencyPolicy;
use mitigate_types::definition::{StepType, SuccessPolicy, WorkflowStep};
use mitigate_types::escalation::{EscalationOutcome, EscalationRecord, EscalationTrigger};
use mitigate_types::event::MitigationEvent;
use mitigate_types::execution::{ExecutionStatus, StepExecution, StepStatus, WorkflowExecution};
use serde_json::{Value, json};
use tokio::sync::MutexGuard;
use uuid::Uuid;

use super::{AttemptHandle, EngineInner, ExecutionSlot, SlotState, replace_escalation};
use crate::escalation::coordinator::EscalationRequest;
use crate::repository::MitigationRepository;
use crate::workflow::handler::{StepContext, StepError};
use crate::workflow::retry::{FailureRoute, RetryHandler};

enum Flow {
    Next,
    Stop,
}

/// A started attempt, carried from phase 1 to phase 3.
struct Attempt {
    ctx: StepContext,
    /// Set for `escalation` steps.
    escalation: Option<EscalationRequest>,
}

enum Prepared {
    Run(Attempt),
    Next,
    Stop,
}

/// Drive an execution until it pauses or reaches a terminal state.
pub(super) async fn drive<R: MitigationRepository + 'static>(
    engine: Arc<EngineInner<R>>,
    slot: Arc<ExecutionSlot>,
) {
    loop {
        match advance(&engine, &slot).await {
            Flow::Next => {}
            Flow::Stop => break,
        }
    }

    let state = slot.state.lock().await;
    if state.execution.is_terminal() && !state.running {
        engine.executions.remove(&state.execution.id);
    }
}

/// Release ownership of the execution. Must be called with the lock held so
/// that a concurrent resume sees a consistent `running` flag.
fn stop(slot: &ExecutionSlot, state: &mut SlotState) -> Flow {
    state.running = false;
    state.finish_attempt();
    slot.settled.send_replace(true);
    Flow::Stop
}

async fn advance<R: MitigationRepository>(engine: &EngineInner<R>, slot: &ExecutionSlot) -> Flow {
    let attempt = {
        let mut guard = slot.state.lock().await;
        match prepare(engine, slot, &mut guard).await {
            Prepared::Run(attempt) => attempt,
            Prepared::Next => return Flow::Next,
            Prepared::Stop => return stop(slot, &mut guard),
        }
    };

    let (outcome, escalation) = match &attempt.escalation {
        None => (engine.runner.run(&attempt.ctx).await, None),
        Some(request) => {
            let record = engine.coordinator.run(request, &attempt.ctx.cancel).await;
            (escalation_step_outcome(&record), Some(record))
        }
    };

    settle(engine, slot, attempt, outcome, escalation).await
}

// ---------------------------------------------------------------------------
// Phase 1
// ---------------------------------------------------------------------------

async fn prepare<R: MitigationRepository>(
    engine: &EngineInner<R>,
    slot: &ExecutionSlot,
    state: &mut SlotState,
) -> Prepared {
    let execution = &mut state.execution;
    if execution.is_terminal() || execution.status == ExecutionStatus::Paused {
        return Prepared::Stop;
    }

    if let Some(reason) = state.pause_requested.take() {
        engine.pause(execution, reason);
        engine.persist(execution).await;
        return Prepared::Stop;
    }

    if execution.status == ExecutionStatus::Initiated {
        execution.status = ExecutionStatus::InProgress;
    }

    let Some(step) = slot.definition.steps.get(execution.cursor).cloned() else {
        engine.complete(execution);
        engine.persist(execution).await;
        return Prepared::Stop;
    };

    let unmet: Vec<&str> = step
        .depends_on
        .iter()
        .filter(|dep| !execution.is_step_completed(dep))
        .map(String::as_str)
        .collect();
    if !unmet.is_empty() {
        let reason = format!("dependency unsatisfied: {}", unmet.join(", "));
        match engine.config.dependency_policy {
            DependencyPolicy::Skip => {
                tracing::debug!(execution_id = %execution.id, step_id = %step.id, %reason, "skipping step");
                execution.steps.push(StepExecution::skipped(&step.id, &reason));
                engine.event_bus.publish(MitigationEvent::StepSkipped {
                    execution_id: execution.id,
                    step_id: step.id.clone(),
                    reason,
                });
                execution.cursor += 1;
                state.next_retry = 0;
                engine.persist(execution).await;
                return Prepared::Next;
            }
            DependencyPolicy::Block => {
                let waiting = execution
                    .latest_for(&step.id)
                    .is_some_and(|r| r.status == StepStatus::Pending);
                if !waiting {
                    execution.steps.push(StepExecution::pending(&step.id, &reason));
                }
                engine.pause(execution, format!("step '{}' blocked: {reason}", step.id));
                engine.persist(execution).await;
                return Prepared::Stop;
            }
        }
    }

    let record = StepExecution::start(&step.id, state.next_retry);
    let token = slot.cancel.child_token();
    let ctx = StepContext {
        execution_id: execution.id,
        step_execution_id: record.id,
        instruction_id: execution.instruction_id.clone(),
        definition_name: execution.definition_name.clone(),
        step: step.clone(),
        retry_count: record.retry_count,
        signals: execution.signals.clone(),
        cancel: token.clone(),
    };

    let escalation = (step.step_type == StepType::Escalation).then(|| {
        let reason = step
            .param_str("reason")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} ({})", step.name, execution.definition_name));
        let request = engine.escalation_request(
            execution,
            &step,
            record.id,
            EscalationTrigger::StepDefined,
            reason,
        );
        execution.escalations.push(request.pending_record());
        request
    });

    tracing::debug!(
        execution_id = %execution.id,
        step_id = %step.id,
        cursor = execution.cursor,
        retry_count = record.retry_count,
        "step started"
    );
    engine.event_bus.publish(MitigationEvent::StepStarted {
        execution_id: execution.id,
        step_execution_id: record.id,
        step_id: step.id.clone(),
        retry_count: record.retry_count,
    });
    // A retry replaces the failed attempt; anything still waiting on it ends.
    let previous = state.attempt.replace(AttemptHandle {
        step_execution_id: record.id,
        token,
    });
    if let Some(previous) = previous {
        previous.token.cancel();
    }
    execution.steps.push(record);
    engine.persist(execution).await;

    Prepared::Run(Attempt { ctx, escalation })
}

/// Map a finished escalation-step walk to a handler outcome.
///
/// `aborted` is handled by [`settle`] before the outcome is looked at.
fn escalation_step_outcome(record: &EscalationRecord) -> Result<Value, StepError> {
    match record.outcome {
        EscalationOutcome::Resolved => Ok(json!({
            "escalation_id": record.id,
            "resolved_level": record.resolved_level,
            "acknowledged_by": record.acknowledged_by,
        })),
        EscalationOutcome::Cancelled => Err(StepError::Cancelled),
        EscalationOutcome::Aborted => Err(StepError::Failed("escalation aborted".to_string())),
        EscalationOutcome::Unresolved | EscalationOutcome::Pending => Err(
            StepError::EscalationUnresolved(format!("no level resolved escalation {}", record.id)),
        ),
    }
}

// ---------------------------------------------------------------------------
// Phase 3
// ---------------------------------------------------------------------------

/// Whether the attempt was settled from outside (bypassed) while unlocked.
fn settled_elsewhere(execution: &WorkflowExecution, step_execution_id: Uuid) -> bool {
    execution
        .step_execution(step_execution_id)
        .is_none_or(|r| r.status != StepStatus::InProgress && r.status != StepStatus::Failed)
}

async fn settle<R: MitigationRepository>(
    engine: &EngineInner<R>,
    slot: &ExecutionSlot,
    attempt: Attempt,
    outcome: Result<Value, StepError>,
    escalation: Option<EscalationRecord>,
) -> Flow {
    let mut guard = slot.state.lock().await;
    let state = &mut *guard;
    let step_execution_id = attempt.ctx.step_execution_id;
    let step = &attempt.ctx.step;

    let aborted_by = escalation
        .as_ref()
        .filter(|r| r.outcome == EscalationOutcome::Aborted)
        .map(|r| r.acknowledged_by.clone().unwrap_or_default());
    let acknowledged_by = escalation.as_ref().and_then(|r| r.acknowledged_by.clone());
    if let Some(record) = escalation {
        replace_escalation(&mut state.execution, record);
    }

    if state.execution.is_terminal() {
        engine.persist(&state.execution).await;
        return stop(slot, state);
    }
    if state
        .execution
        .step_execution(step_execution_id)
        .is_none_or(|r| r.status != StepStatus::InProgress)
    {
        // Bypassed while the handler ran.
        engine.persist(&state.execution).await;
        return Flow::Next;
    }

    if let Some(by) = aborted_by {
        if let Some(record) = state.execution.step_execution_mut(step_execution_id) {
            record.error = Some(format!("escalation aborted by {by}"));
            record.acknowledged_by = Some(by.clone());
            record.finish(StepStatus::Failed);
        }
        engine.fail(
            &mut state.execution,
            format!("escalation step '{}' aborted by {by}", step.id),
        );
        engine.persist(&state.execution).await;
        return stop(slot, state);
    }

    match outcome {
        Ok(value) => on_success(engine, slot, state, step, step_execution_id, value, acknowledged_by).await,
        Err(error) => on_failure(engine, slot, guard, attempt, error).await,
    }
}

async fn on_success<R: MitigationRepository>(
    engine: &EngineInner<R>,
    slot: &ExecutionSlot,
    state: &mut SlotState,
    step: &WorkflowStep,
    step_execution_id: Uuid,
    value: Value,
    acknowledged_by: Option<String>,
) -> Flow {
    let execution = &mut state.execution;
    let mut duration_ms = 0;
    if let Some(record) = execution.step_execution_mut(step_execution_id) {
        record.approved_by = value
            .get("approved_by")
            .and_then(Value::as_str)
            .map(str::to_string);
        record.acknowledged_by = acknowledged_by;
        record.result = Some(value);
        record.finish(StepStatus::Completed);
        duration_ms = record
            .started_at
            .zip(record.completed_at)
            .map(|(start, end)| (end - start).num_milliseconds().max(0) as u64)
            .unwrap_or_default();
    }
    tracing::info!(execution_id = %execution.id, step_id = %step.id, duration_ms, "step completed");
    engine.event_bus.publish(MitigationEvent::StepCompleted {
        execution_id: execution.id,
        step_execution_id,
        step_id: step.id.clone(),
        duration_ms,
    });
    if let Some(attempt) = state.attempt.take() {
        attempt.token.cancel();
    }
    state.next_retry = 0;

    match step.on_success {
        SuccessPolicy::Continue => execution.cursor += 1,
        SuccessPolicy::SkipTo => {
            let target = step
                .skip_to
                .as_deref()
                .and_then(|t| slot.definition.step_index(t))
                .filter(|&t| t > execution.cursor);
            match target {
                Some(target) => {
                    for skipped in &slot.definition.steps[execution.cursor + 1..target] {
                        let reason = format!("skipped by '{}'", step.id);
                        execution.steps.push(StepExecution::skipped(&skipped.id, &reason));
                        engine.event_bus.publish(MitigationEvent::StepSkipped {
                            execution_id: execution.id,
                            step_id: skipped.id.clone(),
                            reason,
                        });
                    }
                    execution.cursor = target;
                }
                None => execution.cursor += 1,
            }
        }
        SuccessPolicy::Complete => {
            engine.complete(execution);
            engine.persist(execution).await;
            return stop(slot, state);
        }
    }

    engine.persist(execution).await;
    Flow::Next
}

async fn on_failure<R: MitigationRepository>(
    engine: &EngineInner<R>,
    slot: &ExecutionSlot,
    mut guard: MutexGuard<'_, SlotState>,
    attempt: Attempt,
    error: StepError,
) -> Flow {
    let step = &attempt.ctx.step;
    let step_execution_id = attempt.ctx.step_execution_id;
    let message = error.to_string();
    let route = RetryHandler::route(step, attempt.ctx.retry_count, engine.config.retry_backoff_ms);

    {
        let state = &mut *guard;
        let execution = &mut state.execution;
        if let Some(record) = execution.step_execution_mut(step_execution_id) {
            record.error = Some(message.clone());
            record.finish(StepStatus::Failed);
        }
        let will_retry = matches!(route, FailureRoute::Retry { .. });
        tracing::warn!(
            execution_id = %execution.id,
            step_id = %step.id,
            retry_count = attempt.ctx.retry_count,
            will_retry,
            error = %message,
            "step failed"
        );
        engine.event_bus.publish(MitigationEvent::StepFailed {
            execution_id: execution.id,
            step_execution_id,
            step_id: step.id.clone(),
            error: message.clone(),
            will_retry,
        });
    }

    let state = &mut *guard;
    match route {
        FailureRoute::Retry { next_retry, backoff } => {
            state.next_retry = next_retry;
            engine.persist(&state.execution).await;
            drop(guard);

            // The attempt handle stays set, so a bypass or cancel during the
            // backoff cuts it short.
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = attempt.ctx.cancel.cancelled() => {}
            }
            Flow::Next
        }
        FailureRoute::Abort => {
            engine.fail(
                &mut state.execution,
                format!("step '{}' failed: {message}", step.id),
            );
            engine.persist(&state.execution).await;
            stop(slot, state)
        }
        FailureRoute::Continue => {
            state.finish_attempt();
            state.next_retry = 0;
            state.execution.cursor += 1;
            engine.persist(&state.execution).await;
            Flow::Next
        }
        FailureRoute::Pause => {
            state.next_retry = 0;
            engine.pause(
                &mut state.execution,
                format!("step '{}' failed: {message}", step.id),
            );
            engine.persist(&state.execution).await;
            stop(slot, state)
        }
        FailureRoute::Escalate => escalate_failure(engine, slot, guard, attempt, message).await,
    }
}

/// Run the escalation coordinator for a failed attempt and route its outcome.
///
/// The cursor stays on the failed step until the escalation is decided.
async fn escalate_failure<R: MitigationRepository>(
    engine: &EngineInner<R>,
    slot: &ExecutionSlot,
    mut guard: MutexGuard<'_, SlotState>,
    attempt: Attempt,
    message: String,
) -> Flow {
    let step = &attempt.ctx.step;
    let step_execution_id = attempt.ctx.step_execution_id;

    let request = {
        let state = &mut *guard;
        let request = engine.escalation_request(
            &state.execution,
            step,
            step_execution_id,
            EscalationTrigger::StepFailure,
            format!("step '{}' failed: {message}", step.id),
        );
        state.execution.escalations.push(request.pending_record());
        engine.persist(&state.execution).await;
        request
    };
    drop(guard);

    let record = engine.coordinator.run(&request, &attempt.ctx.cancel).await;

    let mut guard = slot.state.lock().await;
    let state = &mut *guard;
    let outcome = record.outcome;
    let decided_by = record.acknowledged_by.clone().unwrap_or_default();
    replace_escalation(&mut state.execution, record);

    if state.execution.is_terminal() {
        engine.persist(&state.execution).await;
        return stop(slot, state);
    }
    if settled_elsewhere(&state.execution, step_execution_id) {
        engine.persist(&state.execution).await;
        return Flow::Next;
    }

    state.finish_attempt();
    state.next_retry = 0;
    match outcome {
        EscalationOutcome::Resolved if step.required => {
            engine.pause(
                &mut state.execution,
                format!(
                    "escalation for required step '{}' approved by {decided_by}; resume to re-run it",
                    step.id
                ),
            );
            engine.persist(&state.execution).await;
            stop(slot, state)
        }
        EscalationOutcome::Resolved => {
            tracing::info!(
                execution_id = %state.execution.id,
                step_id = %step.id,
                approved_by = %decided_by,
                "escalation approved; continuing past failed step"
            );
            state.execution.cursor += 1;
            engine.persist(&state.execution).await;
            Flow::Next
        }
        EscalationOutcome::Aborted => {
            engine.fail(
                &mut state.execution,
                format!("escalation for step '{}' aborted by {decided_by}", step.id),
            );
            engine.persist(&state.execution).await;
            stop(slot, state)
        }
        EscalationOutcome::Unresolved | EscalationOutcome::Cancelled | EscalationOutcome::Pending => {
            engine.pause(
                &mut state.execution,
                format!("escalation unresolved for step '{}': {message}", step.id),
            );
            engine.persist(&state.execution).await;
            stop(slot, state)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
