//! Event types for the mitigation event bus.
//!
//! `MitigationEvent` is broadcast by the engine, the escalation coordinator
//! and the deadline monitor. All variants are Clone + Send + Sync for use
//! with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::escalation::{EscalationTrigger, NotificationChannel};

/// Lifecycle events of executions, steps and escalations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MitigationEvent {
    /// A new execution was created for a triggering event.
    ExecutionStarted {
        execution_id: Uuid,
        definition_name: String,
        instruction_id: String,
        trigger_reason: String,
    },

    StepStarted {
        execution_id: Uuid,
        step_execution_id: Uuid,
        step_id: String,
        retry_count: u32,
    },

    StepCompleted {
        execution_id: Uuid,
        step_execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    StepFailed {
        execution_id: Uuid,
        step_execution_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    /// A step was not run (dependency unsatisfied or jumped by `skip_to`).
    StepSkipped {
        execution_id: Uuid,
        step_id: String,
        reason: String,
    },

    /// An operator bypassed a step attempt.
    StepBypassed {
        execution_id: Uuid,
        step_execution_id: Uuid,
        step_id: String,
        bypassed_by: String,
        reason: String,
    },

    ExecutionPaused { execution_id: Uuid, reason: String },

    ExecutionResumed { execution_id: Uuid },

    ExecutionCompleted {
        execution_id: Uuid,
        effectiveness: f64,
        duration_ms: u64,
    },

    ExecutionFailed { execution_id: Uuid, reason: String },

    ExecutionCancelled { execution_id: Uuid, reason: String },

    EscalationStarted {
        escalation_id: Uuid,
        execution_id: Uuid,
        step_id: String,
        trigger: EscalationTrigger,
        reason: String,
    },

    /// One level of an escalation path was notified.
    EscalationLevelNotified {
        escalation_id: Uuid,
        execution_id: Uuid,
        rank: u32,
        roles: Vec<String>,
        channels: Vec<NotificationChannel>,
    },

    EscalationResolved {
        escalation_id: Uuid,
        execution_id: Uuid,
        rank: u32,
        resolved_by: String,
    },

    /// Every level was exhausted (or no rule was available).
    EscalationUnresolved {
        escalation_id: Uuid,
        execution_id: Uuid,
        reason: String,
    },

    /// The deadline monitor found a step running past its deadline.
    StepDeadlineExceeded {
        execution_id: Uuid,
        step_execution_id: Uuid,
        step_id: String,
        elapsed_secs: u64,
        deadline_secs: u64,
    },
}

impl MitigationEvent {
    /// The execution this event concerns.
    pub fn execution_id(&self) -> Uuid {
        match self {
            MitigationEvent::ExecutionStarted { execution_id, .. }
            | MitigationEvent::StepStarted { execution_id, .. }
            | MitigationEvent::StepCompleted { execution_id, .. }
            | MitigationEvent::StepFailed { execution_id, .. }
            | MitigationEvent::StepSkipped { execution_id, .. }
            | MitigationEvent::StepBypassed { execution_id, .. }
            | MitigationEvent::ExecutionPaused { execution_id, .. }
            | MitigationEvent::ExecutionResumed { execution_id }
            | MitigationEvent::ExecutionCompleted { execution_id, .. }
            | MitigationEvent::ExecutionFailed { execution_id, .. }
            | MitigationEvent::ExecutionCancelled { execution_id, .. }
            | MitigationEvent::EscalationStarted { execution_id, .. }
            | MitigationEvent::EscalationLevelNotified { execution_id, .. }
            | MitigationEvent::EscalationResolved { execution_id, .. }
            | MitigationEvent::EscalationUnresolved { execution_id, .. }
            | MitigationEvent::StepDeadlineExceeded { execution_id, .. } => *execution_id,
        }
    }

    /// Whether this event settles an execution for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MitigationEvent::ExecutionCompleted { .. }
                | MitigationEvent::ExecutionFailed { .. }
                | MitigationEvent::ExecutionCancelled { .. }
        )
    }
}
