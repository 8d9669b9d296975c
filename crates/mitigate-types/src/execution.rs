//! Execution tracking types.
//!
//! A `WorkflowExecution` is one run of a playbook against one triggering
//! event. Its `steps` log is append-only: every attempt of a step (including
//! retries and skips) is a separate `StepExecution` record, so the log is a
//! complete audit trail of what happened.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::escalation::EscalationRecord;
use crate::signal::Signals;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Initiated,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal executions are retired and never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Initiated => "initiated",
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(ExecutionStatus::Initiated),
            "in_progress" => Ok(ExecutionStatus::InProgress),
            "paused" => Ok(ExecutionStatus::Paused),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

/// Status of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

// ---------------------------------------------------------------------------
// StepExecution
// ---------------------------------------------------------------------------

/// Operator bypass of a step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBypass {
    pub reason: String,
    pub bypassed_by: String,
    pub bypassed_at: DateTime<Utc>,
}

/// One attempt at running a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// UUIDv7 attempt ID.
    pub id: Uuid,
    /// The step this attempt belongs to.
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// 0 for the first attempt, incremented on every retry.
    pub retry_count: u32,
    /// Opaque handler result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure (or skip) reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass: Option<StepBypass>,
}

impl StepExecution {
    /// A fresh attempt, in progress as of now.
    pub fn start(step_id: impl Into<String>, retry_count: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            step_id: step_id.into(),
            status: StepStatus::InProgress,
            started_at: Some(Utc::now()),
            completed_at: None,
            retry_count,
            result: None,
            error: None,
            approved_by: None,
            acknowledged_by: None,
            bypass: None,
        }
    }

    /// A record for a step that was not run.
    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            started_at: Some(now),
            completed_at: Some(now),
            retry_count: 0,
            result: None,
            error: Some(reason.into()),
            approved_by: None,
            acknowledged_by: None,
            bypass: None,
        }
    }

    /// A record for a step that is waiting on something other than its handler
    /// (unsatisfied dependencies under the `block` policy).
    pub fn pending(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            step_id: step_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            result: None,
            error: Some(reason.into()),
            approved_by: None,
            acknowledged_by: None,
            bypass: None,
        }
    }

    /// Settle the attempt with a final status.
    pub fn finish(&mut self, status: StepStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Time since the attempt started, if it has.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.started_at.map(|started| now - started)
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// One run of a playbook for one triggering event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub definition_id: Uuid,
    /// Definition name (denormalized for display).
    pub definition_name: String,
    /// The trade/settlement instruction this execution mitigates.
    pub instruction_id: String,
    /// Union of the matched condition descriptions.
    pub trigger_reason: String,
    pub triggered_by: String,
    /// Match score, absent for explicit invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_score: Option<f64>,
    /// The signals that triggered the execution.
    #[serde(default)]
    pub signals: Signals,
    pub status: ExecutionStatus,
    /// Index of the current step in the definition's step order.
    pub cursor: usize,
    /// Number of steps in the definition.
    pub total_steps: usize,
    /// Append-only attempt log.
    #[serde(default)]
    pub steps: Vec<StepExecution>,
    #[serde(default)]
    pub escalations: Vec<EscalationRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Fraction of steps completed, set on reaching a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effectiveness: Option<f64>,
    /// Why the execution failed, was cancelled, or is paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

impl WorkflowExecution {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Latest attempt record for a step.
    pub fn latest_for(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().rev().find(|s| s.step_id == step_id)
    }

    pub fn latest_for_mut(&mut self, step_id: &str) -> Option<&mut StepExecution> {
        self.steps.iter_mut().rev().find(|s| s.step_id == step_id)
    }

    pub fn step_execution(&self, id: Uuid) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_execution_mut(&mut self, id: Uuid) -> Option<&mut StepExecution> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Whether the latest attempt of a step completed successfully.
    pub fn is_step_completed(&self, step_id: &str) -> bool {
        self.latest_for(step_id)
            .is_some_and(|s| s.status == StepStatus::Completed)
    }

    /// Distinct steps whose latest attempt completed.
    pub fn completed_step_count(&self) -> usize {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .rev()
            .filter(|s| seen.insert(s.step_id.as_str()))
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// Completed steps / total steps (0 when the definition has no steps).
    pub fn compute_effectiveness(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        self.completed_step_count() as f64 / self.total_steps as f64
    }

    /// Wall-clock duration, for terminal executions.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            definition_name: "test".to_string(),
            instruction_id: "INS-1".to_string(),
            trigger_reason: "manual".to_string(),
            triggered_by: "tester".to_string(),
            match_score: None,
            signals: Signals::new(),
            status: ExecutionStatus::InProgress,
            cursor: 0,
            total_steps: 4,
            steps: vec![],
            escalations: vec![],
            started_at: Utc::now(),
            completed_at: None,
            effectiveness: None,
            status_reason: None,
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(!ExecutionStatus::InProgress.is_terminal());
        assert!(!ExecutionStatus::Initiated.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            ExecutionStatus::Initiated,
            ExecutionStatus::InProgress,
            ExecutionStatus::Paused,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            let parsed: ExecutionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("running".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn effectiveness_counts_latest_attempt_per_step() {
        let mut exec = execution();

        let mut first = StepExecution::start("a", 0);
        first.finish(StepStatus::Failed);
        let mut retry = StepExecution::start("a", 1);
        retry.finish(StepStatus::Completed);
        let mut b = StepExecution::start("b", 0);
        b.finish(StepStatus::Completed);
        let skipped = StepExecution::skipped("c", "dependency unsatisfied");

        exec.steps = vec![first, retry, b, skipped];

        assert_eq!(exec.completed_step_count(), 2);
        assert!((exec.compute_effectiveness() - 0.5).abs() < f64::EPSILON);
        assert!(exec.is_step_completed("a"));
        assert!(!exec.is_step_completed("c"));
        assert_eq!(exec.latest_for("a").unwrap().retry_count, 1);
    }

    #[test]
    fn latest_attempt_failure_is_not_completed() {
        let mut exec = execution();
        let mut ok = StepExecution::start("a", 0);
        ok.finish(StepStatus::Completed);
        let mut rerun = StepExecution::start("a", 0);
        rerun.finish(StepStatus::Failed);
        exec.steps = vec![ok, rerun];
        assert!(!exec.is_step_completed("a"));
        assert_eq!(exec.completed_step_count(), 0);
    }

    #[test]
    fn effectiveness_zero_for_empty_definition() {
        let mut exec = execution();
        exec.total_steps = 0;
        assert_eq!(exec.compute_effectiveness(), 0.0);
    }

    #[test]
    fn skipped_record_is_settled() {
        let rec = StepExecution::skipped("x", "why");
        assert_eq!(rec.status, StepStatus::Skipped);
        assert!(rec.completed_at.is_some());
        assert_eq!(rec.error.as_deref(), Some("why"));
    }
}
