//! Escalation rule and record types.
//!
//! An `EscalationRule` is a ranked path of levels. The coordinator walks the
//! levels in ascending rank, notifying each level's roles and (when the level
//! requires it) waiting for an acknowledgment until the level times out.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::TriggerCondition;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// A leveled escalation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRule {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Optional conditions scored against the execution's trigger signals
    /// when rule selection is condition-based.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<TriggerCondition>,
    pub levels: Vec<EscalationLevel>,
    /// Channels every level is notified on.
    #[serde(default)]
    pub channels: Vec<NotificationChannel>,
}

impl EscalationRule {
    /// Levels sorted by ascending rank.
    pub fn ordered_levels(&self) -> Vec<&EscalationLevel> {
        let mut levels: Vec<&EscalationLevel> = self.levels.iter().collect();
        levels.sort_by_key(|l| l.rank);
        levels
    }
}

fn default_true() -> bool {
    true
}

/// One rank of an escalation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationLevel {
    /// Lower ranks are visited first.
    pub rank: u32,
    /// Roles notified at this level.
    pub roles: Vec<String>,
    /// How long to wait for an acknowledgment before moving on.
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub requires_acknowledgment: bool,
    /// An `approve` decision at this level resolves the escalation.
    #[serde(default)]
    pub can_approve: bool,
    /// An `abort` decision at this level fails the execution.
    #[serde(default)]
    pub can_abort: bool,
}

/// Delivery channel for escalation notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Sms,
    Slack,
    Pager,
    Webhook,
    Dashboard,
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Sms => "sms",
            NotificationChannel::Slack => "slack",
            NotificationChannel::Pager => "pager",
            NotificationChannel::Webhook => "webhook",
            NotificationChannel::Dashboard => "dashboard",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Escalation runs
// ---------------------------------------------------------------------------

/// What started an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    /// A step failed and its policy routed to escalation.
    StepFailure,
    /// An `escalation`-type step ran.
    StepDefined,
    /// The deadline monitor found the step stalled.
    Timeout,
}

/// Decision supplied with an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgmentDecision {
    /// Seen, no authority exercised.
    Acknowledge,
    Approve,
    Abort,
}

impl std::str::FromStr for AcknowledgmentDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acknowledge" | "ack" => Ok(AcknowledgmentDecision::Acknowledge),
            "approve" => Ok(AcknowledgmentDecision::Approve),
            "abort" => Ok(AcknowledgmentDecision::Abort),
            other => Err(format!("invalid acknowledgment decision: '{other}'")),
        }
    }
}

/// Final (or current) outcome of an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOutcome {
    /// Still walking levels.
    Pending,
    /// A level with approval authority approved.
    Resolved,
    /// A level with abort authority aborted.
    Aborted,
    /// Every level was exhausted without resolution.
    Unresolved,
    /// The execution (or step attempt) was cancelled mid-walk.
    Cancelled,
}

/// Audit record of one escalation, attached to its execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub step_execution_id: Uuid,
    /// Absent when no active rule was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<Uuid>,
    pub trigger: EscalationTrigger,
    pub reason: String,
    pub outcome: EscalationOutcome,
    /// Ranks notified, in visiting order.
    #[serde(default)]
    pub levels_notified: Vec<u32>,
    /// Rank at which the escalation was resolved or aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}
