//! Playbook definition types.
//!
//! A `WorkflowDefinition` is the immutable description of a remediation
//! playbook: the trigger conditions that select it, and the ordered,
//! dependency-aware steps that run when it is selected. Definitions are never
//! mutated in place; an edit is a full replacement or a new definition.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signal::SignalValue;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A remediation playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 identifier (generated when omitted from YAML).
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Unique human-readable name (alphanumeric and hyphens).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string; bump when publishing a replacement.
    #[serde(default = "default_version")]
    pub version: String,
    pub category: WorkflowCategory,
    #[serde(default)]
    pub priority: Priority,
    /// Conditions scored by the trigger matcher.
    #[serde(default)]
    pub triggers: Vec<TriggerCondition>,
    /// Steps in execution order (normalized to a topological order on registration).
    pub steps: Vec<WorkflowStep>,
    /// Inactive definitions are never matched or explicitly invoked.
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Position of a step in execution order.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

/// Broad purpose of a playbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCategory {
    Preventive,
    Reactive,
    Recovery,
}

/// Playbook priority. Ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

// ---------------------------------------------------------------------------
// Trigger Conditions
// ---------------------------------------------------------------------------

/// A single weighted threshold test against a named signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    /// Semantic signal name, e.g. `failure_probability`.
    pub field: String,
    pub operator: ConditionOperator,
    /// Threshold value. Not required for `exists`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<SignalValue>,
    /// Weight in `[0, 1]` used in match scoring.
    pub weight: f64,
    /// Human-readable description used in the execution's trigger reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TriggerCondition {
    pub fn new(
        field: impl Into<String>,
        operator: ConditionOperator,
        value: Option<SignalValue>,
        weight: f64,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            weight,
            description: None,
        }
    }

    /// Description for trigger reasons: the explicit one, or `field op value`.
    pub fn describe(&self) -> String {
        if let Some(desc) = &self.description {
            return desc.clone();
        }
        match &self.value {
            Some(value) => format!("{} {} {}", self.field, self.operator, value),
            None => format!("{} {}", self.field, self.operator),
        }
    }
}

/// Comparison operator of a trigger condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[serde(rename = ">", alias = "gt")]
    GreaterThan,
    #[serde(rename = "<", alias = "lt")]
    LessThan,
    #[serde(rename = "=", alias = "==", alias = "eq")]
    Equals,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "exists")]
    Exists,
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            ConditionOperator::GreaterThan => ">",
            ConditionOperator::LessThan => "<",
            ConditionOperator::Equals => "=",
            ConditionOperator::Contains => "contains",
            ConditionOperator::Exists => "exists",
        };
        f.write_str(symbol)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single step of a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step ID, unique within its definition.
    pub id: String,
    pub name: String,
    /// Ordering hint; ties and dependencies are resolved on registration.
    #[serde(default)]
    pub sequence: u32,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub automation: AutomationLevel,
    /// Expected duration in seconds; the deadline monitor flags steps running
    /// past a multiple of this.
    pub expected_duration_secs: u64,
    /// Role responsible for carrying out (or approving) the step.
    pub responsible_role: String,
    /// Prerequisite step IDs (DAG edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Free-form handler parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub on_success: SuccessPolicy,
    /// Target step when `on_success` is `skip_to`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_to: Option<String>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub max_retries: u32,
    /// Required steps never silently continue after failure.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Whether an operator may bypass the step.
    #[serde(default)]
    pub bypassable: bool,
}

impl WorkflowStep {
    pub fn expected_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expected_duration_secs as i64)
    }

    /// String parameter lookup.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    /// Unsigned integer parameter lookup.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(|v| v.as_u64())
    }
}

/// The kind of step, selecting the handler that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Notification,
    Approval,
    Action,
    Verification,
    Escalation,
    Documentation,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepType::Notification => "notification",
            StepType::Approval => "approval",
            StepType::Action => "action",
            StepType::Verification => "verification",
            StepType::Escalation => "escalation",
            StepType::Documentation => "documentation",
        };
        f.write_str(name)
    }
}

/// How much of a step is carried out without humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationLevel {
    Manual,
    SemiAutomated,
    #[default]
    Automated,
}

/// Routing after a step succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessPolicy {
    /// Advance to the next step.
    #[default]
    Continue,
    /// Jump forward to the step named by `skip_to`.
    SkipTo,
    /// Complete the execution immediately.
    Complete,
}

/// Routing after a step fails and its retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Retry; once `max_retries` is exhausted, escalate.
    Retry,
    Escalate,
    #[default]
    Abort,
    /// Soft failure: advance. Not honoured for required steps.
    Continue,
}
