//! Usage and effectiveness report types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate view of executions started within a time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_executions: usize,
    /// Execution count per status name.
    pub by_status: BTreeMap<String, usize>,
    /// Mean effectiveness over terminal executions (`None` when there are none).
    pub average_effectiveness: Option<f64>,
    pub definitions: Vec<DefinitionUsage>,
    pub escalations: usize,
    pub unresolved_escalations: usize,
}

/// Per-playbook usage within a report window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionUsage {
    pub definition_name: String,
    pub executions: usize,
    pub completed: usize,
    pub failed: usize,
    pub average_effectiveness: Option<f64>,
    /// Mean wall-clock duration of terminal executions, in seconds.
    pub average_duration_secs: Option<f64>,
}
