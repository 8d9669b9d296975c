//! Usage and effectiveness reporting over a window of executions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mitigate_types::escalation::EscalationOutcome;
use mitigate_types::execution::{ExecutionStatus, WorkflowExecution};
use mitigate_types::report::{DefinitionUsage, UsageReport};

/// Aggregate executions started within `[from, to]`.
///
/// Effectiveness and duration averages only consider terminal executions.
/// Per-definition rows are ordered by execution count, then name.
pub fn build_report(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    executions: &[WorkflowExecution],
) -> UsageReport {
    let in_window: Vec<&WorkflowExecution> = executions
        .iter()
        .filter(|e| e.started_at >= from && e.started_at <= to)
        .collect();

    let mut by_status = BTreeMap::new();
    let mut by_definition: BTreeMap<&str, Vec<&WorkflowExecution>> = BTreeMap::new();
    let mut escalations = 0;
    let mut unresolved_escalations = 0;

    for execution in &in_window {
        *by_status
            .entry(execution.status.as_str().to_string())
            .or_insert(0) += 1;
        by_definition
            .entry(execution.definition_name.as_str())
            .or_default()
            .push(execution);
        escalations += execution.escalations.len();
        unresolved_escalations += execution
            .escalations
            .iter()
            .filter(|e| e.outcome == EscalationOutcome::Unresolved)
            .count();
    }

    let mut definitions: Vec<DefinitionUsage> = by_definition
        .into_iter()
        .map(|(name, runs)| DefinitionUsage {
            definition_name: name.to_string(),
            executions: runs.len(),
            completed: count_status(&runs, ExecutionStatus::Completed),
            failed: count_status(&runs, ExecutionStatus::Failed),
            average_effectiveness: average(runs.iter().filter_map(|e| e.effectiveness)),
            average_duration_secs: average(
                runs.iter()
                    .filter_map(|e| e.duration())
                    .map(|d| d.num_milliseconds() as f64 / 1000.0),
            ),
        })
        .collect();
    definitions.sort_by(|a, b| {
        b.executions
            .cmp(&a.executions)
            .then_with(|| a.definition_name.cmp(&b.definition_name))
    });

    UsageReport {
        from,
        to,
        total_executions: in_window.len(),
        by_status,
        average_effectiveness: average(in_window.iter().filter_map(|e| e.effectiveness)),
        definitions,
        escalations,
        unresolved_escalations,
    }
}

fn count_status(runs: &[&WorkflowExecution], status: ExecutionStatus) -> usize {
    runs.iter().filter(|e| e.status == status).count()
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}
