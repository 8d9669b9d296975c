//! Step dependency graph: cycle detection and stable execution ordering.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Topological
//! sort detects cycles; `order_steps` then produces the single linear order
//! the execution cursor walks: dependencies first, ties broken by ascending
//! `sequence` and then by declaration order.

use std::collections::{BTreeSet, HashMap};

use mitigate_types::definition::WorkflowStep;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::DefinitionError;

// ---------------------------------------------------------------------------
// DAG validation
// ---------------------------------------------------------------------------

/// Validate that steps form a valid DAG (no cycles, all references exist).
pub fn validate_dag(steps: &[WorkflowStep]) -> Result<(), DefinitionError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for (to_idx, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                DefinitionError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        DefinitionError::CycleDetected(format!("cycle detected involving step '{}'", node_id))
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Execution order
// ---------------------------------------------------------------------------

/// Stable topological order of the steps.
///
/// Kahn's algorithm with a ready set keyed by `(sequence, declaration index)`,
/// so an already-sequential definition keeps its order and independent
/// branches interleave by sequence number.
pub fn order_steps(steps: &[WorkflowStep]) -> Result<Vec<WorkflowStep>, DefinitionError> {
    validate_dag(steps)?;

    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut remaining: Vec<usize> = steps.iter().map(|s| s.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (idx, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            if let Some(&dep_idx) = id_to_idx.get(dep.as_str()) {
                dependents[dep_idx].push(idx);
            }
        }
    }

    let mut ready: BTreeSet<(u32, usize)> = steps
        .iter()
        .enumerate()
        .filter(|(idx, _)| remaining[*idx] == 0)
        .map(|(idx, s)| (s.sequence, idx))
        .collect();

    let mut ordered = Vec::with_capacity(steps.len());
    while let Some(next) = ready.pop_first() {
        let (_, idx) = next;
        ordered.push(steps[idx].clone());
        for &dependent in &dependents[idx] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert((steps[dependent].sequence, dependent));
            }
        }
    }

    if ordered.len() != steps.len() {
        return Err(DefinitionError::CycleDetected(
            "steps could not be ordered".to_string(),
        ));
    }

    Ok(ordered)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
