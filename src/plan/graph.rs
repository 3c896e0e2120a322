//! Pure graph checks over plan nodes.
//!
//! Kahn's algorithm proves acyclicity at insertion time, so scheduling can
//! trust the edge set and never re-validate.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::{NodeId, PlanError, TaskNode};

/// Overall shape of the dependency graph.
///
/// Observability only - the scheduler never branches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanShape {
    Empty,
    SingleTask,
    /// Every node has at most one dependency and at most one dependent.
    LinearChain,
    /// At least one node fans out to (or joins from) several others.
    FanOut,
}

/// Verify the node set forms a DAG.
///
/// # Errors
/// Returns `PlanError::Cycle` if a topological order covering every node
/// cannot be constructed. Unknown dependency ids must be rejected by the
/// caller before this check.
pub(super) fn validate_acyclic(nodes: &[TaskNode]) -> Result<(), PlanError> {
    let mut in_degree: HashMap<&NodeId, usize> = nodes.iter().map(|n| (&n.id, 0)).collect();
    let mut dependents: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();

    for node in nodes {
        for dep in &node.dependencies {
            *in_degree.entry(&node.id).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(&node.id);
        }
    }

    let mut queue: VecDeque<&NodeId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(children) = dependents.get(id) {
            for &child in children {
                let degree = in_degree.get_mut(child).ok_or(PlanError::Cycle)?;
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if visited == nodes.len() {
        Ok(())
    } else {
        Err(PlanError::Cycle)
    }
}

/// Classify the graph shape for observability.
pub(super) fn classify_shape(nodes: &[TaskNode]) -> PlanShape {
    match nodes.len() {
        0 => return PlanShape::Empty,
        1 => return PlanShape::SingleTask,
        _ => {}
    }

    let mut dependent_counts: HashMap<&NodeId, usize> = HashMap::new();
    for node in nodes {
        for dep in &node.dependencies {
            *dependent_counts.entry(dep).or_insert(0) += 1;
        }
    }

    let linear = nodes.iter().all(|n| n.dependencies.len() <= 1)
        && dependent_counts.values().all(|&c| c <= 1);
    if linear {
        PlanShape::LinearChain
    } else {
        PlanShape::FanOut
    }
}
