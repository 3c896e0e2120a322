//! Task plan module - the dependency DAG behind a run.
//!
//! This module is designed with the same discipline as the rest of the
//! state model:
//! - All types use algebraic data types with exhaustive matching
//! - Invariants are documented and enforced in constructors/mutators
//! - Graph validation is pure and separated from status bookkeeping
//!
//! # Invariants
//! - Dependency edges reference only node ids within the same plan
//! - The dependency graph is acyclic (validated at insertion, not at
//!   scheduling time)
//! - A node is *ready* iff it is pending and every dependency is completed

mod graph;

pub use graph::PlanShape;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::agent::{AgentId, AgentType};
use crate::orchestrator::RunId;

/// Identifier of a task node, chosen by the planner.
///
/// Node ids are short human/model-readable strings (e.g. `"research"`),
/// unique within their plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(Uuid);

impl PlanId {
    /// Create a new unique plan ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a task node in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> InProgress -> Completed
///                      \-> Failed -> Pending   (guard-approved retry only)
///         \-> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    /// Whether this status is final for the node (absent a retry).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled
        )
    }
}

/// Status of the plan as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planning,
    Executing,
    Completed,
    Failed,
}

/// Insertion request for one task node.
///
/// Deserialized directly from planner tool-call arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub description: String,
    #[serde(default)]
    pub agent_type: AgentType,
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
}

/// One node of the task DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: NodeId,
    pub description: String,
    pub agent_type: AgentType,
    pub dependencies: BTreeSet<NodeId>,
    pub status: NodeStatus,
    pub assigned_agent_id: Option<AgentId>,
    /// Opaque result payload (success output or failure message).
    pub result: Option<serde_json::Value>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    fn from_spec(spec: NodeSpec) -> Self {
        Self {
            id: spec.id,
            description: spec.description,
            agent_type: spec.agent_type,
            dependencies: spec.dependencies.into_iter().collect(),
            status: NodeStatus::Pending,
            assigned_agent_id: None,
            result: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Result rendered as plain text (for digests and prompts).
    pub fn result_text(&self) -> String {
        match &self.result {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// Counts of nodes by status.
///
/// # Invariants
/// - `total() == plan.nodes.len()` at any snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Node {node} depends on unknown node {dependency}")]
    UnknownDependency { node: NodeId, dependency: NodeId },

    #[error("Dependency graph contains a cycle")]
    Cycle,

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node {0} still has dependents")]
    HasDependents(NodeId),

    #[error("Invalid transition for node {node}: {from:?} -> {to:?}")]
    InvalidTransition {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
}

/// The task DAG for one run.
///
/// # Ownership
/// The control loop is the sole writer; every other reader receives clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub run_id: RunId,
    pub status: PlanStatus,
    /// Nodes in insertion order.
    pub nodes: Vec<TaskNode>,
    /// Planner's stated reasoning for this decomposition.
    pub reasoning: String,
}

impl Plan {
    /// Create an empty plan in the `Planning` state.
    pub fn new(run_id: RunId, reasoning: impl Into<String>) -> Self {
        Self {
            id: PlanId::new(),
            run_id,
            status: PlanStatus::Planning,
            nodes: Vec::new(),
            reasoning: reasoning.into(),
        }
    }

    /// Bulk-insert nodes, validating ids and acyclicity.
    ///
    /// Dependencies may reference nodes already in the plan or other nodes
    /// in the same batch. The whole batch is rejected (plan unchanged) if
    /// any id is duplicated, any dependency is unknown, or the resulting
    /// graph cannot be proven acyclic.
    pub fn insert_nodes(&mut self, specs: Vec<NodeSpec>) -> Result<(), PlanError> {
        let mut known: BTreeSet<NodeId> = self.nodes.iter().map(|n| n.id.clone()).collect();
        for spec in &specs {
            if !known.insert(spec.id.clone()) {
                return Err(PlanError::DuplicateNode(spec.id.clone()));
            }
        }
        for spec in &specs {
            for dep in &spec.dependencies {
                if !known.contains(dep) {
                    return Err(PlanError::UnknownDependency {
                        node: spec.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut candidate: Vec<TaskNode> = self.nodes.clone();
        candidate.extend(specs.into_iter().map(TaskNode::from_spec));
        graph::validate_acyclic(&candidate)?;

        self.nodes = candidate;
        Ok(())
    }

    /// Remove a node nothing else depends on.
    pub fn remove_node(&mut self, id: &NodeId) -> Result<(), PlanError> {
        if !self.nodes.iter().any(|n| &n.id == id) {
            return Err(PlanError::NodeNotFound(id.clone()));
        }
        if self
            .nodes
            .iter()
            .any(|n| &n.id != id && n.dependencies.contains(id))
        {
            return Err(PlanError::HasDependents(id.clone()));
        }
        self.nodes.retain(|n| &n.id != id);
        Ok(())
    }

    pub fn node(&self, id: &NodeId) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    fn node_mut(&mut self, id: &NodeId) -> Result<&mut TaskNode, PlanError> {
        self.nodes
            .iter_mut()
            .find(|n| &n.id == id)
            .ok_or_else(|| PlanError::NodeNotFound(id.clone()))
    }

    /// Ids of nodes that are pending with every dependency completed.
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Pending)
            .filter(|n| {
                n.dependencies.iter().all(|dep| {
                    self.node(dep)
                        .map(|d| d.status == NodeStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .map(|n| n.id.clone())
            .collect()
    }

    /// Textual digest of completed dependency results, used to brief a new
    /// sub-agent. Empty string when the node has no completed dependencies.
    pub fn upstream_context(&self, id: &NodeId) -> String {
        let Some(node) = self.node(id) else {
            return String::new();
        };
        let mut sections = Vec::new();
        for dep_id in &node.dependencies {
            if let Some(dep) = self.node(dep_id) {
                if dep.status == NodeStatus::Completed {
                    sections.push(format!(
                        "### {} ({})\n{}",
                        dep.id,
                        dep.description,
                        dep.result_text()
                    ));
                }
            }
        }
        sections.join("\n\n")
    }

    /// Mark a node as started by an agent.
    pub fn start_node(&mut self, id: &NodeId, agent_id: AgentId) -> Result<(), PlanError> {
        let node = self.node_mut(id)?;
        if node.status != NodeStatus::Pending {
            return Err(PlanError::InvalidTransition {
                node: id.clone(),
                from: node.status,
                to: NodeStatus::InProgress,
            });
        }
        node.status = NodeStatus::InProgress;
        node.assigned_agent_id = Some(agent_id);
        node.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark a node completed with its result payload.
    pub fn complete_node(
        &mut self,
        id: &NodeId,
        result: serde_json::Value,
    ) -> Result<(), PlanError> {
        let node = self.node_mut(id)?;
        if node.status.is_terminal() {
            return Err(PlanError::InvalidTransition {
                node: id.clone(),
                from: node.status,
                to: NodeStatus::Completed,
            });
        }
        node.status = NodeStatus::Completed;
        node.result = Some(result);
        node.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark a node permanently failed with an explanatory message.
    pub fn fail_node(&mut self, id: &NodeId, message: impl Into<String>) -> Result<(), PlanError> {
        let node = self.node_mut(id)?;
        if node.status.is_terminal() && node.status != NodeStatus::Failed {
            return Err(PlanError::InvalidTransition {
                node: id.clone(),
                from: node.status,
                to: NodeStatus::Failed,
            });
        }
        node.status = NodeStatus::Failed;
        node.result = Some(serde_json::Value::String(message.into()));
        node.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark a node cancelled.
    pub fn cancel_node(&mut self, id: &NodeId) -> Result<(), PlanError> {
        let node = self.node_mut(id)?;
        if node.status.is_terminal() {
            return Err(PlanError::InvalidTransition {
                node: id.clone(),
                from: node.status,
                to: NodeStatus::Cancelled,
            });
        }
        node.status = NodeStatus::Cancelled;
        node.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Reset a failed node to pending for a guard-approved retry.
    ///
    /// Clears the stale result and agent assignment from the failed attempt
    /// and bumps `retry_count`.
    pub fn reset_for_retry(&mut self, id: &NodeId) -> Result<(), PlanError> {
        let node = self.node_mut(id)?;
        if node.status != NodeStatus::Failed {
            return Err(PlanError::InvalidTransition {
                node: id.clone(),
                from: node.status,
                to: NodeStatus::Pending,
            });
        }
        node.status = NodeStatus::Pending;
        node.retry_count += 1;
        node.result = None;
        node.assigned_agent_id = None;
        node.started_at = None;
        node.completed_at = None;
        Ok(())
    }

    /// Whether every node reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.nodes.iter().all(|n| n.status.is_terminal())
    }

    /// Whether every node completed successfully.
    pub fn is_success(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| n.status == NodeStatus::Completed)
    }

    /// Snapshot of node counts by status.
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for node in &self.nodes {
            match node.status {
                NodeStatus::Pending => counts.pending += 1,
                NodeStatus::InProgress => counts.in_progress += 1,
                NodeStatus::Completed => counts.completed += 1,
                NodeStatus::Failed => counts.failed += 1,
                NodeStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Classify the overall graph shape. Observability only - scheduling
    /// never consults this.
    pub fn shape(&self) -> PlanShape {
        graph::classify_shape(&self.nodes)
    }

    /// Human/model-readable status summary.
    pub fn summary(&self) -> String {
        let counts = self.status_counts();
        let mut out = format!(
            "Plan {} [{:?}] - {} tasks ({} pending, {} in progress, {} completed, {} failed, {} cancelled)\n",
            self.id,
            self.status,
            counts.total(),
            counts.pending,
            counts.in_progress,
            counts.completed,
            counts.failed,
            counts.cancelled,
        );
        for node in &self.nodes {
            let deps = if node.dependencies.is_empty() {
                String::new()
            } else {
                format!(
                    " (after {})",
                    node.dependencies
                        .iter()
                        .map(|d| d.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            out.push_str(&format!(
                "- {} [{:?}]{}: {}\n",
                node.id, node.status, deps, node.description
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn spec(id: &str, deps: &[&str]) -> NodeSpec {
        NodeSpec {
            id: NodeId::from(id),
            description: format!("task {id}"),
            agent_type: AgentType::General,
            dependencies: deps.iter().map(|d| NodeId::from(*d)).collect(),
        }
    }

    fn fan_plan() -> Plan {
        let mut plan = Plan::new(RunId::new(), "test");
        plan.insert_nodes(vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["a"]),
        ])
        .unwrap();
        plan
    }

    #[test]
    fn ready_set_progression() {
        let mut plan = fan_plan();
        assert_eq!(plan.ready_nodes(), vec![NodeId::from("a")]);

        plan.start_node(&NodeId::from("a"), AgentId::new()).unwrap();
        assert!(plan.ready_nodes().is_empty());

        plan.complete_node(&NodeId::from("a"), serde_json::json!("done"))
            .unwrap();
        let mut ready = plan.ready_nodes();
        ready.sort();
        assert_eq!(ready, vec![NodeId::from("b"), NodeId::from("c")]);

        plan.complete_node(&NodeId::from("b"), serde_json::json!("done"))
            .unwrap();
        plan.complete_node(&NodeId::from("c"), serde_json::json!("done"))
            .unwrap();
        assert!(plan.is_complete());
        assert!(plan.is_success());
        assert_eq!(plan.status_counts().completed, 3);
    }

    #[test]
    fn cycle_is_rejected_and_plan_unchanged() {
        let mut plan = Plan::new(RunId::new(), "test");
        let err = plan
            .insert_nodes(vec![spec("a", &["b"]), spec("b", &["a"])])
            .unwrap_err();
        assert_eq!(err, PlanError::Cycle);
        assert!(plan.nodes.is_empty());
        assert!(plan.ready_nodes().is_empty());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut plan = Plan::new(RunId::new(), "test");
        let err = plan.insert_nodes(vec![spec("a", &["a"])]).unwrap_err();
        assert_eq!(err, PlanError::Cycle);
    }

    #[test]
    fn unknown_dependency_rejected() {
        let mut plan = Plan::new(RunId::new(), "test");
        let err = plan.insert_nodes(vec![spec("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut plan = Plan::new(RunId::new(), "test");
        let err = plan
            .insert_nodes(vec![spec("a", &[]), spec("a", &[])])
            .unwrap_err();
        assert_eq!(err, PlanError::DuplicateNode(NodeId::from("a")));
    }

    #[test]
    fn batch_may_reference_existing_nodes() {
        let mut plan = Plan::new(RunId::new(), "test");
        plan.insert_nodes(vec![spec("a", &[])]).unwrap();
        plan.insert_nodes(vec![spec("b", &["a"])]).unwrap();
        assert_eq!(plan.nodes.len(), 2);
    }

    #[test]
    fn remove_node_refuses_when_dependents_exist() {
        let mut plan = fan_plan();
        let err = plan.remove_node(&NodeId::from("a")).unwrap_err();
        assert_eq!(err, PlanError::HasDependents(NodeId::from("a")));
        plan.remove_node(&NodeId::from("b")).unwrap();
        assert_eq!(plan.nodes.len(), 2);
    }

    #[test]
    fn upstream_context_concatenates_completed_results() {
        let mut plan = fan_plan();
        plan.start_node(&NodeId::from("a"), AgentId::new()).unwrap();
        plan.complete_node(&NodeId::from("a"), serde_json::json!("findings: 42"))
            .unwrap();
        let digest = plan.upstream_context(&NodeId::from("b"));
        assert!(digest.contains("findings: 42"));
        assert!(digest.contains("task a"));
    }

    #[test]
    fn retry_reset_clears_stale_attempt() {
        let mut plan = fan_plan();
        let agent = AgentId::new();
        plan.start_node(&NodeId::from("a"), agent).unwrap();
        plan.fail_node(&NodeId::from("a"), "boom").unwrap();

        plan.reset_for_retry(&NodeId::from("a")).unwrap();
        let node = plan.node(&NodeId::from("a")).unwrap();
        assert_eq!(node.status, NodeStatus::Pending);
        assert_eq!(node.retry_count, 1);
        assert!(node.result.is_none());
        assert!(node.assigned_agent_id.is_none());
        assert!(node.started_at.is_none());

        // Only failed nodes are retryable.
        let err = plan.reset_for_retry(&NodeId::from("b")).unwrap_err();
        assert!(matches!(err, PlanError::InvalidTransition { .. }));
    }

    /// Property: a node is ready iff it is pending and every dependency is
    /// completed, over randomly generated DAGs and status assignments.
    #[test]
    fn ready_set_property_over_random_dags() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let n = rng.gen_range(1..12usize);
            let mut specs = Vec::new();
            for i in 0..n {
                // Depend only on earlier nodes, so the graph is acyclic by
                // construction.
                let mut deps = Vec::new();
                for j in 0..i {
                    if rng.gen_bool(0.3) {
                        deps.push(format!("n{j}"));
                    }
                }
                let deps: Vec<&str> = deps.iter().map(|s| s.as_str()).collect();
                specs.push(spec(&format!("n{i}"), &deps));
            }
            let mut plan = Plan::new(RunId::new(), "prop");
            plan.insert_nodes(specs).unwrap();

            // Random status assignment.
            for node in &mut plan.nodes {
                node.status = match rng.gen_range(0..5) {
                    0 => NodeStatus::Pending,
                    1 => NodeStatus::InProgress,
                    2 => NodeStatus::Completed,
                    3 => NodeStatus::Failed,
                    _ => NodeStatus::Cancelled,
                };
            }

            let ready: BTreeSet<NodeId> = plan.ready_nodes().into_iter().collect();
            for node in &plan.nodes {
                let expected = node.status == NodeStatus::Pending
                    && node.dependencies.iter().all(|d| {
                        plan.node(d).map(|dep| dep.status == NodeStatus::Completed)
                            == Some(true)
                    });
                assert_eq!(
                    ready.contains(&node.id),
                    expected,
                    "node {} readiness mismatch",
                    node.id
                );
            }
        }
    }

    #[test]
    fn status_counts_sum_to_total() {
        let plan = fan_plan();
        assert_eq!(plan.status_counts().total(), plan.nodes.len());
    }
}
