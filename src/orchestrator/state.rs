//! Run state and the public run result.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::plan::{NodeId, Plan, PlanId};

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new unique run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a run.
///
/// # State Machine
/// ```text
/// Idle -> Planning -> Executing -> Monitoring -> Completed
///               \___________\____________\----> Failed
/// ```
/// Terminal states (`Completed`/`Failed`) are entered exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Planning,
    Executing,
    Monitoring,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Full state of one run.
///
/// # Ownership
/// The control loop is the sole writer; readers get clones through the
/// state store or the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub user_id: String,
    pub status: RunStatus,
    /// The active plan, if the run decomposed its request. Exactly one per
    /// run.
    pub plan: Option<Plan>,
    pub active_agent_ids: HashSet<AgentId>,
    /// Retry counters per task, mirrored from the guard for observability.
    pub loop_counters: HashMap<NodeId, u32>,
    pub total_interventions: u32,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(run_id: RunId, user_id: impl Into<String>) -> Self {
        Self {
            run_id,
            user_id: user_id.into(),
            status: RunStatus::Idle,
            plan: None,
            active_agent_ids: HashSet::new(),
            loop_counters: HashMap::new(),
            total_interventions: 0,
            total_tokens: 0,
            total_cost: 0.0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Transition the run status.
    ///
    /// Status is monotonic into a terminal state: once `Completed` or
    /// `Failed` is set, further transitions are refused. `completed_at` is
    /// set iff the new status is terminal.
    ///
    /// Returns whether the transition was applied.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        if self.status.is_terminal() {
            tracing::warn!(
                run = %self.run_id,
                from = ?self.status,
                to = ?next,
                "ignoring status transition on terminal run"
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Fold one oracle call's usage into the running aggregates.
    pub fn record_usage(&mut self, total_tokens: u64, cost: f64) {
        self.total_tokens += total_tokens;
        self.total_cost += cost;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Result of one end-to-end run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_tokens: u64,
    pub total_cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<PlanId>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
}
