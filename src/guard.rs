//! Loop/intervention guard - counter-and-threshold policy.
//!
//! The guard is the sole gate on two privileged escape hatches: retrying a
//! task past a natural failure, and intervening into a running agent.
//! Either could loop unboundedly and exhaust the run's token/cost budget,
//! so callers must check `allowed` immediately before acting and `record`
//! immediately after.
//!
//! # Concurrency
//! Counters are per-run and owned by the control loop (the single writer),
//! which makes the check-then-record pair effectively atomic with respect
//! to concurrent task completions for the same run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::plan::NodeId;

/// Structured outcome of a guard check.
///
/// A denial is data, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GuardDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Per-run retry/intervention counters.
#[derive(Debug, Clone)]
pub struct Guard {
    max_task_retries: u32,
    max_interventions: u32,
    retries: HashMap<NodeId, u32>,
    interventions: u32,
}

impl Guard {
    pub fn new(max_task_retries: u32, max_interventions: u32) -> Self {
        Self {
            max_task_retries,
            max_interventions,
            retries: HashMap::new(),
            interventions: 0,
        }
    }

    /// Whether one more retry of `task` is within the threshold.
    pub fn can_retry_task(&self, task: &NodeId) -> GuardDecision {
        let used = self.retries_for(task);
        if used < self.max_task_retries {
            GuardDecision::allow()
        } else {
            GuardDecision::deny(format!(
                "task {task} already retried {used} times (max {})",
                self.max_task_retries
            ))
        }
    }

    /// Record a retry of `task`. Call immediately after acting on an
    /// allowed decision.
    pub fn record_task_retry(&mut self, task: &NodeId) {
        *self.retries.entry(task.clone()).or_insert(0) += 1;
    }

    /// Whether one more intervention is within the run-wide threshold.
    pub fn can_intervene(&self) -> GuardDecision {
        if self.interventions < self.max_interventions {
            GuardDecision::allow()
        } else {
            GuardDecision::deny(format!(
                "run already intervened {} times (max {})",
                self.interventions, self.max_interventions
            ))
        }
    }

    /// Record an intervention.
    pub fn record_intervention(&mut self) {
        self.interventions += 1;
    }

    pub fn retries_for(&self, task: &NodeId) -> u32 {
        self.retries.get(task).copied().unwrap_or(0)
    }

    pub fn interventions(&self) -> u32 {
        self.interventions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_threshold_boundary() {
        let mut guard = Guard::new(3, 10);
        let task = NodeId::from("x");

        // Below threshold: allowed at 0, 1, 2 recorded retries.
        for _ in 0..2 {
            assert!(guard.can_retry_task(&task).allowed);
            guard.record_task_retry(&task);
        }
        // threshold - 1 recorded: still allowed.
        assert_eq!(guard.retries_for(&task), 2);
        assert!(guard.can_retry_task(&task).allowed);
        guard.record_task_retry(&task);

        // threshold recorded: denied, with a reason.
        let decision = guard.can_retry_task(&task);
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("max 3"));
    }

    #[test]
    fn retry_counters_are_per_task() {
        let mut guard = Guard::new(1, 10);
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        guard.record_task_retry(&a);
        assert!(!guard.can_retry_task(&a).allowed);
        assert!(guard.can_retry_task(&b).allowed);
    }

    #[test]
    fn intervention_threshold_boundary() {
        let mut guard = Guard::new(3, 2);
        assert!(guard.can_intervene().allowed);
        guard.record_intervention();
        assert!(guard.can_intervene().allowed);
        guard.record_intervention();

        let decision = guard.can_intervene();
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("max 2"));
        assert_eq!(guard.interventions(), 2);
    }
}
