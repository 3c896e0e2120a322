//! Typed event stream for run telemetry.
//!
//! Events fan out over `tokio::sync::broadcast`. Emission is best-effort:
//! a send with no subscribers (or a lagging subscriber) never fails the
//! owning run. Per-entity ordering follows the causal order of the
//! underlying state transition; no ordering is guaranteed across unrelated
//! concurrently running agents.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::{AgentId, AgentType};
use crate::orchestrator::{RunId, RunStatus};
use crate::plan::{NodeId, PlanId, PlanShape};

/// A typed event observed on the run's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OrchestratorEvent {
    /// Run status transition.
    #[serde(rename = "orchestrator.status")]
    Status {
        run_id: RunId,
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// A plan was created for the run.
    #[serde(rename = "plan.created")]
    PlanCreated {
        run_id: RunId,
        plan_id: PlanId,
        node_count: usize,
        shape: PlanShape,
    },

    /// Nodes were added to or removed from the plan.
    #[serde(rename = "plan.modified")]
    PlanModified {
        run_id: RunId,
        plan_id: PlanId,
        change: String,
    },

    /// Work started on a task node.
    #[serde(rename = "task.started")]
    TaskStarted {
        run_id: RunId,
        node_id: NodeId,
        agent_id: AgentId,
    },

    /// A task node reached a terminal status.
    #[serde(rename = "task.completed")]
    TaskCompleted {
        run_id: RunId,
        node_id: NodeId,
        success: bool,
    },

    /// A sub-agent worker was spawned.
    #[serde(rename = "agent.spawned")]
    AgentSpawned {
        run_id: RunId,
        agent_id: AgentId,
        node_id: NodeId,
        agent_type: AgentType,
    },

    /// A streamed text chunk. `agent_id` is `None` for the coordinator's
    /// own narration.
    #[serde(rename = "agent.token")]
    AgentToken {
        run_id: RunId,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        content: String,
    },

    /// A guard-approved intervention was delivered to a running agent.
    #[serde(rename = "agent.intervention")]
    AgentIntervention {
        run_id: RunId,
        agent_id: AgentId,
        kind: String,
    },

    /// A sub-agent published its terminal outcome.
    #[serde(rename = "agent.final")]
    AgentFinal {
        run_id: RunId,
        agent_id: AgentId,
        success: bool,
        output: String,
    },

    /// A sub-agent (or the coordinator) hit an error worth surfacing.
    #[serde(rename = "agent.error")]
    AgentError {
        run_id: RunId,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        message: String,
    },
}

/// Broadcast fan-out for [`OrchestratorEvent`].
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the stream from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Best-effort: having no subscribers is not an error.
    pub fn emit(&self, event: OrchestratorEvent) {
        tracing::trace!(?event, "emit");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tags_use_dotted_names() {
        let event = OrchestratorEvent::TaskCompleted {
            run_id: RunId::new(),
            node_id: NodeId::from("a"),
            success: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task.completed");
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(OrchestratorEvent::Status {
            run_id: RunId::new(),
            status: RunStatus::Planning,
            detail: None,
        });

        let mut rx = bus.subscribe();
        bus.emit(OrchestratorEvent::Status {
            run_id: RunId::new(),
            status: RunStatus::Executing,
            detail: None,
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            OrchestratorEvent::Status {
                status: RunStatus::Executing,
                ..
            }
        ));
    }
}
