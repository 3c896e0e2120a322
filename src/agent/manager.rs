//! Sub-agent lifecycle manager for one run.
//!
//! Spawning is admission-free: the DAG's ready set is the only gate, so any
//! number of agents for unrelated ready nodes may run concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, RwLock};

use super::handle::{AgentHandle, CompletionCell};
use super::worker::Worker;
use super::{AgentId, AgentOutcome, SubAgentSpec, SubAgentState};
use crate::context::RunContext;
use crate::events::OrchestratorEvent;

/// Tracks every sub-agent spawned for a run.
///
/// # Ownership
/// Owned and mutated only by the run's control loop.
pub struct SubAgentManager {
    handles: HashMap<AgentId, AgentHandle>,
    /// Agents whose terminal outcome was already applied to the plan.
    reaped: HashSet<AgentId>,
}

impl SubAgentManager {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            reaped: HashSet::new(),
        }
    }

    /// Spawn a worker for a ready node and return its handle.
    pub fn spawn(&mut self, ctx: &RunContext, spec: SubAgentSpec) -> AgentHandle {
        let agent_id = AgentId::new();
        let state = Arc::new(RwLock::new(SubAgentState::new(ctx.run_id, agent_id, &spec)));
        let (guidance_tx, guidance_rx) = mpsc::unbounded_channel();
        let (cell, completion_rx) = CompletionCell::new();
        // Child token: run-level cancellation reaches every agent.
        let cancel = ctx.cancel.child_token();
        let cancel_reason = Arc::new(Mutex::new(None));

        let handle = AgentHandle {
            id: agent_id,
            task_node_id: spec.task_node_id.clone(),
            agent_type: spec.agent_type,
            state: Arc::clone(&state),
            guidance_tx,
            cancel: cancel.clone(),
            cancel_reason: Arc::clone(&cancel_reason),
            completion: completion_rx,
        };

        ctx.events.emit(OrchestratorEvent::AgentSpawned {
            run_id: ctx.run_id,
            agent_id,
            node_id: spec.task_node_id.clone(),
            agent_type: spec.agent_type,
        });
        tracing::info!(
            agent = %agent_id,
            node = %spec.task_node_id,
            agent_type = %spec.agent_type,
            "spawning sub-agent"
        );

        let worker = Worker {
            ctx: ctx.clone(),
            agent_id,
            spec,
            state,
            guidance: guidance_rx,
            cancel,
            cancel_reason,
            completion: cell,
        };
        tokio::spawn(worker.run());

        self.handles.insert(agent_id, handle.clone());
        handle
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentHandle> {
        self.handles.get(id)
    }

    /// Handles of agents that have not published an outcome yet.
    pub fn active_handles(&self) -> Vec<AgentHandle> {
        self.handles
            .values()
            .filter(|h| !h.is_finished())
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.handles.values().filter(|h| !h.is_finished()).count()
    }

    /// Collect agents that finished since the last reap.
    ///
    /// Each agent is returned exactly once across the run, which keeps the
    /// one-completion-callback-per-node contract.
    pub fn reap(&mut self) -> Vec<(AgentHandle, AgentOutcome)> {
        let mut finished = Vec::new();
        for (id, handle) in &self.handles {
            if self.reaped.contains(id) {
                continue;
            }
            if let Some(outcome) = handle.try_outcome() {
                finished.push((handle.clone(), outcome));
            }
        }
        for (handle, _) in &finished {
            self.reaped.insert(handle.id);
        }
        finished
    }

    /// Cooperatively cancel every tracked agent that is still running.
    pub fn cancel_all(&self, reason: &str) {
        for handle in self.handles.values() {
            if !handle.is_finished() {
                handle.cancel(reason);
            }
        }
    }

    /// Wait until any active agent publishes its outcome. Returns `None`
    /// immediately if no agent is active.
    pub async fn wait_any(&self) -> Option<AgentId> {
        let active = self.active_handles();
        if active.is_empty() {
            return None;
        }
        let futures: Vec<_> = active
            .iter()
            .map(|h| Box::pin(h.wait_for_completion()))
            .collect();
        let (_, index, _) = futures::future::select_all(futures).await;
        Some(active[index].id)
    }
}

impl Default for SubAgentManager {
    fn default() -> Self {
        Self::new()
    }
}
