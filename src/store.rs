//! State-store port with a pluggable backend.
//!
//! Durable persistence is an external collaborator; the orchestrator writes
//! through this port and treats bookkeeping failures as best-effort. The
//! in-memory backend is the default for tests and single-process wiring.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::agent::{AgentId, SubAgentState};
use crate::oracle::ChatMessage;
use crate::orchestrator::{RunId, RunState};
use crate::plan::{Plan, PlanId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Durable CRUD for orchestrator records plus per-user conversation
/// history.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Whether records survive a process restart.
    fn is_persistent(&self) -> bool;

    async fn save_run(&self, run: &RunState) -> Result<(), StoreError>;
    async fn load_run(&self, run_id: RunId) -> Result<Option<RunState>, StoreError>;

    async fn save_plan(&self, plan: &Plan) -> Result<(), StoreError>;
    async fn load_plan(&self, plan_id: PlanId) -> Result<Option<Plan>, StoreError>;

    async fn save_agent(&self, agent: &SubAgentState) -> Result<(), StoreError>;
    async fn load_agents_for_run(&self, run_id: RunId) -> Result<Vec<SubAgentState>, StoreError>;

    async fn load_history(&self, user_id: &str) -> Result<Vec<ChatMessage>, StoreError>;
    async fn save_history(&self, user_id: &str, history: &[ChatMessage]) -> Result<(), StoreError>;
    /// Drop the user's conversation history (corrupted-history recovery).
    async fn clear_history(&self, user_id: &str) -> Result<(), StoreError>;
}

/// In-memory state store (non-persistent).
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    runs: Arc<RwLock<HashMap<RunId, RunState>>>,
    plans: Arc<RwLock<HashMap<PlanId, Plan>>>,
    agents: Arc<RwLock<HashMap<AgentId, SubAgentState>>>,
    histories: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn save_run(&self, run: &RunState) -> Result<(), StoreError> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> Result<Option<RunState>, StoreError> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn save_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        self.plans.write().await.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn load_plan(&self, plan_id: PlanId) -> Result<Option<Plan>, StoreError> {
        Ok(self.plans.read().await.get(&plan_id).cloned())
    }

    async fn save_agent(&self, agent: &SubAgentState) -> Result<(), StoreError> {
        self.agents.write().await.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn load_agents_for_run(&self, run_id: RunId) -> Result<Vec<SubAgentState>, StoreError> {
        Ok(self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn load_history(&self, user_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .histories
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_history(&self, user_id: &str, history: &[ChatMessage]) -> Result<(), StoreError> {
        self.histories
            .write()
            .await
            .insert(user_id.to_string(), history.to_vec());
        Ok(())
    }

    async fn clear_history(&self, user_id: &str) -> Result<(), StoreError> {
        self.histories.write().await.remove(user_id);
        Ok(())
    }
}
