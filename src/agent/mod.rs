//! Sub-agent module - concurrent workers bound to task nodes.
//!
//! # Agent Lifecycle
//! - Spawned by the control loop when a DAG node becomes ready
//! - Runs an independent decision sub-loop against the shared tool port,
//!   scoped to its own message history and tool whitelist
//! - Accepts mid-flight steering through a guidance mailbox and cooperative
//!   cancellation through a token, both observed at safe points between
//!   turns
//! - Publishes exactly one terminal outcome, which drives exactly one
//!   completion callback into the owning node
//!
//! # Ownership
//! Each sub-agent is the sole writer of its own state; the control loop and
//! event consumers receive point-in-time clones.

mod handle;
mod manager;
mod worker;

pub use handle::AgentHandle;
pub use manager::SubAgentManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::oracle::{ChatMessage, TokenUsage};
use crate::orchestrator::RunId;
use crate::plan::NodeId;

/// Unique identifier for a sub-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Create a new unique agent ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Specialization of a worker agent.
///
/// Closed set; the planner picks one per task node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    #[default]
    General,
    Research,
    Coding,
    Scheduling,
    Productivity,
    Messaging,
}

impl AgentType {
    /// One-line persona used in the worker system prompt.
    pub fn persona(&self) -> &'static str {
        match self {
            AgentType::General => "a capable general-purpose assistant",
            AgentType::Research => "a research specialist who gathers and verifies information",
            AgentType::Coding => "a software engineer who writes and reviews code",
            AgentType::Scheduling => "a scheduling assistant who manages calendars and timing",
            AgentType::Productivity => "a productivity assistant who organizes tasks and notes",
            AgentType::Messaging => "a communication assistant who drafts and sends messages",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentType::General => "general",
            AgentType::Research => "research",
            AgentType::Coding => "coding",
            AgentType::Scheduling => "scheduling",
            AgentType::Productivity => "productivity",
            AgentType::Messaging => "messaging",
        };
        write!(f, "{name}")
    }
}

/// Status of a sub-agent in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AgentStatus {
    /// Terminal statuses are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Cancelled
        )
    }
}

/// Request to spawn a sub-agent for a ready node.
#[derive(Debug, Clone)]
pub struct SubAgentSpec {
    /// Owning task node.
    pub task_node_id: NodeId,
    pub agent_type: AgentType,
    pub task_description: String,
    /// Digest of completed dependency results.
    pub upstream_context: String,
    /// Tool whitelist. Empty means every tool the user has.
    pub additional_tools: Vec<String>,
    /// Optional standing instructions from the operator.
    pub operator_instructions: Option<String>,
}

/// One tool invocation made by a sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub tool_id: String,
    pub arguments: serde_json::Value,
    pub success: bool,
    /// Truncated output or error text.
    pub summary: String,
    pub at: DateTime<Utc>,
}

/// Mutable state of a sub-agent.
///
/// # Ownership
/// Written only by the worker task that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentState {
    pub id: AgentId,
    pub run_id: RunId,
    pub task_node_id: NodeId,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub task_description: String,
    pub upstream_context: String,
    pub additional_tools: Vec<String>,
    /// The agent's own conversation, in order.
    pub messages: Vec<ChatMessage>,
    /// Tool invocations, in order.
    pub tool_invocations: Vec<ToolInvocationRecord>,
    /// Narration emitted alongside tool calls, in order.
    pub reasoning_steps: Vec<String>,
    pub total_tokens: TokenUsage,
    pub total_cost: f64,
    /// Guidance received but not yet folded into the conversation.
    pub pending_guidance: Option<String>,
}

impl SubAgentState {
    pub(crate) fn new(run_id: RunId, id: AgentId, spec: &SubAgentSpec) -> Self {
        Self {
            id,
            run_id,
            task_node_id: spec.task_node_id.clone(),
            agent_type: spec.agent_type,
            status: AgentStatus::Initializing,
            task_description: spec.task_description.clone(),
            upstream_context: spec.upstream_context.clone(),
            additional_tools: spec.additional_tools.clone(),
            messages: Vec::new(),
            tool_invocations: Vec::new(),
            reasoning_steps: Vec::new(),
            total_tokens: TokenUsage::default(),
            total_cost: 0.0,
            pending_guidance: None,
        }
    }
}

/// Terminal outcome of a sub-agent.
///
/// Published exactly once per agent, even under a cancel/natural-completion
/// race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Completed { output: String },
    Failed { error: String },
    Cancelled { reason: String },
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AgentOutcome::Completed { .. })
    }

    /// The terminal status this outcome maps to.
    pub fn status(&self) -> AgentStatus {
        match self {
            AgentOutcome::Completed { .. } => AgentStatus::Completed,
            AgentOutcome::Failed { .. } => AgentStatus::Failed,
            AgentOutcome::Cancelled { .. } => AgentStatus::Cancelled,
        }
    }

    /// Output or error text, whichever applies.
    pub fn describe(&self) -> &str {
        match self {
            AgentOutcome::Completed { output } => output,
            AgentOutcome::Failed { error } => error,
            AgentOutcome::Cancelled { reason } => reason,
        }
    }
}
