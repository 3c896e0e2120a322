//! # Concierge
//!
//! Autonomous task-orchestration core for a personal assistant backend.
//!
//! Given a user request, the orchestrator decides whether to answer directly
//! or to decompose the request into a dependency graph of tasks, spawn
//! independent worker agents to execute them, supervise their progress,
//! intervene or retry on failure, and consolidate results into a final
//! answer.
//!
//! ## Architecture
//!
//! ```text
//!        ┌───────────────────────────────────┐
//!        │         Orchestrator              │
//!        │  (per-run control loop, bounded)  │
//!        └──────┬──────────┬──────────┬──────┘
//!               │          │          │
//!               ▼          ▼          ▼
//!        ┌──────────┐ ┌─────────┐ ┌─────────┐
//!        │   Plan   │ │SubAgent │ │ Context │
//!        │  (DAG)   │ │ Manager │ │ Manager │
//!        └──────────┘ └────┬────┘ └─────────┘
//!                          │
//!                          ▼ (one tokio task per ready node)
//!                   ┌─────────────┐
//!                   │  sub-agent  │──▶ oracle + tools
//!                   │  sub-loop   │
//!                   └─────────────┘
//! ```
//!
//! ## Run Flow
//! 1. `Orchestrator::execute_run` builds a per-run context and enters the
//!    control loop
//! 2. Each iteration reaps finished sub-agents, rebalances the message
//!    window, and streams one planning-oracle turn
//! 3. Oracle tool calls are dispatched in emission order (plan mutations,
//!    agent lifecycle, memory writes, or generic tool pass-through)
//! 4. Terminal text (or `respond_to_user`) produces the `RunResult`
//!
//! ## Modules
//! - `orchestrator`: control loop, action dispatch, run state, facade
//! - `plan`: task DAG with readiness computation
//! - `agent`: concurrent sub-agent lifecycles
//! - `guard`: retry/intervention rate limiting
//! - `history`: token budgeting and message-window integrity
//! - `oracle`, `tools`, `store`, `memory`, `events`: ports to external
//!   collaborators

pub mod agent;
pub mod config;
pub mod context;
pub mod events;
pub mod guard;
pub mod history;
pub mod memory;
pub mod oracle;
pub mod orchestrator;
pub mod plan;
pub mod store;
pub mod tools;

pub use config::OrchestratorConfig;
pub use context::RunContext;
pub use events::OrchestratorEvent;
pub use orchestrator::{Orchestrator, RunId, RunResult, RunStatus};
