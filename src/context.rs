//! Per-run execution context.
//!
//! One `RunContext` is constructed per run and passed down explicitly -
//! never global mutable state - so concurrent runs for different users
//! cannot cross-contaminate.
//!
//! # Thread Safety
//! The context is cloned into each spawned sub-agent task; ports are shared
//! through `Arc`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::events::EventBus;
use crate::memory::MemoryPort;
use crate::oracle::Oracle;
use crate::orchestrator::RunId;
use crate::store::StateStore;
use crate::tools::ToolInvoker;

/// Shared context for one run.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub user_id: String,

    /// Orchestrator configuration (iteration caps, thresholds, budgets).
    pub config: OrchestratorConfig,

    /// Planning oracle for decision turns and summarization.
    pub oracle: Arc<dyn Oracle>,

    /// Generic tool-invocation port.
    pub tools: Arc<dyn ToolInvoker>,

    /// Durable state store. Bookkeeping writes are best-effort.
    pub store: Arc<dyn StateStore>,

    /// Optional memory/knowledge backend for grounding.
    pub memory: Option<Arc<dyn MemoryPort>>,

    /// Typed event fan-out for this run.
    pub events: EventBus,

    /// Run-level cancellation token. Sub-agents derive child tokens.
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Whether run-level cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
