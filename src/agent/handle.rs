//! Handles for supervising a running sub-agent.
//!
//! The handle is the control loop's only view of a worker: snapshots,
//! best-effort guidance, cooperative cancellation, and a single-resolution
//! completion signal.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use super::{AgentId, AgentOutcome, AgentType, SubAgentState};
use crate::plan::NodeId;

/// One-shot completion signal.
///
/// # Invariants
/// - Transitions `None -> Some(outcome)` at most once; later `resolve`
///   calls are ignored, which makes a cancel/natural-completion race safe
#[derive(Debug)]
pub(crate) struct CompletionCell {
    tx: watch::Sender<Option<AgentOutcome>>,
}

impl CompletionCell {
    pub(crate) fn new() -> (Self, watch::Receiver<Option<AgentOutcome>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    /// Publish the outcome. Returns `false` if already resolved.
    pub(crate) fn resolve(&self, outcome: AgentOutcome) -> bool {
        let mut accepted = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome.clone());
                accepted = true;
                true
            } else {
                false
            }
        });
        accepted
    }
}

/// Supervision handle for one sub-agent.
///
/// Cheap to clone; all clones observe the same worker.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub id: AgentId,
    pub task_node_id: NodeId,
    pub agent_type: AgentType,
    pub(crate) state: Arc<RwLock<SubAgentState>>,
    pub(crate) guidance_tx: mpsc::UnboundedSender<String>,
    pub(crate) cancel: CancellationToken,
    pub(crate) cancel_reason: Arc<Mutex<Option<String>>>,
    pub(crate) completion: watch::Receiver<Option<AgentOutcome>>,
}

impl AgentHandle {
    /// Immutable snapshot of the agent's state.
    pub async fn state(&self) -> SubAgentState {
        self.state.read().await.clone()
    }

    /// Enqueue a steering message the agent consumes at its next safe
    /// point. Best-effort: no delivery acknowledgment, and a message sent
    /// to a finished agent is silently dropped.
    pub fn send_guidance(&self, text: impl Into<String>) {
        let _ = self.guidance_tx.send(text.into());
    }

    /// Request cooperative cancellation. The worker observes the token at
    /// its next safe point; this never preempts an in-flight tool call.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut slot = self.cancel_reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.cancel.cancel();
    }

    /// Wait for the agent's terminal outcome.
    ///
    /// Resolves exactly once per agent; every waiter (and repeated calls on
    /// the same handle) observes the same outcome.
    pub async fn wait_for_completion(&self) -> AgentOutcome {
        let mut rx = self.completion.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Worker dropped without publishing; surface as a failure
                // rather than hanging the supervisor.
                return AgentOutcome::Failed {
                    error: "agent terminated without reporting an outcome".to_string(),
                };
            }
        }
    }

    /// The outcome if the agent already finished.
    pub fn try_outcome(&self) -> Option<AgentOutcome> {
        self.completion.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.completion.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle() -> (AgentHandle, CompletionCell, mpsc::UnboundedReceiver<String>) {
        let (cell, rx) = CompletionCell::new();
        let (guidance_tx, guidance_rx) = mpsc::unbounded_channel();
        let spec = super::super::SubAgentSpec {
            task_node_id: NodeId::from("n"),
            agent_type: AgentType::General,
            task_description: "t".to_string(),
            upstream_context: String::new(),
            additional_tools: Vec::new(),
            operator_instructions: None,
        };
        let state = SubAgentState::new(crate::orchestrator::RunId::new(), AgentId::new(), &spec);
        let handle = AgentHandle {
            id: state.id,
            task_node_id: state.task_node_id.clone(),
            agent_type: state.agent_type,
            state: Arc::new(RwLock::new(state)),
            guidance_tx,
            cancel: CancellationToken::new(),
            cancel_reason: Arc::new(Mutex::new(None)),
            completion: rx,
        };
        (handle, cell, guidance_rx)
    }

    #[tokio::test]
    async fn completion_resolves_exactly_once_under_race() {
        let (handle, cell, _guidance) = test_handle();
        let cell = Arc::new(cell);

        // Two racing publishers: a natural completion and a cancellation.
        let c1 = Arc::clone(&cell);
        let t1 = tokio::spawn(async move {
            c1.resolve(AgentOutcome::Completed {
                output: "done".to_string(),
            })
        });
        let c2 = Arc::clone(&cell);
        let t2 = tokio::spawn(async move {
            c2.resolve(AgentOutcome::Cancelled {
                reason: "stop".to_string(),
            })
        });

        let first = handle.wait_for_completion().await;
        let second = handle.wait_for_completion().await;
        assert_eq!(first, second);

        let accepted = [t1.await.unwrap(), t2.await.unwrap()];
        assert_eq!(accepted.iter().filter(|a| **a).count(), 1);
    }

    #[tokio::test]
    async fn waiters_before_and_after_resolution_agree() {
        let (handle, cell, _guidance) = test_handle();
        let early = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_completion().await })
        };
        tokio::task::yield_now().await;

        assert!(cell.resolve(AgentOutcome::Failed {
            error: "boom".to_string()
        }));

        let late = handle.wait_for_completion().await;
        assert_eq!(early.await.unwrap(), late);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn guidance_is_best_effort_after_finish() {
        let (handle, cell, guidance_rx) = test_handle();
        cell.resolve(AgentOutcome::Completed {
            output: "done".to_string(),
        });
        drop(guidance_rx);
        // Must not panic or error even though nobody is listening.
        handle.send_guidance("too late");
    }

    #[tokio::test]
    async fn cancel_records_first_reason() {
        let (handle, _cell, _guidance) = test_handle();
        handle.cancel("first");
        handle.cancel("second");
        assert!(handle.cancel.is_cancelled());
        assert_eq!(
            handle.cancel_reason.lock().unwrap().as_deref(),
            Some("first")
        );
    }
}
