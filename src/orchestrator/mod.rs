//! Orchestrator - the public surface of the task-orchestration core.
//!
//! One [`Orchestrator`] wires the external ports (oracle, tools, state
//! store, memory) once; each [`Orchestrator::execute_run`] call builds a
//! per-run context and drives the control loop to a `RunResult`. Runs are
//! independent: concurrent runs for different users share nothing but the
//! ports.

mod actions;
mod control_loop;
mod state;

pub use actions::{orchestrator_tool_menu, ActionError, AgentRef, Intervention, OrchestratorAction};
pub use state::{RunId, RunResult, RunState, RunStatus};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::context::RunContext;
use crate::events::{EventBus, OrchestratorEvent};
use crate::memory::MemoryPort;
use crate::oracle::Oracle;
use crate::store::StateStore;
use crate::tools::ToolInvoker;

/// The task-orchestration engine.
pub struct Orchestrator {
    config: OrchestratorConfig,
    oracle: Arc<dyn Oracle>,
    tools: Arc<dyn ToolInvoker>,
    store: Arc<dyn StateStore>,
    memory: Option<Arc<dyn MemoryPort>>,
    events: EventBus,
    /// Cancellation tokens of in-flight runs, by run id.
    active_runs: Arc<RwLock<HashMap<RunId, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        oracle: Arc<dyn Oracle>,
        tools: Arc<dyn ToolInvoker>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            oracle,
            tools,
            store,
            memory: None,
            events: EventBus::default(),
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Attach a memory/knowledge backend.
    pub fn with_memory(mut self, memory: Arc<dyn MemoryPort>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Subscribe to the typed event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Execute one run end to end.
    ///
    /// Never returns an error: every failure mode is folded into the
    /// `RunResult`.
    pub async fn execute_run(&self, user_id: &str, run_id: RunId, input: &str) -> RunResult {
        let cancel = CancellationToken::new();
        self.active_runs.write().await.insert(run_id, cancel.clone());

        let ctx = RunContext {
            run_id,
            user_id: user_id.to_string(),
            config: self.config.clone(),
            oracle: Arc::clone(&self.oracle),
            tools: Arc::clone(&self.tools),
            store: Arc::clone(&self.store),
            memory: self.memory.clone(),
            events: self.events.clone(),
            cancel,
        };

        let result = control_loop::ControlLoop::new(ctx).execute(input).await;
        self.active_runs.write().await.remove(&run_id);
        result
    }

    /// Request cooperative cancellation of a run by id.
    ///
    /// Returns whether the run was active.
    pub async fn cancel_run(&self, run_id: RunId) -> bool {
        match self.active_runs.read().await.get(&run_id) {
            Some(token) => {
                tracing::info!(run = %run_id, "run cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryError, MemoryHit};
    use crate::oracle::{OracleError, ScriptedOracle, ScriptedTurn, ToolDefinition};
    use crate::store::InMemoryStateStore;
    use crate::tools::{StaticToolbox, ToolOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Routing key matching only the coordinator's system prompt.
    const COORD: &str = "orchestrator of a personal assistant";

    fn toolbox() -> Arc<StaticToolbox> {
        Arc::new(
            StaticToolbox::new().register(
                "echo",
                "Echo the arguments back",
                json!({"type": "object"}),
                ToolOutcome::ok,
            ),
        )
    }

    fn orchestrator(oracle: Arc<ScriptedOracle>) -> (Orchestrator, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        let orch = Orchestrator::new(
            OrchestratorConfig::default(),
            oracle,
            toolbox(),
            Arc::clone(&store) as Arc<dyn StateStore>,
        );
        (orch, store)
    }

    async fn run(orch: &Orchestrator, input: &str) -> RunResult {
        tokio::time::timeout(
            Duration::from_secs(20),
            orch.execute_run("u1", RunId::new(), input),
        )
        .await
        .expect("run timed out")
    }

    fn drain_events(
        rx: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>,
    ) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn direct_text_answer_is_the_run_result() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_turn_for(COORD, ScriptedTurn::text("Paris is the capital of France."));

        let (orch, store) = orchestrator(Arc::clone(&oracle));
        let result = run(&orch, "what is the capital of France?").await;

        assert!(result.success);
        assert_eq!(
            result.response.as_deref(),
            Some("Paris is the capital of France.")
        );
        assert!(result.error.is_none());
        assert!(result.plan_id.is_none());
        assert!(result.total_tokens > 0);
        assert_eq!(oracle.remaining_turns(), 0);

        // The answer is persisted into the user's history.
        let history = store.load_history("u1").await.unwrap();
        assert!(history
            .iter()
            .any(|m| m.text_content() == Some("Paris is the capital of France.")));
    }

    #[tokio::test]
    async fn respond_to_user_short_circuits_co_emitted_calls() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_turn_for(
            COORD,
            ScriptedTurn::tool_calls(vec![
                crate::oracle::ToolCall::function(
                    "c1",
                    "respond_to_user",
                    json!({"message": "All set!"}).to_string(),
                ),
                crate::oracle::ToolCall::function("c2", "echo", json!({"x": 1}).to_string()),
            ]),
        );

        let (orch, _) = orchestrator(oracle);
        let result = run(&orch, "quick one").await;
        assert!(result.success);
        assert_eq!(result.response.as_deref(), Some("All set!"));
    }

    #[tokio::test]
    async fn fan_out_plan_executes_and_consolidates() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_turn_for(
            COORD,
            ScriptedTurn::tool_call(
                "c1",
                "create_plan",
                json!({
                    "reasoning": "three coordinated steps",
                    "tasks": [
                        {"id": "a", "description": "gather the data", "agent_type": "research"},
                        {"id": "b", "description": "draft the report", "agent_type": "general",
                         "dependencies": ["a"]},
                        {"id": "c", "description": "prepare the charts", "agent_type": "coding",
                         "dependencies": ["a"]}
                    ]
                }),
            ),
        );
        // Worker turns are routed by persona, which appears only in worker
        // system prompts (the coordinator's prompt embeds task descriptions,
        // so those are not usable as routing keys).
        oracle.push_turn_for("research specialist", ScriptedTurn::text("dataset: 42 rows"));
        oracle.push_turn_for("general-purpose assistant", ScriptedTurn::text("report drafted"));
        oracle.push_turn_for("software engineer", ScriptedTurn::text("charts ready"));
        oracle.push_turn_for(COORD, ScriptedTurn::text("Done: report and charts are ready."));

        let (orch, store) = orchestrator(Arc::clone(&oracle));
        let mut events = orch.subscribe();
        let run_id = RunId::new();
        let result = tokio::time::timeout(
            Duration::from_secs(20),
            orch.execute_run("u1", run_id, "prepare the quarterly report"),
        )
        .await
        .unwrap();

        assert!(result.success, "result: {result:?}");
        assert_eq!(result.tasks_completed, 3);
        assert_eq!(result.tasks_failed, 0);
        assert!(result.plan_id.is_some());
        assert_eq!(
            result.response.as_deref(),
            Some("Done: report and charts are ready.")
        );
        assert_eq!(oracle.remaining_turns(), 0);

        // Downstream tasks saw their dependency's result.
        let agents = store.load_agents_for_run(run_id).await.unwrap();
        assert_eq!(agents.len(), 3);
        let b = agents
            .iter()
            .find(|a| a.task_node_id == crate::plan::NodeId::from("b"))
            .unwrap();
        assert!(b.upstream_context.contains("dataset: 42 rows"));

        let events = drain_events(&mut events);
        let spawned = events
            .iter()
            .filter(|e| matches!(e, OrchestratorEvent::AgentSpawned { .. }))
            .count();
        assert_eq!(spawned, 3);
        assert!(events.iter().any(|e| matches!(
            e,
            OrchestratorEvent::PlanCreated { node_count: 3, .. }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::TaskCompleted { success: true, .. })));
    }

    #[tokio::test]
    async fn failed_task_retries_until_guard_denies() {
        let mut config = OrchestratorConfig::default();
        config.max_task_retries = 1;

        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_turn_for(
            COORD,
            ScriptedTurn::tool_call(
                "c1",
                "create_plan",
                json!({
                    "reasoning": "one fragile step",
                    "tasks": [{"id": "x", "description": "the doomed step"}]
                }),
            ),
        );
        // Both attempts produce no output, which fails the agent.
        oracle.push_turn_for("general-purpose assistant", ScriptedTurn::empty());
        oracle.push_turn_for(
            COORD,
            ScriptedTurn::tool_call(
                "c2",
                "fail_task",
                json!({"task_id": "x", "error": "no output", "retry": true}),
            ),
        );
        oracle.push_turn_for("general-purpose assistant", ScriptedTurn::empty());
        oracle.push_turn_for(
            COORD,
            ScriptedTurn::tool_call(
                "c3",
                "fail_task",
                json!({"task_id": "x", "error": "still no output", "retry": true}),
            ),
        );
        oracle.push_turn_for(COORD, ScriptedTurn::text("The step could not be completed."));

        let store = Arc::new(InMemoryStateStore::new());
        let orch = Orchestrator::new(
            config,
            Arc::clone(&oracle) as Arc<dyn Oracle>,
            toolbox(),
            Arc::clone(&store) as Arc<dyn StateStore>,
        );

        let run_id = RunId::new();
        let result = tokio::time::timeout(
            Duration::from_secs(20),
            orch.execute_run("u1", run_id, "do the fragile thing"),
        )
        .await
        .unwrap();

        assert!(!result.success);
        assert_eq!(result.tasks_completed, 0);
        assert_eq!(result.tasks_failed, 1);
        assert_eq!(
            result.response.as_deref(),
            Some("The step could not be completed.")
        );
        assert_eq!(oracle.remaining_turns(), 0);

        // The permanent failure carries the explanatory message.
        let saved = store.load_run(run_id).await.unwrap().unwrap();
        let plan = saved.plan.unwrap();
        let node = plan.node(&crate::plan::NodeId::from("x")).unwrap();
        assert_eq!(node.retry_count, 1);
        assert!(node.result_text().contains("(max retries reached)"));
    }

    #[tokio::test]
    async fn iteration_cap_is_a_fatal_run_error() {
        let mut config = OrchestratorConfig::default();
        config.max_iterations = 2;

        let oracle = Arc::new(ScriptedOracle::new());
        for i in 0..2 {
            oracle.push_turn_for(
                COORD,
                ScriptedTurn::tool_call(&format!("c{i}"), "get_plan_status", json!({})),
            );
        }

        let orch = Orchestrator::new(
            config,
            oracle,
            toolbox(),
            Arc::new(InMemoryStateStore::new()),
        );
        let result = run(&orch, "spin forever").await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("iteration limit reached (2)"));
        assert!(result.response.is_none());
    }

    #[tokio::test]
    async fn transient_stream_failure_is_retried_once() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_error(OracleError::server_error(503, "upstream hiccup"));
        oracle.push_turn_for(COORD, ScriptedTurn::text("Recovered and answered."));

        let (orch, _) = orchestrator(oracle);
        let result = run(&orch, "hello").await;
        assert!(result.success);
        assert_eq!(result.response.as_deref(), Some("Recovered and answered."));
    }

    #[tokio::test]
    async fn permanent_stream_failure_fails_the_run() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_error(OracleError::client_error("model rejected the request"));

        let (orch, _) = orchestrator(oracle);
        let result = run(&orch, "hello").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("oracle stream failure"));
    }

    #[tokio::test]
    async fn corrupted_history_is_cleared_and_user_asked_to_retry() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_error(OracleError::client_error(
            "messages with role 'tool' must be a response to a preceding message with 'tool_calls'",
        ));

        let (orch, store) = orchestrator(oracle);
        store
            .save_history("u1", &[crate::oracle::ChatMessage::user("earlier turn")])
            .await
            .unwrap();

        let result = run(&orch, "hello again").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("corrupted"));
        // The user gets an instruction to retry, not a raw failure.
        assert!(result.response.unwrap().contains("send your request again"));
        assert!(store.load_history("u1").await.unwrap().is_empty());
    }

    /// Toolbox whose only tool blocks until the test releases it.
    struct GatedToolbox {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ToolInvoker for GatedToolbox {
        async fn invoke(
            &self,
            _user_id: &str,
            tool_id: &str,
            _args: serde_json::Value,
        ) -> ToolOutcome {
            if tool_id == "wait_for_signal" {
                self.gate.notified().await;
                ToolOutcome::ok(json!("released"))
            } else {
                ToolOutcome::err(format!("unknown tool: {tool_id}"))
            }
        }

        async fn get_tools(&self, _user_id: &str) -> Vec<ToolDefinition> {
            vec![ToolDefinition::function(
                "wait_for_signal",
                "Block until released",
                json!({"type": "object"}),
            )]
        }
    }

    #[tokio::test]
    async fn intervention_guides_a_running_agent() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_turn_for(
            COORD,
            ScriptedTurn::tool_call(
                "c1",
                "create_plan",
                json!({
                    "reasoning": "one fragile, one guarded",
                    "tasks": [
                        {"id": "x", "description": "the doomed step"},
                        {"id": "y", "description": "the guarded step", "agent_type": "coding"}
                    ]
                }),
            ),
        );
        oracle.push_turn_for("general-purpose assistant", ScriptedTurn::empty());
        // y blocks in its tool until the intervention is delivered.
        oracle.push_turn_for(
            "software engineer",
            ScriptedTurn::tool_call("y1", "wait_for_signal", json!({})),
        );
        oracle.push_turn_for("software engineer", ScriptedTurn::text("guarded step done"));
        // On x's failure the coordinator accepts it and steers y.
        oracle.push_turn_for(
            COORD,
            ScriptedTurn::tool_calls(vec![
                crate::oracle::ToolCall::function(
                    "c2",
                    "fail_task",
                    json!({"task_id": "x", "error": "no output", "retry": false}).to_string(),
                ),
                crate::oracle::ToolCall::function(
                    "c3",
                    "intervene_agent",
                    json!({"task_id": "y", "action": "guide", "message": "focus on essentials"})
                        .to_string(),
                ),
            ]),
        );
        oracle.push_turn_for(COORD, ScriptedTurn::text("y finished; x failed."));

        let gate = Arc::new(Notify::new());
        let store = Arc::new(InMemoryStateStore::new());
        let orch = Orchestrator::new(
            OrchestratorConfig::default(),
            oracle,
            Arc::new(GatedToolbox {
                gate: Arc::clone(&gate),
            }),
            Arc::clone(&store) as Arc<dyn StateStore>,
        );

        let mut events = orch.subscribe();
        let release = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(OrchestratorEvent::AgentIntervention { .. }) => {
                            gate.notify_one();
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            })
        };

        let run_id = RunId::new();
        let result = tokio::time::timeout(
            Duration::from_secs(20),
            orch.execute_run("u1", run_id, "run the guarded plan"),
        )
        .await
        .unwrap();
        release.await.unwrap();

        assert!(!result.success);
        assert_eq!(result.tasks_completed, 1);
        assert_eq!(result.tasks_failed, 1);

        // The guidance reached y's conversation before its final turn.
        let agents = store.load_agents_for_run(run_id).await.unwrap();
        let y = agents
            .iter()
            .find(|a| a.task_node_id == crate::plan::NodeId::from("y"))
            .unwrap();
        assert!(y.messages.iter().any(|m| {
            m.text_content()
                .map(|t| t.contains("[operator guidance] focus on essentials"))
                .unwrap_or(false)
        }));
    }

    #[tokio::test]
    async fn cancel_run_aborts_and_cancels_agents() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_turn_for(
            COORD,
            ScriptedTurn::tool_call(
                "c1",
                "create_plan",
                json!({
                    "reasoning": "long task",
                    "tasks": [{"id": "y", "description": "the guarded step"}]
                }),
            ),
        );
        oracle.push_turn_for(
            "general-purpose assistant",
            ScriptedTurn::tool_call("y1", "wait_for_signal", json!({})),
        );

        let gate = Arc::new(Notify::new());
        let store = Arc::new(InMemoryStateStore::new());
        let orch = Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            oracle,
            Arc::new(GatedToolbox {
                gate: Arc::clone(&gate),
            }),
            store,
        ));

        let mut events = orch.subscribe();
        let run_id = RunId::new();
        let canceller = {
            let orch = Arc::clone(&orch);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(OrchestratorEvent::AgentSpawned { .. }) => {
                            assert!(orch.cancel_run(run_id).await);
                            gate.notify_one();
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            })
        };

        let result = tokio::time::timeout(
            Duration::from_secs(20),
            orch.execute_run("u1", run_id, "start something long"),
        )
        .await
        .unwrap();
        canceller.await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("run cancelled"));
        // The run is no longer cancellable once finished.
        assert!(!orch.cancel_run(run_id).await);
    }

    /// Memory port that records stores and serves one canned hit.
    #[derive(Default)]
    struct RecordingMemory {
        searches: Mutex<Vec<String>>,
        stored: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MemoryPort for RecordingMemory {
        async fn search(
            &self,
            _user_id: &str,
            query: &str,
            _limit: usize,
        ) -> Result<Vec<MemoryHit>, MemoryError> {
            self.searches.lock().unwrap().push(query.to_string());
            Ok(vec![MemoryHit {
                content: "User prefers metric units".to_string(),
                score: 0.9,
                metadata: json!({}),
            }])
        }

        async fn store(
            &self,
            _user_id: &str,
            content: &str,
            _metadata: serde_json::Value,
        ) -> Result<(), MemoryError> {
            self.stored.lock().unwrap().push(content.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn memory_is_consulted_and_writable() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_turn_for(
            COORD,
            ScriptedTurn::tool_call(
                "c1",
                "store_memory",
                json!({"content": "favorite city is Lisbon"}),
            ),
        );
        oracle.push_turn_for(COORD, ScriptedTurn::text("Noted!"));

        let memory = Arc::new(RecordingMemory::default());
        let store = Arc::new(InMemoryStateStore::new());
        let orch = Orchestrator::new(
            OrchestratorConfig::default(),
            oracle,
            toolbox(),
            store,
        )
        .with_memory(Arc::clone(&memory) as Arc<dyn MemoryPort>);

        let result = run(&orch, "remember that my favorite city is Lisbon").await;
        assert!(result.success);
        assert_eq!(
            memory.searches.lock().unwrap().as_slice(),
            ["remember that my favorite city is Lisbon"]
        );
        assert_eq!(
            memory.stored.lock().unwrap().as_slice(),
            ["favorite city is Lisbon"]
        );
    }
}
