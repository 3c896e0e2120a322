//! The per-run control loop.
//!
//! Each iteration: (1) reap terminated sub-agents and apply their outcomes
//! to the owning nodes, (2) start agents for newly ready nodes, (3) keep
//! the message window within budget, (4) stream one planning-oracle turn
//! and dispatch its actions in emission order.
//!
//! While a plan is executing the oracle is consulted only when it has a
//! decision to make - after a task failure, or when no agent is in flight -
//! otherwise the loop waits on sub-agent completions. Plain text is the
//! terminal answer only outside an executing plan; mid-plan text is
//! internal narration.

use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;

use super::actions::{self, AgentRef, Intervention, OrchestratorAction};
use super::state::{RunResult, RunState, RunStatus};
use crate::agent::{AgentHandle, AgentOutcome, SubAgentManager, SubAgentSpec};
use crate::context::RunContext;
use crate::events::OrchestratorEvent;
use crate::guard::Guard;
use crate::history::{is_corrupted_history_error, ContextManager};
use crate::oracle::{
    ChatMessage, ChatOptions, OracleError, OracleErrorKind, RetryConfig, StreamEvent, TokenUsage,
    ToolCall, ToolDefinition,
};
use crate::plan::{NodeId, NodeStatus, Plan, PlanStatus};

const USER_RETRY_MESSAGE: &str = "I ran into an issue with our conversation history and have \
reset it. Please send your request again.";

const UPDATE_EXCERPT_LIMIT: usize = 300;

/// How the loop interprets a plain-text oracle turn.
///
/// An explicit mode, not an implicit is-there-a-plan check: token streaming
/// and terminal-answer semantics are both decided here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    /// No plan: text is the terminal answer.
    Direct,
    /// Plan executing: text is internal narration.
    Planned,
    /// Plan settled: the oracle was prompted to consolidate; text is the
    /// terminal answer.
    Summarizing,
}

/// One collected oracle turn.
#[derive(Debug, Default)]
struct Turn {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<TokenUsage>,
}

enum TurnError {
    Fatal(String),
    Corrupted,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReapSummary {
    outcomes: usize,
    failures: usize,
}

pub(super) struct ControlLoop {
    ctx: RunContext,
    run: RunState,
    guard: Guard,
    agents: SubAgentManager,
    history: ContextManager,
    messages: Vec<ChatMessage>,
    phase: RunPhase,
    /// Set by `respond_to_user` or a direct terminal answer.
    responded: bool,
    response: Option<String>,
    deadline: Option<Instant>,
}

impl ControlLoop {
    pub(super) fn new(ctx: RunContext) -> Self {
        let run = RunState::new(ctx.run_id, ctx.user_id.clone());
        let guard = Guard::new(ctx.config.max_task_retries, ctx.config.max_interventions);
        let history = ContextManager::from_config(&ctx.config);
        let deadline = (ctx.config.run_deadline_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(ctx.config.run_deadline_secs));
        Self {
            ctx,
            run,
            guard,
            agents: SubAgentManager::new(),
            history,
            messages: Vec::new(),
            phase: RunPhase::Direct,
            responded: false,
            response: None,
            deadline,
        }
    }

    pub(super) async fn execute(mut self, input: &str) -> RunResult {
        tracing::info!(run = %self.ctx.run_id, user = %self.ctx.user_id, "run started");
        self.set_status(RunStatus::Planning, None);

        match self.ctx.store.load_history(&self.ctx.user_id).await {
            Ok(history) => self.messages = ContextManager::sanitize(history),
            Err(e) => tracing::warn!("history load failed, starting fresh: {e}"),
        }
        self.messages.push(ChatMessage::user(input));
        let memory_context = self.recall_memory(input).await;

        let max_iterations = self.ctx.config.max_iterations;
        let mut finished = false;

        for iteration in 1..=max_iterations {
            if self.ctx.is_cancelled() {
                return self.fatal("run cancelled").await;
            }
            if self.past_deadline() {
                return self.fatal("run deadline exceeded").await;
            }
            tracing::debug!(run = %self.ctx.run_id, iteration, "control loop iteration");

            let reap = self.reap_agents().await;
            if reap.outcomes > 0 {
                tracing::debug!(
                    outcomes = reap.outcomes,
                    failures = reap.failures,
                    "reaped sub-agents"
                );
            }
            self.schedule_ready().await;
            self.check_plan_progress(reap.failures > 0);

            // While a plan is executing, the oracle only gets a turn when
            // there is a decision to make; otherwise wait on the workers.
            let oracle_needed = match self.phase {
                RunPhase::Direct | RunPhase::Summarizing => true,
                RunPhase::Planned => reap.failures > 0 || self.agents.active_count() == 0,
            };
            if !oracle_needed {
                if let Err(reason) = self.await_progress().await {
                    return self.fatal(&reason).await;
                }
                continue;
            }

            let system_prompt = self.build_system_prompt(&memory_context);
            let menu = self.tool_menu().await;
            if self.history.over_budget(&system_prompt, &menu, &self.messages) {
                tracing::info!(run = %self.ctx.run_id, "message window over budget, folding");
                self.messages = self
                    .history
                    .fold_into_digest(&self.ctx.oracle, &self.messages)
                    .await;
                // Backstop: if the digest alone did not get us under budget,
                // trim the window outright.
                if self.history.over_budget(&system_prompt, &menu, &self.messages) {
                    let window = std::mem::take(&mut self.messages);
                    self.messages = self.history.trim_to_budget(&system_prompt, &menu, window);
                }
            }

            let turn = match self.oracle_turn(&system_prompt, &menu).await {
                Ok(turn) => turn,
                Err(TurnError::Corrupted) => return self.recover_corrupted_history().await,
                Err(TurnError::Fatal(message)) => return self.fatal(&message).await,
            };
            if let Some(usage) = &turn.usage {
                let cost = self
                    .ctx
                    .oracle
                    .calculate_cost(usage.prompt_tokens, usage.completion_tokens);
                self.run.record_usage(usage.total_tokens, cost);
            }

            if !turn.tool_calls.is_empty() {
                self.messages.push(ChatMessage::assistant_with_tools(
                    (!turn.text.is_empty()).then(|| turn.text.clone()),
                    turn.tool_calls.clone(),
                ));
                self.dispatch_actions(&turn.tool_calls).await;
                if self.responded {
                    finished = true;
                    break;
                }
                continue;
            }

            let text = turn.text.trim().to_string();
            match self.phase {
                RunPhase::Direct | RunPhase::Summarizing if !text.is_empty() => {
                    // A direct answer responds to the user; a consolidation
                    // summary only does if the oracle said so explicitly.
                    if self.phase == RunPhase::Direct {
                        self.responded = true;
                    }
                    self.response = Some(text);
                    finished = true;
                    break;
                }
                RunPhase::Direct | RunPhase::Summarizing => {
                    tracing::debug!("empty oracle turn, asking again");
                }
                RunPhase::Planned => {
                    if !text.is_empty() {
                        self.messages.push(ChatMessage::assistant(text));
                    }
                }
            }
        }

        if !finished {
            return self
                .fatal(&format!("iteration limit reached ({max_iterations})"))
                .await;
        }
        self.finish().await
    }

    // ------------------------------------------------------------------
    // Iteration phases
    // ------------------------------------------------------------------

    /// Apply outcomes of agents that finished since the last iteration.
    ///
    /// An outcome only drives its node if the node is still assigned to
    /// that agent: a superseded agent (cancelled for a retry, or replaced
    /// after a manual complete/fail) must not clobber the node's state.
    async fn reap_agents(&mut self) -> ReapSummary {
        let mut summary = ReapSummary::default();
        for (handle, outcome) in self.agents.reap() {
            summary.outcomes += 1;
            self.run.active_agent_ids.remove(&handle.id);

            // Tokens were spent either way.
            let snapshot = handle.state().await;
            self.run
                .record_usage(snapshot.total_tokens.total_tokens, snapshot.total_cost);

            let node_id = handle.task_node_id.clone();
            let Some(plan) = self.run.plan.as_mut() else {
                continue;
            };
            let still_assigned = plan
                .node(&node_id)
                .and_then(|n| n.assigned_agent_id)
                .map(|assigned| assigned == handle.id)
                .unwrap_or(false);
            if !still_assigned {
                tracing::debug!(
                    agent = %handle.id,
                    node = %node_id,
                    "discarding outcome from superseded agent"
                );
                continue;
            }

            let update = match &outcome {
                AgentOutcome::Completed { output } => {
                    match plan.complete_node(&node_id, serde_json::json!(output)) {
                        Ok(()) => {
                            self.ctx.events.emit(OrchestratorEvent::TaskCompleted {
                                run_id: self.ctx.run_id,
                                node_id: node_id.clone(),
                                success: true,
                            });
                            Some(format!(
                                "[task update] Task {node_id} completed: {}",
                                excerpt(output)
                            ))
                        }
                        Err(e) => {
                            tracing::debug!("stale completion for node {node_id}: {e}");
                            None
                        }
                    }
                }
                AgentOutcome::Failed { error } => match plan.fail_node(&node_id, error.clone()) {
                    Ok(()) => {
                        summary.failures += 1;
                        self.ctx.events.emit(OrchestratorEvent::TaskCompleted {
                            run_id: self.ctx.run_id,
                            node_id: node_id.clone(),
                            success: false,
                        });
                        Some(format!(
                            "[task update] Task {node_id} failed: {}. Decide now: call fail_task \
                             with retry=true to retry it, or retry=false to accept the failure.",
                            excerpt(error)
                        ))
                    }
                    Err(e) => {
                        tracing::debug!("stale failure for node {node_id}: {e}");
                        None
                    }
                },
                AgentOutcome::Cancelled { reason } => match plan.cancel_node(&node_id) {
                    Ok(()) => {
                        self.ctx.events.emit(OrchestratorEvent::TaskCompleted {
                            run_id: self.ctx.run_id,
                            node_id: node_id.clone(),
                            success: false,
                        });
                        Some(format!("[task update] Task {node_id} cancelled: {reason}"))
                    }
                    Err(e) => {
                        tracing::debug!("stale cancellation for node {node_id}: {e}");
                        None
                    }
                },
            };
            if let Some(update) = update {
                self.messages.push(ChatMessage::user(update));
            }
        }
        summary
    }

    /// Spawn agents for every ready node. Admission is governed entirely by
    /// the ready set.
    async fn schedule_ready(&mut self) -> usize {
        let ready = match &self.run.plan {
            Some(plan) if plan.status == PlanStatus::Executing => plan.ready_nodes(),
            _ => return 0,
        };
        let mut spawned = 0;
        for node_id in ready {
            match self.spawn_for_node(&node_id, Vec::new(), None).await {
                Ok(_) => spawned += 1,
                Err(e) => tracing::warn!("could not start ready task {node_id}: {e}"),
            }
        }
        spawned
    }

    async fn spawn_for_node(
        &mut self,
        node_id: &NodeId,
        additional_tools: Vec<String>,
        instructions: Option<String>,
    ) -> Result<crate::agent::AgentId, String> {
        let spec = {
            let plan = self.run.plan.as_ref().ok_or("no active plan")?;
            let node = plan
                .node(node_id)
                .ok_or_else(|| format!("unknown task: {node_id}"))?;
            SubAgentSpec {
                task_node_id: node_id.clone(),
                agent_type: node.agent_type,
                task_description: node.description.clone(),
                upstream_context: plan.upstream_context(node_id),
                additional_tools,
                operator_instructions: instructions,
            }
        };

        let handle = self.agents.spawn(&self.ctx, spec);
        let agent_id = handle.id;
        if let Some(plan) = self.run.plan.as_mut() {
            plan.start_node(node_id, agent_id)
                .map_err(|e| e.to_string())?;
        }
        self.run.active_agent_ids.insert(agent_id);
        self.ctx.events.emit(OrchestratorEvent::TaskStarted {
            run_id: self.ctx.run_id,
            node_id: node_id.clone(),
            agent_id,
        });
        Ok(agent_id)
    }

    /// Settle the plan once every path through it has finished.
    ///
    /// Skipped while a failure reaped this iteration still awaits the
    /// oracle's retry-or-accept decision.
    fn check_plan_progress(&mut self, fresh_failures: bool) {
        if self.phase != RunPhase::Planned || fresh_failures {
            return;
        }
        let Some(plan) = self.run.plan.as_mut() else {
            return;
        };

        // Dependents of a permanently failed node never become ready;
        // close them out so the run can settle.
        let stalled = !plan.is_complete()
            && plan.ready_nodes().is_empty()
            && plan.status_counts().in_progress == 0;
        if stalled {
            let blocked: Vec<NodeId> = plan
                .nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Pending)
                .map(|n| n.id.clone())
                .collect();
            for node_id in blocked {
                tracing::info!("task {node_id} is blocked by a failed dependency, cancelling");
                let _ = plan.cancel_node(&node_id);
                self.ctx.events.emit(OrchestratorEvent::TaskCompleted {
                    run_id: self.ctx.run_id,
                    node_id,
                    success: false,
                });
            }
        }

        if !plan.is_complete() {
            return;
        }
        plan.status = if plan.is_success() {
            PlanStatus::Completed
        } else {
            PlanStatus::Failed
        };
        let summary = plan.summary();

        self.set_status(RunStatus::Monitoring, None);
        self.phase = RunPhase::Summarizing;
        self.messages.push(ChatMessage::user(format!(
            "All plan tasks have finished.\n\n{summary}\nConsolidate the task results into a \
             final answer for the user."
        )));
    }

    /// Block until an agent completes, run cancellation, or the deadline.
    async fn await_progress(&self) -> Result<(), String> {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.ctx.cancel.cancelled() => Err("run cancelled".to_string()),
                    _ = tokio::time::sleep_until(deadline) => Err("run deadline exceeded".to_string()),
                    _ = self.agents.wait_any() => Ok(()),
                }
            }
            None => {
                tokio::select! {
                    _ = self.ctx.cancel.cancelled() => Err("run cancelled".to_string()),
                    _ = self.agents.wait_any() => Ok(()),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Oracle turns
    // ------------------------------------------------------------------

    async fn oracle_turn(
        &mut self,
        system_prompt: &str,
        menu: &[ToolDefinition],
    ) -> Result<Turn, TurnError> {
        let retry = RetryConfig::default();
        let mut attempts = 0u32;
        loop {
            match self.stream_once(system_prompt, menu).await {
                Ok(turn) => return Ok(turn),
                Err(e) if e.kind == OracleErrorKind::Cancelled => {
                    return Err(TurnError::Fatal("run cancelled".to_string()));
                }
                Err(e) if is_corrupted_history_error(&e.message) => {
                    return Err(TurnError::Corrupted);
                }
                Err(e) if e.is_transient() && attempts < retry.max_retries => {
                    attempts += 1;
                    tracing::warn!("transient oracle failure (attempt {attempts}): {e}");
                    tokio::time::sleep(retry.base_delay).await;
                }
                Err(e) => {
                    return Err(TurnError::Fatal(format!("oracle stream failure: {e}")));
                }
            }
        }
    }

    async fn stream_once(
        &self,
        system_prompt: &str,
        menu: &[ToolDefinition],
    ) -> Result<Turn, OracleError> {
        let options = ChatOptions {
            system_prompt: Some(system_prompt.to_string()),
            tools: menu.to_vec(),
            temperature: Some(self.ctx.config.temperature),
            max_tokens: Some(self.ctx.config.max_response_tokens),
        };
        let mut stream = self.ctx.oracle.stream(&self.messages, options).await?;

        let mut turn = Turn::default();
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => {
                    return Err(OracleError::cancelled("run cancelled"));
                }
                event = stream.next() => match event {
                    None => break,
                    Some(Ok(StreamEvent::Token(chunk))) => {
                        self.ctx.events.emit(OrchestratorEvent::AgentToken {
                            run_id: self.ctx.run_id,
                            agent_id: None,
                            content: chunk.clone(),
                        });
                        turn.text.push_str(&chunk);
                    }
                    Some(Ok(StreamEvent::ToolCall(call))) => turn.tool_calls.push(call),
                    Some(Ok(StreamEvent::Done { usage })) => {
                        turn.usage = usage;
                        break;
                    }
                    Some(Err(e)) => return Err(e),
                }
            }
        }
        Ok(turn)
    }

    // ------------------------------------------------------------------
    // Action dispatch
    // ------------------------------------------------------------------

    /// Execute tool calls strictly in emission order, appending each result
    /// before the next call runs. `respond_to_user` short-circuits: later
    /// co-emitted calls are skipped.
    async fn dispatch_actions(&mut self, calls: &[ToolCall]) {
        for call in calls {
            let feedback = self.apply_action(call).await;
            self.messages
                .push(ChatMessage::tool_result(call.id.clone(), feedback));
            if self.responded {
                tracing::debug!("respond_to_user short-circuits remaining tool calls");
                break;
            }
        }
    }

    async fn apply_action(&mut self, call: &ToolCall) -> String {
        let action = match OrchestratorAction::parse(call) {
            Ok(action) => action,
            // Checked residual case: malformed arguments go back to the
            // oracle as the tool result.
            Err(e) => return format!("Error: {e}"),
        };

        match action {
            OrchestratorAction::CreatePlan { reasoning, tasks } => {
                self.action_create_plan(reasoning, tasks).await
            }
            OrchestratorAction::ModifyPlan {
                add_tasks,
                remove_tasks,
            } => self.action_modify_plan(add_tasks, remove_tasks).await,
            OrchestratorAction::StartAgent {
                task_id,
                additional_tools,
                instructions,
            } => self.action_start_agent(task_id, additional_tools, instructions).await,
            OrchestratorAction::MonitorAgent { target } => self.action_monitor(target).await,
            OrchestratorAction::InterveneAgent {
                target,
                intervention,
            } => self.action_intervene(target, intervention),
            OrchestratorAction::CancelAgent { target, reason } => {
                self.action_cancel_agent(target, reason)
            }
            OrchestratorAction::CompleteTask { task_id, result } => {
                self.action_complete_task(task_id, result)
            }
            OrchestratorAction::FailTask {
                task_id,
                error,
                retry,
            } => self.action_fail_task(task_id, error, retry),
            OrchestratorAction::StoreMemory { content, metadata } => {
                self.action_store_memory(content, metadata).await
            }
            OrchestratorAction::GetPlanStatus => match &self.run.plan {
                Some(plan) => plan.summary(),
                None => "No active plan.".to_string(),
            },
            OrchestratorAction::RespondToUser { message } => {
                self.response = Some(message);
                self.responded = true;
                "(response delivered to user)".to_string()
            }
            OrchestratorAction::Passthrough { tool_id, args } => {
                self.ctx
                    .tools
                    .invoke(&self.ctx.user_id, &tool_id, args)
                    .await
                    .as_feedback()
            }
        }
    }

    async fn action_create_plan(
        &mut self,
        reasoning: String,
        tasks: Vec<crate::plan::NodeSpec>,
    ) -> String {
        if self.run.plan.is_some() {
            return "Error: a plan is already active for this run; use modify_plan".to_string();
        }
        if tasks.is_empty() {
            return "Error: a plan needs at least one task".to_string();
        }

        let mut plan = Plan::new(self.ctx.run_id, reasoning);
        if let Err(e) = plan.insert_nodes(tasks) {
            return format!("Error: {e}");
        }
        plan.status = PlanStatus::Executing;

        self.ctx.events.emit(OrchestratorEvent::PlanCreated {
            run_id: self.ctx.run_id,
            plan_id: plan.id,
            node_count: plan.nodes.len(),
            shape: plan.shape(),
        });
        tracing::info!(
            run = %self.ctx.run_id,
            plan = %plan.id,
            nodes = plan.nodes.len(),
            shape = ?plan.shape(),
            "plan created"
        );

        self.run.plan = Some(plan);
        self.set_status(RunStatus::Executing, None);
        self.phase = RunPhase::Planned;

        let spawned = self.schedule_ready().await;
        self.persist().await;

        let plan = self.run.plan.as_ref().map(|p| p.summary()).unwrap_or_default();
        format!("Plan created; {spawned} ready task(s) started.\n{plan}")
    }

    async fn action_modify_plan(
        &mut self,
        add_tasks: Vec<crate::plan::NodeSpec>,
        remove_tasks: Vec<NodeId>,
    ) -> String {
        let Some(plan) = self.run.plan.as_mut() else {
            return "Error: no active plan to modify".to_string();
        };

        let mut notes = Vec::new();
        if !add_tasks.is_empty() {
            let count = add_tasks.len();
            match plan.insert_nodes(add_tasks) {
                Ok(()) => notes.push(format!("added {count} task(s)")),
                Err(e) => return format!("Error: {e}"),
            }
        }
        for node_id in &remove_tasks {
            match plan.remove_node(node_id) {
                Ok(()) => notes.push(format!("removed {node_id}")),
                Err(e) => notes.push(format!("could not remove {node_id}: {e}")),
            }
        }

        let plan_id = plan.id;
        let change = notes.join(", ");
        self.ctx.events.emit(OrchestratorEvent::PlanModified {
            run_id: self.ctx.run_id,
            plan_id,
            change: change.clone(),
        });

        self.schedule_ready().await;
        self.persist().await;
        let summary = self
            .run
            .plan
            .as_ref()
            .map(|p| p.summary())
            .unwrap_or_default();
        format!("Plan modified ({change}).\n{summary}")
    }

    async fn action_start_agent(
        &mut self,
        task_id: NodeId,
        additional_tools: Vec<String>,
        instructions: Option<String>,
    ) -> String {
        let ready = self
            .run
            .plan
            .as_ref()
            .map(|p| p.ready_nodes().contains(&task_id))
            .unwrap_or(false);
        if !ready {
            return format!(
                "Error: task {task_id} is not ready (it is unknown, already running, or has \
                 incomplete dependencies)"
            );
        }
        match self
            .spawn_for_node(&task_id, additional_tools, instructions)
            .await
        {
            Ok(agent_id) => format!("Agent {agent_id} started on task {task_id}"),
            Err(e) => format!("Error: {e}"),
        }
    }

    async fn action_monitor(&self, target: AgentRef) -> String {
        let handle = match self.resolve_agent(&target) {
            Ok(handle) => handle,
            Err(e) => return format!("Error: {e}"),
        };
        let state = handle.state().await;
        serde_json::json!({
            "agent_id": state.id.to_string(),
            "task_id": state.task_node_id,
            "agent_type": state.agent_type,
            "status": state.status,
            "messages": state.messages.len(),
            "tool_invocations": state.tool_invocations.len(),
            "reasoning_steps": state.reasoning_steps,
            "total_tokens": state.total_tokens.total_tokens,
            "total_cost": state.total_cost,
        })
        .to_string()
    }

    fn action_intervene(&mut self, target: AgentRef, intervention: Intervention) -> String {
        let decision = self.guard.can_intervene();
        if !decision.allowed {
            // Non-fatal: report the structured decision to the oracle.
            return serde_json::to_string(&decision)
                .unwrap_or_else(|_| "intervention denied".to_string());
        }

        let handle = match self.resolve_agent(&target) {
            Ok(handle) => handle,
            Err(e) => return format!("Error: {e}"),
        };
        if handle.is_finished() {
            return format!("Error: agent {} already finished", handle.id);
        }

        let kind = intervention.kind();
        match intervention {
            Intervention::Guide { message } => handle.send_guidance(message),
            Intervention::Redirect { message } => {
                handle.send_guidance(format!("Change course: {message}"));
            }
            Intervention::Cancel { reason } => {
                handle.cancel(reason.unwrap_or_else(|| "cancelled by orchestrator".to_string()));
            }
        }
        self.guard.record_intervention();
        self.run.total_interventions = self.guard.interventions();
        self.ctx.events.emit(OrchestratorEvent::AgentIntervention {
            run_id: self.ctx.run_id,
            agent_id: handle.id,
            kind: kind.to_string(),
        });
        tracing::info!(agent = %handle.id, kind, "intervention delivered");
        format!("Intervention '{kind}' delivered to agent {}", handle.id)
    }

    fn action_cancel_agent(&mut self, target: AgentRef, reason: Option<String>) -> String {
        let handle = match self.resolve_agent(&target) {
            Ok(handle) => handle,
            Err(e) => return format!("Error: {e}"),
        };
        if handle.is_finished() {
            return format!("Agent {} already finished", handle.id);
        }
        handle.cancel(reason.unwrap_or_else(|| "cancelled by orchestrator".to_string()));
        format!("Cancellation requested for agent {}", handle.id)
    }

    fn action_complete_task(&mut self, task_id: NodeId, result: serde_json::Value) -> String {
        self.cancel_assigned_agent(&task_id, "task completed by orchestrator");
        let Some(plan) = self.run.plan.as_mut() else {
            return "Error: no active plan".to_string();
        };
        match plan.complete_node(&task_id, result) {
            Ok(()) => {
                self.ctx.events.emit(OrchestratorEvent::TaskCompleted {
                    run_id: self.ctx.run_id,
                    node_id: task_id.clone(),
                    success: true,
                });
                format!("Task {task_id} marked completed")
            }
            Err(e) => format!("Error: {e}"),
        }
    }

    fn action_fail_task(&mut self, task_id: NodeId, error: String, retry: bool) -> String {
        self.cancel_assigned_agent(&task_id, "task failed by orchestrator");

        if retry {
            let decision = self.guard.can_retry_task(&task_id);
            if decision.allowed {
                let Some(plan) = self.run.plan.as_mut() else {
                    return "Error: no active plan".to_string();
                };
                let status = match plan.node(&task_id) {
                    Some(node) => node.status,
                    None => return format!("Error: unknown task {task_id}"),
                };
                if status != NodeStatus::Failed {
                    if let Err(e) = plan.fail_node(&task_id, error.clone()) {
                        return format!("Error: {e}");
                    }
                }
                if let Err(e) = plan.reset_for_retry(&task_id) {
                    return format!("Error: {e}");
                }
                self.guard.record_task_retry(&task_id);
                let attempts = self.guard.retries_for(&task_id);
                self.run.loop_counters.insert(task_id.clone(), attempts);
                return format!(
                    "Task {task_id} queued for retry (attempt {attempts} of {})",
                    self.ctx.config.max_task_retries
                );
            }

            // Guard denied: permanent failure with an explanatory message.
            let Some(plan) = self.run.plan.as_mut() else {
                return "Error: no active plan".to_string();
            };
            let _ = plan.fail_node(&task_id, format!("{error} (max retries reached)"));
            self.ctx.events.emit(OrchestratorEvent::TaskCompleted {
                run_id: self.ctx.run_id,
                node_id: task_id.clone(),
                success: false,
            });
            let reason = decision.reason.clone().unwrap_or_default();
            return format!(
                "{} Task {task_id} marked permanently failed (max retries reached).",
                serde_json::to_string(&decision).unwrap_or(reason)
            );
        }

        let Some(plan) = self.run.plan.as_mut() else {
            return "Error: no active plan".to_string();
        };
        match plan.fail_node(&task_id, error) {
            Ok(()) => {
                self.ctx.events.emit(OrchestratorEvent::TaskCompleted {
                    run_id: self.ctx.run_id,
                    node_id: task_id.clone(),
                    success: false,
                });
                format!("Task {task_id} marked failed")
            }
            Err(e) => format!("Error: {e}"),
        }
    }

    async fn action_store_memory(
        &mut self,
        content: String,
        metadata: serde_json::Value,
    ) -> String {
        let Some(memory) = &self.ctx.memory else {
            return "Memory backend unavailable; nothing stored.".to_string();
        };
        match memory.store(&self.ctx.user_id, &content, metadata).await {
            Ok(()) => "Stored.".to_string(),
            Err(e) => {
                // Best-effort side channel: log and report, never fail the run.
                tracing::warn!("memory store failed: {e}");
                format!("Memory store failed: {e}")
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn resolve_agent(&self, target: &AgentRef) -> Result<AgentHandle, String> {
        match target {
            AgentRef::Agent(raw) => {
                let id: crate::agent::AgentId = raw
                    .parse()
                    .map_err(|_| format!("invalid agent id: {raw}"))?;
                self.agents
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| format!("unknown agent: {raw}"))
            }
            AgentRef::Task(node_id) => {
                let assigned = self
                    .run
                    .plan
                    .as_ref()
                    .and_then(|p| p.node(node_id))
                    .and_then(|n| n.assigned_agent_id)
                    .ok_or_else(|| format!("task {node_id} has no assigned agent"))?;
                self.agents
                    .get(&assigned)
                    .cloned()
                    .ok_or_else(|| format!("task {node_id} agent is not tracked"))
            }
        }
    }

    fn cancel_assigned_agent(&self, task_id: &NodeId, reason: &str) {
        if let Ok(handle) = self.resolve_agent(&AgentRef::Task(task_id.clone())) {
            if !handle.is_finished() {
                handle.cancel(reason);
            }
        }
    }

    fn build_system_prompt(&self, memory_context: &Option<String>) -> String {
        let mut prompt = String::from(
            "You are the orchestrator of a personal assistant. You decide whether to answer \
             the user directly or to decompose the request into a plan of tasks executed by \
             worker agents.\n\n\
             ## Rules\n\
             1. Answer simple requests directly - never create a plan you do not need\n\
             2. For multi-step requests, call create_plan with tasks and their dependencies\n\
             3. Ready tasks start automatically; supervise them and handle failures\n\
             4. When a task fails, either retry it (fail_task with retry=true) or accept the \
             failure (retry=false)\n\
             5. Use respond_to_user to deliver the final answer\n",
        );
        if let Some(memory) = memory_context {
            prompt.push_str(&format!("\n## Relevant Memory\n{memory}\n"));
        }
        if let Some(plan) = &self.run.plan {
            prompt.push_str(&format!("\n## Current Plan\n{}\n", plan.summary()));
        }
        prompt
    }

    async fn tool_menu(&self) -> Vec<ToolDefinition> {
        let mut menu = actions::orchestrator_tool_menu();
        menu.extend(self.ctx.tools.get_tools(&self.ctx.user_id).await);
        menu
    }

    /// Query the memory port for grounding. Best-effort.
    async fn recall_memory(&self, input: &str) -> Option<String> {
        let memory = self.ctx.memory.as_ref()?;
        match memory.search(&self.ctx.user_id, input, 5).await {
            Ok(hits) if !hits.is_empty() => Some(
                hits.iter()
                    .map(|h| format!("- {}", h.content))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("memory search failed: {e}");
                None
            }
        }
    }

    fn set_status(&mut self, status: RunStatus, detail: Option<&str>) {
        if self.run.transition(status) {
            self.ctx.events.emit(OrchestratorEvent::Status {
                run_id: self.ctx.run_id,
                status,
                detail: detail.map(|d| d.to_string()),
            });
        }
    }

    fn past_deadline(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Persist run and plan records. Best-effort bookkeeping.
    async fn persist(&self) {
        if let Err(e) = self.ctx.store.save_run(&self.run).await {
            tracing::warn!("run state save failed: {e}");
        }
        if let Some(plan) = &self.run.plan {
            if let Err(e) = self.ctx.store.save_plan(plan).await {
                tracing::warn!("plan save failed: {e}");
            }
        }
    }

    fn plan_counts(&self) -> (u32, u32, bool, Option<crate::plan::PlanId>) {
        match &self.run.plan {
            Some(plan) => {
                let counts = plan.status_counts();
                (
                    counts.completed as u32,
                    counts.failed as u32,
                    plan.is_complete() && counts.failed == 0,
                    Some(plan.id),
                )
            }
            None => (0, 0, false, None),
        }
    }

    // ------------------------------------------------------------------
    // Terminal paths
    // ------------------------------------------------------------------

    async fn finish(mut self) -> RunResult {
        let (tasks_completed, tasks_failed, plan_clean, plan_id) = self.plan_counts();
        let success = self.responded || plan_clean;

        self.set_status(RunStatus::Completed, None);
        if let Some(response) = self.response.clone() {
            self.messages.push(ChatMessage::assistant(response));
        }
        if let Err(e) = self
            .ctx
            .store
            .save_history(&self.ctx.user_id, &self.messages)
            .await
        {
            tracing::warn!("history save failed: {e}");
        }
        self.persist().await;

        tracing::info!(
            run = %self.ctx.run_id,
            success,
            tasks_completed,
            tasks_failed,
            tokens = self.run.total_tokens,
            "run finished"
        );
        RunResult {
            success,
            response: self.response,
            error: None,
            total_tokens: self.run.total_tokens,
            total_cost: self.run.total_cost,
            plan_id,
            tasks_completed,
            tasks_failed,
        }
    }

    /// Fatal run error: cancel all sub-agents, emit a terminal status, and
    /// return a failed result. Never propagates past the run boundary.
    async fn fatal(mut self, message: &str) -> RunResult {
        tracing::error!(run = %self.ctx.run_id, "fatal run error: {message}");
        self.agents.cancel_all(message);

        let (tasks_completed, tasks_failed, _, plan_id) = self.plan_counts();
        self.set_status(RunStatus::Failed, Some(message));
        if let Err(e) = self
            .ctx
            .store
            .save_history(&self.ctx.user_id, &self.messages)
            .await
        {
            tracing::warn!("history save failed: {e}");
        }
        self.persist().await;

        RunResult {
            success: false,
            response: None,
            error: Some(message.to_string()),
            total_tokens: self.run.total_tokens,
            total_cost: self.run.total_cost,
            plan_id,
            tasks_completed,
            tasks_failed,
        }
    }

    /// Corrupted-history recovery: clear the persisted conversation and ask
    /// the user to retry instead of repeating the failure.
    async fn recover_corrupted_history(mut self) -> RunResult {
        tracing::warn!(
            run = %self.ctx.run_id,
            user = %self.ctx.user_id,
            "corrupted conversation history detected, clearing"
        );
        if let Err(e) = self.ctx.store.clear_history(&self.ctx.user_id).await {
            tracing::warn!("history clear failed: {e}");
        }
        self.agents.cancel_all("run aborted: corrupted history");

        let (tasks_completed, tasks_failed, _, plan_id) = self.plan_counts();
        self.set_status(
            RunStatus::Failed,
            Some("corrupted conversation history (cleared)"),
        );
        self.persist().await;

        RunResult {
            success: false,
            response: Some(USER_RETRY_MESSAGE.to_string()),
            error: Some("corrupted conversation history (cleared)".to_string()),
            total_tokens: self.run.total_tokens,
            total_cost: self.run.total_cost,
            plan_id,
            tasks_completed,
            tasks_failed,
        }
    }
}

/// Short excerpt for task-update messages.
fn excerpt(text: &str) -> String {
    if text.chars().count() <= UPDATE_EXCERPT_LIMIT {
        text.to_string()
    } else {
        let cut: String = text.chars().take(UPDATE_EXCERPT_LIMIT).collect();
        format!("{cut}...")
    }
}
