//! The sub-agent decision sub-loop.
//!
//! Each worker runs as an independent tokio task scoped strictly to its own
//! message history and tool whitelist. Safe points - where guidance and
//! cancellation are observed - are the boundaries between oracle turns and
//! individual stream events; an in-flight tool call is never preempted.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use super::handle::CompletionCell;
use super::{AgentId, AgentOutcome, AgentStatus, SubAgentSpec, SubAgentState, ToolInvocationRecord};
use crate::context::RunContext;
use crate::events::OrchestratorEvent;
use crate::oracle::{ChatMessage, ChatOptions, StreamEvent, ToolDefinition};

const TOOL_SUMMARY_LIMIT: usize = 400;

/// Truncate on a character boundary (tool output may be multi-byte text).
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub(super) struct Worker {
    pub ctx: RunContext,
    pub agent_id: AgentId,
    pub spec: SubAgentSpec,
    pub state: Arc<RwLock<SubAgentState>>,
    pub guidance: mpsc::UnboundedReceiver<String>,
    pub cancel: CancellationToken,
    pub cancel_reason: Arc<Mutex<Option<String>>>,
    pub completion: CompletionCell,
}

impl Worker {
    pub(super) async fn run(mut self) {
        {
            let mut state = self.state.write().await;
            state.status = AgentStatus::Running;
        }

        let menu = self.tool_menu().await;
        let system_prompt = self.build_system_prompt();
        let mut messages = vec![ChatMessage::user(self.spec.task_description.clone())];

        let outcome = self
            .decision_loop(&system_prompt, &menu, &mut messages)
            .await;
        self.finish(messages, outcome).await;
    }

    /// Tools offered to this agent: the whitelist when one was given,
    /// otherwise everything the user has.
    async fn tool_menu(&self) -> Vec<ToolDefinition> {
        let all = self.ctx.tools.get_tools(&self.ctx.user_id).await;
        if self.spec.additional_tools.is_empty() {
            return all;
        }
        all.into_iter()
            .filter(|t| {
                self.spec
                    .additional_tools
                    .iter()
                    .any(|name| name == &t.function.name)
            })
            .collect()
    }

    fn build_system_prompt(&self) -> String {
        let mut prompt = format!(
            "You are {persona}, working on one task as part of a larger plan.\n\n\
             ## Task\n{task}\n",
            persona = self.spec.agent_type.persona(),
            task = self.spec.task_description,
        );
        if !self.spec.upstream_context.is_empty() {
            prompt.push_str(&format!(
                "\n## Results From Earlier Tasks\n{}\n",
                self.spec.upstream_context
            ));
        }
        if let Some(instructions) = &self.spec.operator_instructions {
            prompt.push_str(&format!("\n## Operator Instructions\n{instructions}\n"));
        }
        prompt.push_str(
            "\n## Rules\n\
             1. Use tools to make real progress - do not just describe intentions\n\
             2. Messages tagged [operator guidance] override your current direction\n\
             3. When the task is done, reply with a clear summary of the result\n\
             4. If the task cannot be completed, say so and explain what is blocking you\n",
        );
        prompt
    }

    async fn decision_loop(
        &mut self,
        system_prompt: &str,
        menu: &[ToolDefinition],
        messages: &mut Vec<ChatMessage>,
    ) -> AgentOutcome {
        for iteration in 0..self.ctx.config.max_agent_iterations {
            if self.cancel.is_cancelled() {
                return AgentOutcome::Cancelled {
                    reason: self.cancel_reason(),
                };
            }
            let had_guidance = self.drain_guidance(messages).await;

            tracing::debug!(agent = %self.agent_id, iteration, "sub-agent turn");
            let options = ChatOptions {
                system_prompt: Some(system_prompt.to_string()),
                tools: menu.to_vec(),
                temperature: Some(self.ctx.config.temperature),
                max_tokens: Some(self.ctx.config.max_response_tokens),
            };

            let stream = match self.ctx.oracle.stream(messages, options).await {
                Ok(stream) => stream,
                Err(e) => {
                    return AgentOutcome::Failed {
                        error: format!("oracle error: {e}"),
                    }
                }
            };

            let (text, tool_calls) = match self.collect_turn(stream).await {
                Ok(turn) => turn,
                Err(outcome) => return outcome,
            };
            if had_guidance {
                // The turn that just completed has seen the guidance.
                self.state.write().await.pending_guidance = None;
            }

            if tool_calls.is_empty() {
                if text.trim().is_empty() {
                    return AgentOutcome::Failed {
                        error: "agent produced no output".to_string(),
                    };
                }
                messages.push(ChatMessage::assistant(text.clone()));
                return AgentOutcome::Completed { output: text };
            }

            // Narration alongside tool calls is reasoning, not a result.
            if !text.trim().is_empty() {
                let mut state = self.state.write().await;
                state.reasoning_steps.push(text.trim().to_string());
            }
            messages.push(ChatMessage::assistant_with_tools(
                (!text.is_empty()).then(|| text.clone()),
                tool_calls.clone(),
            ));

            for call in &tool_calls {
                let result = self.execute_tool_call(call).await;
                messages.push(ChatMessage::tool_result(call.id.clone(), result));
            }
            self.sync_messages(messages).await;
        }

        AgentOutcome::Failed {
            error: format!(
                "agent reached its iteration limit ({})",
                self.ctx.config.max_agent_iterations
            ),
        }
    }

    /// Drain the guidance mailbox into the conversation. Returns whether
    /// any guidance arrived; `pending_guidance` stays set until the next
    /// turn has consumed it.
    async fn drain_guidance(&mut self, messages: &mut Vec<ChatMessage>) -> bool {
        let mut last = None;
        while let Ok(text) = self.guidance.try_recv() {
            tracing::info!(agent = %self.agent_id, "guidance received");
            messages.push(ChatMessage::user(format!("[operator guidance] {text}")));
            last = Some(text);
        }
        match last {
            Some(text) => {
                self.state.write().await.pending_guidance = Some(text);
                true
            }
            None => false,
        }
    }

    /// Collect one streamed turn, observing cancellation between events.
    async fn collect_turn(
        &self,
        mut stream: crate::oracle::OracleStream,
    ) -> Result<(String, Vec<crate::oracle::ToolCall>), AgentOutcome> {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(AgentOutcome::Cancelled {
                        reason: self.cancel_reason(),
                    });
                }
                event = stream.next() => match event {
                    None => break,
                    Some(Ok(StreamEvent::Token(chunk))) => {
                        self.ctx.events.emit(OrchestratorEvent::AgentToken {
                            run_id: self.ctx.run_id,
                            agent_id: Some(self.agent_id),
                            content: chunk.clone(),
                        });
                        text.push_str(&chunk);
                    }
                    Some(Ok(StreamEvent::ToolCall(call))) => tool_calls.push(call),
                    Some(Ok(StreamEvent::Done { usage })) => {
                        if let Some(usage) = usage {
                            let cost = self
                                .ctx
                                .oracle
                                .calculate_cost(usage.prompt_tokens, usage.completion_tokens);
                            let mut state = self.state.write().await;
                            state.total_tokens = state.total_tokens.add(&usage);
                            state.total_cost += cost;
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        return Err(AgentOutcome::Failed {
                            error: format!("oracle stream error: {e}"),
                        });
                    }
                }
            }
        }
        Ok((text, tool_calls))
    }

    /// Execute one tool call against the shared port, recording it.
    async fn execute_tool_call(&self, call: &crate::oracle::ToolCall) -> String {
        let args: serde_json::Value =
            serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::Value::Null);

        let outcome = self
            .ctx
            .tools
            .invoke(&self.ctx.user_id, &call.function.name, args.clone())
            .await;
        let feedback = outcome.as_feedback();

        let summary = truncate_chars(&feedback, TOOL_SUMMARY_LIMIT);

        let mut state = self.state.write().await;
        state.tool_invocations.push(ToolInvocationRecord {
            tool_id: call.function.name.clone(),
            arguments: args,
            success: outcome.success,
            summary,
            at: chrono::Utc::now(),
        });
        feedback
    }

    async fn sync_messages(&self, messages: &[ChatMessage]) {
        let mut state = self.state.write().await;
        state.messages = messages.to_vec();
    }

    fn cancel_reason(&self) -> String {
        self.cancel_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "cancelled".to_string())
    }

    async fn finish(self, messages: Vec<ChatMessage>, outcome: AgentOutcome) {
        {
            let mut state = self.state.write().await;
            state.messages = messages;
            state.status = outcome.status();
        }

        // Best-effort bookkeeping; never fails the agent.
        let snapshot = self.state.read().await.clone();
        if let Err(e) = self.ctx.store.save_agent(&snapshot).await {
            tracing::warn!(agent = %self.agent_id, "agent state save failed: {e}");
        }

        match &outcome {
            AgentOutcome::Failed { error } => {
                self.ctx.events.emit(OrchestratorEvent::AgentError {
                    run_id: self.ctx.run_id,
                    agent_id: Some(self.agent_id),
                    message: error.clone(),
                });
            }
            AgentOutcome::Completed { .. } | AgentOutcome::Cancelled { .. } => {}
        }
        self.ctx.events.emit(OrchestratorEvent::AgentFinal {
            run_id: self.ctx.run_id,
            agent_id: self.agent_id,
            success: outcome.is_success(),
            output: outcome.describe().to_string(),
        });

        self.completion.resolve(outcome);
    }
}
