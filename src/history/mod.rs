//! Context & history manager.
//!
//! Two responsibilities:
//! - **Budgeting**: estimate the token cost of system prompt + message
//!   window + tool menu, and fold the oldest turns into a digest when the
//!   budget is exceeded
//! - **Structural integrity**: guarantee that a window handed to the oracle
//!   never opens on an orphaned tool-result message and never leaves an
//!   assistant message's tool calls partially unanswered at a trim boundary
//!
//! Both structural passes are idempotent: re-running them on an
//! already-valid sequence is a no-op.

pub mod tokens;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::OrchestratorConfig;
use crate::oracle::{ChatMessage, ChatOptions, Oracle, Role, ToolDefinition};

const SUMMARY_INSTRUCTIONS: &str = "You condense assistant conversation history. \
Produce a compact summary that preserves: durable facts about the user, \
outcomes of completed tasks, open threads that still need follow-up, and key \
decisions already made. Omit pleasantries and dead ends. Reply with the \
summary only.";

/// Window budgeting and structural validation policy.
#[derive(Debug, Clone)]
pub struct ContextManager {
    /// Token budget for the full window. `0` disables budgeting.
    budget: u64,
    /// Most-recent messages never folded into a digest.
    keep_recent: usize,
}

impl ContextManager {
    pub fn new(budget: u64, keep_recent: usize) -> Self {
        Self { budget, keep_recent }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.context_token_budget, config.keep_recent_messages)
    }

    /// Whether the window exceeds the configured budget.
    pub fn over_budget(
        &self,
        system_prompt: &str,
        tools: &[ToolDefinition],
        messages: &[ChatMessage],
    ) -> bool {
        self.budget > 0 && tokens::estimate_window(system_prompt, tools, messages) > self.budget
    }

    /// Fold turns older than the keep-recent tail into a digest via a
    /// one-shot oracle call, splicing the digest in as a single leading
    /// message.
    ///
    /// A failed summarization falls back to dropping the folded turns
    /// outright - the window must shrink either way.
    pub async fn fold_into_digest(
        &self,
        oracle: &Arc<dyn Oracle>,
        messages: &[ChatMessage],
    ) -> Vec<ChatMessage> {
        if messages.len() <= self.keep_recent {
            return Self::sanitize(messages.to_vec());
        }
        let split = messages.len() - self.keep_recent;
        let (head, tail) = messages.split_at(split);

        let prompt = vec![
            ChatMessage::system(SUMMARY_INSTRUCTIONS),
            ChatMessage::user(render_transcript(head)),
        ];
        match oracle.generate(&prompt, ChatOptions::default()).await {
            Ok(digest) => {
                let mut out = vec![ChatMessage::system(format!(
                    "Summary of the earlier conversation:\n{digest}"
                ))];
                out.extend(Self::sanitize(tail.to_vec()));
                out
            }
            Err(e) => {
                tracing::warn!("history summarization failed, dropping folded turns: {e}");
                Self::sanitize(tail.to_vec())
            }
        }
    }

    /// Trim from the most recent message backward until the budget would be
    /// exceeded, then repair the cut edge.
    ///
    /// The newest message is always kept, even if it alone exceeds the
    /// budget.
    pub fn trim_to_budget(
        &self,
        system_prompt: &str,
        tools: &[ToolDefinition],
        messages: Vec<ChatMessage>,
    ) -> Vec<ChatMessage> {
        if self.budget == 0 || messages.is_empty() {
            return Self::sanitize(messages);
        }

        let overhead = tokens::estimate_text(system_prompt) + tokens::estimate_tools(tools);
        let mut total = overhead;
        let mut keep_from = messages.len();
        for (i, message) in messages.iter().enumerate().rev() {
            let cost = tokens::estimate_message(message);
            if total + cost > self.budget && keep_from < messages.len() {
                break;
            }
            total += cost;
            keep_from = i;
        }

        Self::sanitize(messages[keep_from..].to_vec())
    }

    /// Drop leading orphaned tool results, then run the forward validation
    /// pass.
    pub fn sanitize(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        validate_structure(drop_leading_orphans(messages))
    }
}

/// Drop tool-result messages at the head of the window; their originating
/// assistant message was trimmed away.
pub fn drop_leading_orphans(mut messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let leading = messages
        .iter()
        .take_while(|m| m.role == Role::Tool)
        .count();
    if leading > 0 {
        messages.drain(..leading);
    }
    messages
}

/// Forward validation pass.
///
/// Drops (i) any assistant message whose tool-call set is interrupted by an
/// intervening message before all results arrive (including a dangling set
/// at the end of the window), together with its partial results, and
/// (ii) any tool-result message whose call id has no pending match.
pub fn validate_structure(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    struct PendingCalls {
        assistant_index: usize,
        remaining: HashSet<String>,
        result_indices: Vec<usize>,
    }

    fn discard_incomplete(out: &mut Vec<ChatMessage>, pending: &mut Option<PendingCalls>) {
        if let Some(p) = pending.take() {
            // `pending` is only held while calls are unanswered, so this is
            // always an interrupted set: remove its partial results and the
            // assistant message itself, highest index first.
            let mut doomed = p.result_indices;
            doomed.push(p.assistant_index);
            doomed.sort_unstable_by(|a, b| b.cmp(a));
            for index in doomed {
                out.remove(index);
            }
        }
    }

    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut pending: Option<PendingCalls> = None;

    for message in messages {
        match message.role {
            Role::Tool => {
                let matched = match (&message.tool_call_id, pending.as_mut()) {
                    (Some(id), Some(p)) => p.remaining.remove(id),
                    _ => false,
                };
                if matched {
                    out.push(message);
                    if let Some(p) = pending.as_mut() {
                        p.result_indices.push(out.len() - 1);
                        if p.remaining.is_empty() {
                            pending = None;
                        }
                    }
                } else {
                    tracing::debug!("dropping unmatched tool result");
                }
            }
            Role::Assistant => {
                discard_incomplete(&mut out, &mut pending);
                let has_calls = message
                    .tool_calls
                    .as_ref()
                    .map(|c| !c.is_empty())
                    .unwrap_or(false);
                if has_calls {
                    let remaining: HashSet<String> = message
                        .tool_calls
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .map(|c| c.id.clone())
                        .collect();
                    out.push(message);
                    pending = Some(PendingCalls {
                        assistant_index: out.len() - 1,
                        remaining,
                        result_indices: Vec::new(),
                    });
                } else {
                    out.push(message);
                }
            }
            Role::User | Role::System => {
                discard_incomplete(&mut out, &mut pending);
                out.push(message);
            }
        }
    }
    discard_incomplete(&mut out, &mut pending);
    out
}

/// Known provider signature for a tool-result message with no preceding
/// matching call reaching the oracle.
pub fn is_corrupted_history_error(message: &str) -> bool {
    static SIGNATURE: OnceLock<Regex> = OnceLock::new();
    let re = SIGNATURE.get_or_init(|| {
        Regex::new(
            r"(?i)(tool_call_id|tool call|role '?tool'?).{0,120}(no (preceding|matching)|not found|must be a response|without a (preceding|corresponding)|missing)",
        )
        .unwrap_or_else(|e| panic!("invalid corrupted-history signature: {e}"))
    });
    re.is_match(message)
}

/// Render folded turns as a plain transcript for the summarizer.
fn render_transcript(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        let role = match message.role {
            Role::System => "SYSTEM",
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::Tool => "TOOL",
        };
        if let Some(content) = &message.content {
            out.push_str(&format!("{role}: {content}\n"));
        }
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                out.push_str(&format!(
                    "{role} -> {}({})\n",
                    call.function.name, call.function.arguments
                ));
            }
        }
    }
    out
}
