//! Deterministic scripted oracle for tests and offline wiring.
//!
//! Entries are consumed in FIFO order among those whose routing filter
//! matches the caller's system prompt, so one script can serve the
//! coordinator and several concurrent sub-agents deterministically.
//! Running past the end of the script is a `ClientError`, so a consumer
//! that loops more than it scripted fails loudly instead of hanging.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;

use super::{
    ChatMessage, ChatOptions, Oracle, OracleError, OracleStream, StreamEvent, TokenUsage, ToolCall,
};

/// One pre-scripted oracle turn.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    /// Plain-text output, streamed in word-sized chunks.
    pub text: Option<String>,
    /// Tool calls emitted after the text.
    pub tool_calls: Vec<ToolCall>,
    /// Usage reported in the `Done` event.
    pub usage: TokenUsage,
}

impl ScriptedTurn {
    /// A text-only turn.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
            usage: TokenUsage::new(50, 20),
        }
    }

    /// A tool-call turn with no text.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            tool_calls: calls,
            usage: TokenUsage::new(50, 30),
        }
    }

    /// A single tool call built from a name and JSON arguments.
    pub fn tool_call(id: &str, name: &str, args: serde_json::Value) -> Self {
        Self::tool_calls(vec![ToolCall::function(id, name, args.to_string())])
    }

    /// An empty turn: no text, no calls. A sub-agent consuming this fails
    /// with "produced no output", which is the scripted way to make a task
    /// fail.
    pub fn empty() -> Self {
        Self {
            text: None,
            tool_calls: Vec::new(),
            usage: TokenUsage::new(50, 0),
        }
    }

    /// Override reported usage.
    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = TokenUsage::new(prompt_tokens, completion_tokens);
        self
    }
}

#[derive(Debug, Clone)]
enum EntryKind {
    Turn(ScriptedTurn),
    Error(OracleError),
}

#[derive(Debug, Clone)]
struct ScriptedEntry {
    /// Substring the caller's system prompt must contain. `None` matches
    /// any caller.
    when: Option<String>,
    kind: EntryKind,
}

impl ScriptedEntry {
    fn matches(&self, system_prompt: &str) -> bool {
        self.when
            .as_deref()
            .map(|needle| system_prompt.contains(needle))
            .unwrap_or(true)
    }
}

/// Scripted [`Oracle`] implementation.
///
/// # Thread Safety
/// Script queues use interior mutability so a single instance can be shared
/// as `Arc<ScriptedOracle>` between a test body, the control loop, and
/// every spawned sub-agent.
pub struct ScriptedOracle {
    model: String,
    entries: Mutex<VecDeque<ScriptedEntry>>,
    summaries: Mutex<VecDeque<String>>,
    /// USD per million prompt tokens.
    prompt_rate: f64,
    /// USD per million completion tokens.
    completion_rate: f64,
}

impl ScriptedOracle {
    /// Create an empty script.
    pub fn new() -> Self {
        Self {
            model: "scripted-oracle-1".to_string(),
            entries: Mutex::new(VecDeque::new()),
            summaries: Mutex::new(VecDeque::new()),
            prompt_rate: 1.0,
            completion_rate: 4.0,
        }
    }

    /// Append a turn served to any caller.
    pub fn push_turn(&self, turn: ScriptedTurn) -> &Self {
        self.push_entry(None, EntryKind::Turn(turn))
    }

    /// Append a turn served only to callers whose system prompt contains
    /// `when`.
    pub fn push_turn_for(&self, when: &str, turn: ScriptedTurn) -> &Self {
        self.push_entry(Some(when.to_string()), EntryKind::Turn(turn))
    }

    /// Append a stream failure served to any caller.
    pub fn push_error(&self, error: OracleError) -> &Self {
        self.push_entry(None, EntryKind::Error(error))
    }

    /// Append a `generate` reply to the script.
    pub fn push_summary(&self, text: impl Into<String>) -> &Self {
        self.summaries.lock().unwrap().push_back(text.into());
        self
    }

    /// Number of scripted stream entries not yet consumed.
    pub fn remaining_turns(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn push_entry(&self, when: Option<String>, kind: EntryKind) -> &Self {
        self.entries
            .lock()
            .unwrap()
            .push_back(ScriptedEntry { when, kind });
        self
    }

    fn pop_matching(&self, system_prompt: &str) -> Option<ScriptedEntry> {
        let mut entries = self.entries.lock().unwrap();
        let index = entries.iter().position(|e| e.matches(system_prompt))?;
        entries.remove(index)
    }
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn stream(
        &self,
        _messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<OracleStream, OracleError> {
        let system_prompt = options.system_prompt.unwrap_or_default();
        let entry = self
            .pop_matching(&system_prompt)
            .ok_or_else(|| OracleError::client_error("scripted oracle: script exhausted"))?;

        let turn = match entry.kind {
            EntryKind::Turn(turn) => turn,
            EntryKind::Error(error) => return Err(error),
        };

        let s = stream! {
            if let Some(text) = &turn.text {
                for chunk in split_chunks(text) {
                    yield Ok(StreamEvent::Token(chunk));
                }
            }
            for call in turn.tool_calls.clone() {
                yield Ok(StreamEvent::ToolCall(call));
            }
            yield Ok(StreamEvent::Done { usage: Some(turn.usage) });
        };
        Ok(s.boxed())
    }

    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _options: ChatOptions,
    ) -> Result<String, OracleError> {
        Ok(self
            .summaries
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "Condensed summary of earlier turns.".to_string()))
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn calculate_cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 * self.prompt_rate + completion_tokens as f64 * self.completion_rate)
            / 1_000_000.0
    }
}

/// Split text into word-boundary chunks, preserving whitespace.
fn split_chunks(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleErrorKind;

    async fn collect(
        oracle: &ScriptedOracle,
        system_prompt: &str,
    ) -> (String, Vec<ToolCall>, Option<TokenUsage>) {
        let options = ChatOptions {
            system_prompt: Some(system_prompt.to_string()),
            ..Default::default()
        };
        let mut stream = oracle.stream(&[], options).await.unwrap();
        let mut text = String::new();
        let mut calls = Vec::new();
        let mut usage = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                StreamEvent::Token(chunk) => text.push_str(&chunk),
                StreamEvent::ToolCall(call) => calls.push(call),
                StreamEvent::Done { usage: u } => usage = u,
            }
        }
        (text, calls, usage)
    }

    #[tokio::test]
    async fn replays_text_then_tools_then_done() {
        let oracle = ScriptedOracle::new();
        oracle.push_turn(
            ScriptedTurn::tool_call("c1", "get_plan_status", serde_json::json!({}))
                .with_usage(10, 5),
        );

        let (_, calls, usage) = collect(&oracle, "any").await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "get_plan_status");
        assert_eq!(usage.unwrap().total_tokens, 15);
    }

    #[tokio::test]
    async fn routing_serves_matching_callers_in_order() {
        let oracle = ScriptedOracle::new();
        oracle.push_turn_for("coordinator", ScriptedTurn::text("for the boss"));
        oracle.push_turn_for("worker", ScriptedTurn::text("for the worker"));

        // The worker pops its own entry even though it is queued second.
        let (text, _, _) = collect(&oracle, "you are a worker agent").await;
        assert_eq!(text, "for the worker");
        let (text, _, _) = collect(&oracle, "you are the coordinator").await;
        assert_eq!(text, "for the boss");
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let oracle = ScriptedOracle::new();
        let err = oracle
            .stream(&[], ChatOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, OracleErrorKind::ClientError);
    }

    #[tokio::test]
    async fn scripted_error_is_returned() {
        let oracle = ScriptedOracle::new();
        oracle.push_error(OracleError::server_error(503, "unavailable"));
        let err = oracle
            .stream(&[], ChatOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, OracleErrorKind::ServerError);
    }

    #[tokio::test]
    async fn text_chunks_reassemble() {
        let oracle = ScriptedOracle::new();
        oracle.push_turn(ScriptedTurn::text("hello orchestrated world"));
        let (text, _, _) = collect(&oracle, "").await;
        assert_eq!(text, "hello orchestrated world");
    }
}
