//! Planning-oracle port - the decision model behind the control loop.
//!
//! This module provides a trait-based abstraction over the planning model.
//! The orchestrator only depends on two call shapes:
//! - `stream`: a token-by-token turn that may emit tool calls
//! - `generate`: a one-shot text completion (summaries, digests)
//!
//! Concrete network clients live outside this crate; a deterministic
//! [`ScriptedOracle`] is provided for tests and offline wiring.

mod error;
mod scripted;

pub use error::{OracleError, OracleErrorKind, RetryConfig};
pub use scripted::{ScriptedOracle, ScriptedTurn};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    /// Create a function-type tool call.
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// The function name and JSON-encoded arguments of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments string, as emitted by the model.
    pub arguments: String,
}

/// A message in a chat conversation.
///
/// # Structural Invariants (enforced by the history manager, not here)
/// - A `Tool` message carries `tool_call_id` matching a preceding assistant
///   tool call
/// - An assistant message with `tool_calls` is answered by one tool message
///   per call before any other role appears
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a simple text message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message carrying tool calls.
    pub fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Create a tool-result message answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Get the text content of this message, if any.
    pub fn text_content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Tool-call ids carried by this message (empty unless assistant).
    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.tool_calls
            .as_deref()
            .map(|calls| calls.iter().map(|c| c.id.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Schema of a tool offered to the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    /// Create a function-type tool definition.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function schema inside a tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Token usage reported for one oracle call.
///
/// # Invariants
/// - `total_tokens == prompt_tokens + completion_tokens` (enforced in constructor)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Component-wise sum with another usage object.
    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage::new(
            self.prompt_tokens.saturating_add(other.prompt_tokens),
            self.completion_tokens
                .saturating_add(other.completion_tokens),
        )
    }
}

/// Optional parameters for oracle calls.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// System prompt prepended to the message window.
    pub system_prompt: Option<String>,
    /// Tool menu offered for this turn.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature (0 = deterministic).
    pub temperature: Option<f64>,
    /// Maximum completion tokens to generate.
    pub max_tokens: Option<u64>,
}

/// One event in a streamed oracle turn.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A chunk of plain-text output.
    Token(String),
    /// A fully assembled tool call.
    ToolCall(ToolCall),
    /// End of the turn, with usage when the provider reports it.
    Done { usage: Option<TokenUsage> },
}

/// A streamed oracle turn.
pub type OracleStream = BoxStream<'static, Result<StreamEvent, OracleError>>;

/// Trait for planning-oracle clients.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Stream one decision turn.
    ///
    /// The stream yields zero or more `Token`/`ToolCall` events followed by
    /// exactly one `Done`, or terminates with an error.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<OracleStream, OracleError>;

    /// One-shot text completion (summarization, digest extraction).
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<String, OracleError>;

    /// Identifier of the underlying model.
    fn model(&self) -> &str;

    /// Compute cost in USD for the given token counts.
    fn calculate_cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_totals_are_consistent() {
        let a = TokenUsage::new(100, 20);
        assert_eq!(a.total_tokens, 120);
        let b = a.add(&TokenUsage::new(5, 7));
        assert_eq!(b.prompt_tokens, 105);
        assert_eq!(b.completion_tokens, 27);
        assert_eq!(b.total_tokens, 132);
    }

    #[test]
    fn message_roundtrips_through_json() {
        let msg = ChatMessage::assistant_with_tools(
            Some("thinking".to_string()),
            vec![ToolCall::function("call_1", "start_agent", "{\"task_id\":\"a\"}")],
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_call_ids(), vec!["call_1"]);
        assert_eq!(back.text_content(), Some("thinking"));
    }
}
