//! Token-count estimation for budgeting.
//!
//! A character heuristic (~4 chars per token) is enough here: the budget
//! only needs to decide *when* to fold history, and the oracle's own usage
//! reports are what drive cost accounting.

use crate::oracle::{ChatMessage, ToolDefinition};

/// Fixed per-message overhead (role markers, framing).
const MESSAGE_OVERHEAD: u64 = 4;

/// Estimate tokens for a plain text span.
pub fn estimate_text(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Estimate tokens for one message, including tool-call payloads.
pub fn estimate_message(message: &ChatMessage) -> u64 {
    let mut tokens = MESSAGE_OVERHEAD;
    if let Some(content) = &message.content {
        tokens += estimate_text(content);
    }
    if let Some(calls) = &message.tool_calls {
        for call in calls {
            tokens += estimate_text(&call.function.name);
            tokens += estimate_text(&call.function.arguments);
        }
    }
    tokens
}

/// Estimate tokens for the tool menu (serialized schemas).
pub fn estimate_tools(tools: &[ToolDefinition]) -> u64 {
    tools
        .iter()
        .map(|t| {
            estimate_text(&t.function.name)
                + estimate_text(&t.function.description)
                + estimate_text(&t.function.parameters.to_string())
        })
        .sum()
}

/// Estimate the full window: system prompt + messages + tool menu.
pub fn estimate_window(
    system_prompt: &str,
    tools: &[ToolDefinition],
    messages: &[ChatMessage],
) -> u64 {
    estimate_text(system_prompt)
        + estimate_tools(tools)
        + messages.iter().map(estimate_message).sum::<u64>()
}
