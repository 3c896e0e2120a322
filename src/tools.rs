//! Tool-invocation port.
//!
//! Tool execution itself is an external collaborator; the orchestrator only
//! depends on the generic invoke contract. A [`StaticToolbox`] is provided
//! for wiring and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::oracle::ToolDefinition;

/// Result of one tool invocation.
///
/// # Invariants
/// - `success == true` implies `output` is set
/// - `success == false` implies `error` is set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    /// Successful invocation with an output payload.
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    /// Failed invocation with an error message.
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// Render for feeding back into a conversation as a tool result.
    pub fn as_feedback(&self) -> String {
        if self.success {
            self.output
                .as_ref()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("unknown tool error")
            )
        }
    }
}

/// Trait for tool-invocation providers.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke a tool on behalf of a user.
    ///
    /// Failures are data (`success == false`), never panics or transport
    /// errors surfaced to the caller.
    async fn invoke(&self, user_id: &str, tool_id: &str, args: serde_json::Value) -> ToolOutcome;

    /// Tool definitions available to this user.
    async fn get_tools(&self, user_id: &str) -> Vec<ToolDefinition>;
}

type ToolHandler = Arc<dyn Fn(serde_json::Value) -> ToolOutcome + Send + Sync>;

/// In-memory toolbox with closure-backed handlers.
#[derive(Clone, Default)]
pub struct StaticToolbox {
    definitions: Vec<ToolDefinition>,
    handlers: HashMap<String, ToolHandler>,
}

impl StaticToolbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with its schema and handler.
    pub fn register<F>(
        mut self,
        name: &str,
        description: &str,
        parameters: serde_json::Value,
        handler: F,
    ) -> Self
    where
        F: Fn(serde_json::Value) -> ToolOutcome + Send + Sync + 'static,
    {
        self.definitions
            .push(ToolDefinition::function(name, description, parameters));
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }
}

#[async_trait]
impl ToolInvoker for StaticToolbox {
    async fn invoke(&self, _user_id: &str, tool_id: &str, args: serde_json::Value) -> ToolOutcome {
        match self.handlers.get(tool_id) {
            Some(handler) => handler(args),
            None => ToolOutcome::err(format!("unknown tool: {tool_id}")),
        }
    }

    async fn get_tools(&self, _user_id: &str) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn toolbox_dispatches_by_name() {
        let toolbox = StaticToolbox::new().register(
            "echo",
            "Echo the input",
            serde_json::json!({"type": "object"}),
            |args| ToolOutcome::ok(args),
        );

        let out = toolbox
            .invoke("u1", "echo", serde_json::json!({"x": 1}))
            .await;
        assert!(out.success);
        assert_eq!(out.output.unwrap()["x"], 1);

        let missing = toolbox.invoke("u1", "nope", serde_json::json!({})).await;
        assert!(!missing.success);
        assert!(missing.as_feedback().contains("unknown tool"));
    }
}
