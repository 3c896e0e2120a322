//! Orchestrator actions - the closed set of tool calls the oracle can make,
//! plus one open pass-through case for generic tool execution.
//!
//! Dispatch is by exhaustive matching on a tagged union, so an unrecognized
//! *argument shape* is a checked residual case fed back to the oracle,
//! never a silent no-op. An unrecognized *tool name* is by design the
//! pass-through case.

use serde::Deserialize;
use thiserror::Error;

use crate::oracle::{ToolCall, ToolDefinition};
use crate::plan::{NodeId, NodeSpec};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("invalid arguments for {tool}: {message}")]
    BadArguments { tool: String, message: String },
}

/// How to steer a running agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intervention {
    /// Add guidance without changing the goal.
    Guide { message: String },
    /// Point the agent at a different approach or goal.
    Redirect { message: String },
    /// Stop the agent cooperatively.
    Cancel { reason: Option<String> },
}

impl Intervention {
    /// Short tag for events.
    pub fn kind(&self) -> &'static str {
        match self {
            Intervention::Guide { .. } => "guide",
            Intervention::Redirect { .. } => "redirect",
            Intervention::Cancel { .. } => "cancel",
        }
    }
}

/// Target of an agent-directed action: the agent id, or the task it is
/// assigned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRef {
    Agent(String),
    Task(NodeId),
}

/// One dispatched orchestrator action.
#[derive(Debug, Clone)]
pub enum OrchestratorAction {
    CreatePlan {
        reasoning: String,
        tasks: Vec<NodeSpec>,
    },
    ModifyPlan {
        add_tasks: Vec<NodeSpec>,
        remove_tasks: Vec<NodeId>,
    },
    StartAgent {
        task_id: NodeId,
        additional_tools: Vec<String>,
        instructions: Option<String>,
    },
    MonitorAgent {
        target: AgentRef,
    },
    InterveneAgent {
        target: AgentRef,
        intervention: Intervention,
    },
    CancelAgent {
        target: AgentRef,
        reason: Option<String>,
    },
    CompleteTask {
        task_id: NodeId,
        result: serde_json::Value,
    },
    FailTask {
        task_id: NodeId,
        error: String,
        retry: bool,
    },
    StoreMemory {
        content: String,
        metadata: serde_json::Value,
    },
    GetPlanStatus,
    RespondToUser {
        message: String,
    },
    /// Any other tool name: pass through to the generic tool port.
    Passthrough {
        tool_id: String,
        args: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct CreatePlanArgs {
    #[serde(default)]
    reasoning: String,
    tasks: Vec<NodeSpec>,
}

#[derive(Debug, Deserialize)]
struct ModifyPlanArgs {
    #[serde(default)]
    add_tasks: Vec<NodeSpec>,
    #[serde(default)]
    remove_tasks: Vec<NodeId>,
}

#[derive(Debug, Deserialize)]
struct StartAgentArgs {
    task_id: NodeId,
    #[serde(default)]
    additional_tools: Vec<String>,
    #[serde(default)]
    instructions: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentRefArgs {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    task_id: Option<NodeId>,
}

impl AgentRefArgs {
    fn into_ref(self, tool: &str) -> Result<AgentRef, ActionError> {
        match (self.agent_id, self.task_id) {
            (Some(agent), _) => Ok(AgentRef::Agent(agent)),
            (None, Some(task)) => Ok(AgentRef::Task(task)),
            (None, None) => Err(ActionError::BadArguments {
                tool: tool.to_string(),
                message: "either agent_id or task_id is required".to_string(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InterveneArgs {
    #[serde(flatten)]
    target: AgentRefArgs,
    action: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CancelAgentArgs {
    #[serde(flatten)]
    target: AgentRefArgs,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompleteTaskArgs {
    task_id: NodeId,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct FailTaskArgs {
    task_id: NodeId,
    #[serde(default = "default_task_error")]
    error: String,
    #[serde(default)]
    retry: bool,
}

fn default_task_error() -> String {
    "task failed".to_string()
}

#[derive(Debug, Deserialize)]
struct StoreMemoryArgs {
    content: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RespondArgs {
    message: String,
}

impl OrchestratorAction {
    /// Parse a tool call into an action.
    ///
    /// Known action names with malformed arguments are errors (fed back to
    /// the oracle as the tool result); unknown names become `Passthrough`.
    pub fn parse(call: &ToolCall) -> Result<Self, ActionError> {
        let name = call.function.name.as_str();
        let args: serde_json::Value = serde_json::from_str(&call.function.arguments)
            .unwrap_or(serde_json::Value::Object(Default::default()));

        fn from_args<T: serde::de::DeserializeOwned>(
            tool: &str,
            args: &serde_json::Value,
        ) -> Result<T, ActionError> {
            serde_json::from_value(args.clone()).map_err(|e| ActionError::BadArguments {
                tool: tool.to_string(),
                message: e.to_string(),
            })
        }

        match name {
            "create_plan" => {
                let parsed: CreatePlanArgs = from_args(name, &args)?;
                Ok(Self::CreatePlan {
                    reasoning: parsed.reasoning,
                    tasks: parsed.tasks,
                })
            }
            "modify_plan" => {
                let parsed: ModifyPlanArgs = from_args(name, &args)?;
                Ok(Self::ModifyPlan {
                    add_tasks: parsed.add_tasks,
                    remove_tasks: parsed.remove_tasks,
                })
            }
            "start_agent" => {
                let parsed: StartAgentArgs = from_args(name, &args)?;
                Ok(Self::StartAgent {
                    task_id: parsed.task_id,
                    additional_tools: parsed.additional_tools,
                    instructions: parsed.instructions,
                })
            }
            "monitor_agent" => {
                let parsed: AgentRefArgs = from_args(name, &args)?;
                Ok(Self::MonitorAgent {
                    target: parsed.into_ref(name)?,
                })
            }
            "intervene_agent" => {
                let parsed: InterveneArgs = from_args(name, &args)?;
                let intervention = match parsed.action.as_str() {
                    "guide" => Intervention::Guide {
                        message: parsed.message.unwrap_or_default(),
                    },
                    "redirect" => Intervention::Redirect {
                        message: parsed.message.unwrap_or_default(),
                    },
                    "cancel" => Intervention::Cancel {
                        reason: parsed.reason,
                    },
                    other => {
                        return Err(ActionError::BadArguments {
                            tool: name.to_string(),
                            message: format!(
                                "unknown intervention action '{other}' (expected guide, redirect, or cancel)"
                            ),
                        })
                    }
                };
                Ok(Self::InterveneAgent {
                    target: parsed.target.into_ref(name)?,
                    intervention,
                })
            }
            "cancel_agent" => {
                let parsed: CancelAgentArgs = from_args(name, &args)?;
                Ok(Self::CancelAgent {
                    target: parsed.target.into_ref(name)?,
                    reason: parsed.reason,
                })
            }
            "complete_task" => {
                let parsed: CompleteTaskArgs = from_args(name, &args)?;
                Ok(Self::CompleteTask {
                    task_id: parsed.task_id,
                    result: parsed.result,
                })
            }
            "fail_task" => {
                let parsed: FailTaskArgs = from_args(name, &args)?;
                Ok(Self::FailTask {
                    task_id: parsed.task_id,
                    error: parsed.error,
                    retry: parsed.retry,
                })
            }
            "store_memory" => {
                let parsed: StoreMemoryArgs = from_args(name, &args)?;
                Ok(Self::StoreMemory {
                    content: parsed.content,
                    metadata: parsed.metadata,
                })
            }
            "get_plan_status" => Ok(Self::GetPlanStatus),
            "respond_to_user" => {
                let parsed: RespondArgs = from_args(name, &args)?;
                Ok(Self::RespondToUser {
                    message: parsed.message,
                })
            }
            _ => Ok(Self::Passthrough {
                tool_id: name.to_string(),
                args,
            }),
        }
    }
}

/// Tool menu describing the orchestrator actions to the oracle.
pub fn orchestrator_tool_menu() -> Vec<ToolDefinition> {
    use serde_json::json;

    let task_schema = json!({
        "type": "object",
        "properties": {
            "id": {"type": "string", "description": "Short unique task id, e.g. 'research'"},
            "description": {"type": "string"},
            "agent_type": {
                "type": "string",
                "enum": ["general", "research", "coding", "scheduling", "productivity", "messaging"]
            },
            "dependencies": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Ids of tasks that must complete first"
            }
        },
        "required": ["id", "description"]
    });

    vec![
        ToolDefinition::function(
            "create_plan",
            "Decompose the request into a dependency graph of tasks and start executing it. \
             Use only when the request needs multiple coordinated steps.",
            json!({
                "type": "object",
                "properties": {
                    "reasoning": {"type": "string", "description": "Why this decomposition"},
                    "tasks": {"type": "array", "items": task_schema.clone()}
                },
                "required": ["tasks"]
            }),
        ),
        ToolDefinition::function(
            "modify_plan",
            "Add tasks to or remove tasks from the active plan.",
            json!({
                "type": "object",
                "properties": {
                    "add_tasks": {"type": "array", "items": task_schema},
                    "remove_tasks": {"type": "array", "items": {"type": "string"}}
                }
            }),
        ),
        ToolDefinition::function(
            "start_agent",
            "Start a worker agent on a ready task, optionally with a tool whitelist and \
             extra instructions. Ready tasks are otherwise started automatically.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string"},
                    "additional_tools": {"type": "array", "items": {"type": "string"}},
                    "instructions": {"type": "string"}
                },
                "required": ["task_id"]
            }),
        ),
        ToolDefinition::function(
            "monitor_agent",
            "Get a status snapshot of a running agent by agent_id or task_id.",
            json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string"},
                    "task_id": {"type": "string"}
                }
            }),
        ),
        ToolDefinition::function(
            "intervene_agent",
            "Steer a running agent: guide (extra guidance), redirect (new direction), \
             or cancel. Interventions are rate limited per run.",
            json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string"},
                    "task_id": {"type": "string"},
                    "action": {"type": "string", "enum": ["guide", "redirect", "cancel"]},
                    "message": {"type": "string"},
                    "reason": {"type": "string"}
                },
                "required": ["action"]
            }),
        ),
        ToolDefinition::function(
            "cancel_agent",
            "Cooperatively cancel a running agent by agent_id or task_id.",
            json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string"},
                    "task_id": {"type": "string"},
                    "reason": {"type": "string"}
                }
            }),
        ),
        ToolDefinition::function(
            "complete_task",
            "Mark a task completed with its result payload.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string"},
                    "result": {"description": "Result payload"}
                },
                "required": ["task_id"]
            }),
        ),
        ToolDefinition::function(
            "fail_task",
            "Mark a task failed. Set retry=true to request a rate-limited retry instead \
             of a permanent failure.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string"},
                    "error": {"type": "string"},
                    "retry": {"type": "boolean"}
                },
                "required": ["task_id"]
            }),
        ),
        ToolDefinition::function(
            "store_memory",
            "Store a durable fact or preference in the user's long-term memory.",
            json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string"},
                    "metadata": {"type": "object"}
                },
                "required": ["content"]
            }),
        ),
        ToolDefinition::function(
            "get_plan_status",
            "Get the current plan with per-task statuses.",
            json!({"type": "object", "properties": {}}),
        ),
        ToolDefinition::function(
            "respond_to_user",
            "Deliver the final answer to the user and end the run immediately.",
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"}
                },
                "required": ["message"]
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::function("c1", name, args.to_string())
    }

    #[test]
    fn create_plan_parses_tasks() {
        let action = OrchestratorAction::parse(&call(
            "create_plan",
            serde_json::json!({
                "reasoning": "multi-step",
                "tasks": [
                    {"id": "a", "description": "first"},
                    {"id": "b", "description": "second", "agent_type": "research",
                     "dependencies": ["a"]}
                ]
            }),
        ))
        .unwrap();
        match action {
            OrchestratorAction::CreatePlan { reasoning, tasks } => {
                assert_eq!(reasoning, "multi-step");
                assert_eq!(tasks.len(), 2);
                assert_eq!(tasks[1].dependencies, vec![NodeId::from("a")]);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn unknown_tool_name_is_passthrough() {
        let action = OrchestratorAction::parse(&call(
            "calendar_create_event",
            serde_json::json!({"title": "standup"}),
        ))
        .unwrap();
        match action {
            OrchestratorAction::Passthrough { tool_id, args } => {
                assert_eq!(tool_id, "calendar_create_event");
                assert_eq!(args["title"], "standup");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn malformed_known_action_is_an_error_not_a_noop() {
        let err =
            OrchestratorAction::parse(&call("create_plan", serde_json::json!({"tasks": "nope"})))
                .unwrap_err();
        assert!(matches!(err, ActionError::BadArguments { tool, .. } if tool == "create_plan"));
    }

    #[test]
    fn intervene_requires_known_action_and_target() {
        let action = OrchestratorAction::parse(&call(
            "intervene_agent",
            serde_json::json!({"task_id": "x", "action": "guide", "message": "focus"}),
        ))
        .unwrap();
        match action {
            OrchestratorAction::InterveneAgent {
                target,
                intervention,
            } => {
                assert_eq!(target, AgentRef::Task(NodeId::from("x")));
                assert_eq!(
                    intervention,
                    Intervention::Guide {
                        message: "focus".to_string()
                    }
                );
            }
            other => panic!("unexpected action: {other:?}"),
        }

        let err = OrchestratorAction::parse(&call(
            "intervene_agent",
            serde_json::json!({"action": "guide"}),
        ))
        .unwrap_err();
        assert!(matches!(err, ActionError::BadArguments { .. }));

        let err = OrchestratorAction::parse(&call(
            "intervene_agent",
            serde_json::json!({"task_id": "x", "action": "pause"}),
        ))
        .unwrap_err();
        assert!(matches!(err, ActionError::BadArguments { .. }));
    }

    #[test]
    fn menu_names_round_trip_through_parse() {
        for tool in orchestrator_tool_menu() {
            let name = tool.function.name;
            // Every menu name must be recognized as a closed-set action,
            // not fall through to Passthrough.
            let parsed = OrchestratorAction::parse(&call(&name, serde_json::json!({})));
            if let Ok(OrchestratorAction::Passthrough { .. }) = parsed {
                panic!("menu tool {name} fell through to passthrough");
            }
        }
    }
}
