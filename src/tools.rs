//! Tool-framework surface: the three background task commands

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::TaskError;
use crate::ids::{SessionId, TaskId};
use crate::orchestrator::{DispatchRequest, Orchestrator};

pub const BACKGROUND_TASK: &str = "background_task";
pub const BACKGROUND_OUTPUT: &str = "background_output";
pub const BACKGROUND_CANCEL: &str = "background_cancel";

const BACKGROUND_TASK_DESCRIPTION: &str = "Dispatch an agent to run asynchronously in the background.

Returns immediately with a task_id. The main session can continue working while the background task runs.

Use this for:
- Long-running operations (tests, analysis, compilation)
- Parallel execution of independent tasks
- Non-blocking research or data gathering

The background agent runs in its own session and can use all available tools.

**wait parameter:**
- `wait: false` (default): Returns immediately with task_id. You'll receive a notification when complete. **Recommended.**
- `wait: true`: Blocks until task completes. Use sparingly - only when you need the result immediately to proceed.";

const BACKGROUND_OUTPUT_DESCRIPTION: &str = "Get results from a background task.

Returns the output of a completed task, or status if still running.";

const BACKGROUND_CANCEL_DESCRIPTION: &str = "Cancel running background tasks.";

/// Who is calling a tool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolContext {
    /// Session the calling agent runs in
    pub session_id: Option<SessionId>,
    /// Name of the calling agent
    pub agent: Option<String>,
}

impl ToolContext {
    pub fn new(session_id: SessionId, agent: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id),
            agent: Some(agent.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchArgs {
    pub agent: String,
    pub instruction: String,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputArgs {
    pub task_id: TaskId,
    #[serde(default)]
    pub wait: bool,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<f64>,
}

impl OutputArgs {
    /// Wait bound; absent, zero and nonsensical values fall back to the default
    fn timeout(&self) -> Option<Duration> {
        self.timeout
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelArgs {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub all: bool,
}

/// Name, description and JSON parameter schema of every tool
pub fn schemas() -> Vec<Value> {
    vec![
        json!({
            "name": BACKGROUND_TASK,
            "description": BACKGROUND_TASK_DESCRIPTION,
            "parameters": {
                "type": "object",
                "properties": {
                    "agent": {
                        "type": "string",
                        "description": "Agent to dispatch (e.g., \"build\", \"explore\", \"librarian\")"
                    },
                    "instruction": {
                        "type": "string",
                        "description": "Instructions for the agent"
                    },
                    "wait": {
                        "type": "boolean",
                        "description": "Wait for task completion (default: false)"
                    },
                    "session_id": {
                        "type": "string",
                        "description": "Optional session ID to reuse an existing subagent session. If provided, continues conversation in that session instead of creating a new one."
                    }
                },
                "required": ["agent", "instruction"]
            }
        }),
        json!({
            "name": BACKGROUND_OUTPUT,
            "description": BACKGROUND_OUTPUT_DESCRIPTION,
            "parameters": {
                "type": "object",
                "properties": {
                    "task_id": {
                        "type": "string",
                        "description": "Task ID returned from background_task"
                    },
                    "wait": {
                        "type": "boolean",
                        "description": "Wait for completion if still running"
                    },
                    "timeout": {
                        "type": "number",
                        "description": "Max wait time in seconds (default: 300)"
                    }
                },
                "required": ["task_id"]
            }
        }),
        json!({
            "name": BACKGROUND_CANCEL,
            "description": BACKGROUND_CANCEL_DESCRIPTION,
            "parameters": {
                "type": "object",
                "properties": {
                    "task_id": {
                        "type": "string",
                        "description": "Specific task to cancel"
                    },
                    "all": {
                        "type": "boolean",
                        "description": "Cancel all tasks"
                    }
                }
            }
        }),
    ]
}

/// Run a tool by name and return the text shown to the calling agent
pub async fn invoke(orchestrator: &Orchestrator, name: &str, args: Value, ctx: &ToolContext) -> String {
    debug!(tool = name, session_id = ?ctx.session_id, "Tool invoked");
    match name {
        BACKGROUND_TASK => match decode::<DispatchArgs>(args) {
            Ok(args) => {
                let request = DispatchRequest {
                    agent: args.agent,
                    instruction: args.instruction,
                    wait: args.wait,
                    wait_timeout: None,
                    session_id: args.session_id,
                };
                orchestrator.dispatch(ctx, request).await
            }
            Err(e) => e.to_tool_text(),
        },
        BACKGROUND_OUTPUT => match decode::<OutputArgs>(args) {
            Ok(args) => {
                orchestrator
                    .output(&args.task_id, args.wait, args.timeout())
                    .await
            }
            Err(e) => e.to_tool_text(),
        },
        BACKGROUND_CANCEL => match decode::<CancelArgs>(args) {
            Ok(args) => {
                orchestrator
                    .cancel(ctx, args.task_id.as_ref(), args.all)
                    .await
            }
            Err(e) => e.to_tool_text(),
        },
        other => format!("Error: Unknown tool {other}"),
    }
}

/// Decode tool arguments; a missing or null argument object counts as empty
fn decode<T: DeserializeOwned>(args: Value) -> Result<T, TaskError> {
    let args = if args.is_null() { json!({}) } else { args };
    Ok(serde_json::from_value(args)?)
}
