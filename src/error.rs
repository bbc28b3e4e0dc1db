//! Errand error types

use thiserror::Error;

use crate::ids::TaskId;
use crate::task::TaskStatus;

/// Errors that can occur while orchestrating background tasks
///
/// None of these escape the tool surface as faults: the orchestrator renders
/// each one into the human-readable text the calling agent sees.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task id unknown (never registered, or already evicted)
    #[error("Task {0} not found")]
    NotFound(TaskId),

    /// Cancelling the task would abort the caller's own session
    #[error("Cannot cancel task {0} - it would abort the calling session")]
    InvalidTarget(TaskId),

    /// Task already left the running state
    #[error("Task {id} is not running (status: {status})")]
    NotRunning { id: TaskId, status: TaskStatus },

    /// Task is active but its completion signal is gone
    #[error("Task {0} completion signal not found")]
    SignalMissing(TaskId),

    /// Wait exceeded the caller's bound; the task keeps running
    #[error("Timeout waiting for task {0}")]
    Timeout(TaskId),

    /// Registry is full of in-flight tasks
    #[error("Too many background tasks in flight (capacity {capacity}); retry after some complete")]
    CapacityExhausted { capacity: usize },

    /// Required argument or context value missing
    #[error("{0}")]
    MissingArgument(String),

    /// Tool arguments could not be decoded
    #[error("Invalid arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TaskError {
    /// Render as the text returned to the tool framework
    pub fn to_tool_text(&self) -> String {
        match self {
            Self::Timeout(_) | Self::NotRunning { .. } => self.to_string(),
            _ => format!("Error: {self}"),
        }
    }
}
