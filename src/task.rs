//! Task record and its lifecycle state machine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ids::{SessionId, TaskId};

/// Lifecycle status of a background task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Completed, Failed and Cancelled never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Running or Cancelling: remote work may still be in flight
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Cancelling)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One dispatched unit of background agent work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Agent running the task
    pub agent: String,
    pub instruction: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Session that dispatched the task
    pub parent_session_id: SessionId,
    /// Agent owning the parent session; notifications are sent as this agent
    pub parent_agent: String,
    /// Session id supplied by the caller for reuse
    pub requested_session_id: Option<SessionId>,
    /// Session the task runs in, once known
    pub child_session_id: Option<SessionId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new running task
    pub fn new(
        agent: impl Into<String>,
        instruction: impl Into<String>,
        parent_session_id: SessionId,
        parent_agent: impl Into<String>,
        requested_session_id: Option<SessionId>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            agent: agent.into(),
            instruction: instruction.into(),
            status: TaskStatus::Running,
            result: None,
            error: None,
            parent_session_id,
            parent_agent: parent_agent.into(),
            requested_session_id,
            child_session_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Session id to offer for continuation
    pub fn continuation_session(&self) -> Option<&SessionId> {
        self.requested_session_id
            .as_ref()
            .or(self.child_session_id.as_ref())
    }

    /// Record the child session; the first value wins
    pub fn set_child_session(&mut self, session_id: SessionId) -> bool {
        if self.child_session_id.is_some() {
            return false;
        }
        self.child_session_id = Some(session_id);
        true
    }

    /// Running -> Completed
    pub fn complete(&mut self, result: &str, max_chars: usize) -> bool {
        if self.status != TaskStatus::Running {
            debug!(task_id = %self.id, status = %self.status, "Ignoring completion of non-running task");
            return false;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(tail_truncate(result, max_chars).to_string());
        self.completed_at = Some(Utc::now());
        true
    }

    /// Running -> Failed
    pub fn fail(&mut self, error: &str, max_chars: usize) -> bool {
        if self.status != TaskStatus::Running {
            debug!(task_id = %self.id, status = %self.status, "Ignoring failure of non-running task");
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(tail_truncate(error, max_chars).to_string());
        self.completed_at = Some(Utc::now());
        true
    }

    /// Running -> Cancelling
    pub fn mark_cancelling(&mut self) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Cancelling;
        true
    }

    /// Running | Cancelling -> Cancelled
    pub fn cancel(&mut self, reason: Option<&str>, max_chars: usize) -> bool {
        if !self.status.is_active() {
            debug!(task_id = %self.id, status = %self.status, "Ignoring cancellation of finished task");
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.error = reason.map(|r| tail_truncate(r, max_chars).to_string());
        self.completed_at = Some(Utc::now());
        true
    }
}

/// Keep the trailing `max_chars` characters of `s`
pub fn tail_truncate(s: &str, max_chars: usize) -> &str {
    let total = s.chars().count();
    if total <= max_chars {
        return s;
    }
    let skip = total - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}

/// Keep the leading `max_chars` characters of `s`
pub fn head_truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
