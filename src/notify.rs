//! Parent session notifications

use std::fmt;

use tracing::{debug, warn};

use crate::backend::{BackendError, PromptRequest, SessionBackend};
use crate::ids::{SessionId, TaskId};

/// Outcome reported to the parent session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Completed,
    Failed { error: String },
    Interrupted,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed { .. } => f.write_str("failed"),
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Status message pushed into a parent session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentNotification {
    pub parent_session_id: SessionId,
    /// Agent owning the parent session
    pub parent_agent: String,
    pub task_id: TaskId,
    /// Agent that ran the task
    pub agent: String,
    pub kind: NotificationKind,
}

impl ParentNotification {
    /// Text of the notification as the parent agent will read it
    pub fn message(&self) -> String {
        let id = &self.task_id;
        let agent = &self.agent;
        match &self.kind {
            NotificationKind::Completed => format!(
                "[BACKGROUND TASK COMPLETED] Task \"{id}\" (@{agent}) has finished successfully. \
                 Use background_output with task_id=\"{id}\" to retrieve the results."
            ),
            NotificationKind::Failed { error } => format!(
                "[BACKGROUND TASK FAILED] Task \"{id}\" (@{agent}) has failed. Error: {error}. \
                 Use background_output with task_id=\"{id}\" for details."
            ),
            NotificationKind::Interrupted => format!(
                "[BACKGROUND TASK INTERRUPTED] Task \"{id}\" (@{agent}) was interrupted by user. \
                 The subagent and any of its children have been cancelled. How would you like to proceed?"
            ),
        }
    }

    fn request(&self) -> PromptRequest {
        PromptRequest::text(
            self.parent_session_id.clone(),
            self.parent_agent.clone(),
            self.message(),
        )
    }
}

/// Deliver a notification, best effort
///
/// Prefers the non-blocking prompt. Falls back to the blocking prompt when the
/// backend lacks it, in which case a response that fails to decode still
/// counts as delivered. Failures are logged and never propagated.
pub async fn deliver(backend: &dyn SessionBackend, notification: &ParentNotification) {
    let outcome = match backend.prompt_async(notification.request()).await {
        Err(BackendError::Unsupported(_)) => backend.prompt(notification.request()).await.map(|_| ()),
        other => other,
    };

    match outcome {
        Ok(()) => debug!(
            task_id = %notification.task_id,
            parent_session_id = %notification.parent_session_id,
            kind = %notification.kind,
            "Notified parent session"
        ),
        Err(BackendError::Decode(reason)) => debug!(
            task_id = %notification.task_id,
            reason = %reason,
            "Notification accepted; ignoring undecodable response"
        ),
        Err(e) => warn!(
            task_id = %notification.task_id,
            parent_session_id = %notification.parent_session_id,
            error = %e,
            "Failed to notify parent session"
        ),
    }
}
