//! Execution driver: runs one background task end to end

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendError, PromptRequest, Role, SessionBackend, SessionMessage};
use crate::ids::{SessionId, TaskId};
use crate::notify::{self, NotificationKind, ParentNotification};
use crate::registry::{Released, TaskRegistry};
use crate::task::{head_truncate, TaskStatus};

/// Placeholder stored when the agent produced no text
pub const NO_TEXT_OUTPUT: &str = "(No text output)";

/// Separator between text chunks of different assistant messages
const CHUNK_SEPARATOR: &str = "\n\n";

/// Everything the driver needs to know about its task
#[derive(Debug, Clone)]
pub struct DriverJob {
    pub task_id: TaskId,
    pub agent: String,
    pub instruction: String,
    pub parent_session_id: SessionId,
    /// Existing session to continue instead of creating one
    pub reuse_session: Option<SessionId>,
    pub title_preview_chars: usize,
}

impl DriverJob {
    /// Title for a freshly created child session
    pub fn session_title(&self) -> String {
        format!(
            "Background: {} - {}...",
            self.agent,
            head_truncate(&self.instruction, self.title_preview_chars)
        )
    }
}

/// Run the task and drive it to a terminal state
///
/// Every failure is funneled into the task's Failed state here, unless the
/// task's cancellation token fired, in which case the cancel path owns the
/// outcome and no failure notification is sent.
#[instrument(skip_all, fields(task_id = %job.task_id, agent = %job.agent))]
pub async fn run(
    registry: Arc<RwLock<TaskRegistry>>,
    backend: Arc<dyn SessionBackend>,
    cancel: CancellationToken,
    job: DriverJob,
) {
    let outcome = drive(&registry, backend.as_ref(), &cancel, &job).await;
    let id = &job.task_id;

    match outcome {
        Ok(Some(result)) => {
            let released = registry.write().complete(id, &result);
            match released {
                Some(released) => {
                    info!("Background task completed");
                    notify_parent(released, NotificationKind::Completed).await;
                }
                None => debug!("Completion superseded by a concurrent transition"),
            }
        }
        Ok(None) => {
            debug!("Task left running state while in flight; dropping result");
        }
        Err(_) if cancel.is_cancelled() => {
            let mut reg = registry.write();
            // A Cancelling task belongs to the canceller, which records its own reason.
            if reg.status(id) == Some(TaskStatus::Running) {
                let _ = reg.cancel(id, Some("Task was cancelled"));
            }
            debug!("Driver abandoned after cancellation");
        }
        Err(e) => {
            let error = format!("{e:#}");
            warn!(error = %error, "Background task failed");
            let released = registry.write().fail(id, &error);
            if let Some(released) = released {
                notify_parent(released, NotificationKind::Failed { error }).await;
            }
        }
    }
}

async fn drive(
    registry: &RwLock<TaskRegistry>,
    backend: &dyn SessionBackend,
    cancel: &CancellationToken,
    job: &DriverJob,
) -> anyhow::Result<Option<String>> {
    let id = &job.task_id;

    let child = match &job.reuse_session {
        Some(session_id) => session_id.clone(),
        None => {
            let title = job.session_title();
            until_cancelled(cancel, backend.create_session(&job.parent_session_id, &title))
                .await
                .context("Failed to create session")?
        }
    };
    let _ = registry.write().set_child_session(id, child.clone());
    debug!(child_session_id = %child, "Child session ready");
    if superseded(registry, id) {
        return Ok(None);
    }

    let request = PromptRequest::text(child.clone(), job.agent.clone(), job.instruction.clone());
    until_cancelled(cancel, backend.prompt(request))
        .await
        .context("Failed to send prompt")?;
    if superseded(registry, id) {
        return Ok(None);
    }

    let messages = until_cancelled(cancel, backend.messages(&child))
        .await
        .context("Failed to fetch messages")?;
    if superseded(registry, id) {
        return Ok(None);
    }

    Ok(Some(render_result(job, &messages)))
}

/// Race a backend call against the task's cancellation token
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, BackendError>>,
) -> anyhow::Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(anyhow!("task cancelled")),
        result = call => result.map_err(Into::into),
    }
}

fn superseded(registry: &RwLock<TaskRegistry>, id: &TaskId) -> bool {
    registry.read().status(id) != Some(TaskStatus::Running)
}

/// Assistant text of a transcript, message chunks separated by a blank line
pub fn assistant_text(messages: &[SessionMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .map(SessionMessage::text)
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join(CHUNK_SEPARATOR)
}

fn render_result(job: &DriverJob, messages: &[SessionMessage]) -> String {
    let text = assistant_text(messages);
    let text = if text.is_empty() { NO_TEXT_OUTPUT } else { text.as_str() };
    format!(
        "Background task {} completed by @{}\n\nInstruction: {}\n\nResult: {}",
        job.task_id, job.agent, job.instruction, text
    )
}

/// Deliver a parent notification with the context released by a terminal transition
pub async fn notify_parent(released: Released, kind: NotificationKind) {
    let Some(context) = released.context else {
        debug!(task_id = %released.task.id, "No execution context; skipping parent notification");
        return;
    };
    let notification = ParentNotification {
        parent_session_id: released.task.parent_session_id,
        parent_agent: released.task.parent_agent,
        task_id: released.task.id,
        agent: released.task.agent,
        kind,
    };
    notify::deliver(context.as_ref(), &notification).await;
}
