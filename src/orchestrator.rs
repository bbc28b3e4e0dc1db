//! Main orchestrator - dispatches background tasks and propagates cancellation
//!
//! One `Orchestrator` owns one task registry. It is cheap to clone; clones
//! share the registry, so a tool layer and an event listener can each hold one.

use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::SessionBackend;
use crate::config::OrchestratorConfig;
use crate::driver::{self, DriverJob};
use crate::error::TaskError;
use crate::event::SessionEvent;
use crate::ids::{SessionId, TaskId};
use crate::notify::NotificationKind;
use crate::registry::{Released, TaskRegistry};
use crate::task::{Task, TaskStatus};
use crate::tools::ToolContext;

/// Reason recorded on a task cancelled through the cancel command
pub const CANCELLED_PROGRAMMATICALLY: &str = "Task was cancelled programmatically";
/// Reason recorded on descendants of a task cancelled through the cancel command
pub const PARENT_CANCELLED: &str = "Parent task was cancelled - task was cancelled";
/// Reason recorded on a subagent whose session the user interrupted
pub const USER_INTERRUPTED: &str = "User interrupted subagent - task was cancelled";
/// Reason recorded on descendants of an interrupted subagent
pub const PARENT_INTERRUPTED: &str = "Parent subagent was interrupted - task was cancelled";

/// A request to run an agent in the background
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub agent: String,
    pub instruction: String,
    /// Block until the task finishes
    pub wait: bool,
    /// Bound for `wait`; the configured default when absent
    pub wait_timeout: Option<Duration>,
    /// Existing session to continue in
    pub session_id: Option<SessionId>,
}

/// Per-level reasons used when cancelling a subtree
#[derive(Debug, Clone, Copy)]
struct CancelReasons {
    root: &'static str,
    descendants: &'static str,
}

const PROGRAMMATIC: CancelReasons = CancelReasons {
    root: CANCELLED_PROGRAMMATICALLY,
    descendants: PARENT_CANCELLED,
};

const INTERRUPTED: CancelReasons = CancelReasons {
    root: USER_INTERRUPTED,
    descendants: PARENT_INTERRUPTED,
};

/// The background task orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<RwLock<TaskRegistry>>,
    backend: Arc<dyn SessionBackend>,
    config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    /// Create an orchestrator over the given session backend
    pub fn new(backend: Arc<dyn SessionBackend>, config: OrchestratorConfig) -> Result<Self, TaskError> {
        config.validate()?;
        Ok(Self::assemble(backend, config))
    }

    /// Create an orchestrator with the default configuration
    pub fn with_defaults(backend: Arc<dyn SessionBackend>) -> Self {
        Self::assemble(backend, OrchestratorConfig::default())
    }

    /// Build from an already validated configuration
    fn assemble(backend: Arc<dyn SessionBackend>, config: OrchestratorConfig) -> Self {
        Self {
            registry: Arc::new(RwLock::new(TaskRegistry::new(&config))),
            backend,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // === Dispatch ===

    /// Dispatch a task and render the outcome for the calling agent
    ///
    /// Fire-and-forget unless `request.wait` is set, in which case this blocks
    /// until the task finishes or the wait bound elapses.
    pub async fn dispatch(&self, caller: &ToolContext, request: DispatchRequest) -> String {
        let wait = request.wait;
        let timeout = request
            .wait_timeout
            .unwrap_or_else(|| self.config.default_wait_timeout());

        let task = match self.spawn_task(caller, request) {
            Ok(task) => task,
            Err(e) => return e.to_tool_text(),
        };

        if wait {
            return self.wait_for(&task.id, timeout).await;
        }

        let id = &task.id;
        format!(
            "Background task started: {id}\n\nAgent: {}\nInstruction: {}\n\n\
             Use background_output with task_id=\"{id}\" to check results.",
            task.agent, task.instruction
        )
    }

    /// Register a task and start its execution driver
    pub fn spawn_task(&self, caller: &ToolContext, request: DispatchRequest) -> Result<Task, TaskError> {
        let parent_session_id = caller.session_id.clone().ok_or_else(|| {
            TaskError::MissingArgument("Could not determine parent session ID from context".into())
        })?;
        let parent_agent = caller
            .agent
            .clone()
            .filter(|agent| !agent.is_empty())
            .unwrap_or_else(|| self.config.default_parent_agent.clone());

        let mut task = Task::new(
            request.agent,
            request.instruction,
            parent_session_id,
            parent_agent,
            request.session_id.clone(),
        );
        if let Some(reuse) = request.session_id {
            task.set_child_session(reuse);
        }

        let cancel = CancellationToken::new();
        self.registry
            .write()
            .register(task.clone(), Some(Arc::clone(&self.backend)), cancel.clone())?;

        info!(
            task_id = %task.id,
            agent = %task.agent,
            parent_session_id = %task.parent_session_id,
            reused_session = task.requested_session_id.is_some(),
            "Dispatched background task"
        );

        let job = DriverJob {
            task_id: task.id.clone(),
            agent: task.agent.clone(),
            instruction: task.instruction.clone(),
            parent_session_id: task.parent_session_id.clone(),
            reuse_session: task.requested_session_id.clone(),
            title_preview_chars: self.config.title_preview_chars,
        };
        tokio::spawn(driver::run(
            Arc::clone(&self.registry),
            Arc::clone(&self.backend),
            cancel,
            job,
        ));

        Ok(task)
    }

    // === Queries ===

    /// Snapshot of a task
    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.registry.read().get(id)
    }

    /// Snapshot of all tasks, oldest first
    pub fn tasks(&self) -> Vec<Task> {
        self.registry.read().list()
    }

    pub fn is_top_level(&self, session_id: &SessionId) -> bool {
        self.registry.read().is_top_level(session_id)
    }

    pub fn children_tasks(&self, session_id: &SessionId) -> Vec<Task> {
        self.registry.read().children_tasks(session_id)
    }

    pub fn descendant_tasks(&self, session_id: &SessionId) -> Vec<Task> {
        self.registry.read().descendant_tasks(session_id)
    }

    pub fn top_level_ancestor(&self, session_id: &SessionId) -> SessionId {
        self.registry.read().top_level_ancestor(session_id)
    }

    /// Status text of a task, optionally waiting for it to finish
    pub async fn output(&self, id: &TaskId, wait: bool, timeout: Option<Duration>) -> String {
        let Some(task) = self.task(id) else {
            return TaskError::NotFound(id.clone()).to_tool_text();
        };

        if wait && task.status == TaskStatus::Running {
            let timeout = timeout.unwrap_or_else(|| self.config.default_wait_timeout());
            return self.wait_for(id, timeout).await;
        }

        render_task(&task)
    }

    // === Waiting ===

    /// Wait for a task to finish and render its final state
    pub async fn wait_for(&self, id: &TaskId, timeout: Duration) -> String {
        match self.wait_task(id, timeout).await {
            Ok(task) => render_task(&task),
            Err(e) => e.to_tool_text(),
        }
    }

    /// Wait until the task is terminal or `timeout` elapses
    ///
    /// A timeout does not affect the task; it keeps running in the background.
    pub async fn wait_task(&self, id: &TaskId, timeout: Duration) -> Result<Task, TaskError> {
        let (task, signal) = {
            let reg = self.registry.read();
            (reg.get(id), reg.signal(id))
        };
        let task = task.ok_or_else(|| TaskError::NotFound(id.clone()))?;
        if task.status.is_terminal() {
            return Ok(task);
        }

        let Some(signal) = signal else {
            // Raced with a terminal transition that dropped the signal.
            tokio::task::yield_now().await;
            let task = self.task(id).ok_or_else(|| TaskError::NotFound(id.clone()))?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            return Err(TaskError::SignalMissing(id.clone()));
        };

        if tokio::time::timeout(timeout, signal.wait()).await.is_err() {
            debug!(task_id = %id, ?timeout, "Wait timed out");
        }

        // The race may have ended on the timer; the registry has the real answer.
        let task = self.task(id).ok_or_else(|| TaskError::NotFound(id.clone()))?;
        if task.status.is_terminal() {
            Ok(task)
        } else {
            Err(TaskError::Timeout(id.clone()))
        }
    }

    // === Explicit cancellation ===

    /// Cancel one task or all running tasks and render the outcome
    pub async fn cancel(&self, caller: &ToolContext, task_id: Option<&TaskId>, all: bool) -> String {
        if all {
            let count = self.cancel_all(caller.session_id.as_ref()).await;
            return format!("Cancelled {count} running tasks");
        }

        match task_id {
            Some(id) => match self.cancel_task(id, caller.session_id.as_ref()).await {
                Ok(_) => format!("Cancelled task: {id}"),
                Err(e) => e.to_tool_text(),
            },
            None => TaskError::MissingArgument("Must specify task_id or all=true".into()).to_tool_text(),
        }
    }

    /// Cancel a running task and its descendants
    ///
    /// Rejected if the task runs in `caller_session`, since that would abort
    /// the caller itself.
    pub async fn cancel_task(
        &self,
        id: &TaskId,
        caller_session: Option<&SessionId>,
    ) -> Result<Task, TaskError> {
        let task = self.task(id).ok_or_else(|| TaskError::NotFound(id.clone()))?;
        if task.status != TaskStatus::Running {
            return Err(TaskError::NotRunning {
                id: id.clone(),
                status: task.status,
            });
        }
        if caller_session.is_some() && task.child_session_id.as_ref() == caller_session {
            return Err(TaskError::InvalidTarget(id.clone()));
        }

        if !self.cancel_explicit(id, caller_session).await {
            // Lost a race with another transition.
            let status = self.task(id).map_or(TaskStatus::Cancelled, |t| t.status);
            return Err(TaskError::NotRunning { id: id.clone(), status });
        }

        self.task(id).ok_or_else(|| TaskError::NotFound(id.clone()))
    }

    /// Cancel every running task except the one hosting `caller_session`
    pub async fn cancel_all(&self, caller_session: Option<&SessionId>) -> usize {
        let running: Vec<Task> = self
            .tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .collect();

        let mut cancelled = 0;
        for task in running {
            if caller_session.is_some() && task.child_session_id.as_ref() == caller_session {
                debug!(task_id = %task.id, "Skipping the caller's own task");
                continue;
            }
            if self.cancel_explicit(&task.id, caller_session).await {
                cancelled += 1;
            }
        }

        info!(count = cancelled, "Cancelled all running tasks");
        cancelled
    }

    /// Running -> Cancelling -> abort -> Cancelled, then the subtree
    async fn cancel_explicit(&self, id: &TaskId, spare: Option<&SessionId>) -> bool {
        let (token, context, child) = {
            let mut reg = self.registry.write();
            if !reg.mark_cancelling(id) {
                return false;
            }
            // The abort below echoes back as an interruption event; make it silent.
            reg.mark_programmatic(id);
            let child = reg.get(id).and_then(|t| t.child_session_id);
            (reg.cancel_token(id), reg.context(id), child)
        };

        if let Some(token) = token {
            token.cancel();
        }
        if let (Some(context), Some(child)) = (context, &child) {
            abort_session(context.as_ref(), child).await;
        }

        let released = self.registry.write().cancel(id, Some(PROGRAMMATIC.root));
        if released.is_some() {
            info!(task_id = %id, "Cancelled background task");
        }

        if let Some(child) = &child {
            self.cancel_descendants(child, PROGRAMMATIC.descendants, spare).await;
        }
        true
    }

    // === Interruption events ===

    /// React to a backend event; only "message aborted" interruptions matter
    pub async fn handle_event(&self, event: &SessionEvent) {
        if let Some(session_id) = event.aborted_session() {
            self.handle_interruption(&session_id).await;
        }
    }

    /// A session's running message was aborted
    ///
    /// Top-level sessions are ignored: their background work keeps running and
    /// reports back when done. For a tracked child session the task and its
    /// whole subtree are cancelled. The parent is told only when the abort did
    /// not come from our own cancel command.
    pub async fn handle_interruption(&self, session_id: &SessionId) {
        let found = {
            let mut reg = self.registry.write();
            if reg.is_top_level(session_id) {
                debug!(session_id = %session_id, "Top-level session interrupted; background tasks continue");
                return;
            }
            reg.find_by_child_session(session_id)
                .map(|task| (reg.take_programmatic(&task.id), task))
        };
        let Some((programmatic, task)) = found else {
            return;
        };

        if programmatic {
            // The cancel command already handled the subtree and spared the caller.
            debug!(task_id = %task.id, "Interruption caused by cancel command; finalizing silently");
            let _ = self.terminate(&task.id, PROGRAMMATIC.root);
            return;
        }
        if !task.status.is_active() {
            debug!(task_id = %task.id, status = %task.status, "Interrupted session belongs to a finished task");
            return;
        }

        info!(task_id = %task.id, session_id = %session_id, "Subagent interrupted by user");
        let released = self.terminate(&task.id, INTERRUPTED.root);
        self.cancel_descendants(session_id, INTERRUPTED.descendants, None).await;

        if let Some(released) = released {
            driver::notify_parent(released, NotificationKind::Interrupted).await;
        }

        // Reaching the top-level session needs a handle this path does not have;
        // it sees the interruption through its own output queries.
        let top_level = self.top_level_ancestor(session_id);
        debug!(task_id = %task.id, top_level_session = %top_level, "Resolved top-level session of interrupted subagent");
    }

    // === Propagation ===

    /// Cancel a task, signalling its token
    fn terminate(&self, id: &TaskId, reason: &str) -> Option<Released> {
        let (token, released) = {
            let mut reg = self.registry.write();
            let token = reg.cancel_token(id);
            (token, reg.cancel(id, Some(reason)))
        };
        if let Some(token) = token {
            token.cancel();
        }
        released
    }

    /// Cancel every active task below `session_id` without notifying anyone
    ///
    /// Each active descendant is flagged programmatic before its session is
    /// aborted, so the resulting interruption events stay silent.
    async fn cancel_descendants(&self, session_id: &SessionId, reason: &str, spare: Option<&SessionId>) {
        let targets: Vec<_> = {
            let mut reg = self.registry.write();
            let descendants = reg.descendant_tasks(session_id);
            let mut targets = Vec::new();
            for task in descendants {
                if !task.status.is_active() {
                    continue;
                }
                if spare.is_some() && task.child_session_id.as_ref() == spare {
                    continue;
                }
                reg.mark_programmatic(&task.id);
                let token = reg.cancel_token(&task.id);
                let context = reg.context(&task.id);
                let _ = reg.cancel(&task.id, Some(reason));
                targets.push((task, token, context));
            }
            targets
        };

        for (task, token, context) in targets {
            debug!(task_id = %task.id, parent_session_id = %task.parent_session_id, "Cancelled descendant task");
            if let Some(token) = token {
                token.cancel();
            }
            if let (Some(context), Some(child)) = (context, &task.child_session_id) {
                abort_session(context.as_ref(), child).await;
            }
        }
    }
}

/// Ask the backend to abort a session; failures are logged only
async fn abort_session(backend: &dyn SessionBackend, session_id: &SessionId) {
    if let Err(e) = backend.abort(session_id).await {
        warn!(session_id = %session_id, error = %e, "Failed to abort session");
    }
}

/// Human-readable status of a task
pub fn render_task(task: &Task) -> String {
    let id = &task.id;
    let started = task.created_at.to_rfc3339_opts(SecondsFormat::Millis, true);
    let body = match task.status {
        TaskStatus::Running => format!(
            "Task {id} is still running...\n\nAgent: {}\nStarted: {started}",
            task.agent
        ),
        TaskStatus::Cancelling => format!(
            "Task {id} is being cancelled...\n\nAgent: {}\nStarted: {started}",
            task.agent
        ),
        TaskStatus::Completed => format!(
            "Task {id} completed:\n\n{}",
            task.result.as_deref().unwrap_or_default()
        ),
        TaskStatus::Failed => format!(
            "Task {id} failed:\n\n{}",
            task.error.as_deref().unwrap_or_default()
        ),
        TaskStatus::Cancelled => match &task.error {
            Some(reason) => format!("Task {id} was cancelled: {reason}"),
            None => format!("Task {id} was cancelled"),
        },
    };

    match task.continuation_session() {
        Some(session_id) => format!("{body}\n\nSession ID (for continuation): {session_id}"),
        None => body,
    }
}
