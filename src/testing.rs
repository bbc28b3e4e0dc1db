//! Test infrastructure: a scripted in-memory session backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BackendError, MessagePart, PromptRequest, Role, SessionBackend, SessionMessage,
};
use crate::ids::SessionId;

/// How prompts sent to child sessions behave
#[derive(Debug, Clone, Copy)]
pub enum PromptMode {
    /// Return right away
    Immediate,
    /// Return after the given delay
    Delay(Duration),
    /// Never return until the session is aborted
    Hang,
}

/// Mock backend that records every call and replays scripted answers
pub struct MockBackend {
    next_session: AtomicU32,
    supports_prompt_async: AtomicBool,
    mode: Mutex<PromptMode>,
    transcript: Mutex<Vec<SessionMessage>>,
    create_error: Mutex<Option<BackendError>>,
    prompt_errors: Mutex<HashMap<SessionId, BackendError>>,
    messages_error: Mutex<Option<BackendError>>,
    abort_error: Mutex<Option<BackendError>>,
    abort_tokens: Mutex<HashMap<SessionId, CancellationToken>>,
    abort_tx: Mutex<Option<mpsc::UnboundedSender<SessionId>>>,
    /// (parent, title) for every created session
    pub created: Mutex<Vec<(SessionId, String)>>,
    pub prompts: Mutex<Vec<PromptRequest>>,
    pub async_prompts: Mutex<Vec<PromptRequest>>,
    pub aborted: Mutex<Vec<SessionId>>,
}

impl MockBackend {
    /// Backend whose sessions answer "Mock response" immediately
    pub fn new() -> Self {
        Self {
            next_session: AtomicU32::new(1),
            supports_prompt_async: AtomicBool::new(true),
            mode: Mutex::new(PromptMode::Immediate),
            transcript: Mutex::new(vec![
                Self::message(Role::User, "do the thing"),
                Self::message(Role::Assistant, "Mock response"),
            ]),
            create_error: Mutex::new(None),
            prompt_errors: Mutex::new(HashMap::new()),
            messages_error: Mutex::new(None),
            abort_error: Mutex::new(None),
            abort_tokens: Mutex::new(HashMap::new()),
            abort_tx: Mutex::new(None),
            created: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            async_prompts: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
        }
    }

    /// Helper: single text-part message
    pub fn message(role: Role, text: &str) -> SessionMessage {
        SessionMessage {
            role,
            parts: vec![MessagePart::text(text)],
        }
    }

    pub fn with_mode(self, mode: PromptMode) -> Self {
        *self.mode.lock() = mode;
        self
    }

    pub fn with_transcript(self, transcript: Vec<SessionMessage>) -> Self {
        *self.transcript.lock() = transcript;
        self
    }

    pub fn without_prompt_async(self) -> Self {
        self.supports_prompt_async.store(false, Ordering::SeqCst);
        self
    }

    pub fn failing_create(self, message: &str) -> Self {
        *self.create_error.lock() = Some(BackendError::Request(message.to_string()));
        self
    }

    pub fn failing_prompt_for(self, session_id: &str, error: BackendError) -> Self {
        self.prompt_errors.lock().insert(SessionId::from(session_id), error);
        self
    }

    pub fn failing_messages(self, message: &str) -> Self {
        *self.messages_error.lock() = Some(BackendError::Request(message.to_string()));
        self
    }

    pub fn failing_abort(self, message: &str) -> Self {
        *self.abort_error.lock() = Some(BackendError::Request(message.to_string()));
        self
    }

    /// Receive the id of every aborted session, as a real backend would report it
    pub fn subscribe_aborts(&self) -> mpsc::UnboundedReceiver<SessionId> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.abort_tx.lock() = Some(tx);
        rx
    }

    /// Notifications delivered through either prompt variant to `session_id`
    pub fn notifications_to(&self, session_id: &str) -> Vec<PromptRequest> {
        let target = SessionId::from(session_id);
        self.async_prompts
            .lock()
            .iter()
            .chain(self.prompts.lock().iter())
            .filter(|p| p.session_id == target)
            .cloned()
            .collect()
    }

    fn abort_token(&self, session_id: &SessionId) -> CancellationToken {
        self.abort_tokens
            .lock()
            .entry(session_id.clone())
            .or_default()
            .clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    async fn create_session(
        &self,
        parent_id: &SessionId,
        title: &str,
    ) -> Result<SessionId, BackendError> {
        if let Some(err) = self.create_error.lock().clone() {
            return Err(err);
        }
        let n = self.next_session.fetch_add(1, Ordering::SeqCst);
        let id = SessionId::new(format!("ses_child_{n}"));
        self.created.lock().push((parent_id.clone(), title.to_string()));
        Ok(id)
    }

    async fn prompt(&self, request: PromptRequest) -> Result<Vec<SessionMessage>, BackendError> {
        self.prompts.lock().push(request.clone());
        if let Some(err) = self.prompt_errors.lock().get(&request.session_id).cloned() {
            return Err(err);
        }

        let aborted = self.abort_token(&request.session_id);
        let mode = *self.mode.lock();
        let finished = match mode {
            PromptMode::Immediate => true,
            PromptMode::Delay(delay) => tokio::select! {
                () = tokio::time::sleep(delay) => true,
                () = aborted.cancelled() => false,
            },
            PromptMode::Hang => {
                aborted.cancelled().await;
                false
            }
        };

        if finished {
            Ok(self.transcript.lock().clone())
        } else {
            Err(BackendError::Request("MessageAbortedError".to_string()))
        }
    }

    async fn prompt_async(&self, request: PromptRequest) -> Result<(), BackendError> {
        if !self.supports_prompt_async.load(Ordering::SeqCst) {
            return Err(BackendError::Unsupported("prompt_async"));
        }
        self.async_prompts.lock().push(request);
        Ok(())
    }

    async fn messages(&self, _session_id: &SessionId) -> Result<Vec<SessionMessage>, BackendError> {
        if let Some(err) = self.messages_error.lock().clone() {
            return Err(err);
        }
        Ok(self.transcript.lock().clone())
    }

    async fn abort(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.aborted.lock().push(session_id.clone());
        if let Some(err) = self.abort_error.lock().clone() {
            return Err(err);
        }
        self.abort_token(session_id).cancel();
        if let Some(tx) = self.abort_tx.lock().as_ref() {
            let _ = tx.send(session_id.clone());
        }
        Ok(())
    }
}
