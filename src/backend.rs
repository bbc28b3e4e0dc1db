//! Session backend seam
//!
//! The backend owns the actual agent loop: it creates sessions, runs prompts
//! to completion and aborts sessions on request. The orchestrator only talks
//! to it through [`SessionBackend`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::SessionId;

/// Errors reported by the session backend
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The call was rejected or failed in transport
    #[error("{0}")]
    Request(String),

    /// The backend accepted the call but its response could not be parsed
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Optional operation not provided by this backend
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

/// Author of a session message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One part of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    #[serde(other)]
    Other,
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Other => None,
        }
    }
}

/// A message in a session transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl SessionMessage {
    /// Concatenated text of all text parts
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(MessagePart::as_text).collect()
    }
}

/// Prompt addressed to a session, spoken as a given agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub session_id: SessionId,
    pub agent: String,
    pub parts: Vec<MessagePart>,
}

impl PromptRequest {
    /// Single text-part prompt
    pub fn text(session_id: SessionId, agent: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id,
            agent: agent.into(),
            parts: vec![MessagePart::text(text)],
        }
    }
}

/// Remote session backend running agent loops
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Create a session as a child of `parent_id`
    async fn create_session(
        &self,
        parent_id: &SessionId,
        title: &str,
    ) -> Result<SessionId, BackendError>;

    /// Send a prompt and block until the agent loop finishes
    async fn prompt(&self, request: PromptRequest) -> Result<Vec<SessionMessage>, BackendError>;

    /// Send a prompt without waiting for the agent loop
    async fn prompt_async(&self, _request: PromptRequest) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("prompt_async"))
    }

    /// Ordered transcript of a session
    async fn messages(&self, session_id: &SessionId) -> Result<Vec<SessionMessage>, BackendError>;

    /// Abort whatever the session is doing; must be idempotent
    async fn abort(&self, session_id: &SessionId) -> Result<(), BackendError>;
}
