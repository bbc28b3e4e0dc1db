//! Session events observed from the backend's event stream

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;

/// Event type carrying session errors
pub const SESSION_ERROR: &str = "session.error";

/// Error name the backend uses when a running message is aborted
pub const MESSAGE_ABORTED: &str = "MessageAbortedError";

/// Raw backend event; only the fields the orchestrator reacts to are typed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: Value,
}

/// Properties of a `session.error` event
#[derive(Debug, Clone, Default, Deserialize)]
struct SessionErrorProperties {
    #[serde(rename = "sessionID")]
    session_id: Option<SessionId>,
    error: Option<EventError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EventError {
    name: Option<String>,
}

impl SessionEvent {
    /// Build a "message aborted" event for a session
    pub fn message_aborted(session_id: &SessionId) -> Self {
        Self {
            kind: SESSION_ERROR.to_string(),
            properties: serde_json::json!({
                "sessionID": session_id,
                "error": { "name": MESSAGE_ABORTED, "data": { "message": "The operation was aborted." } },
            }),
        }
    }

    /// Session named by a "message aborted" interruption, if this is one
    pub fn aborted_session(&self) -> Option<SessionId> {
        if self.kind != SESSION_ERROR {
            return None;
        }
        let props: SessionErrorProperties = serde_json::from_value(self.properties.clone()).ok()?;
        let is_abort = props
            .error
            .and_then(|e| e.name)
            .is_some_and(|name| name == MESSAGE_ABORTED);
        if is_abort {
            props.session_id
        } else {
            None
        }
    }
}
