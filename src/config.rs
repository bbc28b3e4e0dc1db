//! Orchestrator configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Tunables for the task registry and the tool surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Finished tasks older than this are evicted
    pub task_ttl_secs: u64,
    /// Registry capacity
    pub max_tasks: usize,
    /// Result and error text beyond this many characters is cut from the front
    pub max_result_chars: usize,
    /// Wait bound used when the caller gives none
    pub default_wait_timeout_secs: u64,
    /// Persona used for notifications when the dispatching context has no agent
    pub default_parent_agent: String,
    /// Instruction characters shown in the child session title
    pub title_preview_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_ttl_secs: 7 * 24 * 60 * 60,
            max_tasks: 50,
            max_result_chars: 256 * 1024,
            default_wait_timeout_secs: 300,
            default_parent_agent: "coder".to_string(),
            title_preview_chars: 50,
        }
    }
}

impl OrchestratorConfig {
    /// Parse from JSON; missing keys take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, TaskError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TaskError::Config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TaskError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TaskError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Reject values the registry cannot work with
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.max_tasks == 0 {
            return Err(TaskError::Config("max_tasks must be at least 1".into()));
        }
        if self.max_result_chars == 0 {
            return Err(TaskError::Config("max_result_chars must be at least 1".into()));
        }
        Ok(())
    }

    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub fn with_max_result_chars(mut self, max_result_chars: usize) -> Self {
        self.max_result_chars = max_result_chars;
        self
    }

    pub fn with_task_ttl(mut self, ttl: Duration) -> Self {
        self.task_ttl_secs = ttl.as_secs();
        self
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.default_wait_timeout_secs)
    }
}
