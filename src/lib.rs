//! # Errand
//!
//! Background agent task orchestration with hierarchical cancellation.
//!
//! An agent running in a session dispatches other agents to work in child
//! sessions of their own. Those children may dispatch further agents, so the
//! sessions form a tree rooted at the session a human talks to.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ORCHESTRATOR                          │
//! │  ┌─────────────┐  ┌──────────────┐  ┌──────────────────────┐ │
//! │  │ Tool surface│  │ Task Registry│  │ Interruption handler │ │
//! │  └─────────────┘  └──────┬───────┘  └──────────────────────┘ │
//! └──────────────────────────┼───────────────────────────────────┘
//!                            │ spawns one driver per task
//!          ┌─────────────────┼─────────────────┐
//!          ▼                 ▼                 ▼
//!   ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//!   │   Driver    │   │   Driver    │   │   Driver    │
//!   └──────┬──────┘   └──────┬──────┘   └──────┬──────┘
//!          └─────────────────┴─────────────────┘
//!                            ▼
//!                  SessionBackend (create, prompt,
//!                  messages, abort)
//! ```
//!
//! ## Key Concepts
//!
//! - **Task**: one dispatched unit of agent work and its lifecycle
//! - **Hierarchy**: which session dispatched which task, and where it runs
//! - **Interruption**: a user aborting a child session, which cancels its subtree
//! - **Notification**: a status message pushed back into the parent session

pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod hierarchy;
pub mod ids;
pub mod notify;
pub mod orchestrator;
pub mod registry;
pub mod signal;
pub mod task;
pub mod tools;

#[cfg(test)]
mod testing;

pub use backend::{BackendError, MessagePart, PromptRequest, Role, SessionBackend, SessionMessage};
pub use config::OrchestratorConfig;
pub use error::TaskError;
pub use event::SessionEvent;
pub use hierarchy::SessionHierarchy;
pub use ids::{SessionId, TaskId};
pub use orchestrator::{DispatchRequest, Orchestrator};
pub use task::{Task, TaskStatus};
pub use tools::ToolContext;
