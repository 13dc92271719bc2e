//! Error taxonomy for agent orchestration.

use thiserror::Error;

use crate::events::AgentStatus;

#[derive(Error, Debug)]
pub enum AgentError {
    /// The working directory failed pre-spawn validation. No process was started.
    #[error("Working directory unavailable: {path}: {reason}")]
    DirectoryUnavailable { path: String, reason: String },

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(String),

    /// The subprocess died while the agent was not in a terminal state.
    #[error("Agent process exited unexpectedly: {0}")]
    ProcessExited(String),

    #[error("Protocol handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Failed to load session {session_id}: {reason}")]
    SessionLoadFailed { session_id: String, reason: String },

    #[error("Prompt failed: {0}")]
    PromptFailed(String),

    /// The peer declined the request outright.
    #[error("Agent refused the request: {0}")]
    Refused(String),

    #[error("Session mode {mode_id} is not available (available: {available:?})")]
    ModeUnavailable {
        mode_id: String,
        available: Vec<String>,
    },

    #[error("No pending permission request with id {0}")]
    PermissionNotFound(String),

    #[error("Permission request {0} timed out")]
    PermissionTimeout(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// The agent exists but its state rules out the requested operation.
    #[error("Agent is {status:?}: {reason}")]
    Unavailable { status: AgentStatus, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Store(#[from] crate::persistence::StoreError),
}
