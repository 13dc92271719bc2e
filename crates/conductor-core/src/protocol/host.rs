//! Trait seams between the protocol layer and the orchestrator.
//!
//! The protocol layer holds no business concepts: the orchestrator hands it an
//! [`AgentHost`] for peer-initiated callbacks, and talks back through
//! [`AgentConnection`]. Keeping both behind traits lets tests drive the
//! lifecycle manager with a scripted peer and no subprocess.

use async_trait::async_trait;

use crate::error::AgentError;
use crate::protocol::types::{
    InitializeResult, LoadSessionResult, NewSessionResult, PermissionOutcome, PermissionRequest,
    PromptResult, ReadTextFileParams, SessionNotification, WriteTextFileParams,
};

/// Callback surface this core implements for the peer.
#[async_trait]
pub trait AgentHost: Send + Sync {
    /// The peer wants permission to run a tool. Resolves once a client
    /// responds or the request times out.
    async fn request_permission(&self, request: PermissionRequest) -> PermissionOutcome;

    async fn read_text_file(&self, params: ReadTextFileParams) -> Result<String, String>;

    async fn write_text_file(&self, params: WriteTextFileParams) -> Result<(), String>;

    /// A streamed session update. Called in wire order.
    async fn session_update(&self, notification: SessionNotification);
}

/// RPCs this core issues to the peer.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    async fn initialize(&self) -> Result<InitializeResult, AgentError>;

    async fn new_session(&self, cwd: &str) -> Result<NewSessionResult, AgentError>;

    async fn load_session(
        &self,
        session_id: &str,
        cwd: &str,
    ) -> Result<LoadSessionResult, AgentError>;

    async fn prompt(&self, session_id: &str, text: &str) -> Result<PromptResult, AgentError>;

    /// Fire-and-forget: the peer acknowledges by ending the in-flight prompt
    /// with a `cancelled` stop reason.
    async fn cancel(&self, session_id: &str) -> Result<(), AgentError>;

    async fn set_session_mode(&self, session_id: &str, mode_id: &str) -> Result<(), AgentError>;
}
