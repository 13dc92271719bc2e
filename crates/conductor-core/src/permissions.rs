//! Brokering of peer permission requests.
//!
//! When the peer asks for permission, the orchestrator parks the peer's
//! continuation here under a generated request id and emits an event for
//! clients. Whoever resolves the entry first — an explicit client response or
//! the expiry timer — wins; removal from the pending map is the linearization
//! point, so exactly one resolution ever reaches the peer.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::AgentError;
use crate::protocol::types::{PermissionOutcome, PermissionRequest};

/// How long a pending request survives without a response.
pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// One permission request awaiting a decision.
pub struct PendingPermission {
    pub agent_id: String,
    pub session_id: String,
    pub request: PermissionRequest,
    responder: oneshot::Sender<PermissionOutcome>,
}

impl PendingPermission {
    /// Hand the outcome to the waiting protocol task. Consumes the entry, so
    /// double resolution is unrepresentable.
    pub fn resolve(self, outcome: PermissionOutcome) {
        let _ = self.responder.send(outcome);
    }
}

/// Registry of pending permission requests across all agents.
pub struct PermissionBroker {
    pending: std::sync::Mutex<HashMap<String, PendingPermission>>,
    timeout: Duration,
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PERMISSION_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            pending: std::sync::Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Park a request under a fresh id. Returns the id and the receiver the
    /// protocol task awaits for the outcome.
    pub fn register(
        &self,
        agent_id: &str,
        request: PermissionRequest,
    ) -> (String, oneshot::Receiver<PermissionOutcome>) {
        let request_id = Uuid::new_v4().to_string();
        let (responder, receiver) = oneshot::channel();

        let entry = PendingPermission {
            agent_id: agent_id.to_string(),
            session_id: request.session_id.clone(),
            request,
            responder,
        };
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), entry);

        (request_id, receiver)
    }

    /// Remove a pending entry, if it is still unresolved.
    pub fn take(&self, request_id: &str) -> Option<PendingPermission> {
        self.pending.lock().unwrap().remove(request_id)
    }

    /// Resolve a pending entry with the option a client selected.
    pub fn respond(&self, request_id: &str, option_id: &str) -> Result<(), AgentError> {
        let entry = self
            .take(request_id)
            .ok_or_else(|| AgentError::PermissionNotFound(request_id.to_string()))?;
        entry.resolve(PermissionOutcome::Selected {
            option_id: option_id.to_string(),
        });
        Ok(())
    }

    /// Ids of every pending request for one agent.
    pub fn pending_for(&self, agent_id: &str) -> Vec<String> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.agent_id == agent_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Default for PermissionBroker {
    fn default() -> Self {
        Self::new()
    }
}
