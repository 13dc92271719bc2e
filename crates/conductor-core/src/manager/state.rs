//! Per-agent state.
//!
//! [`AgentState`] is a genuine sum type: a runtime handle only exists in the
//! states that actually have one, so combinations like "ready with no
//! session" are unrepresentable. The runtime moves between variants as the
//! agent transitions; at most one runtime ever exists per agent.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde::Serialize;

use crate::bus::SubscriberBus;
use crate::enrich::EventEnricher;
use crate::events::{AgentEvent, AgentStatus, AgentUpdate, StopReason};
use crate::persistence::AgentOptions;
use crate::protocol::host::AgentConnection;
use crate::protocol::types::SessionMode;
use crate::spawn::AgentProcess;

/// The memoized outcome every concurrent initializer awaits. The error side
/// is a plain message so the future stays cloneable.
pub type InitFuture = Shared<BoxFuture<'static, Result<(), String>>>;

/// Live resources for an initialized agent: one subprocess, one protocol
/// connection, one peer session.
pub struct AgentRuntime {
    pub process: AgentProcess,
    pub connection: Arc<dyn AgentConnection>,
    pub session_id: String,
    pub current_mode_id: Option<String>,
    pub available_modes: Vec<SessionMode>,
}

/// Lifecycle state machine for one agent.
pub enum AgentState {
    Uninitialized {
        persisted_session_id: Option<String>,
    },
    Initializing {
        started_at: DateTime<Utc>,
        in_flight: InitFuture,
    },
    Ready {
        runtime: AgentRuntime,
    },
    Processing {
        runtime: AgentRuntime,
        /// Sequence number of the active turn; a completion observed for an
        /// older turn must not transition the state.
        turn: u64,
    },
    Completed {
        runtime: AgentRuntime,
        stop_reason: StopReason,
    },
    Failed {
        last_error: String,
        runtime: Option<AgentRuntime>,
    },
    Killed,
}

impl AgentState {
    pub fn status(&self) -> AgentStatus {
        match self {
            AgentState::Uninitialized { .. } => AgentStatus::Uninitialized,
            AgentState::Initializing { .. } => AgentStatus::Initializing,
            AgentState::Ready { .. } => AgentStatus::Ready,
            AgentState::Processing { .. } => AgentStatus::Processing,
            AgentState::Completed { .. } => AgentStatus::Completed,
            AgentState::Failed { .. } => AgentStatus::Failed,
            AgentState::Killed => AgentStatus::Killed,
        }
    }

    pub fn runtime(&self) -> Option<&AgentRuntime> {
        match self {
            AgentState::Ready { runtime }
            | AgentState::Processing { runtime, .. }
            | AgentState::Completed { runtime, .. } => Some(runtime),
            AgentState::Failed { runtime, .. } => runtime.as_ref(),
            _ => None,
        }
    }

    pub fn runtime_mut(&mut self) -> Option<&mut AgentRuntime> {
        match self {
            AgentState::Ready { runtime }
            | AgentState::Processing { runtime, .. }
            | AgentState::Completed { runtime, .. } => Some(runtime),
            AgentState::Failed { runtime, .. } => runtime.as_mut(),
            _ => None,
        }
    }

    /// Consume the state, surrendering its runtime if it holds one.
    pub fn into_runtime(self) -> Option<AgentRuntime> {
        match self {
            AgentState::Ready { runtime }
            | AgentState::Processing { runtime, .. }
            | AgentState::Completed { runtime, .. } => Some(runtime),
            AgentState::Failed { runtime, .. } => runtime,
            _ => None,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match self {
            AgentState::Failed { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}

/// One managed agent. Owned exclusively by the lifecycle manager; everything
/// else observes it through snapshots and the subscriber bus.
pub struct ManagedAgent {
    pub id: String,
    pub cwd: String,
    pub created_at: DateTime<Utc>,
    pub options: AgentOptions,
    pub title: std::sync::Mutex<String>,
    pub state: tokio::sync::Mutex<AgentState>,
    pub bus: SubscriberBus,
    /// Per-turn message/thought ids; touched only by the enrichment step.
    pub enricher: std::sync::Mutex<EventEnricher>,
    /// Mode requested before initialization finished; applied on `Ready`.
    pub queued_mode: std::sync::Mutex<Option<String>>,
    pub turn_seq: AtomicU64,
}

impl ManagedAgent {
    pub fn new(
        id: String,
        cwd: String,
        options: AgentOptions,
        title: String,
        created_at: DateTime<Utc>,
        persisted_session_id: Option<String>,
    ) -> Self {
        Self {
            id,
            cwd,
            created_at,
            options,
            title: std::sync::Mutex::new(title),
            state: tokio::sync::Mutex::new(AgentState::Uninitialized {
                persisted_session_id,
            }),
            bus: SubscriberBus::new(),
            enricher: std::sync::Mutex::new(EventEnricher::new()),
            queued_mode: std::sync::Mutex::new(None),
            turn_seq: AtomicU64::new(0),
        }
    }

    /// Stamp and fan out one event for this agent. Fan-out is channel-based,
    /// so a broken subscriber fails in its own task, never here.
    pub fn publish(&self, event: AgentEvent) {
        let update = AgentUpdate::new(self.id.clone(), event);
        self.bus.publish(update);
    }
}

/// Read model of one agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub id: String,
    pub provider: String,
    pub cwd: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_mode_id: Option<String>,
    pub available_modes: Vec<SessionMode>,
    pub pending_permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uninitialized_agent() -> ManagedAgent {
        ManagedAgent::new(
            "agent-1".to_string(),
            "/tmp".to_string(),
            AgentOptions::new("claude"),
            "Test agent".to_string(),
            Utc::now(),
            None,
        )
    }

    #[test]
    fn state_status_mapping() {
        assert_eq!(
            AgentState::Uninitialized {
                persisted_session_id: None
            }
            .status(),
            AgentStatus::Uninitialized
        );
        assert_eq!(AgentState::Killed.status(), AgentStatus::Killed);
        assert_eq!(
            AgentState::Failed {
                last_error: "boom".to_string(),
                runtime: None
            }
            .status(),
            AgentStatus::Failed
        );
    }

    #[test]
    fn failed_state_exposes_last_error() {
        let state = AgentState::Failed {
            last_error: "spawn failed".to_string(),
            runtime: None,
        };
        assert_eq!(state.last_error(), Some("spawn failed"));
        assert!(AgentState::Killed.last_error().is_none());
    }

    #[test]
    fn states_without_runtime_yield_none() {
        assert!(AgentState::Killed.into_runtime().is_none());
        assert!(AgentState::Uninitialized {
            persisted_session_id: None
        }
        .into_runtime()
        .is_none());
    }

    #[tokio::test]
    async fn publish_lands_in_history() {
        let agent = uninitialized_agent();
        agent.publish(AgentEvent::TurnStarted);

        let history = agent.bus.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].agent_id, "agent-1");
    }
}
