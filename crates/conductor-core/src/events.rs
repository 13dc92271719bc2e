//! Outbound update stream shared by the orchestrator and the timeline reducer.
//!
//! Everything an agent does is reported as an [`AgentUpdate`] — a timestamped
//! [`AgentEvent`] tagged with the agent id. The same stream feeds live
//! subscribers and bulk hydration after a reconnect, so every payload here is
//! plain serializable data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::types::PermissionRequest;

/// Read-model status of a managed agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Uninitialized,
    Initializing,
    Ready,
    Processing,
    Completed,
    Failed,
    Killed,
}

/// Why a prompt turn stopped, as reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
    Other,
}

// Manual impl so a newer peer's stop reason degrades to `Other` instead of
// failing the whole prompt response.
impl<'de> Deserialize<'de> for StopReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(match value.as_str() {
            "end_turn" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            "max_turn_requests" => StopReason::MaxTurnRequests,
            "refusal" => StopReason::Refusal,
            "cancelled" => StopReason::Cancelled,
            _ => StopReason::Other,
        })
    }
}

/// Token usage reported by the peer at the end of a turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// Execution status of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ToolStatus {
    /// Terminal statuses never regress back to `Running`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ToolStatus::Running)
    }
}

/// One entry of the agent's working todo list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

/// How a pending permission request was settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PermissionResolution {
    Selected { option_id: String },
    TimedOut,
    /// The agent went away before anyone answered.
    Cancelled,
}

/// Payload of a `timeline_item` event: one unit of agent activity as it
/// crossed the wire. The reducer folds these into [`crate::timeline::StreamItem`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TimelineEvent {
    UserMessage {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        text: String,
    },
    AssistantChunk {
        id: String,
        text: String,
    },
    ThoughtChunk {
        id: String,
        text: String,
    },
    ToolCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<ToolStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Peer-reported tool kind hint (read/edit/execute/search/...).
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_kind: Option<String>,
        /// Originating tool server, when the peer reports one.
        #[serde(skip_serializing_if = "Option::is_none")]
        server: Option<String>,
    },
    TodoUpdate {
        items: Vec<TodoItem>,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// One event on an agent's outbound stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AgentEvent {
    /// The protocol session is established and has an id.
    ThreadStarted { session_id: String },

    TurnStarted,

    TurnCompleted {
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TurnUsage>,
    },

    TurnFailed { error: String },

    TurnCanceled { reason: String },

    TimelineItem { item: TimelineEvent },

    PermissionRequested {
        request_id: String,
        request: PermissionRequest,
    },

    PermissionResolved {
        request_id: String,
        resolution: PermissionResolution,
    },

    /// Lifecycle transition. The timeline reducer ignores these.
    StateChanged { status: AgentStatus },

    #[serde(other)]
    Unknown,
}

/// A timestamped event tagged with its agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUpdate {
    pub agent_id: String,
    pub event: AgentEvent,
    pub timestamp: DateTime<Utc>,
}

impl AgentUpdate {
    pub fn new(agent_id: impl Into<String>, event: AgentEvent) -> Self {
        Self {
            agent_id: agent_id.into(),
            event,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod serialization {
        use super::*;

        #[test]
        fn turn_completed_roundtrip() {
            let event = AgentEvent::TurnCompleted {
                usage: Some(TurnUsage {
                    input_tokens: Some(120),
                    output_tokens: Some(48),
                }),
            };

            let json = serde_json::to_string(&event).unwrap();
            assert!(json.contains("turnCompleted"));

            let parsed: AgentEvent = serde_json::from_str(&json).unwrap();
            match parsed {
                AgentEvent::TurnCompleted { usage } => {
                    assert_eq!(usage.unwrap().input_tokens, Some(120));
                }
                _ => panic!("Expected TurnCompleted"),
            }
        }

        #[test]
        fn timeline_item_tool_call_skips_none_fields() {
            let event = AgentEvent::TimelineItem {
                item: TimelineEvent::ToolCall {
                    call_id: Some("call-1".to_string()),
                    name: Some("shell".to_string()),
                    status: None,
                    input: Some(json!({"command": "ls"})),
                    output: None,
                    error: None,
                    tool_kind: None,
                    server: None,
                },
            };

            let json = serde_json::to_string(&event).unwrap();
            assert!(!json.contains("output"));
            assert!(!json.contains("server"));
            assert!(json.contains("call-1"));
        }

        #[test]
        fn unknown_event_kind_deserializes_to_unknown() {
            let json = r#"{"kind":"somethingNewer","payload":{"x":1}}"#;
            let parsed: AgentEvent = serde_json::from_str(json).unwrap();
            assert!(matches!(parsed, AgentEvent::Unknown));
        }

        #[test]
        fn unknown_timeline_kind_deserializes_to_unknown() {
            let json = r#"{"kind":"holograph"}"#;
            let parsed: TimelineEvent = serde_json::from_str(json).unwrap();
            assert!(matches!(parsed, TimelineEvent::Unknown));
        }

        #[test]
        fn stop_reason_unknown_value_maps_to_other() {
            let parsed: StopReason = serde_json::from_str(r#""exotic_reason""#).unwrap();
            assert_eq!(parsed, StopReason::Other);
        }

        #[test]
        fn agent_update_roundtrip() {
            let update = AgentUpdate::new("agent-1", AgentEvent::TurnStarted);
            let json = serde_json::to_string(&update).unwrap();
            let parsed: AgentUpdate = serde_json::from_str(&json).unwrap();

            assert_eq!(parsed.agent_id, "agent-1");
            assert!(matches!(parsed.event, AgentEvent::TurnStarted));
            assert_eq!(parsed.timestamp, update.timestamp);
        }
    }

    mod tool_status {
        use super::*;

        #[test]
        fn running_is_not_terminal() {
            assert!(!ToolStatus::Running.is_terminal());
        }

        #[test]
        fn completed_failed_canceled_are_terminal() {
            assert!(ToolStatus::Completed.is_terminal());
            assert!(ToolStatus::Failed.is_terminal());
            assert!(ToolStatus::Canceled.is_terminal());
        }
    }
}
