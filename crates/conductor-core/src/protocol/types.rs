//! Wire types for the peer protocol.
//!
//! The peer speaks line-delimited JSON-RPC 2.0 over its stdio. This module
//! defines the envelope plus the payloads for every method this core issues
//! or answers. Unknown notification shapes deserialize to `Unknown` so a newer
//! peer never breaks the read loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{StopReason, ToolStatus, TurnUsage};

/// Protocol revision this client implements.
pub const PROTOCOL_VERSION: u16 = 1;

// Methods issued by this core.
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_SESSION_NEW: &str = "session/new";
pub const METHOD_SESSION_LOAD: &str = "session/load";
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";
pub const METHOD_SESSION_CANCEL: &str = "session/cancel";
pub const METHOD_SESSION_SET_MODE: &str = "session/set_mode";

// Methods the peer issues back to us.
pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";
pub const METHOD_FS_READ: &str = "fs/read_text_file";
pub const METHOD_FS_WRITE: &str = "fs/write_text_file";
pub const METHOD_SESSION_UPDATE: &str = "session/update";

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

/// A raw JSON-RPC 2.0 message: request, response, or notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcMessage {
    pub fn request(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Some(Value::from(id)),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn response(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

// ============================================================================
// Client → peer
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: u16,
    pub client_capabilities: ClientCapabilities,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    pub fs: FsCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsCapabilities {
    pub read_text_file: bool,
    pub write_text_file: bool,
}

impl Default for FsCapabilities {
    fn default() -> Self {
        Self {
            read_text_file: true,
            write_text_file: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_capabilities: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionParams {
    pub cwd: String,
    #[serde(default)]
    pub mcp_servers: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResult {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modes: Option<SessionModeState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSessionParams {
    pub session_id: String,
    pub cwd: String,
    #[serde(default)]
    pub mcp_servers: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSessionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modes: Option<SessionModeState>,
}

/// The peer-advertised mode set for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionModeState {
    pub current_mode_id: String,
    #[serde(default)]
    pub available_modes: Vec<SessionMode>,
}

/// One peer-advertised behavior profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMode {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParams {
    pub session_id: String,
    pub prompt: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TurnUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModeParams {
    pub session_id: String,
    pub mode_id: String,
}

/// One block of prompt or streamed message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Unknown,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// The textual content, empty for non-text blocks.
    pub fn as_text(&self) -> &str {
        match self {
            ContentBlock::Text { text } => text,
            ContentBlock::Unknown => "",
        }
    }
}

// ============================================================================
// Peer → client
// ============================================================================

/// A peer request for permission to run a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub session_id: String,
    /// The original tool-call payload, kept verbatim for the client to render.
    pub tool_call: Value,
    pub options: Vec<PermissionOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Outcome returned to the peer for a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum PermissionOutcome {
    #[serde(rename_all = "camelCase")]
    Selected { option_id: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub outcome: PermissionOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadTextFileParams {
    pub session_id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadTextFileResult {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTextFileParams {
    pub session_id: String,
    pub path: String,
    pub content: String,
}

/// A `session/update` notification from the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: String,
    pub update: SessionUpdate,
}

/// The streamed update payloads a peer can send during (or while replaying) a
/// session. Fragments of one logical message arrive as separate chunks with no
/// shared identifier; the enrichment step assigns those.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    UserMessageChunk {
        content: ContentBlock,
    },
    AgentMessageChunk {
        content: ContentBlock,
    },
    AgentThoughtChunk {
        content: ContentBlock,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ToolStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallUpdate {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ToolStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<String>,
    },
    Plan {
        entries: Vec<PlanEntry>,
    },
    #[serde(rename_all = "camelCase")]
    CurrentModeUpdate {
        current_mode_id: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod envelope {
        use super::*;

        #[test]
        fn request_has_id_and_method() {
            let msg = RpcMessage::request(7, METHOD_INITIALIZE, json!({"x": 1}));
            let json = serde_json::to_value(&msg).unwrap();

            assert_eq!(json["jsonrpc"], "2.0");
            assert_eq!(json["id"], 7);
            assert_eq!(json["method"], "initialize");
            assert_eq!(json["params"]["x"], 1);
            assert!(json.get("result").is_none());
        }

        #[test]
        fn notification_has_no_id() {
            let msg = RpcMessage::notification(METHOD_SESSION_CANCEL, json!({}));
            let json = serde_json::to_value(&msg).unwrap();
            assert!(json.get("id").is_none());
        }

        #[test]
        fn error_response_roundtrip() {
            let msg = RpcMessage::error_response(
                Value::from(3),
                RpcError::new(RpcError::METHOD_NOT_FOUND, "no such method"),
            );
            let text = serde_json::to_string(&msg).unwrap();
            let parsed: RpcMessage = serde_json::from_str(&text).unwrap();

            assert_eq!(parsed.error.unwrap().code, RpcError::METHOD_NOT_FOUND);
        }
    }

    mod session_update {
        use super::*;

        #[test]
        fn agent_message_chunk_parses() {
            let json = r#"{
                "sessionId": "sess-1",
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": {"type": "text", "text": "Hello"}
                }
            }"#;

            let parsed: SessionNotification = serde_json::from_str(json).unwrap();
            assert_eq!(parsed.session_id, "sess-1");
            match parsed.update {
                SessionUpdate::AgentMessageChunk { content } => {
                    assert_eq!(content.as_text(), "Hello");
                }
                _ => panic!("Expected AgentMessageChunk"),
            }
        }

        #[test]
        fn tool_call_parses_with_camel_case_fields() {
            let json = r#"{
                "sessionId": "sess-1",
                "update": {
                    "sessionUpdate": "tool_call",
                    "toolCallId": "call-9",
                    "title": "shell",
                    "kind": "execute",
                    "status": "running",
                    "rawInput": {"command": "ls"}
                }
            }"#;

            let parsed: SessionNotification = serde_json::from_str(json).unwrap();
            match parsed.update {
                SessionUpdate::ToolCall {
                    tool_call_id,
                    title,
                    status,
                    raw_input,
                    ..
                } => {
                    assert_eq!(tool_call_id.as_deref(), Some("call-9"));
                    assert_eq!(title, "shell");
                    assert_eq!(status, Some(ToolStatus::Running));
                    assert_eq!(raw_input.unwrap()["command"], "ls");
                }
                _ => panic!("Expected ToolCall"),
            }
        }

        #[test]
        fn unknown_update_kind_is_tolerated() {
            let json = r#"{
                "sessionId": "sess-1",
                "update": {"sessionUpdate": "available_commands_update"}
            }"#;

            let parsed: SessionNotification = serde_json::from_str(json).unwrap();
            assert!(matches!(parsed.update, SessionUpdate::Unknown));
        }

        #[test]
        fn plan_entries_parse() {
            let json = r#"{
                "sessionId": "sess-1",
                "update": {
                    "sessionUpdate": "plan",
                    "entries": [
                        {"content": "Write tests", "status": "pending"},
                        {"content": "Fix bug", "status": "completed"}
                    ]
                }
            }"#;

            let parsed: SessionNotification = serde_json::from_str(json).unwrap();
            match parsed.update {
                SessionUpdate::Plan { entries } => {
                    assert_eq!(entries.len(), 2);
                    assert_eq!(entries[1].status.as_deref(), Some("completed"));
                }
                _ => panic!("Expected Plan"),
            }
        }
    }

    mod permission {
        use super::*;

        #[test]
        fn outcome_selected_serializes_with_tag() {
            let outcome = PermissionOutcome::Selected {
                option_id: "allow-once".to_string(),
            };
            let json = serde_json::to_value(&outcome).unwrap();
            assert_eq!(json["outcome"], "selected");
            assert_eq!(json["optionId"], "allow-once");
        }

        #[test]
        fn request_roundtrip() {
            let request = PermissionRequest {
                session_id: "sess-1".to_string(),
                tool_call: json!({"title": "shell", "rawInput": {"command": "rm -rf build"}}),
                options: vec![PermissionOption {
                    option_id: "allow".to_string(),
                    name: "Allow".to_string(),
                    kind: Some("allow_once".to_string()),
                }],
            };

            let text = serde_json::to_string(&request).unwrap();
            let parsed: PermissionRequest = serde_json::from_str(&text).unwrap();
            assert_eq!(parsed, request);
        }
    }
}
