//! Line-delimited JSON-RPC client for the agent peer.
//!
//! One [`ProtocolClient`] owns one peer connection: a writer (the subprocess
//! stdin), a reader (its stdout), a map of pending requests awaiting replies,
//! and a read loop that routes every inbound line. Peer-initiated requests are
//! dispatched to the [`AgentHost`] on their own tasks so a slow permission
//! decision never stalls the stream; `session/update` notifications are
//! delivered inline to preserve wire order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::logging::{log_line, LogHandle};
use crate::protocol::host::{AgentConnection, AgentHost};
use crate::protocol::types::{
    CancelParams, ClientCapabilities, ContentBlock, InitializeParams, InitializeResult,
    LoadSessionParams, LoadSessionResult, NewSessionParams, NewSessionResult, PermissionResponse,
    PromptParams, PromptResult, ReadTextFileResult, RpcError, RpcMessage, SetModeParams,
    METHOD_FS_READ, METHOD_FS_WRITE, METHOD_INITIALIZE, METHOD_REQUEST_PERMISSION,
    METHOD_SESSION_CANCEL, METHOD_SESSION_LOAD, METHOD_SESSION_NEW, METHOD_SESSION_PROMPT,
    METHOD_SESSION_SET_MODE, METHOD_SESSION_UPDATE, PROTOCOL_VERSION,
};

type PendingMap = std::sync::Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>;

struct ClientInner {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    pending: PendingMap,
    next_id: AtomicU64,
    host: Arc<dyn AgentHost>,
    wire_log: LogHandle,
}

/// JSON-RPC connection to one agent subprocess.
pub struct ProtocolClient {
    inner: Arc<ClientInner>,
    read_task: JoinHandle<()>,
}

impl ProtocolClient {
    /// Wire a connection over the given reader/writer pair and start the read
    /// loop. The reader is normally the subprocess stdout and the writer its
    /// stdin; tests substitute in-memory duplex streams.
    pub fn new<R, W>(reader: R, writer: W, host: Arc<dyn AgentHost>, wire_log: LogHandle) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let inner = Arc::new(ClientInner {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: std::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            host,
            wire_log,
        });

        let read_inner = Arc::clone(&inner);
        let read_task = tokio::spawn(async move {
            read_loop(read_inner, reader).await;
        });

        Self { inner, read_task }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

async fn read_loop<R>(inner: Arc<ClientInner>, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                log::warn!("agent stream read error: {}", err);
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        log_line(&inner.wire_log, "RECV", trimmed);

        let message: RpcMessage = match serde_json::from_str(trimmed) {
            Ok(m) => m,
            Err(err) => {
                log::warn!("ignoring unparseable agent message: {}", err);
                continue;
            }
        };

        match (message.method, message.id) {
            (Some(method), Some(id)) => {
                // Peer-initiated request. Handled off-loop: permission
                // decisions can take minutes.
                let task_inner = Arc::clone(&inner);
                let params = message.params.unwrap_or(Value::Null);
                tokio::spawn(async move {
                    let result = dispatch_peer_request(&task_inner, &method, params).await;
                    task_inner.respond(id, result).await;
                });
            }
            (Some(method), None) => {
                handle_notification(&inner, &method, message.params).await;
            }
            (None, Some(id)) => {
                inner.resolve(&id, message.result, message.error);
            }
            (None, None) => {
                log::warn!("agent message has neither method nor id");
            }
        }
    }

    // Connection gone: every caller still waiting gets an error.
    inner.pending.lock().unwrap().clear();
}

async fn handle_notification(inner: &Arc<ClientInner>, method: &str, params: Option<Value>) {
    match method {
        METHOD_SESSION_UPDATE => {
            let params = params.unwrap_or(Value::Null);
            match serde_json::from_value(params) {
                Ok(notification) => inner.host.session_update(notification).await,
                Err(err) => log::warn!("malformed session/update notification: {}", err),
            }
        }
        other => {
            log::debug!("ignoring notification {}", other);
        }
    }
}

async fn dispatch_peer_request(
    inner: &Arc<ClientInner>,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    match method {
        METHOD_REQUEST_PERMISSION => {
            let request = serde_json::from_value(params)
                .map_err(|e| RpcError::new(RpcError::INVALID_PARAMS, e.to_string()))?;
            let outcome = inner.host.request_permission(request).await;
            serde_json::to_value(PermissionResponse { outcome })
                .map_err(|e| RpcError::new(RpcError::INTERNAL_ERROR, e.to_string()))
        }
        METHOD_FS_READ => {
            let params = serde_json::from_value(params)
                .map_err(|e| RpcError::new(RpcError::INVALID_PARAMS, e.to_string()))?;
            let content = inner
                .host
                .read_text_file(params)
                .await
                .map_err(|e| RpcError::new(RpcError::INTERNAL_ERROR, e))?;
            serde_json::to_value(ReadTextFileResult { content })
                .map_err(|e| RpcError::new(RpcError::INTERNAL_ERROR, e.to_string()))
        }
        METHOD_FS_WRITE => {
            let params = serde_json::from_value(params)
                .map_err(|e| RpcError::new(RpcError::INVALID_PARAMS, e.to_string()))?;
            inner
                .host
                .write_text_file(params)
                .await
                .map_err(|e| RpcError::new(RpcError::INTERNAL_ERROR, e))?;
            Ok(Value::Null)
        }
        other => Err(RpcError::new(
            RpcError::METHOD_NOT_FOUND,
            format!("unknown method {}", other),
        )),
    }
}

impl ClientInner {
    async fn request(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let message = RpcMessage::request(id, method, params);
        if let Err(err) = self.write_message(&message).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(AgentError::Protocol(format!("{}: {}", method, err))),
            Err(_) => Err(AgentError::Protocol(format!(
                "{}: connection closed before response",
                method
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), AgentError> {
        self.write_message(&RpcMessage::notification(method, params))
            .await
    }

    async fn respond(&self, id: Value, result: Result<Value, RpcError>) {
        let message = match result {
            Ok(value) => RpcMessage::response(id, value),
            Err(err) => RpcMessage::error_response(id, err),
        };
        if let Err(err) = self.write_message(&message).await {
            log::warn!("failed to send response to agent: {}", err);
        }
    }

    fn resolve(&self, id: &Value, result: Option<Value>, error: Option<RpcError>) {
        let Some(id) = id.as_u64() else {
            log::warn!("agent response with non-numeric id {}", id);
            return;
        };
        let Some(sender) = self.pending.lock().unwrap().remove(&id) else {
            log::warn!("agent response for unknown request id {}", id);
            return;
        };
        let outcome = match error {
            Some(err) => Err(err),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = sender.send(outcome);
    }

    async fn write_message(&self, message: &RpcMessage) -> Result<(), AgentError> {
        let text =
            serde_json::to_string(message).map_err(|e| AgentError::Protocol(e.to_string()))?;
        log_line(&self.wire_log, "SEND", &text);

        let mut writer = self.writer.lock().await;
        writer
            .write_all(text.as_bytes())
            .await
            .map_err(|e| AgentError::Protocol(format!("write failed: {}", e)))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| AgentError::Protocol(format!("write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| AgentError::Protocol(format!("flush failed: {}", e)))?;
        Ok(())
    }
}

fn parse_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, AgentError> {
    serde_json::from_value(value)
        .map_err(|e| AgentError::Protocol(format!("malformed {} result: {}", method, e)))
}

#[async_trait]
impl AgentConnection for ProtocolClient {
    async fn initialize(&self) -> Result<InitializeResult, AgentError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            client_capabilities: ClientCapabilities::default(),
        };
        let value = self
            .inner
            .request(METHOD_INITIALIZE, serde_json::to_value(params).unwrap_or(Value::Null))
            .await?;
        parse_result(METHOD_INITIALIZE, value)
    }

    async fn new_session(&self, cwd: &str) -> Result<NewSessionResult, AgentError> {
        let params = NewSessionParams {
            cwd: cwd.to_string(),
            mcp_servers: Vec::new(),
        };
        let value = self
            .inner
            .request(METHOD_SESSION_NEW, serde_json::to_value(params).unwrap_or(Value::Null))
            .await?;
        parse_result(METHOD_SESSION_NEW, value)
    }

    async fn load_session(
        &self,
        session_id: &str,
        cwd: &str,
    ) -> Result<LoadSessionResult, AgentError> {
        let params = LoadSessionParams {
            session_id: session_id.to_string(),
            cwd: cwd.to_string(),
            mcp_servers: Vec::new(),
        };
        let value = self
            .inner
            .request(METHOD_SESSION_LOAD, serde_json::to_value(params).unwrap_or(Value::Null))
            .await?;
        parse_result(METHOD_SESSION_LOAD, value)
    }

    async fn prompt(&self, session_id: &str, text: &str) -> Result<PromptResult, AgentError> {
        let params = PromptParams {
            session_id: session_id.to_string(),
            prompt: vec![ContentBlock::text(text)],
        };
        let value = self
            .inner
            .request(METHOD_SESSION_PROMPT, serde_json::to_value(params).unwrap_or(Value::Null))
            .await?;
        parse_result(METHOD_SESSION_PROMPT, value)
    }

    async fn cancel(&self, session_id: &str) -> Result<(), AgentError> {
        let params = CancelParams {
            session_id: session_id.to_string(),
        };
        self.inner
            .notify(METHOD_SESSION_CANCEL, serde_json::to_value(params).unwrap_or(Value::Null))
            .await
    }

    async fn set_session_mode(&self, session_id: &str, mode_id: &str) -> Result<(), AgentError> {
        let params = SetModeParams {
            session_id: session_id.to_string(),
            mode_id: mode_id.to_string(),
        };
        self.inner
            .request(METHOD_SESSION_SET_MODE, serde_json::to_value(params).unwrap_or(Value::Null))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::null_log;
    use crate::protocol::types::{
        PermissionOutcome, PermissionRequest, ReadTextFileParams, SessionNotification,
        WriteTextFileParams,
    };
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Host that records updates and answers permissions with a fixed option.
    struct RecordingHost {
        updates: std::sync::Mutex<Vec<SessionNotification>>,
        permission_choice: String,
    }

    impl RecordingHost {
        fn new(choice: &str) -> Arc<Self> {
            Arc::new(Self {
                updates: std::sync::Mutex::new(Vec::new()),
                permission_choice: choice.to_string(),
            })
        }
    }

    #[async_trait]
    impl AgentHost for RecordingHost {
        async fn request_permission(&self, _request: PermissionRequest) -> PermissionOutcome {
            PermissionOutcome::Selected {
                option_id: self.permission_choice.clone(),
            }
        }

        async fn read_text_file(&self, params: ReadTextFileParams) -> Result<String, String> {
            Ok(format!("contents of {}", params.path))
        }

        async fn write_text_file(&self, _params: WriteTextFileParams) -> Result<(), String> {
            Ok(())
        }

        async fn session_update(&self, notification: SessionNotification) {
            self.updates.lock().unwrap().push(notification);
        }
    }

    fn connect(host: Arc<dyn AgentHost>) -> (ProtocolClient, DuplexStream) {
        let (client_side, peer_side) = duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(client_side);
        let client = ProtocolClient::new(read_half, write_half, host, null_log());
        (client, peer_side)
    }

    async fn read_json(reader: &mut BufReader<tokio::io::ReadHalf<DuplexStream>>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn initialize_round_trip() {
        let host = RecordingHost::new("allow");
        let (client, peer) = connect(host);
        let (peer_read, mut peer_write) = tokio::io::split(peer);
        let mut peer_reader = BufReader::new(peer_read);

        let peer_task = tokio::spawn(async move {
            let request = read_json(&mut peer_reader).await;
            assert_eq!(request["method"], "initialize");
            assert_eq!(request["params"]["protocolVersion"], 1);

            let response = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"protocolVersion": 1}
            });
            peer_write
                .write_all(format!("{}\n", response).as_bytes())
                .await
                .unwrap();
            (peer_reader, peer_write)
        });

        let result = client.initialize().await.unwrap();
        assert_eq!(result.protocol_version, 1);
        peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn session_updates_arrive_in_wire_order() {
        let host = RecordingHost::new("allow");
        let (client, peer) = connect(host.clone());
        let (_peer_read, mut peer_write) = tokio::io::split(peer);

        for text in ["first", "second", "third"] {
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {
                    "sessionId": "sess-1",
                    "update": {
                        "sessionUpdate": "agent_message_chunk",
                        "content": {"type": "text", "text": text}
                    }
                }
            });
            peer_write
                .write_all(format!("{}\n", notification).as_bytes())
                .await
                .unwrap();
        }
        peer_write.flush().await.unwrap();

        // Give the read loop a moment to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let updates = host.updates.lock().unwrap();
        let texts: Vec<&str> = updates
            .iter()
            .map(|n| match &n.update {
                crate::protocol::types::SessionUpdate::AgentMessageChunk { content } => {
                    content.as_text()
                }
                _ => panic!("Expected AgentMessageChunk"),
            })
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        drop(updates);
        drop(client);
    }

    #[tokio::test]
    async fn permission_request_is_answered() {
        let host = RecordingHost::new("allow-once");
        let (client, peer) = connect(host);
        let (peer_read, mut peer_write) = tokio::io::split(peer);
        let mut peer_reader = BufReader::new(peer_read);

        let request = json!({
            "jsonrpc": "2.0",
            "id": 99,
            "method": "session/request_permission",
            "params": {
                "sessionId": "sess-1",
                "toolCall": {"title": "shell"},
                "options": [
                    {"optionId": "allow-once", "name": "Allow once"},
                    {"optionId": "reject", "name": "Reject"}
                ]
            }
        });
        peer_write
            .write_all(format!("{}\n", request).as_bytes())
            .await
            .unwrap();

        let response = read_json(&mut peer_reader).await;
        assert_eq!(response["id"], 99);
        assert_eq!(response["result"]["outcome"]["outcome"], "selected");
        assert_eq!(response["result"]["outcome"]["optionId"], "allow-once");
        drop(client);
    }

    #[tokio::test]
    async fn fs_read_is_answered() {
        let host = RecordingHost::new("allow");
        let (client, peer) = connect(host);
        let (peer_read, mut peer_write) = tokio::io::split(peer);
        let mut peer_reader = BufReader::new(peer_read);

        let request = json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "fs/read_text_file",
            "params": {"sessionId": "sess-1", "path": "/tmp/file.txt"}
        });
        peer_write
            .write_all(format!("{}\n", request).as_bytes())
            .await
            .unwrap();

        let response = read_json(&mut peer_reader).await;
        assert_eq!(response["result"]["content"], "contents of /tmp/file.txt");
        drop(client);
    }

    #[tokio::test]
    async fn unknown_peer_method_gets_error_response() {
        let host = RecordingHost::new("allow");
        let (client, peer) = connect(host);
        let (peer_read, mut peer_write) = tokio::io::split(peer);
        let mut peer_reader = BufReader::new(peer_read);

        let request = json!({
            "jsonrpc": "2.0",
            "id": 6,
            "method": "terminal/create",
            "params": {}
        });
        peer_write
            .write_all(format!("{}\n", request).as_bytes())
            .await
            .unwrap();

        let response = read_json(&mut peer_reader).await;
        assert_eq!(response["error"]["code"], RpcError::METHOD_NOT_FOUND);
        drop(client);
    }

    #[tokio::test]
    async fn closed_connection_fails_pending_requests() {
        let host = RecordingHost::new("allow");
        let (client, peer) = connect(host);

        // Dropping the peer side closes the stream; the in-flight request
        // must resolve with an error rather than hang.
        drop(peer);

        let err = client.initialize().await.unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
    }
}
