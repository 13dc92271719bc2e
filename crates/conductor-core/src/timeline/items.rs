//! Rendered timeline items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{TodoItem, ToolStatus};

/// One rendered unit of agent activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StreamItem {
    UserMessage {
        id: String,
        timestamp: DateTime<Utc>,
        text: String,
    },
    AssistantMessage {
        id: String,
        timestamp: DateTime<Utc>,
        text: String,
        in_progress: bool,
    },
    Thought {
        id: String,
        timestamp: DateTime<Utc>,
        text: String,
        in_progress: bool,
    },
    ToolCall {
        id: String,
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        name: String,
        status: ToolStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_kind: Option<String>,
        detail: ToolCallDetail,
    },
    TodoList {
        id: String,
        timestamp: DateTime<Utc>,
        items: Vec<TodoItem>,
    },
}

impl StreamItem {
    pub fn id(&self) -> &str {
        match self {
            StreamItem::UserMessage { id, .. }
            | StreamItem::AssistantMessage { id, .. }
            | StreamItem::Thought { id, .. }
            | StreamItem::ToolCall { id, .. }
            | StreamItem::TodoList { id, .. } => id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StreamItem::UserMessage { timestamp, .. }
            | StreamItem::AssistantMessage { timestamp, .. }
            | StreamItem::Thought { timestamp, .. }
            | StreamItem::ToolCall { timestamp, .. }
            | StreamItem::TodoList { timestamp, .. } => *timestamp,
        }
    }
}

/// Structured rendering hints for a tool call, extracted from its raw
/// input/output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ToolCallDetail {
    Shell {
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i64>,
    },
    Read {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Edit {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Write {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Search {
        #[serde(skip_serializing_if = "Option::is_none")]
        query: Option<String>,
    },
    Unknown,
}

impl ToolCallDetail {
    /// Classify a call and pull out the fields worth rendering. Driven by the
    /// peer's kind hint when present, the tool name otherwise.
    pub fn derive(
        kind: Option<&str>,
        name: &str,
        input: Option<&Value>,
        output: Option<&Value>,
    ) -> Self {
        let lower = name.to_lowercase();
        let class = kind.map(str::to_lowercase);
        let class = class.as_deref().unwrap_or("");

        if class == "execute" || class == "shell" || has_any(&lower, &["bash", "shell", "terminal", "exec"]) {
            ToolCallDetail::Shell {
                command: extract_str(input, &["command", "cmd"]),
                output: extract_output_text(output),
                exit_code: extract_exit_code(output),
            }
        } else if class == "read" || lower.contains("read") {
            ToolCallDetail::Read {
                path: extract_str(input, &["path", "file_path", "abs_path"]),
            }
        } else if class == "edit" || has_any(&lower, &["edit", "patch", "diff"]) {
            ToolCallDetail::Edit {
                path: extract_str(input, &["path", "file_path", "abs_path"]),
            }
        } else if class == "write" || lower.contains("write") {
            ToolCallDetail::Write {
                path: extract_str(input, &["path", "file_path", "abs_path"]),
            }
        } else if class == "search" || has_any(&lower, &["search", "grep", "glob", "find"]) {
            ToolCallDetail::Search {
                query: extract_str(input, &["query", "pattern", "regex"]),
            }
        } else {
            ToolCallDetail::Unknown
        }
    }
}

fn has_any(name: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| name.contains(n))
}

fn extract_str(value: Option<&Value>, keys: &[&str]) -> Option<String> {
    let value = value?;
    keys.iter()
        .find_map(|k| value.get(k).and_then(Value::as_str))
        .map(str::to_string)
}

/// Shell output may be a bare string or nested result metadata.
fn extract_output_text(output: Option<&Value>) -> Option<String> {
    let output = output?;
    if let Some(text) = output.as_str() {
        return Some(text.to_string());
    }
    ["output", "stdout", "content", "result"]
        .iter()
        .find_map(|k| output.get(k).and_then(Value::as_str))
        .map(str::to_string)
}

fn extract_exit_code(output: Option<&Value>) -> Option<i64> {
    let output = output?;
    ["exit_code", "exitCode"]
        .iter()
        .find_map(|k| output.get(k).and_then(Value::as_i64))
        .or_else(|| {
            output
                .get("metadata")
                .and_then(|m| m.get("exit_code").or_else(|| m.get("exitCode")))
                .and_then(Value::as_i64)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_hint_beats_name() {
        let detail = ToolCallDetail::derive(Some("read"), "mystery_tool", None, None);
        assert!(matches!(detail, ToolCallDetail::Read { .. }));
    }

    #[test]
    fn shell_detail_extracts_command_and_exit_code() {
        let input = json!({"command": "cargo test"});
        let output = json!({"output": "ok", "metadata": {"exit_code": 0}});

        let detail = ToolCallDetail::derive(None, "bash", Some(&input), Some(&output));
        match detail {
            ToolCallDetail::Shell {
                command,
                output,
                exit_code,
            } => {
                assert_eq!(command.as_deref(), Some("cargo test"));
                assert_eq!(output.as_deref(), Some("ok"));
                assert_eq!(exit_code, Some(0));
            }
            _ => panic!("Expected Shell detail"),
        }
    }

    #[test]
    fn read_detail_extracts_path() {
        let input = json!({"file_path": "/src/main.rs"});
        let detail = ToolCallDetail::derive(None, "read_file", Some(&input), None);
        match detail {
            ToolCallDetail::Read { path } => assert_eq!(path.as_deref(), Some("/src/main.rs")),
            _ => panic!("Expected Read detail"),
        }
    }

    #[test]
    fn search_detail_extracts_query() {
        let input = json!({"pattern": "fn main"});
        let detail = ToolCallDetail::derive(Some("search"), "grep", Some(&input), None);
        match detail {
            ToolCallDetail::Search { query } => assert_eq!(query.as_deref(), Some("fn main")),
            _ => panic!("Expected Search detail"),
        }
    }

    #[test]
    fn unrecognized_tool_is_unknown() {
        let detail = ToolCallDetail::derive(None, "mystery_tool", None, None);
        assert_eq!(detail, ToolCallDetail::Unknown);
    }

    #[test]
    fn bare_string_output_is_shell_output() {
        let output = json!("hello\n");
        let detail = ToolCallDetail::derive(Some("execute"), "shell", None, Some(&output));
        match detail {
            ToolCallDetail::Shell { output, .. } => assert_eq!(output.as_deref(), Some("hello\n")),
            _ => panic!("Expected Shell detail"),
        }
    }
}
