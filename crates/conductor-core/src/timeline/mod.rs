//! Timeline reduction: folding an ordered update stream into rendered state.
//!
//! [`Timeline::apply`] is a pure, order-sensitive fold over
//! [`AgentUpdate`]s; [`Timeline::hydrate`] is the same fold run left-to-right
//! from empty state. Both paths share every rule, so a reconnecting client
//! replaying stored events reconstructs exactly the state a live subscriber
//! accumulated. Reduction never fails: unknown or malformed events leave the
//! state untouched.

mod items;

pub use items::{StreamItem, ToolCallDetail};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::events::{AgentEvent, AgentUpdate, TimelineEvent, TodoItem, ToolStatus};

/// Identity of the single todo-list item. Updates replace its entries but
/// never its id, so client references do not churn.
const TODO_LIST_ID: &str = "todo-list";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextKind {
    User,
    Assistant,
    Thought,
}

impl TextKind {
    fn label(self) -> &'static str {
        match self {
            TextKind::User => "user",
            TextKind::Assistant => "assistant",
            TextKind::Thought => "thought",
        }
    }
}

/// Reduced, render-ready state for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Timeline {
    items: Vec<StreamItem>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[StreamItem] {
        &self.items
    }

    /// Rebuild state from a stored or replayed batch of updates.
    pub fn hydrate(updates: &[AgentUpdate]) -> Self {
        let mut timeline = Self::new();
        for update in updates {
            timeline.apply(update);
        }
        timeline
    }

    /// Fold one update into the state.
    pub fn apply(&mut self, update: &AgentUpdate) {
        match &update.event {
            AgentEvent::TimelineItem { item } => self.apply_item(item, update.timestamp),
            AgentEvent::TurnCompleted { .. }
            | AgentEvent::TurnFailed { .. }
            | AgentEvent::TurnCanceled { .. } => self.finish_turn(),
            // Lifecycle and permission events carry no timeline state.
            _ => {}
        }
    }

    fn apply_item(&mut self, item: &TimelineEvent, timestamp: DateTime<Utc>) {
        match item {
            TimelineEvent::UserMessage { id, text } => {
                self.append_text(TextKind::User, id.clone(), text, timestamp);
            }
            TimelineEvent::AssistantChunk { id, text } => {
                self.append_text(TextKind::Assistant, Some(id.clone()), text, timestamp);
            }
            TimelineEvent::ThoughtChunk { id, text } => {
                self.append_text(TextKind::Thought, Some(id.clone()), text, timestamp);
            }
            TimelineEvent::ToolCall {
                call_id,
                name,
                status,
                input,
                output,
                error,
                tool_kind,
                server,
            } => {
                self.apply_tool_call(ToolCallEvent {
                    call_id: call_id.as_deref(),
                    name: name.as_deref(),
                    status: *status,
                    input: input.as_ref(),
                    output: output.as_ref(),
                    error: error.as_deref(),
                    tool_kind: tool_kind.as_deref(),
                    server: server.as_deref(),
                    timestamp,
                });
            }
            TimelineEvent::TodoUpdate { items } => {
                self.apply_todos(items.clone(), timestamp);
            }
            // Stream errors have no item representation; clients read them
            // off the bus directly.
            TimelineEvent::Error { .. } | TimelineEvent::Unknown => {}
        }
    }

    /// Text rule: a fragment extends the last item when it is the same kind,
    /// verbatim and with no inserted separator; otherwise it starts a new
    /// item.
    fn append_text(
        &mut self,
        kind: TextKind,
        id: Option<String>,
        fragment: &str,
        timestamp: DateTime<Utc>,
    ) {
        if let Some(last) = self.items.last_mut() {
            match (kind, last) {
                (
                    TextKind::User,
                    StreamItem::UserMessage {
                        text, timestamp: ts, ..
                    },
                )
                | (
                    TextKind::Assistant,
                    StreamItem::AssistantMessage {
                        text, timestamp: ts, ..
                    },
                )
                | (
                    TextKind::Thought,
                    StreamItem::Thought {
                        text, timestamp: ts, ..
                    },
                ) => {
                    text.push_str(fragment);
                    *ts = timestamp;
                    return;
                }
                _ => {}
            }
        }

        let id = id.unwrap_or_else(|| derived_id(kind.label(), fragment, timestamp));
        let item = match kind {
            TextKind::User => StreamItem::UserMessage {
                id,
                timestamp,
                text: fragment.to_string(),
            },
            TextKind::Assistant => StreamItem::AssistantMessage {
                id,
                timestamp,
                text: fragment.to_string(),
                in_progress: true,
            },
            TextKind::Thought => StreamItem::Thought {
                id,
                timestamp,
                text: fragment.to_string(),
                in_progress: true,
            },
        };
        self.items.push(item);
    }

    fn apply_tool_call(&mut self, event: ToolCallEvent<'_>) {
        // Permission-arbitration calls never become timeline items.
        if event.server == Some("permission") || event.tool_kind == Some("permission") {
            return;
        }

        // Structured plan updates render as the todo list, never as a call.
        if is_plan_update(event.tool_kind, event.name) {
            if let Some(todos) = parse_todos(event.input) {
                self.apply_todos(todos, event.timestamp);
            }
            return;
        }

        // Events without a call id get a deterministic fallback, which also
        // makes replayed duplicates land on the same item.
        let lookup_id = match event.call_id {
            Some(cid) => cid.to_string(),
            None => fallback_call_id(event.name, event.timestamp),
        };

        let position = self.items.iter().position(|item| match item {
            StreamItem::ToolCall { id, call_id, .. } => match event.call_id {
                Some(cid) => call_id.as_deref() == Some(cid),
                None => id == &lookup_id,
            },
            _ => false,
        });

        let incoming_status = infer_status(event.status, event.error, event.output);

        match position {
            Some(position) => {
                if let StreamItem::ToolCall {
                    timestamp,
                    name,
                    status,
                    input,
                    output,
                    error,
                    tool_kind,
                    detail,
                    ..
                } = &mut self.items[position]
                {
                    // Present fields override, absent fields never erase: a
                    // completion event without input keeps the start's input.
                    if let Some(new_name) = event.name {
                        *name = new_name.to_string();
                    }
                    if event.input.is_some() {
                        *input = event.input.cloned();
                    }
                    if event.output.is_some() {
                        *output = event.output.cloned();
                    }
                    if event.error.is_some() {
                        *error = event.error.map(str::to_string);
                    }
                    if event.tool_kind.is_some() {
                        *tool_kind = event.tool_kind.map(str::to_string);
                    }
                    // Terminal statuses win: a late `running` never regresses.
                    if !(status.is_terminal() && incoming_status == ToolStatus::Running) {
                        *status = incoming_status;
                    }
                    *timestamp = event.timestamp;
                    *detail = ToolCallDetail::derive(
                        tool_kind.as_deref(),
                        name,
                        input.as_ref(),
                        output.as_ref(),
                    );
                }
            }
            None => {
                let name = event.name.unwrap_or("tool").to_string();
                let detail =
                    ToolCallDetail::derive(event.tool_kind, &name, event.input, event.output);
                self.items.push(StreamItem::ToolCall {
                    id: lookup_id,
                    timestamp: event.timestamp,
                    call_id: event.call_id.map(str::to_string),
                    name,
                    status: incoming_status,
                    input: event.input.cloned(),
                    output: event.output.cloned(),
                    error: event.error.map(str::to_string),
                    tool_kind: event.tool_kind.map(str::to_string),
                    detail,
                });
            }
        }
    }

    /// Todo rule: one list item, entries replaced wholesale, identity stable.
    fn apply_todos(&mut self, todos: Vec<TodoItem>, timestamp: DateTime<Utc>) {
        for item in &mut self.items {
            if let StreamItem::TodoList {
                items,
                timestamp: ts,
                ..
            } = item
            {
                *items = todos;
                *ts = timestamp;
                return;
            }
        }
        self.items.push(StreamItem::TodoList {
            id: TODO_LIST_ID.to_string(),
            timestamp,
            items: todos,
        });
    }

    /// Turn boundary: streamed text is final now, contents untouched.
    fn finish_turn(&mut self) {
        for item in &mut self.items {
            match item {
                StreamItem::AssistantMessage { in_progress, .. }
                | StreamItem::Thought { in_progress, .. } => *in_progress = false,
                _ => {}
            }
        }
    }
}

struct ToolCallEvent<'a> {
    call_id: Option<&'a str>,
    name: Option<&'a str>,
    status: Option<ToolStatus>,
    input: Option<&'a Value>,
    output: Option<&'a Value>,
    error: Option<&'a str>,
    tool_kind: Option<&'a str>,
    server: Option<&'a str>,
    timestamp: DateTime<Utc>,
}

/// Status rule: explicit wins; otherwise an error payload means failure, any
/// non-null output (including nested result metadata) means completion, and
/// nothing at all means the call is still running.
fn infer_status(
    explicit: Option<ToolStatus>,
    error: Option<&str>,
    output: Option<&Value>,
) -> ToolStatus {
    if let Some(status) = explicit {
        return status;
    }
    if error.is_some() {
        return ToolStatus::Failed;
    }
    if matches!(output, Some(v) if !v.is_null()) {
        return ToolStatus::Completed;
    }
    ToolStatus::Running
}

fn is_plan_update(kind: Option<&str>, name: Option<&str>) -> bool {
    if kind == Some("plan") {
        return true;
    }
    let Some(name) = name else {
        return false;
    };
    matches!(
        name.to_lowercase().replace('_', "").as_str(),
        "updateplan" | "todowrite" | "updatetodos" | "plan"
    )
}

/// Pull todo entries out of a plan-update call's input. `None` when the input
/// carries no entry list at all (e.g. a completion event), so a metadata-only
/// replay never wipes the list.
fn parse_todos(input: Option<&Value>) -> Option<Vec<TodoItem>> {
    let input = input?;
    let entries = ["todos", "entries", "plan", "items"]
        .iter()
        .find_map(|k| input.get(k).and_then(Value::as_array))?;

    Some(
        entries
            .iter()
            .filter_map(|entry| {
                if let Some(text) = entry.as_str() {
                    return Some(TodoItem {
                        text: text.to_string(),
                        completed: false,
                    });
                }
                let text = ["content", "text", "step", "title"]
                    .iter()
                    .find_map(|k| entry.get(k).and_then(Value::as_str))?;
                let completed = entry
                    .get("completed")
                    .and_then(Value::as_bool)
                    .unwrap_or_else(|| {
                        entry.get("status").and_then(Value::as_str) == Some("completed")
                    });
                Some(TodoItem {
                    text: text.to_string(),
                    completed,
                })
            })
            .collect(),
    )
}

fn fallback_call_id(name: Option<&str>, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        name.unwrap_or("tool"),
        timestamp.timestamp_millis()
    )
}

/// Deterministic id for a text item, derived purely from event content so
/// hydration stays reproducible.
fn derived_id(kind: &str, text: &str, timestamp: DateTime<Utc>) -> String {
    let mut hash: u32 = 5381;
    for byte in text
        .bytes()
        .chain(timestamp.timestamp_millis().to_le_bytes())
    {
        hash = hash.wrapping_mul(33) ^ u32::from(byte);
    }
    format!("{}-{:08x}", kind, hash)
}
