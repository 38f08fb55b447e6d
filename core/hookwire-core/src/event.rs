//! Typed hook events parsed from the JSON payload Claude Code writes to stdin.
//!
//! ## Shape
//!
//! ```text
//! { "hook_event_name": "PreToolUse", "session_id": "...", "cwd": "...",
//!   "tool_name": "Bash", "tool_input": { "command": "ls" }, ... }
//! ```
//!
//! Parsing is strict about the envelope (discriminator, `session_id`, `cwd`)
//! and permissive about everything else: missing optional fields become `None`,
//! unknown tools become [`ToolInput::Other`], and the full object is kept in
//! [`Event::raw`] so fields this crate doesn't model stay reachable.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{HookError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PreToolUse,
    PostToolUse,
    Stop,
    SubagentStop,
    SessionStart,
    SessionEnd,
    PreCompact,
    UserPromptSubmit,
    Notification,
    PermissionRequest,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::PreToolUse,
        EventKind::PostToolUse,
        EventKind::Stop,
        EventKind::SubagentStop,
        EventKind::SessionStart,
        EventKind::SessionEnd,
        EventKind::PreCompact,
        EventKind::UserPromptSubmit,
        EventKind::Notification,
        EventKind::PermissionRequest,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        EventKind::ALL.into_iter().find(|k| k.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PreToolUse => "PreToolUse",
            EventKind::PostToolUse => "PostToolUse",
            EventKind::Stop => "Stop",
            EventKind::SubagentStop => "SubagentStop",
            EventKind::SessionStart => "SessionStart",
            EventKind::SessionEnd => "SessionEnd",
            EventKind::PreCompact => "PreCompact",
            EventKind::UserPromptSubmit => "UserPromptSubmit",
            EventKind::Notification => "Notification",
            EventKind::PermissionRequest => "PermissionRequest",
        }
    }

    /// Tool events are the only kinds routed by tool name.
    pub fn is_tool_event(&self) -> bool {
        matches!(self, EventKind::PreToolUse | EventKind::PostToolUse)
    }

    /// Name used in observability records (`pre_tool`, `on_stop`, ...).
    pub fn hook_label(&self) -> &'static str {
        match self {
            EventKind::PreToolUse => "pre_tool",
            EventKind::PostToolUse => "post_tool",
            EventKind::Stop => "on_stop",
            EventKind::SubagentStop => "on_subagent_stop",
            EventKind::SessionStart => "on_session_start",
            EventKind::SessionEnd => "on_session_end",
            EventKind::PreCompact => "on_pre_compact",
            EventKind::UserPromptSubmit => "on_prompt",
            EventKind::Notification => "on_notification",
            EventKind::PermissionRequest => "on_permission_request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field-level leniency for tool inputs: a null or mistyped field falls back
/// to its default instead of failing the whole input.
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct BashInput {
    #[serde(deserialize_with = "lenient")]
    pub command: String,
    #[serde(deserialize_with = "lenient")]
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub timeout: Option<u64>,
    #[serde(deserialize_with = "lenient")]
    pub run_in_background: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct WriteInput {
    #[serde(deserialize_with = "lenient")]
    pub file_path: String,
    #[serde(deserialize_with = "lenient")]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct EditInput {
    #[serde(deserialize_with = "lenient")]
    pub file_path: String,
    #[serde(deserialize_with = "lenient")]
    pub old_string: String,
    #[serde(deserialize_with = "lenient")]
    pub new_string: String,
    #[serde(deserialize_with = "lenient")]
    pub replace_all: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ReadInput {
    #[serde(deserialize_with = "lenient")]
    pub file_path: String,
    #[serde(deserialize_with = "lenient")]
    pub offset: Option<u64>,
    #[serde(deserialize_with = "lenient")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct SearchInput {
    #[serde(deserialize_with = "lenient")]
    pub pattern: String,
    #[serde(deserialize_with = "lenient")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct TaskInput {
    #[serde(deserialize_with = "lenient")]
    pub description: String,
    #[serde(deserialize_with = "lenient")]
    pub prompt: String,
    #[serde(deserialize_with = "lenient")]
    pub subagent_type: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct WebFetchInput {
    #[serde(deserialize_with = "lenient")]
    pub url: String,
    #[serde(deserialize_with = "lenient")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct WebSearchInput {
    #[serde(deserialize_with = "lenient")]
    pub query: String,
}

/// Typed view over `tool_input` for the tools this crate knows about.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInput {
    Bash(BashInput),
    Write(WriteInput),
    Edit(EditInput),
    Read(ReadInput),
    Glob(SearchInput),
    Grep(SearchInput),
    Task(TaskInput),
    WebFetch(WebFetchInput),
    WebSearch(WebSearchInput),
    /// Unrecognized tool (MCP tools, future tools). Fields live in [`Event::raw`].
    Other,
}

impl ToolInput {
    fn from_value(tool_name: &str, input: &Value) -> Self {
        fn typed<T: DeserializeOwned>(input: &Value, wrap: fn(T) -> ToolInput) -> ToolInput {
            match serde_json::from_value::<T>(input.clone()) {
                Ok(v) => wrap(v),
                Err(e) => {
                    tracing::debug!(error = %e, "tool_input did not match typed shape");
                    ToolInput::Other
                }
            }
        }

        match tool_name {
            "Bash" => typed(input, ToolInput::Bash),
            "Write" => typed(input, ToolInput::Write),
            "Edit" => typed(input, ToolInput::Edit),
            "Read" => typed(input, ToolInput::Read),
            "Glob" => typed(input, ToolInput::Glob),
            "Grep" => typed(input, ToolInput::Grep),
            "Task" => typed(input, ToolInput::Task),
            "WebFetch" => typed(input, ToolInput::WebFetch),
            "WebSearch" => typed(input, ToolInput::WebSearch),
            _ => ToolInput::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool_use_id: Option<String>,
    pub input: ToolInput,
    /// Present on `PostToolUse` only.
    pub response: Option<Value>,
}

/// Variant-specific fields.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Tool(ToolCall),
    Stop {
        stop_hook_active: bool,
    },
    SessionStart {
        source: Option<String>,
    },
    SessionEnd {
        reason: Option<String>,
    },
    PreCompact {
        trigger: Option<String>,
        custom_instructions: Option<String>,
    },
    UserPromptSubmit {
        prompt: Option<String>,
    },
    Notification {
        message: Option<String>,
        notification_type: Option<String>,
    },
    PermissionRequest {
        tool_name: Option<String>,
        tool_input: Option<Value>,
    },
}

/// One hook event. Created once per process invocation and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub session_id: String,
    pub cwd: String,
    pub transcript_path: Option<String>,
    pub permission_mode: Option<String>,
    /// Only set for [`EventKind::PreToolUse`] and [`EventKind::PostToolUse`].
    pub tool_name: Option<String>,
    pub payload: EventPayload,
    pub raw: Map<String, Value>,
}

impl Event {
    pub fn tool_input(&self) -> Option<&ToolInput> {
        match &self.payload {
            EventPayload::Tool(call) => Some(&call.input),
            _ => None,
        }
    }

    /// Untyped `tool_input` object, for tools without a typed shape.
    pub fn raw_tool_input(&self) -> Option<&Map<String, Value>> {
        self.raw.get("tool_input").and_then(Value::as_object)
    }

    pub fn tool_response(&self) -> Option<&Value> {
        match &self.payload {
            EventPayload::Tool(call) => call.response.as_ref(),
            _ => None,
        }
    }

    /// Shell command for Bash events.
    pub fn command(&self) -> Option<&str> {
        match self.tool_input()? {
            ToolInput::Bash(b) => Some(b.command.as_str()),
            _ => None,
        }
    }

    /// Target file for file-oriented tools.
    pub fn file_path(&self) -> Option<&str> {
        match self.tool_input()? {
            ToolInput::Write(w) => Some(w.file_path.as_str()),
            ToolInput::Edit(e) => Some(e.file_path.as_str()),
            ToolInput::Read(r) => Some(r.file_path.as_str()),
            _ => None,
        }
    }

    pub fn stop_hook_active(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::Stop {
                stop_hook_active: true
            }
        )
    }

    /// `pre_tool:Bash`, `on_stop`, ...
    pub fn hook_name(&self) -> String {
        match &self.tool_name {
            Some(tool) => format!("{}:{}", self.kind.hook_label(), tool),
            None => self.kind.hook_label().to_string(),
        }
    }
}

/// Parses a raw payload into an [`Event`]. Has no side effects.
pub fn parse(raw: &[u8]) -> Result<Event> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| HookError::MalformedPayload(format!("payload is not UTF-8: {}", e)))?;
    if text.trim().is_empty() {
        return Err(HookError::MalformedPayload("empty payload".to_string()));
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| HookError::MalformedPayload(format!("invalid JSON: {}", e)))?;
    let raw = match value {
        Value::Object(map) => map,
        _ => {
            return Err(HookError::MalformedPayload(
                "payload is not a JSON object".to_string(),
            ))
        }
    };

    let event_name = str_field(&raw, "hook_event_name")
        .ok_or_else(|| HookError::MalformedPayload("missing hook_event_name".to_string()))?;
    let kind = EventKind::from_name(&event_name).ok_or_else(|| {
        HookError::MalformedPayload(format!("unrecognized hook_event_name '{}'", event_name))
    })?;

    let session_id = str_field(&raw, "session_id")
        .ok_or_else(|| HookError::MalformedPayload("missing session_id".to_string()))?;
    let cwd = str_field(&raw, "cwd")
        .ok_or_else(|| HookError::MalformedPayload("missing cwd".to_string()))?;

    let tool_name = if kind.is_tool_event() {
        Some(str_field(&raw, "tool_name").unwrap_or_default())
    } else {
        None
    };

    let payload = match kind {
        EventKind::PreToolUse | EventKind::PostToolUse => {
            let name = tool_name.as_deref().unwrap_or_default();
            let input = raw
                .get("tool_input")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            EventPayload::Tool(ToolCall {
                tool_use_id: str_field(&raw, "tool_use_id"),
                input: ToolInput::from_value(name, &input),
                response: if kind == EventKind::PostToolUse {
                    raw.get("tool_response").cloned()
                } else {
                    None
                },
            })
        }
        EventKind::Stop | EventKind::SubagentStop => EventPayload::Stop {
            stop_hook_active: raw
                .get("stop_hook_active")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        EventKind::SessionStart => EventPayload::SessionStart {
            source: str_field(&raw, "source"),
        },
        EventKind::SessionEnd => EventPayload::SessionEnd {
            reason: str_field(&raw, "reason"),
        },
        EventKind::PreCompact => EventPayload::PreCompact {
            trigger: str_field(&raw, "trigger"),
            custom_instructions: str_field(&raw, "custom_instructions"),
        },
        EventKind::UserPromptSubmit => EventPayload::UserPromptSubmit {
            prompt: str_field(&raw, "prompt"),
        },
        EventKind::Notification => EventPayload::Notification {
            message: str_field(&raw, "message"),
            notification_type: str_field(&raw, "notification_type"),
        },
        EventKind::PermissionRequest => EventPayload::PermissionRequest {
            tool_name: str_field(&raw, "tool_name"),
            tool_input: raw.get("tool_input").cloned(),
        },
    };

    Ok(Event {
        kind,
        session_id,
        cwd,
        transcript_path: str_field(&raw, "transcript_path"),
        permission_mode: str_field(&raw, "permission_mode"),
        tool_name,
        payload,
        raw,
    })
}

fn str_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}
