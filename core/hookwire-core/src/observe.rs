//! Observability events emitted by the dispatcher.
//!
//! The engine only emits into an [`ObservabilitySink`]; nothing it does
//! depends on what a sink does with the records. Per dispatch:
//!
//! - one `hook_enter` and one `hook_exit` (with `duration_ms`)
//! - one `decision` per invoked handler that returned something other than Passthrough
//! - one `error` per failed guard or handler
//! - any number of `custom` events emitted by handlers

use chrono::{DateTime, Utc};
use fs_err::OpenOptions;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::decision::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservabilityKind {
    HookEnter,
    HookExit,
    Decision,
    Error,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityEvent {
    pub session_id: String,
    /// Shared by every record of one invocation.
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    pub event_type: ObservabilityKind,
    /// `pre_tool:Bash`, `on_stop`, ...
    pub hook_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_event_type: Option<String>,
}

impl ObservabilityEvent {
    pub fn new(
        kind: ObservabilityKind,
        session_id: &str,
        request_id: &str,
        hook_name: &str,
    ) -> Self {
        ObservabilityEvent {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            duration_ms: None,
            event_type: kind,
            hook_name: hook_name.to_string(),
            binding: None,
            payload: Map::new(),
            decision: None,
            reason: None,
            error_type: None,
            error_message: None,
            custom_event_type: None,
        }
    }

    pub fn with_binding(mut self, binding: &str) -> Self {
        self.binding = Some(binding.to_string());
        self
    }

    pub fn with_decision(mut self, decision: &Decision) -> Self {
        self.decision = Some(decision.label().to_string());
        self.reason = decision.reason().map(str::to_string);
        self
    }

    pub fn with_error(mut self, error_type: &str, message: &str) -> Self {
        self.error_type = Some(error_type.to_string());
        self.error_message = Some(message.to_string());
        self
    }
}

pub trait ObservabilitySink: Send + Sync {
    fn emit(&self, event: &ObservabilityEvent);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl ObservabilitySink for NullSink {
    fn emit(&self, _event: &ObservabilityEvent) {}
}

/// Appends one JSON line per event to `<dir>/observability-<session>.jsonl`.
#[derive(Debug)]
pub struct JsonlSink {
    dir: PathBuf,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonlSink { dir: dir.into() }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let name = if safe.is_empty() { "unknown" } else { &safe };
        self.dir.join(format!("observability-{}.jsonl", name))
    }

    fn append(&self, event: &ObservabilityEvent) -> std::io::Result<()> {
        fs_err::create_dir_all(&self.dir)?;
        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(&event.session_id))?;
        writeln!(file, "{}", line)
    }
}

impl ObservabilitySink for JsonlSink {
    fn emit(&self, event: &ObservabilityEvent) {
        // Observability must never fail the hook.
        if let Err(e) = self.append(event) {
            tracing::warn!(error = %e, "Failed to write observability event");
        }
    }
}

/// Collects events in memory, for tests and embedding apps.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ObservabilityEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn events(&self) -> Vec<ObservabilityEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, kind: ObservabilityKind) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type == kind)
            .count()
    }
}

impl ObservabilitySink for MemorySink {
    fn emit(&self, event: &ObservabilityEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let temp = tempdir().unwrap();
        let sink = JsonlSink::new(temp.path().join("logs"));

        let enter = ObservabilityEvent::new(ObservabilityKind::HookEnter, "s1", "r1", "on_stop");
        let decision = ObservabilityEvent::new(ObservabilityKind::Decision, "s1", "r1", "on_stop")
            .with_binding("check")
            .with_decision(&Decision::Block("not yet".to_string()));
        sink.emit(&enter);
        sink.emit(&decision);

        let content = fs_err::read_to_string(sink.path_for("s1")).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "hook_enter");
        assert_eq!(lines[1]["decision"], "block");
        assert_eq!(lines[1]["reason"], "not yet");
        assert_eq!(lines[1]["binding"], "check");
    }

    #[test]
    fn test_jsonl_sink_sanitizes_session_id() {
        let sink = JsonlSink::new("/logs");
        assert_eq!(
            sink.path_for("../evil"),
            PathBuf::from("/logs/observability-___evil.jsonl")
        );
    }

    #[test]
    fn test_memory_sink_counts_by_kind() {
        let sink = MemorySink::new();
        sink.emit(&ObservabilityEvent::new(ObservabilityKind::Error, "s", "r", "h"));
        sink.emit(&ObservabilityEvent::new(ObservabilityKind::Error, "s", "r", "h"));
        assert_eq!(sink.count(ObservabilityKind::Error), 2);
        assert_eq!(sink.count(ObservabilityKind::Decision), 0);
    }
}
