//! Lazy access to the Claude Code session transcript (JSONL).
//!
//! Constructing a [`Transcript`] touches nothing on disk. The file is read and
//! parsed on first access and memoised, so every handler in one invocation
//! shares a single parse.

use fs_err as fs;
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    User,
    Assistant,
    System,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub kind: EntryKind,
    pub uuid: Option<String>,
    /// Concatenated text blocks (or the plain string content for user turns).
    pub text: String,
    pub tool_uses: Vec<ToolUse>,
    /// Number of `tool_result` blocks with `is_error: true`.
    pub tool_errors: usize,
    pub is_compact_boundary: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranscriptStats {
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub tool_uses: usize,
    pub tool_errors: usize,
    pub compactions: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Default)]
struct Parsed {
    /// Entries after the last compact boundary.
    current: Vec<TranscriptEntry>,
    archived: Vec<TranscriptEntry>,
}

#[derive(Debug)]
pub struct Transcript {
    session_id: String,
    path: PathBuf,
    parsed: OnceCell<Parsed>,
}

impl Transcript {
    /// Uses `transcript_path` from the event when present, otherwise Claude
    /// Code's default location for `(cwd, session_id)`.
    pub fn new(session_id: &str, cwd: &str, transcript_path: Option<&str>) -> Self {
        let path = match transcript_path {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => default_transcript_path(session_id, cwd),
        };
        Transcript::from_path(session_id, path)
    }

    pub fn from_path(session_id: &str, path: impl Into<PathBuf>) -> Self {
        Transcript {
            session_id: session_id.to_string(),
            path: path.into(),
            parsed: OnceCell::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file has been read yet.
    pub fn is_loaded(&self) -> bool {
        self.parsed.get().is_some()
    }

    fn parsed(&self) -> &Parsed {
        self.parsed.get_or_init(|| load(&self.path))
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.parsed().current
    }

    /// Entries before the last compaction.
    pub fn archived(&self) -> &[TranscriptEntry] {
        &self.parsed().archived
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = &ToolUse> {
        self.entries().iter().flat_map(|e| e.tool_uses.iter())
    }

    pub fn last_assistant_text(&self) -> Option<&str> {
        self.entries()
            .iter()
            .rev()
            .find(|e| e.kind == EntryKind::Assistant && !e.text.is_empty())
            .map(|e| e.text.as_str())
    }

    /// Statistics over the whole file, archived entries included.
    pub fn stats(&self) -> TranscriptStats {
        let parsed = self.parsed();
        let mut stats = TranscriptStats::default();
        for entry in parsed.archived.iter().chain(parsed.current.iter()) {
            match entry.kind {
                EntryKind::User if entry.tool_errors == 0 && !entry.text.is_empty() => {
                    stats.user_messages += 1
                }
                EntryKind::Assistant => stats.assistant_messages += 1,
                _ => {}
            }
            stats.tool_uses += entry.tool_uses.len();
            stats.tool_errors += entry.tool_errors;
            stats.input_tokens += entry.input_tokens;
            stats.output_tokens += entry.output_tokens;
            if entry.is_compact_boundary {
                stats.compactions += 1;
            }
        }
        stats
    }
}

/// `~/.claude/projects/<cwd with '/' and '.' as '-'>/<session_id>.jsonl`
pub fn default_transcript_path(session_id: &str, cwd: &str) -> PathBuf {
    let project = cwd.replace(['/', '.'], "-");
    dirs::home_dir()
        .unwrap_or_default()
        .join(".claude")
        .join("projects")
        .join(project)
        .join(format!("{}.jsonl", session_id))
}

fn load(path: &Path) -> Parsed {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "Failed to open transcript");
            }
            return Parsed::default();
        }
    };

    let mut entries = Vec::new();
    let mut last_boundary = None;
    for chunk in BufReader::new(file).split(b'\n') {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read transcript");
                break;
            }
        };
        let Ok(line) = std::str::from_utf8(&bytes) else {
            tracing::debug!("Skipping non-UTF-8 transcript line");
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            tracing::debug!("Skipping unparseable transcript line");
            continue;
        };
        let entry = parse_entry(&value);
        if entry.is_compact_boundary {
            last_boundary = Some(entries.len());
        }
        entries.push(entry);
    }

    match last_boundary {
        Some(idx) => {
            let current = entries.split_off(idx + 1);
            Parsed {
                current,
                archived: entries,
            }
        }
        None => Parsed {
            current: entries,
            archived: Vec::new(),
        },
    }
}

fn parse_entry(value: &Value) -> TranscriptEntry {
    let kind = match value.get("type").and_then(Value::as_str) {
        Some("user") => EntryKind::User,
        Some("assistant") => EntryKind::Assistant,
        Some("system") => EntryKind::System,
        _ => EntryKind::Other,
    };
    let message = value.get("message");
    let content = message.and_then(|m| m.get("content"));

    let mut text = String::new();
    let mut tool_uses = Vec::new();
    let mut tool_errors = 0;

    match content {
        Some(Value::String(s)) => text.push_str(s),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(t);
                        }
                    }
                    Some("tool_use") => tool_uses.push(ToolUse {
                        id: str_of(block, "id"),
                        name: str_of(block, "name"),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    }),
                    Some("tool_result") => {
                        if block.get("is_error").and_then(Value::as_bool) == Some(true) {
                            tool_errors += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let usage = message.and_then(|m| m.get("usage"));
    let tokens = |key: &str| usage.and_then(|u| u.get(key)).and_then(Value::as_u64).unwrap_or(0);

    TranscriptEntry {
        kind,
        uuid: value.get("uuid").and_then(Value::as_str).map(str::to_string),
        text,
        tool_uses,
        tool_errors,
        is_compact_boundary: value.get("subtype").and_then(Value::as_str)
            == Some("compact_boundary"),
        input_tokens: tokens("input_tokens"),
        output_tokens: tokens("output_tokens"),
    }
}

fn str_of(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
