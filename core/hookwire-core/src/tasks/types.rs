//! Serialized task descriptor and the statuses observers see.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use ulid::Ulid;

pub const DESCRIPTOR_VERSION: u32 = 1;

/// Upper bound for any task TTL, wherever it comes from.
pub const MAX_TASK_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_TASK_TTL)
}

/// `None` when `secs` does not fit a chrono delta.
pub(crate) fn ttl_delta(secs: u64) -> Option<ChronoDuration> {
    i64::try_from(secs).ok().and_then(ChronoDuration::try_seconds)
}

/// Stored status. Only the worker executing a descriptor moves it forward:
/// `pending → running → done | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub version: u32,
    pub task_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// Name of the registered work function.
    pub work_ref: String,
    #[serde(default)]
    pub args: Value,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub ttl_secs: u64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worker_pid: Option<u32>,
}

impl TaskDescriptor {
    pub fn new(session_id: &str, work_ref: &str, args: Value, ttl: Duration) -> Self {
        TaskDescriptor {
            version: DESCRIPTOR_VERSION,
            // ULIDs sort by creation time, which keeps execution FIFO.
            task_id: Ulid::new().to_string(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            work_ref: work_ref.to_string(),
            args,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            ttl_secs: clamp_ttl(ttl).as_secs(),
            started_at: None,
            finished_at: None,
            worker_pid: None,
        }
    }

    /// `None` for a `ttl_secs` too large to represent (hand-edited or
    /// corrupt descriptors); such descriptors count as expired.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        ttl_delta(self.ttl_secs).and_then(|ttl| self.created_at.checked_add_signed(ttl))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(true, |at| now > at)
    }

    /// Time left before the TTL elapses, zero if already past.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at()
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Status as an observer should report it: non-terminal descriptors past
    /// their TTL read as `failed("timeout")`.
    pub fn observe(&self, now: DateTime<Utc>) -> TaskOutcome {
        match self.status {
            TaskStatus::Pending | TaskStatus::Running if self.is_expired(now) => {
                TaskOutcome::Failed(TIMEOUT_ERROR.to_string())
            }
            TaskStatus::Pending => TaskOutcome::Pending,
            TaskStatus::Running => TaskOutcome::Running,
            TaskStatus::Done => TaskOutcome::Done(self.result.clone().unwrap_or(Value::Null)),
            TaskStatus::Failed => TaskOutcome::Failed(
                self.error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
        }
    }
}

pub const TIMEOUT_ERROR: &str = "timeout";

/// What a handler gets back from `status`/`collect`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Pending,
    Running,
    Done(Value),
    Failed(String),
    /// The result was already consumed by an earlier `collect`.
    AlreadyCollected,
    NotFound,
}

impl TaskOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskOutcome::Done(_) | TaskOutcome::Failed(_))
    }
}
