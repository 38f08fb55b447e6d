use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{HookError, Result};

use super::store::TaskStore;
use super::types::{TaskDescriptor, TaskOutcome};

#[derive(Debug, Default)]
struct Pending {
    /// Scheduled by the running handler, not yet written.
    staged: Vec<TaskDescriptor>,
    /// Written during this invocation.
    committed: Vec<String>,
}

/// Per-invocation handle injected into handlers as `tasks`.
///
/// `schedule` returns a task id immediately and never runs work inline. The
/// descriptor is written once the scheduling handler returns normally; a
/// failing handler's schedules are dropped.
#[derive(Debug, Clone)]
pub struct BackgroundTasks {
    session_id: String,
    store: TaskStore,
    ttl: Duration,
    known_work: Arc<HashSet<String>>,
    pending: Arc<Mutex<Pending>>,
}

impl BackgroundTasks {
    pub fn new(
        session_id: &str,
        store: TaskStore,
        ttl: Duration,
        known_work: Arc<HashSet<String>>,
    ) -> Self {
        BackgroundTasks {
            session_id: session_id.to_string(),
            store,
            ttl,
            known_work,
            pending: Arc::new(Mutex::new(Pending::default())),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn schedule<A: Serialize>(&self, work_ref: &str, args: A) -> Result<String> {
        self.schedule_with_ttl(work_ref, args, self.ttl)
    }

    pub fn schedule_with_ttl<A: Serialize>(
        &self,
        work_ref: &str,
        args: A,
        ttl: Duration,
    ) -> Result<String> {
        if !self.known_work.contains(work_ref) {
            return Err(HookError::config(format!(
                "no work registered under '{}'",
                work_ref
            )));
        }
        let descriptor =
            TaskDescriptor::new(&self.session_id, work_ref, serde_json::to_value(args)?, ttl);
        let task_id = descriptor.task_id.clone();
        tracing::debug!(session = %self.session_id, task = %task_id, work = %work_ref, "Task scheduled");
        self.pending().staged.push(descriptor);
        Ok(task_id)
    }

    /// Current status, without consuming a finished result.
    pub fn status(&self, task_id: &str) -> Result<TaskOutcome> {
        if self.is_staged(task_id) {
            return Ok(TaskOutcome::Pending);
        }
        self.store.observe(&self.session_id, task_id, Utc::now())
    }

    /// Hands out a finished result exactly once. Never blocks.
    pub fn collect(&self, task_id: &str) -> Result<TaskOutcome> {
        if self.is_staged(task_id) {
            return Ok(TaskOutcome::Pending);
        }
        self.store.collect(&self.session_id, task_id, Utc::now())
    }

    /// Every stored descriptor of this session, oldest first.
    pub fn list(&self) -> Result<Vec<TaskDescriptor>> {
        self.store.list(&self.session_id)
    }

    fn is_staged(&self, task_id: &str) -> bool {
        self.pending().staged.iter().any(|d| d.task_id == task_id)
    }

    pub(crate) fn commit(&self) -> Result<usize> {
        let staged = std::mem::take(&mut self.pending().staged);
        let count = staged.len();
        for descriptor in &staged {
            self.store.write(descriptor)?;
            self.pending().committed.push(descriptor.task_id.clone());
        }
        Ok(count)
    }

    pub(crate) fn rollback(&self) {
        let dropped = std::mem::take(&mut self.pending().staged);
        if !dropped.is_empty() {
            tracing::debug!(session = %self.session_id, dropped = dropped.len(), "Discarded scheduled tasks");
        }
    }

    /// Task ids written during this invocation.
    pub fn scheduled(&self) -> Vec<String> {
        self.pending().committed.clone()
    }
}
