//! Background tasks: work scheduled in one hook invocation and collected in
//! a later one.
//!
//! # Lifecycle
//!
//! ```text
//! invocation N     handler: tasks.schedule("lint", args)  → task_id
//!                  dispatcher: write descriptor (pending), ensure a worker
//! worker process   pending → running → done | failed      (descriptor rewritten atomically)
//! invocation N+k   handler: tasks.collect(task_id)         → Done(result) once, then AlreadyCollected
//! ```
//!
//! Descriptors still pending/running past their TTL read as `failed("timeout")`.
//! Each invocation runs a housekeeping pass that deletes expired records.
//!
//! # Module Structure
//!
//! - [`types`]: descriptor and observed outcome
//! - [`store`]: on-disk layout, collect-once markers, reaping
//! - [`lock`]: the per-session worker lock (at most one active worker)
//! - [`launcher`]: detached worker spawning
//! - [`worker`]: work registry and the drain loop
//! - `handle`: the per-invocation [`BackgroundTasks`] injected into handlers

mod handle;
pub mod launcher;
pub mod lock;
pub mod store;
pub mod types;
pub mod worker;

pub use handle::BackgroundTasks;
pub use launcher::{ProcessLauncher, RecordingLauncher, WorkerLauncher, WORKER_SUBCOMMAND};
pub use store::TaskStore;
pub use types::{TaskDescriptor, TaskOutcome, TaskStatus};
pub use worker::{run_worker, WorkRegistry, WorkerReport};

use chrono::Utc;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Probability that a housekeeping pass sweeps every session, not just the current one.
const SWEEP_PROBABILITY: f64 = 0.05;

/// Owns the descriptor store and the worker substrate for one app.
pub struct TaskManager {
    store: TaskStore,
    launcher: Arc<dyn WorkerLauncher>,
    ttl: Duration,
    known_work: Arc<HashSet<String>>,
}

impl TaskManager {
    pub fn new(
        store: TaskStore,
        launcher: Arc<dyn WorkerLauncher>,
        ttl: Duration,
        known_work: impl IntoIterator<Item = String>,
    ) -> Self {
        TaskManager {
            store,
            launcher,
            ttl,
            known_work: Arc::new(known_work.into_iter().collect()),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn handle(&self, session_id: &str) -> BackgroundTasks {
        BackgroundTasks::new(
            session_id,
            self.store.clone(),
            self.ttl,
            Arc::clone(&self.known_work),
        )
    }

    /// Reaps the session's expired records, occasionally every session's.
    pub fn housekeeping(&self, session_id: &str) {
        let now = Utc::now();
        match self.store.reap(session_id, now) {
            Ok(0) => {}
            Ok(n) => tracing::debug!(session = %session_id, removed = n, "Reaped expired tasks"),
            Err(e) => tracing::warn!(session = %session_id, error = %e, "Task housekeeping failed"),
        }

        if rand::thread_rng().gen::<f64>() < SWEEP_PROBABILITY {
            if let Err(e) = self.store.sweep(now) {
                tracing::warn!(error = %e, "Task sweep failed");
            }
        }
    }

    /// Makes sure pending work has a worker before the process exits.
    /// Returns whether a worker was launched.
    pub fn finalize(&self, session_id: &str) -> Result<bool> {
        let pending = self.store.pending(session_id, Utc::now())?;
        if pending.is_empty() {
            return Ok(false);
        }
        if self.launcher.is_active(session_id) {
            tracing::debug!(session = %session_id, pending = pending.len(), "Worker already active");
            return Ok(false);
        }
        self.launcher.launch(session_id)?;
        tracing::info!(session = %session_id, pending = pending.len(), "Launched task worker");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn manager(root: &std::path::Path, launcher: Arc<RecordingLauncher>) -> TaskManager {
        TaskManager::new(
            TaskStore::new(root),
            launcher,
            Duration::from_secs(60),
            ["lint".to_string()],
        )
    }

    #[test]
    fn test_finalize_launches_once_per_session() {
        let temp = tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::new());
        let manager = manager(temp.path(), Arc::clone(&launcher));

        assert!(!manager.finalize("s1").unwrap());

        let tasks = manager.handle("s1");
        tasks.schedule("lint", json!({})).unwrap();
        tasks.commit().unwrap();
        assert!(manager.finalize("s1").unwrap());
        assert_eq!(launcher.launches(), vec!["s1".to_string()]);

        launcher.set_active("s1", true);
        assert!(!manager.finalize("s1").unwrap());
        assert_eq!(launcher.launches().len(), 1);
    }
}
