//! The detached side of background tasks: named work functions and the loop
//! that drains a session's pending descriptors.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::error::{HookError, Result};

use super::lock::WorkerLock;
use super::store::TaskStore;
use super::types::{TaskDescriptor, TaskStatus, TIMEOUT_ERROR};

pub type WorkFn = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Work functions addressable by `work_ref`. The hook invocation and the
/// worker process must register the same table.
#[derive(Clone, Default)]
pub struct WorkRegistry {
    works: HashMap<String, WorkFn>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        WorkRegistry::default()
    }

    pub fn register<F, Fut>(&mut self, name: &str, work: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if name.trim().is_empty() {
            return Err(HookError::config("work name must not be empty"));
        }
        if self.works.contains_key(name) {
            return Err(HookError::config(format!(
                "work '{}' is already registered",
                name
            )));
        }
        let work: WorkFn = Arc::new(move |args| work(args).boxed());
        self.works.insert(name.to_string(), work);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<WorkFn> {
        self.works.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.works.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.works.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRegistry")
            .field("works", &self.works.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Another live worker already held the session's lock.
    pub lock_busy: bool,
}

/// Drains every pending descriptor of `session_id`, one at a time, oldest first.
///
/// Returns immediately if another worker holds the session lock. After
/// releasing the lock it looks once more for descriptors scheduled in the
/// meantime, so nothing is stranded between the last scan and the release.
pub async fn run_worker(
    store: &TaskStore,
    works: &WorkRegistry,
    session_id: &str,
) -> Result<WorkerReport> {
    let mut report = WorkerReport::default();

    loop {
        let Some(lock) = WorkerLock::acquire(&store.worker_lock_dir(session_id), session_id)?
        else {
            tracing::debug!(session = %session_id, "Worker already active, exiting");
            report.lock_busy = true;
            break;
        };

        loop {
            let pending = store.pending(session_id, Utc::now())?;
            if pending.is_empty() {
                break;
            }
            for descriptor in pending {
                execute(store, works, descriptor, &mut report).await?;
            }
        }

        drop(lock);

        if store.pending(session_id, Utc::now())?.is_empty() {
            break;
        }
    }

    tracing::info!(
        session = %session_id,
        succeeded = report.succeeded,
        failed = report.failed,
        "Worker finished"
    );
    Ok(report)
}

async fn execute(
    store: &TaskStore,
    works: &WorkRegistry,
    mut descriptor: TaskDescriptor,
    report: &mut WorkerReport,
) -> Result<()> {
    // Re-read right before starting: the listing may be stale.
    match store.read(&descriptor.session_id, &descriptor.task_id)? {
        Some(current) if current.status == TaskStatus::Pending => descriptor = current,
        _ => return Ok(()),
    }

    descriptor.status = TaskStatus::Running;
    descriptor.started_at = Some(Utc::now());
    descriptor.worker_pid = Some(std::process::id());
    store.write(&descriptor)?;

    tracing::info!(task = %descriptor.task_id, work = %descriptor.work_ref, "Task started");

    let outcome = match works.get(&descriptor.work_ref) {
        None => Err(format!("unknown work: {}", descriptor.work_ref)),
        Some(work) => {
            let remaining = descriptor.remaining(Utc::now());
            let run = AssertUnwindSafe(work(descriptor.args.clone())).catch_unwind();
            match tokio::time::timeout(remaining, run).await {
                Err(_) => Err(TIMEOUT_ERROR.to_string()),
                Ok(Err(_panic)) => Err("work panicked".to_string()),
                Ok(Ok(Err(e))) => Err(format!("{:#}", e)),
                Ok(Ok(Ok(value))) => Ok(value),
            }
        }
    };

    descriptor.finished_at = Some(Utc::now());
    match outcome {
        Ok(value) => {
            descriptor.status = TaskStatus::Done;
            descriptor.result = Some(value);
            report.succeeded += 1;
            tracing::info!(task = %descriptor.task_id, "Task done");
        }
        Err(message) => {
            descriptor.status = TaskStatus::Failed;
            tracing::warn!(task = %descriptor.task_id, error = %message, "Task failed");
            descriptor.error = Some(message);
            report.failed += 1;
        }
    }
    store.write(&descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::lock::tests_helper::create_lock;
    use crate::tasks::types::TaskOutcome;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn registry() -> WorkRegistry {
        let mut works = WorkRegistry::new();
        works
            .register("double", |args: Value| async move {
                let n = args["n"].as_i64().unwrap_or(0);
                Ok(json!(n * 2))
            })
            .unwrap();
        works
            .register("explode", |_args: Value| async move {
                Err(anyhow::anyhow!("boom"))
            })
            .unwrap();
        works
    }

    #[test]
    fn test_duplicate_work_name_is_configuration_error() {
        let mut works = registry();
        let err = works
            .register("double", |_args: Value| async move { Ok(Value::Null) })
            .unwrap_err();
        assert!(matches!(err, HookError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_worker_drains_pending_tasks() {
        let temp = tempdir().unwrap();
        let store = TaskStore::new(temp.path());
        let ttl = Duration::from_secs(60);
        let ok = TaskDescriptor::new("s1", "double", json!({"n": 21}), ttl);
        let bad = TaskDescriptor::new("s1", "explode", Value::Null, ttl);
        let unknown = TaskDescriptor::new("s1", "missing", Value::Null, ttl);
        for d in [&ok, &bad, &unknown] {
            store.write(d).unwrap();
        }

        let report = run_worker(&store, &registry(), "s1").await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert!(!report.lock_busy);

        let now = Utc::now();
        assert_eq!(
            store.collect("s1", &ok.task_id, now).unwrap(),
            TaskOutcome::Done(json!(42))
        );
        assert_eq!(
            store.collect("s1", &bad.task_id, now).unwrap(),
            TaskOutcome::Failed("boom".to_string())
        );
        assert_eq!(
            store.collect("s1", &unknown.task_id, now).unwrap(),
            TaskOutcome::Failed("unknown work: missing".to_string())
        );
        assert!(!store.worker_lock_dir("s1").exists());
    }

    #[tokio::test]
    async fn test_worker_exits_when_lock_held() {
        let temp = tempdir().unwrap();
        let store = TaskStore::new(temp.path());
        let d = TaskDescriptor::new("s1", "double", json!({"n": 1}), Duration::from_secs(60));
        store.write(&d).unwrap();
        create_lock(&store.worker_lock_dir("s1"), std::process::id());

        let report = run_worker(&store, &registry(), "s1").await.unwrap();
        assert!(report.lock_busy);
        assert_eq!(
            store.observe("s1", &d.task_id, Utc::now()).unwrap(),
            TaskOutcome::Pending
        );
    }

    #[tokio::test]
    async fn test_work_exceeding_ttl_fails_with_timeout() {
        let temp = tempdir().unwrap();
        let store = TaskStore::new(temp.path());
        let mut works = WorkRegistry::new();
        works
            .register("slow", |_args: Value| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            })
            .unwrap();
        let d = TaskDescriptor::new("s1", "slow", Value::Null, Duration::from_secs(1));
        store.write(&d).unwrap();

        run_worker(&store, &works, "s1").await.unwrap();
        let stored = store.read("s1", &d.task_id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("timeout"));
    }
}
