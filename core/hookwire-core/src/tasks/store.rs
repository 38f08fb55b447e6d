//! File-backed task descriptor store.
//!
//! # Layout
//!
//! ```text
//! <tasks_dir>/<session-key>/
//!     <task_id>.json        descriptor, replaced atomically on every transition
//!     <task_id>.collected   consumption marker (exclusive create)
//!     worker.lock/          present while a worker drains this session
//! ```
//!
//! Descriptors have a single writer (the worker executing them), so the only
//! cross-process coordination needed is the exclusive create of the marker,
//! which makes `collect` hand out a result at most once.

use chrono::{DateTime, Utc};
use fs_err as fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::Result;
use crate::storage::{session_key, write_json_atomic};

use super::types::{ttl_delta, TaskDescriptor, TaskOutcome, TaskStatus, DESCRIPTOR_VERSION};

const DESCRIPTOR_EXT: &str = "json";
const MARKER_EXT: &str = "collected";
const WORKER_LOCK: &str = "worker.lock";

#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        TaskStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_key(session_id))
    }

    pub fn worker_lock_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(WORKER_LOCK)
    }

    fn descriptor_path(&self, session_id: &str, task_id: &str) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{}.{}", task_id, DESCRIPTOR_EXT))
    }

    fn marker_path(&self, session_id: &str, task_id: &str) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{}.{}", task_id, MARKER_EXT))
    }

    pub fn write(&self, descriptor: &TaskDescriptor) -> Result<()> {
        write_json_atomic(
            &self.descriptor_path(&descriptor.session_id, &descriptor.task_id),
            descriptor,
        )
    }

    pub fn read(&self, session_id: &str, task_id: &str) -> Result<Option<TaskDescriptor>> {
        if !is_valid_task_id(task_id) {
            return Ok(None);
        }
        read_descriptor(&self.descriptor_path(session_id, task_id))
    }

    /// All descriptors of a session, oldest first.
    pub fn list(&self, session_id: &str) -> Result<Vec<TaskDescriptor>> {
        let dir = self.session_dir(session_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut descriptors = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == DESCRIPTOR_EXT) {
                if let Some(d) = read_descriptor(&path)? {
                    descriptors.push(d);
                }
            }
        }
        descriptors.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(descriptors)
    }

    /// Pending descriptors still inside their TTL, oldest first.
    pub fn pending(&self, session_id: &str, now: DateTime<Utc>) -> Result<Vec<TaskDescriptor>> {
        Ok(self
            .list(session_id)?
            .into_iter()
            .filter(|d| d.status == TaskStatus::Pending && !d.is_expired(now))
            .collect())
    }

    pub fn is_collected(&self, session_id: &str, task_id: &str) -> bool {
        self.marker_path(session_id, task_id).exists()
    }

    /// Current status without consuming anything.
    pub fn observe(&self, session_id: &str, task_id: &str, now: DateTime<Utc>) -> Result<TaskOutcome> {
        let Some(descriptor) = self.read(session_id, task_id)? else {
            return Ok(TaskOutcome::NotFound);
        };
        let outcome = descriptor.observe(now);
        if outcome.is_finished() && self.is_collected(session_id, task_id) {
            return Ok(TaskOutcome::AlreadyCollected);
        }
        Ok(outcome)
    }

    /// Like [`observe`](Self::observe), but a finished result is handed out
    /// exactly once; later calls report [`TaskOutcome::AlreadyCollected`].
    pub fn collect(&self, session_id: &str, task_id: &str, now: DateTime<Utc>) -> Result<TaskOutcome> {
        let outcome = self.observe(session_id, task_id, now)?;
        if !outcome.is_finished() {
            return Ok(outcome);
        }

        let claimed = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.marker_path(session_id, task_id));
        match claimed {
            Ok(_) => Ok(outcome),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(TaskOutcome::AlreadyCollected),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes expired records of one session. Terminal descriptors go once
    /// their TTL has elapsed; stuck pending/running ones are kept for a second
    /// TTL so observers still get to see them as `failed("timeout")`.
    pub fn reap(&self, session_id: &str, now: DateTime<Utc>) -> Result<usize> {
        reap_dir(&self.session_dir(session_id), now)
    }

    /// Reaps every session under the root.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            removed += reap_dir(entry.path(), now)?;
        }
        Ok(removed)
    }
}

fn is_valid_task_id(task_id: &str) -> bool {
    !task_id.is_empty() && task_id.chars().all(|c| c.is_ascii_alphanumeric())
}

fn read_descriptor(path: &Path) -> Result<Option<TaskDescriptor>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str::<TaskDescriptor>(&content) {
        Ok(d) if d.version == DESCRIPTOR_VERSION => Ok(Some(d)),
        Ok(d) => {
            tracing::warn!(task = %d.task_id, version = d.version, "Unsupported task descriptor version");
            Ok(None)
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "Failed to parse task descriptor");
            Ok(None)
        }
    }
}

fn reap_dir(dir: &Path, now: DateTime<Utc>) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.extension().is_some_and(|e| e == DESCRIPTOR_EXT) {
            continue;
        }
        let Some(descriptor) = read_descriptor(&path)? else {
            continue;
        };

        let reapable = if descriptor.status.is_terminal() {
            descriptor.is_expired(now)
        } else {
            // Stuck descriptors get one extra TTL before they are deleted.
            descriptor
                .expires_at()
                .zip(ttl_delta(descriptor.ttl_secs))
                .and_then(|(at, grace)| at.checked_add_signed(grace))
                .map_or(true, |deadline| now > deadline)
        };
        if !reapable {
            continue;
        }

        remove_if_exists(&path)?;
        remove_if_exists(&path.with_extension(MARKER_EXT))?;
        tracing::debug!(task = %descriptor.task_id, status = ?descriptor.status, "Reaped task");
        removed += 1;
    }

    // Orphaned markers whose descriptor is already gone.
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == MARKER_EXT)
                && !path.with_extension(DESCRIPTOR_EXT).exists()
            {
                remove_if_exists(&path)?;
            }
        }
    }

    // Only succeeds when nothing (descriptor, marker, worker lock) is left.
    let _ = std::fs::remove_dir(dir);

    Ok(removed)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
