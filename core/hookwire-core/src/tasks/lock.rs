//! Per-session worker lock: a `worker.lock/` directory holding `pid` and
//! `meta.json`. `mkdir` is atomic, so at most one worker holds it at a time.
//!
//! A lock whose PID is dead (or whose PID has been reused by a process with a
//! different start time) is stale and may be taken over.

use chrono::Utc;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLockInfo {
    pub pid: u32,
    pub session_id: String,
    /// Process start time (Unix seconds) for PID identity verification.
    #[serde(default)]
    pub proc_started: Option<u64>,
    /// Lock creation time (Unix seconds).
    pub created: u64,
}

fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: kill with signal 0 only checks for existence/permission.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn process_start_time(pid: u32) -> Option<u64> {
    use sysinfo::{Pid, System};

    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process(pid) {
        return None;
    }
    sys.process(pid).map(|p| p.start_time())
}

pub fn read_lock_info(lock_dir: &Path) -> Option<WorkerLockInfo> {
    let pid: u32 = fs::read_to_string(lock_dir.join("pid"))
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let meta = fs::read_to_string(lock_dir.join("meta.json")).ok()?;
    let info: WorkerLockInfo = serde_json::from_str(&meta).ok()?;
    (info.pid == pid).then_some(info)
}

/// Whether a live worker currently holds the lock at `lock_dir`.
pub fn is_worker_alive(lock_dir: &Path) -> bool {
    let Some(info) = read_lock_info(lock_dir) else {
        return false;
    };
    if !is_pid_alive(info.pid) {
        return false;
    }
    match (info.proc_started, process_start_time(info.pid)) {
        (Some(expected), Some(actual)) => expected == actual,
        // Can't verify identity; trust the live PID.
        _ => true,
    }
}

/// Held for as long as the value lives; the directory is removed on drop.
#[derive(Debug)]
pub struct WorkerLock {
    dir: PathBuf,
}

impl WorkerLock {
    /// Tries to take the lock. `Ok(None)` means a live worker already has it.
    pub fn acquire(lock_dir: &Path, session_id: &str) -> Result<Option<WorkerLock>> {
        if let Some(parent) = lock_dir.parent() {
            fs::create_dir_all(parent)?;
        }

        for _attempt in 0..2 {
            match std::fs::create_dir(lock_dir) {
                Ok(()) => {
                    let lock = WorkerLock {
                        dir: lock_dir.to_path_buf(),
                    };
                    lock.write_info(session_id)?;
                    return Ok(Some(lock));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_worker_alive(lock_dir) || is_being_written(lock_dir) {
                        return Ok(None);
                    }
                    tracing::info!(session = %session_id, "Removing stale worker lock");
                    if let Err(e) = fs::remove_dir_all(lock_dir) {
                        if e.kind() != ErrorKind::NotFound {
                            return Err(e.into());
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn write_info(&self, session_id: &str) -> Result<()> {
        let pid = std::process::id();
        let info = WorkerLockInfo {
            pid,
            session_id: session_id.to_string(),
            proc_started: process_start_time(pid),
            created: Utc::now().timestamp().max(0) as u64,
        };
        fs::write(self.dir.join("meta.json"), serde_json::to_vec(&info)?)?;
        // pid last: a lock with a pid file is fully written.
        fs::write(self.dir.join("pid"), pid.to_string())?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            tracing::warn!(error = %e, "Failed to release worker lock");
        }
    }
}

/// A freshly created lock dir without a pid file yet belongs to a worker
/// that is still writing it. Give it a few seconds before calling it stale.
fn is_being_written(lock_dir: &Path) -> bool {
    if lock_dir.join("pid").exists() {
        return false;
    }
    fs::metadata(lock_dir)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age.as_secs() < 5)
}


#[cfg(test)]
mod tests {
    use super::tests_helper::create_lock;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_no_lock_means_no_worker() {
        let temp = tempdir().unwrap();
        assert!(!is_worker_alive(&temp.path().join("worker.lock")));
    }

    #[test]
    fn test_lock_with_dead_pid_is_not_alive() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("worker.lock");
        create_lock(&dir, 99999999);
        assert!(!is_worker_alive(&dir));
    }

    #[test]
    fn test_lock_with_live_pid_is_alive() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("worker.lock");
        create_lock(&dir, std::process::id());
        assert!(is_worker_alive(&dir));
    }

    #[test]
    fn test_acquire_is_exclusive_and_released_on_drop() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("s/worker.lock");

        let lock = WorkerLock::acquire(&dir, "s").unwrap().unwrap();
        assert!(is_worker_alive(&dir));
        assert!(WorkerLock::acquire(&dir, "s").unwrap().is_none());

        drop(lock);
        assert!(!dir.exists());
        assert!(WorkerLock::acquire(&dir, "s").unwrap().is_some());
    }

    #[test]
    fn test_acquire_takes_over_stale_lock() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("worker.lock");
        create_lock(&dir, 99999999);

        let lock = WorkerLock::acquire(&dir, "s").unwrap().unwrap();
        assert_eq!(read_lock_info(lock.dir()).unwrap().pid, std::process::id());
    }
}
