//! Worker execution substrate: start a detached process that outlives the
//! hook invocation, and tell whether one is already running for a session.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use crate::error::{HookError, Result};

use super::lock::is_worker_alive;
use super::store::TaskStore;

/// Subcommand the runner understands for draining a session's tasks.
pub const WORKER_SUBCOMMAND: &str = "task-worker";

pub trait WorkerLauncher: Send + Sync {
    fn is_active(&self, session_id: &str) -> bool;
    fn launch(&self, session_id: &str) -> Result<()>;
}

/// Re-executes a hook binary as `task-worker --session-id <id> --state-dir <dir>`.
pub struct ProcessLauncher {
    program: Option<PathBuf>,
    state_dir: PathBuf,
    store: TaskStore,
}

impl ProcessLauncher {
    pub fn new(program: Option<PathBuf>, state_dir: PathBuf, store: TaskStore) -> Self {
        ProcessLauncher {
            program,
            state_dir,
            store,
        }
    }

    fn program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(p) => Ok(p.clone()),
            None => env::current_exe().map_err(HookError::from),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn is_active(&self, session_id: &str) -> bool {
        is_worker_alive(&self.store.worker_lock_dir(session_id))
    }

    fn launch(&self, session_id: &str) -> Result<()> {
        let program = self.program()?;
        let mut command = Command::new(&program);
        command
            .args([WORKER_SUBCOMMAND, "--session-id", session_id, "--state-dir"])
            .arg(&self.state_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Own process group, so the host tearing down the hook's group
        // doesn't take the worker with it.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn()?;
        tracing::debug!(
            session = %session_id,
            pid = child.id(),
            program = %program.display(),
            "Task worker spawned"
        );
        Ok(())
    }
}

/// Records launches instead of spawning processes.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    launches: Mutex<Vec<String>>,
    active: Mutex<HashSet<String>>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        RecordingLauncher::default()
    }

    pub fn launches(&self) -> Vec<String> {
        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Pretend a worker is (or is no longer) running for `session_id`.
    pub fn set_active(&self, session_id: &str, active: bool) {
        let mut set = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active {
            set.insert(session_id.to_string());
        } else {
            set.remove(session_id);
        }
    }
}

impl WorkerLauncher for RecordingLauncher {
    fn is_active(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(session_id)
    }

    fn launch(&self, session_id: &str) -> Result<()> {
        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(session_id.to_string());
        Ok(())
    }
}
