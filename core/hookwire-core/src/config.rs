//! Engine configuration.
//!
//! Paths and TTLs are carried in an explicit [`EngineConfig`] value handed to
//! the app at construction. Layering, lowest priority first:
//!
//! 1. built-in defaults rooted at `~/.hookwire`
//! 2. `<home>/config.json` (best-effort; malformed files are ignored)
//! 3. environment: `HOOKWIRE_HOME`, `HOOKWIRE_TASK_TTL_SECS`, `HOOKWIRE_OBSERVABILITY`
//!
//! Task TTLs above [`MAX_TASK_TTL`](crate::tasks::types::MAX_TASK_TTL) (one week) are clamped.

use fs_err as fs;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tasks::types::clamp_ttl;

const DEFAULT_DIR: &str = ".hookwire";
const CONFIG_FILE: &str = "config.json";
const DEFAULT_TASK_TTL_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub home: PathBuf,
    /// Session state records and background task descriptors live here.
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub task_ttl: Duration,
    /// Executable re-launched as the background worker. `None` means the current exe.
    pub worker_program: Option<PathBuf>,
    /// Write observability JSONL files under `log_dir`.
    pub observability: bool,
}

/// On-disk overrides. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    state_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    task_ttl_secs: Option<u64>,
    worker_program: Option<PathBuf>,
    observability: Option<bool>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let home = dirs::home_dir()
            .map(|h| h.join(DEFAULT_DIR))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIR));
        EngineConfig::with_home(home)
    }
}

impl EngineConfig {
    /// Config rooted at `home` with default layout and TTL. Used by tests.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        EngineConfig {
            state_dir: home.join("state"),
            log_dir: home.join("logs"),
            home,
            task_ttl: Duration::from_secs(DEFAULT_TASK_TTL_SECS),
            worker_program: None,
            observability: true,
        }
    }

    pub fn task_ttl(mut self, ttl: Duration) -> Self {
        self.task_ttl = clamp_ttl(ttl);
        self
    }

    /// Defaults, then `config.json`, then environment.
    pub fn load() -> Self {
        let mut config = match env::var_os("HOOKWIRE_HOME") {
            Some(home) => EngineConfig::with_home(home),
            None => EngineConfig::default(),
        };

        if let Some(file) = read_config_file(&config.home.join(CONFIG_FILE)) {
            config.apply_file(file);
        }

        if let Some(ttl) = env::var("HOOKWIRE_TASK_TTL_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            config.task_ttl = clamp_ttl(Duration::from_secs(ttl));
        }
        if let Ok(v) = env::var("HOOKWIRE_OBSERVABILITY") {
            config.observability = !matches!(v.trim(), "0" | "false" | "off");
        }

        config
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(dir) = file.state_dir {
            self.state_dir = self.resolve(dir);
        }
        if let Some(dir) = file.log_dir {
            self.log_dir = self.resolve(dir);
        }
        if let Some(ttl) = file.task_ttl_secs {
            self.task_ttl = clamp_ttl(Duration::from_secs(ttl));
        }
        if file.worker_program.is_some() {
            self.worker_program = file.worker_program;
        }
        if let Some(enabled) = file.observability {
            self.observability = enabled;
        }
    }

    /// Relative paths in the config file are relative to `home`.
    fn resolve(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.home.join(path)
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.state_dir.join("tasks")
    }
}

fn read_config_file(path: &Path) -> Option<ConfigFile> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "Ignoring malformed config file");
            None
        }
    }
}
