//! File-backed per-session key-value state.
//!
//! Each session gets `<state_dir>/sessions/<session-key>.json`:
//!
//! ```json
//! { "version": 1, "session_id": "abc", "updated_at": "...", "data": { "k": 1 } }
//! ```
//!
//! Records are read whole, mutated in memory and replaced atomically on save.
//! There is no cross-process lock: two invocations saving the same session
//! concurrently race and the last write wins.
//!
//! Loads are defensive in the same way for every caller: a missing, empty,
//! corrupt or wrong-version file is an empty record.

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;
use crate::storage::{session_key, write_json_atomic};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    session_id: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    data: Map<String, Value>,
}

/// Persistence backend: load/save a session's record by id.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StateStore { dir: dir.into() }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_key(session_id)))
    }

    pub fn load(&self, session_id: &str) -> Result<Map<String, Value>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(Map::new());
        }

        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            tracing::warn!(session = %session_id, "Empty state file, returning empty record");
            return Ok(Map::new());
        }

        match serde_json::from_str::<StateFile>(&content) {
            Ok(file) if file.version == STATE_VERSION => Ok(file.data),
            Ok(file) => {
                tracing::warn!(
                    session = %session_id,
                    version = file.version,
                    "Unsupported state file version, returning empty record"
                );
                Ok(Map::new())
            }
            Err(e) => {
                tracing::warn!(
                    session = %session_id,
                    error = %e,
                    "Failed to parse state file, returning empty record"
                );
                Ok(Map::new())
            }
        }
    }

    pub fn save(&self, session_id: &str, data: &Map<String, Value>) -> Result<()> {
        let file = StateFile {
            version: STATE_VERSION,
            session_id: session_id.to_string(),
            updated_at: Utc::now(),
            data: data.clone(),
        };
        write_json_atomic(&self.path_for(session_id), &file)
    }

    pub fn remove(&self, session_id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    /// Working copy; `None` until first access.
    data: Option<Map<String, Value>>,
    /// Last durable (or committed) contents, restored on rollback.
    baseline: Option<Map<String, Value>>,
    /// Snapshot from `save()` waiting for the dispatcher to commit it.
    staged: Option<Map<String, Value>>,
}

/// Per-invocation state handle injected into handlers.
///
/// The record is loaded on first access. `save()` stages a snapshot; the
/// dispatcher writes it once the calling handler has returned normally, and
/// discards it (along with in-memory edits) if the handler failed.
#[derive(Debug, Clone)]
pub struct State {
    session_id: String,
    store: StateStore,
    slot: Arc<Mutex<Slot>>,
}

impl State {
    pub fn new(session_id: impl Into<String>, store: StateStore) -> Self {
        State {
            session_id: session_id.into(),
            store,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_data<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        let mut slot = self.slot();
        if slot.data.is_none() {
            let loaded = self.store.load(&self.session_id).unwrap_or_else(|e| {
                tracing::warn!(session = %self.session_id, error = %e, "Failed to read state");
                Map::new()
            });
            slot.baseline = Some(loaded.clone());
            slot.data = Some(loaded);
        }
        f(slot.data.get_or_insert_with(Map::new))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.with_data(|data| data.get(key).cloned())
    }

    /// Typed read; `None` if the key is missing or has a different shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.with_data(|data| {
            data.insert(key.to_string(), value);
        });
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.with_data(|data| data.remove(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.with_data(|data| data.contains_key(key))
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.with_data(|data| data.clone())
    }

    /// Marks the current contents for persistence.
    pub fn save(&self) {
        let snapshot = self.snapshot();
        self.slot().staged = Some(snapshot);
    }

    /// Writes a staged snapshot, if any. Returns whether anything was written.
    /// Also makes the in-memory contents the new rollback point.
    pub(crate) fn commit(&self) -> Result<bool> {
        let staged = {
            let mut slot = self.slot();
            if slot.data.is_some() {
                slot.baseline = slot.data.clone();
            }
            slot.staged.take()
        };
        match staged {
            Some(data) => {
                self.store.save(&self.session_id, &data)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drops staged and in-memory changes made since the last commit.
    pub(crate) fn rollback(&self) {
        let mut slot = self.slot();
        slot.staged = None;
        slot.data = slot.baseline.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_save_then_fresh_load_round_trips() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());

        let state = State::new("s1", store.clone());
        state.set("k", 1).unwrap();
        state.save();
        assert!(state.commit().unwrap());

        let fresh = State::new("s1", store.clone());
        assert_eq!(fresh.get("k"), Some(json!(1)));
        assert_eq!(store.load("s1").unwrap().get("k"), Some(&json!(1)));
    }

    #[test]
    fn test_unsaved_changes_do_not_reach_disk() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());

        let state = State::new("s1", store.clone());
        state.set("k", 1).unwrap();
        assert!(!state.commit().unwrap());

        assert!(store.load("s1").unwrap().is_empty());
        assert!(!store.path_for("s1").exists());
    }

    #[test]
    fn test_rollback_discards_staged_save() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        store
            .save("s1", json!({"k": "before"}).as_object().unwrap())
            .unwrap();

        let state = State::new("s1", store.clone());
        state.set("k", "after").unwrap();
        state.save();
        state.rollback();

        assert_eq!(state.get("k"), Some(json!("before")));
        assert!(!state.commit().unwrap());
        assert_eq!(store.load("s1").unwrap().get("k"), Some(&json!("before")));
    }

    #[test]
    fn test_sessions_are_isolated() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());

        let a = State::new("a", store.clone());
        a.set("k", "a").unwrap();
        a.save();
        a.commit().unwrap();

        let b = State::new("b", store);
        assert_eq!(b.get("k"), None);
    }

    #[test]
    fn test_load_corrupt_file_returns_empty() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        fs::write(store.path_for("s1"), "{invalid json}").unwrap();
        assert!(store.load("s1").unwrap().is_empty());
    }

    #[test]
    fn test_load_unsupported_version_returns_empty() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        fs::write(
            store.path_for("s1"),
            r#"{"version":99,"session_id":"s1","updated_at":"2024-01-01T00:00:00Z","data":{"k":1}}"#,
        )
        .unwrap();
        assert!(store.load("s1").unwrap().is_empty());
    }

    #[test]
    fn test_get_as_typed() {
        let temp = tempdir().unwrap();
        let state = State::new("s1", StateStore::new(temp.path()));
        state.set("count", 3u32).unwrap();
        assert_eq!(state.get_as::<u32>("count"), Some(3));
        assert_eq!(state.get_as::<String>("count"), None);
    }
}
