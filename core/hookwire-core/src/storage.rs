//! Shared file helpers for the state and task stores.

use fs_err as fs;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::error::Result;

/// Stable, filesystem-safe directory/file name for a session id.
pub fn session_key(session_id: &str) -> String {
    format!("{:x}", md5::compute(session_id))
}

/// Serializes `value` and replaces `path` atomically (temp file in the same
/// directory, then rename). Readers see either the old or the new record.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent_dir)?;

    let content = serde_json::to_vec_pretty(value)?;
    let mut temp_file = NamedTempFile::new_in(parent_dir)?;
    temp_file.write_all(&content)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path)?;
    Ok(())
}
