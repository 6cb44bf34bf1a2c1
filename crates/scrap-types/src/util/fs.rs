//! Crash-safe JSON file persistence.
//!
//! The replay cache, the settlement store, and the revocation list are all
//! whole-file rewrites. Writes go to a sibling temp file which is then renamed
//! into place, so a crash mid-write never yields a partial file.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io;
use std::path::Path;

/// Serializes `value` as pretty JSON and atomically replaces `path` with it.
///
/// Parent directories are created as needed. The rename is the commit point.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, payload)?;
    fs::rename(&tmp, path)
}

/// Reads and deserializes a JSON file, returning `None` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let value = serde_json::from_str(&content)?;
    Ok(Some(value))
}
