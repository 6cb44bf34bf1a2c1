//! Single-use token-id ledger with expiry sweep.
//!
//! The executor owns one replay cache file. Every mutation reloads the
//! persisted set, drops entries whose expiry has passed, and inserts the new
//! key only if absent. A duplicate insertion is a replay violation. The file
//! is rewritten atomically (temp file + rename), single writer per process.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::util::fs::{read_json, write_json_atomic};

/// File-backed ledger of used token identifiers.
///
/// Persisted as `{token_id_hex: expires_at}`, key-sorted.
#[derive(Debug, Clone)]
pub struct ReplayCache {
    path: PathBuf,
}

impl ReplayCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted set, tolerating a missing or unreadable file.
    fn load(&self) -> BTreeMap<String, u32> {
        read_json(&self.path).ok().flatten().unwrap_or_default()
    }

    /// Records one use of `token_id`.
    ///
    /// Returns `true` when this is the first use, `false` when the id was
    /// already present (a replay). Entries whose `expires_at` precedes `now`
    /// are purged before the membership check, so an expired id becomes
    /// usable again exactly when its token would no longer validate.
    pub fn check_and_add(&self, token_id: &[u8], expires_at: u32, now: u64) -> io::Result<bool> {
        let mut cache = self.load();
        cache.retain(|_, entry_expires| *entry_expires as u64 >= now);

        let key = hex::encode(token_id);
        if cache.contains_key(&key) {
            return Ok(false);
        }

        cache.insert(key, expires_at);
        write_json_atomic(&self.path, &cache)?;
        Ok(true)
    }
}
