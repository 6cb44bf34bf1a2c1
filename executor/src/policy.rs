//! Executor policy file.

use serde::Deserialize;
use std::error::Error;
use std::path::{Path, PathBuf};

fn default_execute_delay() -> u64 {
    1
}

/// Per-node policy loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorPolicy {
    /// Node id tokens must name as their audience.
    pub node_id: String,
    #[serde(default)]
    pub allow_mock_signatures: bool,
    /// Require and verify a commander signature on every request.
    #[serde(default)]
    pub require_commander_sig: bool,
    /// Revocation list consumed from a trusted path.
    #[serde(default)]
    pub revocation_list_path: Option<PathBuf>,
    /// Replay cache location; replay protection is off when absent.
    #[serde(default)]
    pub replay_cache_path: Option<PathBuf>,
    /// Simulated execution time between accept and proof.
    #[serde(default = "default_execute_delay")]
    pub execute_delay_sec: u64,
}

impl ExecutorPolicy {
    pub fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| format!("failed to read policy {}: {err}", path.display()))?;
        let policy: ExecutorPolicy = serde_json::from_str(&content)
            .map_err(|err| format!("failed to parse policy {}: {err}", path.display()))?;
        if policy.node_id.is_empty() {
            return Err("policy requires node_id".into());
        }
        Ok(policy)
    }
}
