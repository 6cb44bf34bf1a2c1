//! Key material loaded from `keys.json`.
//!
//! One flat file carries the hex-encoded keypairs for all three roles. Each
//! binary loads the same file and picks the keys it needs; absent entries are
//! an error only when actually required.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::util::parse_hex;

/// Errors raised while loading or decoding key material.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read keys file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse keys file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("keys file is missing {0}")]
    Missing(&'static str),
    #[error("{0} is not valid hex")]
    Hex(&'static str),
}

/// Hex keypairs for the operator, commander, and executor roles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyRing {
    pub operator_pubkey: Option<String>,
    pub operator_privkey: Option<String>,
    pub commander_pubkey: Option<String>,
    pub commander_privkey: Option<String>,
    pub executor_pubkey: Option<String>,
    pub executor_privkey: Option<String>,
}

fn decode(value: &Option<String>, name: &'static str) -> Result<Vec<u8>, KeyError> {
    let hex_str = value.as_deref().ok_or(KeyError::Missing(name))?;
    parse_hex(hex_str).map_err(|_| KeyError::Hex(name))
}

fn decode_opt(value: &Option<String>, name: &'static str) -> Result<Option<Vec<u8>>, KeyError> {
    match value {
        None => Ok(None),
        Some(hex_str) => parse_hex(hex_str)
            .map(Some)
            .map_err(|_| KeyError::Hex(name)),
    }
}

impl KeyRing {
    /// Loads the key ring from a JSON file.
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn operator_pubkey_bytes(&self) -> Result<Vec<u8>, KeyError> {
        decode(&self.operator_pubkey, "operator_pubkey")
    }

    pub fn operator_privkey_bytes(&self) -> Result<Option<Vec<u8>>, KeyError> {
        decode_opt(&self.operator_privkey, "operator_privkey")
    }

    pub fn commander_privkey_bytes(&self) -> Result<Option<Vec<u8>>, KeyError> {
        decode_opt(&self.commander_privkey, "commander_privkey")
    }

    pub fn executor_privkey_bytes(&self) -> Result<Option<Vec<u8>>, KeyError> {
        decode_opt(&self.executor_privkey, "executor_privkey")
    }
}
