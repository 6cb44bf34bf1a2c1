//! Settlement records, deterministic hash bindings, and the durable store.
//!
//! Settlement links an invoice, a task, and an execution proof through two
//! deterministic digests both sides can derive independently from
//! `(task_id, token_id)`:
//!
//! - `payment_hash = sha256(task_id || token_id || "payment")`
//! - `proof_hash   = sha256(task_id || payment_hash_hex || "proof")`
//!
//! Records advance `Requested → LockedAcked → Claimed` and are persisted as a
//! single JSON file rewritten atomically on every upsert.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::crypto::sha256_hex_parts;
use crate::timestamp::UnixTimestamp;
use crate::util::fs::{read_json, write_json_atomic};

/// Derives the payment hash binding a task to its token.
pub fn compute_payment_hash(task_id: &str, token_id: &str) -> String {
    sha256_hex_parts(&[task_id, token_id, "payment"])
}

/// Derives the proof hash expected for a task's execution proof.
pub fn compute_proof_hash(task_id: &str, payment_hash: &str) -> String {
    sha256_hex_parts(&[task_id, payment_hash, "proof"])
}

/// Lifecycle position of a settlement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementState {
    Requested,
    LockedAcked,
    Claimed,
}

/// Terminal settlement failures.
///
/// Each variant carries a stable machine-readable code recorded as
/// `last_error` and logged before the bridge exits with status 2.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("unknown invoice {0}")]
    InvoiceMissing(String),
    #[error("btcpay http error: {0}")]
    BtcpayHttp(String),
    #[error("btcpay url error: {0}")]
    BtcpayUrl(String),
    #[error("missing invoice id in response")]
    BtcpayMissingInvoiceId,
    #[error("invoice not paid before timeout")]
    InvoiceTimeout,
    #[error("task_accepted payment_hash mismatch")]
    PaymentHashMismatch,
    #[error("proof task_id mismatch")]
    TaskIdMismatch,
    #[error("proof hash mismatch")]
    ProofHashMismatch,
    #[error("proof arrived before payment locked")]
    ProofBeforeLock,
    #[error("task rejected: {0}")]
    TaskRejected(String),
    #[error("proof not received before timeout")]
    ProofTimeout,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SettlementError {
    /// Stable error code for logs and `last_error` stamps.
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::InvoiceMissing(_) => "invoice_missing",
            SettlementError::BtcpayHttp(_) => "btcpay_http_error",
            SettlementError::BtcpayUrl(_) => "btcpay_url_error",
            SettlementError::BtcpayMissingInvoiceId => "btcpay_missing_invoice_id",
            SettlementError::InvoiceTimeout => "invoice_timeout",
            SettlementError::PaymentHashMismatch => "payment_hash_mismatch",
            SettlementError::TaskIdMismatch => "task_id_mismatch",
            SettlementError::ProofHashMismatch => "proof_hash_mismatch",
            SettlementError::ProofBeforeLock => "proof_before_lock",
            SettlementError::TaskRejected(_) => "task_rejected",
            SettlementError::ProofTimeout => "proof_timeout",
            SettlementError::Io(_) => "io_error",
        }
    }
}

/// Durable per-task settlement state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub task_id: String,
    pub token_id: String,
    pub payment_hash: String,
    pub proof_hash: String,
    pub invoice_id: String,
    pub invoice_url: String,
    pub state: SettlementState,
    pub requested_at: UnixTimestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<UnixTimestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<UnixTimestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SettlementRecord {
    /// Opens a record in `Requested` with its hashes pre-derived.
    pub fn open(
        task_id: String,
        token_id: String,
        invoice_id: String,
        invoice_url: String,
        requested_at: UnixTimestamp,
    ) -> Self {
        let payment_hash = compute_payment_hash(&task_id, &token_id);
        let proof_hash = compute_proof_hash(&task_id, &payment_hash);
        SettlementRecord {
            task_id,
            token_id,
            payment_hash,
            proof_hash,
            invoice_id,
            invoice_url,
            state: SettlementState::Requested,
            requested_at,
            locked_at: None,
            claimed_at: None,
            last_error: None,
        }
    }

    /// Marks the invoice paid. A no-op outside `Requested`.
    pub fn mark_locked(&mut self, locked_at: UnixTimestamp) {
        if self.state == SettlementState::Requested {
            self.state = SettlementState::LockedAcked;
            self.locked_at = Some(locked_at);
        }
    }

    /// Marks the proof observed, completing the record.
    ///
    /// # Errors
    ///
    /// [`SettlementError::ProofBeforeLock`] unless the record is
    /// `LockedAcked`; [`SettlementError::ProofHashMismatch`] when the
    /// observed hash differs from the derived one.
    pub fn mark_claimed(
        &mut self,
        proof_hash: &str,
        claimed_at: UnixTimestamp,
    ) -> Result<(), SettlementError> {
        if self.state != SettlementState::LockedAcked {
            return Err(SettlementError::ProofBeforeLock);
        }
        if proof_hash != self.proof_hash {
            return Err(SettlementError::ProofHashMismatch);
        }
        self.state = SettlementState::Claimed;
        self.claimed_at = Some(claimed_at);
        Ok(())
    }
}

/// On-disk shape of the store. Older files were a bare array of records.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoreFile {
    Wrapped { records: Vec<SettlementRecord> },
    Bare(Vec<SettlementRecord>),
}

/// Durable settlement record set, keyed by `task_id`.
///
/// Every upsert rewrites the whole file, key-sorted, via temp-and-rename.
#[derive(Debug)]
pub struct SettlementStore {
    path: PathBuf,
    records: BTreeMap<String, SettlementRecord>,
}

impl SettlementStore {
    /// Opens a store, loading any existing file. Accepts both the wrapped
    /// `{records: [...]}` shape and the older bare-array shape.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut records = BTreeMap::new();
        if let Some(file) = read_json::<StoreFile>(&path)? {
            let loaded = match file {
                StoreFile::Wrapped { records } => records,
                StoreFile::Bare(records) => records,
            };
            for record in loaded {
                records.insert(record.task_id.clone(), record);
            }
        }
        Ok(SettlementStore { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or replaces a record and persists the full set.
    pub fn upsert(&mut self, record: SettlementRecord) -> io::Result<()> {
        self.records.insert(record.task_id.clone(), record);
        self.save()
    }

    fn save(&self) -> io::Result<()> {
        let file = StoreFile::Wrapped {
            records: self.records.values().cloned().collect(),
        };
        write_json_atomic(&self.path, &file)
    }

    pub fn get(&self, task_id: &str) -> Option<&SettlementRecord> {
        self.records.get(task_id)
    }

    pub fn get_by_invoice_id(&self, invoice_id: &str) -> Option<&SettlementRecord> {
        self.records.values().find(|r| r.invoice_id == invoice_id)
    }
}
