//! Core types for the SCRAP capability and authorization protocol.
//!
//! SCRAP mediates authenticated, payment-bound task execution between three
//! roles: an operator issues capability tokens, a commander requests tasks,
//! and an executor validates and runs them. This crate provides the
//! foundational pieces shared by all three, plus the settlement state machine
//! used by the bridge that couples task execution to an external invoice
//! processor.
//!
//! # Modules
//!
//! - [`codec`] - BigSize varints and the ascending-ordered TLV stream format
//! - [`crypto`] - SHA-256, tagged hashes, and the Schnorr engine abstraction
//! - [`token`] - Capability token parsing, issuance, and validation
//! - [`message`] - Task-protocol wire messages and canonical request hashing
//! - [`replay`] - Single-use token-id ledger with expiry sweep
//! - [`settlement`] - Settlement records, deterministic hash bindings, store
//! - [`keys`] - Key material loaded from `keys.json`
//! - [`transport`] - JSON-datagram helpers over UDP
//! - [`timestamp`] - Unix timestamp type for message and record fields
//! - [`util`] - Base64, hex, canonical JSON, and atomic file writes

pub mod codec;
pub mod crypto;
pub mod keys;
pub mod message;
pub mod replay;
pub mod settlement;
pub mod timestamp;
pub mod token;
pub mod transport;
pub mod util;
