//! Revocation list mutation.
//!
//! The list is a monotonic append-only set of token ids, persisted as a
//! sorted JSON array. The operator is its sole writer; executors read it on
//! each request and treat it as eventually consistent.

use clap::Args;
use std::error::Error;
use std::path::{Path, PathBuf};

use scrap_types::util::fs::{read_json, write_json_atomic};

#[derive(Args, Debug)]
pub struct RevokeArgs {
    /// Path to the revocation list JSON file.
    #[arg(long)]
    pub revocation_list: PathBuf,
    /// Token id (hex) to revoke.
    #[arg(long)]
    pub token_id: String,
}

pub fn run(args: RevokeArgs) -> Result<(), Box<dyn Error>> {
    let total = revoke(&args.revocation_list, &args.token_id)?;
    tracing::info!(token_id = %args.token_id, total, "token revoked");
    Ok(())
}

/// Adds `token_id` to the list at `path`, returning the resulting list size.
fn revoke(path: &Path, token_id: &str) -> Result<usize, std::io::Error> {
    let mut revoked: Vec<String> = read_json(path)?.unwrap_or_default();
    revoked.push(token_id.to_string());
    revoked.sort();
    revoked.dedup();
    write_json_atomic(path, &revoked)?;
    Ok(revoked.len())
}
