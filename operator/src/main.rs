//! SCRAP operator entrypoint.
//!
//! Issues TLV-encoded capability tokens signed under `SCRAP/token/v1` and
//! maintains the append-only revocation list.
//!
//! Subcommands:
//! - `issue-token` - encode, sign, and write a token (plus optional metadata)
//! - `revoke` - add a token id to the revocation list

mod issue;
mod revoke;

use clap::{Parser, Subcommand};
use std::process;
use tracing_subscriber::EnvFilter;

use crate::issue::IssueArgs;
use crate::revoke::RevokeArgs;

#[derive(Parser, Debug)]
#[command(name = "scrap-operator")]
#[command(about = "SCRAP operator: issue and revoke capability tokens")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a capability token.
    IssueToken(IssueArgs),
    /// Add a token id to the revocation list.
    Revoke(RevokeArgs),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::IssueToken(args) => issue::run(args),
        Command::Revoke(args) => revoke::run(args),
    };
    if let Err(e) = result {
        eprintln!("{e}");
        process::exit(1)
    }
}
