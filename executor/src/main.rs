//! SCRAP executor entrypoint.
//!
//! Binds a UDP socket and serves the task protocol: validate the capability
//! token and commander signature on each `task_request`, then either reply
//! with a single `task_reject` or emit `task_accept` followed by a
//! `proof_of_execution` after the simulated execution delay.

mod policy;
mod run;

use clap::Parser;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scrap-executor")]
#[command(about = "SCRAP executor: UDP task server")]
pub struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,
    /// Port to bind.
    #[arg(long, default_value_t = 7227)]
    pub port: u16,
    /// Path to keys.json.
    #[arg(long)]
    pub keys: PathBuf,
    /// Path to the executor policy JSON.
    #[arg(long)]
    pub policy: PathBuf,
    /// Treat undetermined signature verdicts as notes instead of failures.
    #[arg(long)]
    pub allow_mock_signatures: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run::run(cli).await {
        eprintln!("{e}");
        process::exit(1)
    }
}
