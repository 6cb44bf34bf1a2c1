//! SCRAP commander entrypoint.
//!
//! Builds a `task_request` carrying the capability token, signs its canonical
//! form with the commander key, sends it over UDP, and waits for the
//! executor's terminal response: a `task_reject`, or a `task_accept` followed
//! by the matching `proof_of_execution`.

mod run;

use clap::Parser;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scrap-commander")]
#[command(about = "SCRAP commander: one-shot task requester")]
pub struct Cli {
    /// Executor host.
    #[arg(long)]
    pub target_host: String,
    /// Executor port.
    #[arg(long, default_value_t = 7227)]
    pub target_port: u16,
    /// Path to the binary capability token.
    #[arg(long)]
    pub token: PathBuf,
    /// Path to keys.json carrying the commander keypair.
    #[arg(long)]
    pub keys: PathBuf,
    /// Task identifier.
    #[arg(long)]
    pub task_id: String,
    /// Capability the task exercises.
    #[arg(long)]
    pub requested_capability: String,
    /// Task type label.
    #[arg(long, default_value = "imaging")]
    pub task_type: String,
    /// Payment ceiling in satoshis.
    #[arg(long, default_value_t = 22000)]
    pub max_amount_sats: u64,
    /// Send an empty signature when signing is unavailable.
    #[arg(long)]
    pub allow_mock_signatures: bool,
    /// Seconds to wait for a terminal response.
    #[arg(long, default_value_t = 15)]
    pub timeout: u64,
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
