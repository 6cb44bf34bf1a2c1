//! SCRAP settlement bridge entrypoint.
//!
//! Acts as a commander that additionally drives an invoice processor: create
//! an invoice bound to `(task_id, token_id)`, send the task request, poll
//! until the invoice is paid, send a `payment_lock`, then wait for the proof
//! whose hash matches the deterministic binding. Every transition is
//! persisted to the settlement store.
//!
//! Exit codes: `0` success, `1` configuration error, `2` settlement error.

mod run;
mod wire;

use clap::Parser;
use std::path::PathBuf;
use std::process;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use scrap_types::settlement::SettlementError;

#[derive(Parser, Debug)]
#[command(name = "scrap-bridge")]
#[command(about = "SCRAP settlement bridge (BTCPay)")]
pub struct Cli {
    /// Invoice amount in USD.
    #[arg(long)]
    pub usd: f64,
    /// Task identifier; derived from the token id when absent.
    #[arg(long)]
    pub task_id: Option<String>,
    /// Token id override (hex); must match the token file.
    #[arg(long)]
    pub token_id: Option<String>,
    /// Path to the binary capability token.
    #[arg(long, default_value = "demo/config/token.bin")]
    pub token: PathBuf,
    /// Path to keys.json for the commander cross-check and signature.
    #[arg(long, default_value = "demo/config/keys.json")]
    pub keys: PathBuf,
    /// Capability to request; defaults to the token's first capability.
    #[arg(long)]
    pub requested_capability: Option<String>,
    /// Executor host.
    #[arg(long)]
    pub target_host: String,
    /// Executor port.
    #[arg(long, default_value_t = 7227)]
    pub target_port: u16,
    /// Address to bind for replies.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,
    /// Port to bind for replies; 0 picks an ephemeral port.
    #[arg(long, default_value_t = 0)]
    pub bind_port: u16,
    /// Payment ceiling in satoshis.
    #[arg(long, default_value_t = 25000)]
    pub max_amount_sats: u64,
    /// Lock timeout in blocks, carried in the payment_lock message.
    #[arg(long, default_value_t = 144)]
    pub timeout_blocks: u32,
    /// Seconds between invoice polls.
    #[arg(long, default_value_t = 2)]
    pub poll_interval: u64,
    /// Seconds to wait for the invoice to be paid.
    #[arg(long, default_value_t = 900)]
    pub invoice_timeout: u64,
    /// Seconds to wait for the execution proof.
    #[arg(long, default_value_t = 60)]
    pub exec_timeout: u64,
    /// Settlement store location.
    #[arg(long, default_value = "demo/runtime/settlement.json")]
    pub settlement_store: PathBuf,
    /// BTCPay config file ({api_base, api_key, store_id}).
    #[arg(long)]
    pub btcpay_config: Option<PathBuf>,
    /// BTCPay base URL.
    #[arg(long, env = "BTCPAY_URL")]
    pub btcpay_url: Option<String>,
    /// BTCPay API key.
    #[arg(long, env = "BTCPAY_API_KEY")]
    pub btcpay_api_key: Option<String>,
    /// BTCPay store id.
    #[arg(long, env = "BTCPAY_STORE_ID")]
    pub btcpay_store_id: Option<String>,
    /// Use the fake invoice client (default).
    #[arg(long, conflicts_with = "real")]
    pub fake: bool,
    /// Use the real BTCPay client.
    #[arg(long)]
    pub real: bool,
    /// Seconds until the fake client auto-pays; negative disables.
    #[arg(long, default_value_t = 2)]
    pub fake_auto_pay_after: i64,
}

/// Bridge failures, split by exit code.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run::run(cli).await {
        Ok(()) => {}
        Err(e @ BridgeError::Config(_)) => {
            eprintln!("{e}");
            process::exit(1)
        }
        Err(e @ BridgeError::Settlement(_)) => {
            eprintln!("{e}");
            process::exit(2)
        }
    }
}
