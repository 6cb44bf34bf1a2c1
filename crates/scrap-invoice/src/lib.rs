//! Invoice-processor abstraction for the SCRAP settlement bridge.
//!
//! The bridge drives an [`InvoiceClient`]: create an invoice bound to a task,
//! then poll it until paid. Two implementations exist:
//!
//! - [`FakeInvoiceClient`](fake::FakeInvoiceClient) - deterministic ids and a
//!   scheduled auto-pay, for demos and tests
//! - [`BtcPayClient`](btcpay::BtcPayClient) - the BTCPay Server Greenfield
//!   REST API with bearer-token auth

use async_trait::async_trait;
use serde::Serialize;

use scrap_types::settlement::SettlementError;

pub mod btcpay;
pub mod fake;

/// Invoice statuses treated as paid for settlement purposes.
pub const PAID_STATUSES: [&str; 4] = ["paid", "confirmed", "complete", "settled"];

/// Metadata attached to an invoice, binding it to a task and token.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceMetadata {
    pub task_id: String,
    pub token_id: String,
    pub payment_hash: String,
    pub proof_hash: String,
}

/// Result of creating an invoice.
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    pub invoice_id: String,
    pub invoice_url: String,
    pub status: String,
}

/// Point-in-time view of an invoice, as much of it as the processor reports.
#[derive(Debug, Clone, Default)]
pub struct InvoiceSnapshot {
    pub status: Option<String>,
    pub additional_status: Option<String>,
    pub paid_at: Option<u64>,
}

impl InvoiceSnapshot {
    /// True when either status field reads as paid, case-insensitively.
    pub fn is_paid(&self) -> bool {
        let matches_paid = |status: &Option<String>| {
            status
                .as_deref()
                .map(|s| PAID_STATUSES.contains(&s.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        };
        matches_paid(&self.status) || matches_paid(&self.additional_status)
    }
}

/// An external invoice processor.
///
/// Referenced by the bridge, never owned by settlement records.
#[async_trait]
pub trait InvoiceClient {
    /// Creates an invoice for `usd_amount` carrying the task binding.
    async fn create_invoice(
        &self,
        usd_amount: f64,
        metadata: &InvoiceMetadata,
    ) -> Result<CreatedInvoice, SettlementError>;

    /// Fetches the current state of a previously created invoice.
    async fn get_invoice(&self, invoice_id: &str) -> Result<InvoiceSnapshot, SettlementError>;
}
