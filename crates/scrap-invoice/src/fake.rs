//! In-memory invoice client with deterministic ids and scheduled auto-pay.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use scrap_types::crypto::sha256_hex_parts;
use scrap_types::settlement::SettlementError;
use scrap_types::timestamp::UnixTimestamp;

use crate::{CreatedInvoice, InvoiceClient, InvoiceMetadata, InvoiceSnapshot};

#[derive(Debug)]
struct FakeInvoice {
    status: String,
    created_at: u64,
    paid_at: Option<u64>,
}

/// Invoice client for demos and tests.
///
/// Invoice ids are derived from the amount and task binding, so repeated runs
/// with the same inputs produce the same id. An invoice flips from `New` to
/// `Paid` once `auto_pay_after` seconds have elapsed since creation; a
/// negative value disables auto-pay.
pub struct FakeInvoiceClient {
    auto_pay_after: i64,
    invoices: Mutex<HashMap<String, FakeInvoice>>,
}

impl FakeInvoiceClient {
    pub fn new(auto_pay_after: i64) -> Self {
        Self {
            auto_pay_after,
            invoices: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl InvoiceClient for FakeInvoiceClient {
    async fn create_invoice(
        &self,
        usd_amount: f64,
        metadata: &InvoiceMetadata,
    ) -> Result<CreatedInvoice, SettlementError> {
        let invoice_id = sha256_hex_parts(&[
            &format!("{usd_amount:.2}"),
            &metadata.task_id,
            &metadata.token_id,
            "fake",
        ])[..32]
            .to_string();
        let invoice_url = format!("https://fake.btcpay.local/i/{invoice_id}");

        let mut invoices = self.invoices.lock().expect("fake invoice lock poisoned");
        invoices.insert(
            invoice_id.clone(),
            FakeInvoice {
                status: "New".to_string(),
                created_at: UnixTimestamp::now().as_secs(),
                paid_at: None,
            },
        );

        Ok(CreatedInvoice {
            invoice_id,
            invoice_url,
            status: "New".to_string(),
        })
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<InvoiceSnapshot, SettlementError> {
        let mut invoices = self.invoices.lock().expect("fake invoice lock poisoned");
        let invoice = invoices
            .get_mut(invoice_id)
            .ok_or_else(|| SettlementError::InvoiceMissing(invoice_id.to_string()))?;

        let now = UnixTimestamp::now().as_secs();
        if invoice.status == "New"
            && self.auto_pay_after >= 0
            && now.saturating_sub(invoice.created_at) >= self.auto_pay_after as u64
        {
            invoice.status = "Paid".to_string();
            invoice.paid_at = Some(now);
        }

        Ok(InvoiceSnapshot {
            status: Some(invoice.status.clone()),
            additional_status: None,
            paid_at: invoice.paid_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> InvoiceMetadata {
        InvoiceMetadata {
            task_id: "t1".to_string(),
            token_id: "00".repeat(16),
            payment_hash: "11".repeat(32),
            proof_hash: "22".repeat(32),
        }
    }

    #[tokio::test]
    async fn test_deterministic_invoice_id() {
        let client = FakeInvoiceClient::new(0);
        let first = client.create_invoice(0.10, &metadata()).await.unwrap();
        let second = client.create_invoice(0.10, &metadata()).await.unwrap();
        assert_eq!(first.invoice_id, second.invoice_id);
        assert_eq!(first.invoice_id.len(), 32);
        assert_eq!(
            first.invoice_url,
            format!("https://fake.btcpay.local/i/{}", first.invoice_id)
        );
    }

    #[tokio::test]
    async fn test_immediate_auto_pay() {
        let client = FakeInvoiceClient::new(0);
        let created = client.create_invoice(0.10, &metadata()).await.unwrap();
        assert_eq!(created.status, "New");

        let snapshot = client.get_invoice(&created.invoice_id).await.unwrap();
        assert!(snapshot.is_paid());
        assert!(snapshot.paid_at.is_some());
    }

    #[tokio::test]
    async fn test_auto_pay_disabled() {
        let client = FakeInvoiceClient::new(-1);
        let created = client.create_invoice(0.10, &metadata()).await.unwrap();
        let snapshot = client.get_invoice(&created.invoice_id).await.unwrap();
        assert!(!snapshot.is_paid());
    }

    #[tokio::test]
    async fn test_unknown_invoice_is_an_error() {
        let client = FakeInvoiceClient::new(0);
        let err = client.get_invoice("missing").await.unwrap_err();
        assert_eq!(err.code(), "invoice_missing");
    }
}
