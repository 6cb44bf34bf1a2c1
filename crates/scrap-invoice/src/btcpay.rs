//! BTCPay Server Greenfield API client.
//!
//! Speaks the two endpoints the bridge needs: invoice creation and invoice
//! lookup, authenticated with `Authorization: token <api-key>`. Response
//! parsing tolerates both the `id`/`checkoutLink` and `invoiceId`/`url`
//! spellings seen across BTCPay versions.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::Path;
use url::Url;

use scrap_types::settlement::SettlementError;

use crate::{CreatedInvoice, InvoiceClient, InvoiceMetadata, InvoiceSnapshot};

/// Connection settings for a BTCPay store.
///
/// Resolution precedence: config file, then `BTCPAY_URL` / `BTCPAY_API_KEY` /
/// `BTCPAY_STORE_ID` environment variables, then explicit flags (the env and
/// flag layers arrive merged from clap).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BtcPayConfig {
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub store_id: Option<String>,
}

impl BtcPayConfig {
    /// Loads the file layer and applies override values on top.
    pub fn resolve(
        config_file: Option<&Path>,
        api_base: Option<String>,
        api_key: Option<String>,
        store_id: Option<String>,
    ) -> Result<Self, std::io::Error> {
        let mut config = match config_file {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                serde_json::from_str(&content)?
            }
            None => BtcPayConfig::default(),
        };
        if api_base.is_some() {
            config.api_base = api_base;
        }
        if api_key.is_some() {
            config.api_key = api_key;
        }
        if store_id.is_some() {
            config.store_id = store_id;
        }
        Ok(config)
    }

    /// Names of the settings still unset, for the configuration error path.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.api_base.is_none() {
            missing.push("api_base");
        }
        if self.api_key.is_none() {
            missing.push("api_key");
        }
        if self.store_id.is_none() {
            missing.push("store_id");
        }
        missing
    }
}

/// Client for one BTCPay store.
pub struct BtcPayClient {
    api_base: Url,
    api_key: String,
    store_id: String,
    http: reqwest::Client,
}

impl BtcPayClient {
    pub fn new(api_base: Url, api_key: String, store_id: String) -> Self {
        Self {
            api_base,
            api_key,
            store_id,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!(
            "{}/api/v1/stores/{}/invoices{}",
            self.api_base.as_str().trim_end_matches('/'),
            self.store_id,
            suffix
        )
    }

    async fn request(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<Value, SettlementError> {
        let response = builder
            .header("Authorization", format!("token {}", self.api_key))
            .send()
            .await
            .map_err(|err| SettlementError::BtcpayUrl(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(SettlementError::BtcpayHttp(format!("{status}: {details}")));
        }
        response
            .json()
            .await
            .map_err(|err| SettlementError::BtcpayHttp(err.to_string()))
    }

    fn fallback_url(&self, invoice_id: &str) -> String {
        format!(
            "{}/i/{invoice_id}",
            self.api_base.as_str().trim_end_matches('/')
        )
    }
}

fn string_field(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| data.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// Extracts a created invoice from a BTCPay response body.
fn parse_created(data: &Value, fallback_url: impl FnOnce(&str) -> String) -> Result<CreatedInvoice, SettlementError> {
    let invoice_id =
        string_field(data, &["id", "invoiceId"]).ok_or(SettlementError::BtcpayMissingInvoiceId)?;
    let invoice_url =
        string_field(data, &["checkoutLink", "url"]).unwrap_or_else(|| fallback_url(&invoice_id));
    let status = string_field(data, &["status"]).unwrap_or_else(|| "New".to_string());
    Ok(CreatedInvoice {
        invoice_id,
        invoice_url,
        status,
    })
}

/// Extracts an invoice snapshot from a BTCPay response body.
fn parse_snapshot(data: &Value) -> InvoiceSnapshot {
    InvoiceSnapshot {
        status: string_field(data, &["status"]),
        additional_status: string_field(data, &["additionalStatus"]),
        paid_at: ["paidAt", "paidAtUnix"]
            .iter()
            .find_map(|key| data.get(*key).and_then(Value::as_u64)),
    }
}

#[async_trait]
impl InvoiceClient for BtcPayClient {
    async fn create_invoice(
        &self,
        usd_amount: f64,
        metadata: &InvoiceMetadata,
    ) -> Result<CreatedInvoice, SettlementError> {
        let body = json!({
            "amount": usd_amount,
            "currency": "USD",
            "metadata": metadata,
        });
        let data = self
            .request(self.http.post(self.endpoint("")).json(&body))
            .await?;
        parse_created(&data, |id| self.fallback_url(id))
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<InvoiceSnapshot, SettlementError> {
        let data = self
            .request(self.http.get(self.endpoint(&format!("/{invoice_id}"))))
            .await?;
        Ok(parse_snapshot(&data))
    }
}
