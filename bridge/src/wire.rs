//! Settlement wire coupling.
//!
//! Outbound, the bridge sends a string-tagged `payment_lock` once the invoice
//! is paid. Inbound, executor replies are classified by the string `type` tag
//! when present, falling back to the numeric `message_type` header the task
//! protocol uses (2 → task_accepted, 3 → task_rejected, 4 → proof).

use serde::Serialize;
use serde_json::Value;

use scrap_types::message::MessageType;
use scrap_types::timestamp::UnixTimestamp;

/// Notifies the executor that the payment backing `payment_hash` is locked.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentLock {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub task_id: String,
    pub correlation_id: String,
    pub payment_hash: String,
    pub amount_sats: u64,
    pub timeout_blocks: u32,
    pub timestamp: UnixTimestamp,
}

impl PaymentLock {
    pub const KIND: &'static str = "payment_lock";
}

/// An inbound datagram, reduced to what the settlement wait loop acts on.
#[derive(Debug, PartialEq, Eq)]
pub enum SettlementSignal {
    TaskAccepted { payment_hash: Option<String> },
    TaskRejected { details: String },
    Proof { task_id: Option<String>, proof_hash: Option<String> },
    PaymentClaim { payment_hash: Option<String> },
    Other,
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Classifies an inbound datagram.
pub fn classify(value: &Value) -> SettlementSignal {
    let tag = match value.get("type").and_then(Value::as_str) {
        Some(tag) => Some(tag.to_string()),
        None => value
            .get("message_type")
            .and_then(Value::as_u64)
            .and_then(|code| u8::try_from(code).ok())
            .and_then(MessageType::from_code)
            .and_then(|message_type| match message_type {
                MessageType::TaskAccept => Some("task_accepted".to_string()),
                MessageType::TaskReject => Some("task_rejected".to_string()),
                MessageType::Proof => Some("proof".to_string()),
                MessageType::TaskRequest => None,
            }),
    };

    match tag.as_deref() {
        Some("task_accepted") => SettlementSignal::TaskAccepted {
            payment_hash: string_field(value, "payment_hash"),
        },
        Some("task_rejected") => SettlementSignal::TaskRejected {
            details: value
                .get("details")
                .map(Value::to_string)
                .unwrap_or_default(),
        },
        Some("proof") => SettlementSignal::Proof {
            task_id: string_field(value, "task_id"),
            proof_hash: string_field(value, "proof_hash"),
        },
        Some("payment_claim") => SettlementSignal::PaymentClaim {
            payment_hash: string_field(value, "payment_hash"),
        },
        _ => SettlementSignal::Other,
    }
}
