//! Task-protocol wire messages and canonical request hashing.
//!
//! Each UDP datagram is a single JSON object carrying a numeric
//! `message_type` and a human-readable `message_name`. The canonical form of
//! a request for hashing and signing is its field set minus
//! `commander_signature` and `message_name`, serialized key-sorted with no
//! whitespace.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::Value;
use thiserror::Error;

use crate::crypto::{TAG_TASK, sha256, tagged_hash};
use crate::timestamp::UnixTimestamp;
use crate::util::canonical::{canonical_json, without_fields};

/// Numeric wire discriminant of a task-protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    TaskRequest,
    TaskAccept,
    TaskReject,
    Proof,
}

impl MessageType {
    pub const fn code(&self) -> u8 {
        match self {
            MessageType::TaskRequest => 0x01,
            MessageType::TaskAccept => 0x02,
            MessageType::TaskReject => 0x03,
            MessageType::Proof => 0x04,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(MessageType::TaskRequest),
            0x02 => Some(MessageType::TaskAccept),
            0x03 => Some(MessageType::TaskReject),
            0x04 => Some(MessageType::Proof),
            _ => None,
        }
    }

    /// The `message_name` value paired with this type on the wire.
    pub const fn name(&self) -> &'static str {
        match self {
            MessageType::TaskRequest => "task_request",
            MessageType::TaskAccept => "task_accept",
            MessageType::TaskReject => "task_reject",
            MessageType::Proof => "proof_of_execution",
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let code = u8::deserialize(deserializer)?;
        MessageType::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown message_type {code}")))
    }
}

/// Errors raised while decoding inbound datagrams.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("missing message_type")]
    MissingType,
    #[error("unexpected message_type {0}")]
    UnexpectedType(u64),
}

/// A task execution request from commander to executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub message_type: MessageType,
    pub message_name: String,
    pub task_id: String,
    pub timestamp: UnixTimestamp,
    pub task_type: String,
    pub requested_capability: String,
    pub max_amount_sats: u64,
    /// Base64-encoded capability token bytes.
    pub capability_token: String,
    pub commander_pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commander_signature: Option<String>,
}

/// Executor acceptance, carrying the payment hash the settlement binds to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAccept {
    pub message_type: MessageType,
    pub message_name: String,
    pub task_id: String,
    pub timestamp: UnixTimestamp,
    /// Hash of the request minus its signature fields.
    pub in_reply_to: String,
    pub estimated_duration_sec: u64,
    pub payment_hash: String,
    pub amount_sats: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_signature: Option<String>,
}

/// Terminal rejection with accumulated validation issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReject {
    pub message_type: MessageType,
    pub message_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub timestamp: UnixTimestamp,
    pub reason: String,
    pub details: Vec<String>,
    pub notes: Vec<String>,
}

/// Proof of execution, closing the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    pub message_type: MessageType,
    pub message_name: String,
    pub task_id: String,
    pub timestamp: UnixTimestamp,
    pub status: String,
    pub output_hash: String,
    pub proof_hash: String,
    pub payment_hash: String,
}

/// Reads the numeric `message_type` discriminant out of a decoded datagram.
pub fn message_type_of(value: &Value) -> Result<MessageType, MessageError> {
    let code = value
        .get("message_type")
        .and_then(Value::as_u64)
        .ok_or(MessageError::MissingType)?;
    u8::try_from(code)
        .ok()
        .and_then(MessageType::from_code)
        .ok_or(MessageError::UnexpectedType(code))
}

/// Canonical bytes of a request: signature fields stripped, keys sorted,
/// compact separators.
pub fn canonical_request(request: &Value) -> Vec<u8> {
    let base = without_fields(request, &["commander_signature", "message_name"]);
    canonical_json(&base)
}

/// Hash of the canonical request, hex-encoded. Populates `in_reply_to`.
pub fn request_hash(request: &Value) -> String {
    hex::encode(sha256(&canonical_request(request)))
}

/// The 32-byte message a commander signs: tagged hash of the canonical
/// request under `SCRAP/task/v1`.
pub fn task_hash_for_signature(request: &Value) -> [u8; 32] {
    tagged_hash(TAG_TASK, &canonical_request(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> Value {
        json!({
            "message_type": 1,
            "message_name": "task_request",
            "task_id": "t1",
            "timestamp": 1_700_000_050,
            "task_type": "imaging",
            "requested_capability": "telemetry.read",
            "max_amount_sats": 22000,
            "capability_token": "AAAA",
            "commander_pubkey": "ab".repeat(32),
        })
    }

    #[test]
    fn test_message_type_codes() {
        assert_eq!(serde_json::to_string(&MessageType::TaskRequest).unwrap(), "1");
        let parsed: MessageType = serde_json::from_str("4").unwrap();
        assert_eq!(parsed, MessageType::Proof);
        assert!(serde_json::from_str::<MessageType>("9").is_err());
    }

    #[test]
    fn test_request_hash_ignores_signature_fields() {
        let unsigned = sample_request();
        let mut signed = unsigned.clone();
        signed["commander_signature"] = json!("f0".repeat(64));
        assert_eq!(request_hash(&unsigned), request_hash(&signed));

        // Any payload field participates.
        let mut altered = unsigned.clone();
        altered["task_id"] = json!("t2");
        assert_ne!(request_hash(&unsigned), request_hash(&altered));
    }

    #[test]
    fn test_task_hash_is_domain_separated() {
        let request = sample_request();
        let plain = sha256(&canonical_request(&request));
        assert_ne!(task_hash_for_signature(&request), plain);
    }

    #[test]
    fn test_request_struct_roundtrips_through_value() {
        let request = TaskRequest {
            message_type: MessageType::TaskRequest,
            message_name: MessageType::TaskRequest.name().to_string(),
            task_id: "t1".to_string(),
            timestamp: UnixTimestamp::from_secs(1_700_000_050),
            task_type: "imaging".to_string(),
            requested_capability: "telemetry.read".to_string(),
            max_amount_sats: 22000,
            capability_token: "AAAA".to_string(),
            commander_pubkey: "ab".repeat(32),
            correlation_id: None,
            commander_signature: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(message_type_of(&value).unwrap(), MessageType::TaskRequest);
        assert_eq!(value, sample_request());
    }

    #[test]
    fn test_message_type_of_rejects_unknown() {
        let value = json!({"message_type": 240});
        assert!(matches!(
            message_type_of(&value),
            Err(MessageError::UnexpectedType(240))
        ));
        let absent = json!({"type": "proof"});
        assert!(matches!(
            message_type_of(&absent),
            Err(MessageError::MissingType)
        ));
    }
}
