//! Request construction and the response wait loop.

use serde_json::Value;
use std::error::Error;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use scrap_types::crypto::{CryptoError, SchnorrEngine};
use scrap_types::keys::KeyRing;
use scrap_types::message::{
    MessageType, TaskRequest, message_type_of, task_hash_for_signature,
};
use scrap_types::timestamp::UnixTimestamp;
use scrap_types::transport::{recv_message, send_message};
use scrap_types::util::Base64Bytes;

use crate::Cli;

/// Signs the canonical request form, or degrades to an empty signature under
/// the mock policy.
fn sign_request(
    request: &Value,
    privkey: Option<&[u8]>,
    engine: &SchnorrEngine,
    allow_mock: bool,
) -> Result<String, Box<dyn Error>> {
    if let Some(privkey) = privkey {
        let msg32 = task_hash_for_signature(request);
        match engine.sign(&msg32, privkey) {
            Ok(signature) => return Ok(hex::encode(signature)),
            Err(CryptoError::Unavailable) => {}
            Err(err) => return Err(err.into()),
        }
    }
    if allow_mock {
        tracing::info!("commander signature mocked");
        Ok(String::new())
    } else {
        Err("commander signature unavailable (enable bip340 or pass --allow-mock-signatures)".into())
    }
}

pub async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let ring = KeyRing::load(&cli.keys)?;
    let commander_pubkey = ring
        .commander_pubkey
        .clone()
        .ok_or("keys require commander_pubkey")?;
    let commander_privkey = ring.commander_privkey_bytes()?;

    let token_bytes = std::fs::read(&cli.token)?;

    let mut request = TaskRequest {
        message_type: MessageType::TaskRequest,
        message_name: MessageType::TaskRequest.name().to_string(),
        task_id: cli.task_id.clone(),
        timestamp: UnixTimestamp::now(),
        task_type: cli.task_type.clone(),
        requested_capability: cli.requested_capability.clone(),
        max_amount_sats: cli.max_amount_sats,
        capability_token: Base64Bytes::encode(&token_bytes).to_string(),
        commander_pubkey,
        correlation_id: None,
        commander_signature: None,
    };

    let engine = SchnorrEngine::load();
    let unsigned = serde_json::to_value(&request)?;
    request.commander_signature = Some(sign_request(
        &unsigned,
        commander_privkey.as_deref(),
        &engine,
        cli.allow_mock_signatures,
    )?);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let target = tokio::net::lookup_host((cli.target_host.as_str(), cli.target_port))
        .await?
        .next()
        .ok_or("target host did not resolve")?;
    send_message(&socket, target, &request).await?;
    tracing::info!(task_id = %cli.task_id, target = %target, "task request sent");

    let deadline = Instant::now() + Duration::from_secs(cli.timeout);
    while Instant::now() < deadline {
        let payload = match recv_message(&socket, Duration::from_secs(2)).await {
            Ok(Some((payload, _))) => payload,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable datagram");
                continue;
            }
        };

        match message_type_of(&payload) {
            Ok(MessageType::TaskReject) => {
                tracing::info!(
                    task_id = %cli.task_id,
                    details = ?payload.get("details"),
                    notes = ?payload.get("notes"),
                    "task rejected"
                );
                return Ok(());
            }
            Ok(MessageType::TaskAccept) => {
                tracing::info!(
                    task_id = %cli.task_id,
                    payment_hash = ?payload.get("payment_hash"),
                    "task accepted"
                );
            }
            Ok(MessageType::Proof) => {
                tracing::info!(
                    task_id = %cli.task_id,
                    proof_hash = ?payload.get("proof_hash"),
                    "proof received"
                );
                return Ok(());
            }
            other => {
                tracing::warn!(message_type = ?other.ok(), "unexpected message");
            }
        }
    }

    tracing::warn!(task_id = %cli.task_id, "timeout waiting for response");
    Ok(())
}
