//! The end-to-end settlement flow.
//!
//! Phase A polls the invoice until paid, then locks. Phase B reads executor
//! replies until the matching proof arrives. Terminal errors stamp
//! `last_error` on the settlement record before propagating.

use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use url::Url;

use scrap_invoice::btcpay::{BtcPayClient, BtcPayConfig};
use scrap_invoice::fake::FakeInvoiceClient;
use scrap_invoice::{InvoiceClient, InvoiceMetadata};
use scrap_types::crypto::{SchnorrEngine, sha256_hex_parts};
use scrap_types::keys::KeyRing;
use scrap_types::message::{MessageType, TaskRequest, task_hash_for_signature};
use scrap_types::settlement::{
    SettlementError, SettlementRecord, SettlementStore, compute_payment_hash, compute_proof_hash,
};
use scrap_types::timestamp::UnixTimestamp;
use scrap_types::token::CapabilityToken;
use scrap_types::transport::{recv_message, send_message};
use scrap_types::util::Base64Bytes;

use crate::wire::{PaymentLock, SettlementSignal, classify};
use crate::{BridgeError, Cli};

fn config_err(message: impl Into<String>) -> BridgeError {
    BridgeError::Config(message.into())
}

/// Builds the invoice client selected by `--fake` / `--real`.
fn build_client(cli: &Cli) -> Result<Box<dyn InvoiceClient + Send + Sync>, BridgeError> {
    if cli.real {
        let config = BtcPayConfig::resolve(
            cli.btcpay_config.as_deref(),
            cli.btcpay_url.clone(),
            cli.btcpay_api_key.clone(),
            cli.btcpay_store_id.clone(),
        )
        .map_err(|err| config_err(format!("failed to load BTCPay config: {err}")))?;

        let missing = config.missing();
        if !missing.is_empty() {
            return Err(config_err(format!(
                "missing BTCPay config: {}",
                missing.join(", ")
            )));
        }
        let api_base = Url::parse(config.api_base.as_deref().expect("checked"))
            .map_err(|err| config_err(format!("invalid BTCPay url: {err}")))?;
        Ok(Box::new(BtcPayClient::new(
            api_base,
            config.api_key.expect("checked"),
            config.store_id.expect("checked"),
        )))
    } else {
        Ok(Box::new(FakeInvoiceClient::new(cli.fake_auto_pay_after)))
    }
}

/// Resolves the commander public key: the token subject, cross-checked
/// against keys.json when present.
fn resolve_commander_pubkey(
    token: &CapabilityToken,
    ring: Option<&KeyRing>,
) -> Result<String, BridgeError> {
    let subject = token.subject.clone();
    if subject.is_empty() {
        return Err(config_err("token has an empty subject"));
    }
    if let Some(ring) = ring
        && let Some(keys_pubkey) = &ring.commander_pubkey
        && *keys_pubkey != subject
    {
        return Err(config_err("token subject does not match keys.json commander_pubkey"));
    }
    Ok(subject)
}

pub async fn run(cli: Cli) -> Result<(), BridgeError> {
    let token_bytes = std::fs::read(&cli.token)
        .map_err(|err| config_err(format!("failed to read token {}: {err}", cli.token.display())))?;
    let token = CapabilityToken::from_bytes(&token_bytes)
        .map_err(|err| config_err(format!("failed to parse token: {err}")))?;

    let token_id = token.token_id_hex();
    if let Some(override_id) = &cli.token_id
        && *override_id != token_id
    {
        return Err(config_err("token_id does not match the token file"));
    }

    let ring = match KeyRing::load(&cli.keys) {
        Ok(ring) => Some(ring),
        Err(_) => None,
    };
    let commander_pubkey = resolve_commander_pubkey(&token, ring.as_ref())?;

    let now = UnixTimestamp::now();
    let task_id = cli.task_id.clone().unwrap_or_else(|| {
        sha256_hex_parts(&[&now.to_string(), &token_id])[..32].to_string()
    });
    let requested_capability = cli
        .requested_capability
        .clone()
        .or_else(|| token.capabilities.first().cloned())
        .ok_or_else(|| config_err("no requested capability"))?;

    let correlation_id = sha256_hex_parts(&[&format!("{task_id}:{token_id}")]);

    let mut store = SettlementStore::open(&cli.settlement_store)
        .map_err(|err| BridgeError::Settlement(err.into()))?;
    let client = build_client(&cli)?;

    let payment_hash = compute_payment_hash(&task_id, &token_id);
    let proof_hash = compute_proof_hash(&task_id, &payment_hash);
    let metadata = InvoiceMetadata {
        task_id: task_id.clone(),
        token_id: token_id.clone(),
        payment_hash,
        proof_hash,
    };

    let invoice = client
        .create_invoice(cli.usd, &metadata)
        .await
        .map_err(BridgeError::Settlement)?;

    let mut record = SettlementRecord::open(
        task_id.clone(),
        token_id.clone(),
        invoice.invoice_id.clone(),
        invoice.invoice_url.clone(),
        now,
    );
    store
        .upsert(record.clone())
        .map_err(|err| BridgeError::Settlement(err.into()))?;

    println!("INVOICE_URL {}", invoice.invoice_url);
    tracing::info!(
        task_id = %task_id,
        invoice_id = %invoice.invoice_id,
        usd_amount = cli.usd,
        "invoice created"
    );

    let socket = UdpSocket::bind((cli.bind.as_str(), cli.bind_port))
        .await
        .map_err(|err| config_err(format!("failed to bind {}:{}: {err}", cli.bind, cli.bind_port)))?;
    let target = tokio::net::lookup_host((cli.target_host.as_str(), cli.target_port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| config_err("target host did not resolve"))?;

    send_task_request(
        &cli,
        &socket,
        target,
        &token_bytes,
        &task_id,
        &requested_capability,
        &commander_pubkey,
        &correlation_id,
        ring.as_ref(),
    )
    .await?;
    tracing::info!(task_id = %task_id, target = %target, "task request sent");

    let outcome = drive(&cli, client.as_ref(), &socket, target, &correlation_id, &mut record, &mut store).await;
    match outcome {
        Ok(()) => {
            let claimed_at = record.claimed_at.unwrap_or(now);
            println!(
                "DEMO SUCCESS task_id={} invoice_id={} usd_amount={} payment_hash={} proof_hash={} claimed_at={}",
                task_id, record.invoice_id, cli.usd, record.payment_hash, record.proof_hash, claimed_at
            );
            Ok(())
        }
        Err(err) => {
            record.last_error = Some(format!("{}: {}", err.code(), err));
            if let Err(store_err) = store.upsert(record.clone()) {
                tracing::error!(error = %store_err, "failed to persist last_error");
            }
            tracing::error!(code = err.code(), message = %err, "settlement error");
            Err(BridgeError::Settlement(err))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_task_request(
    cli: &Cli,
    socket: &UdpSocket,
    target: SocketAddr,
    token_bytes: &[u8],
    task_id: &str,
    requested_capability: &str,
    commander_pubkey: &str,
    correlation_id: &str,
    ring: Option<&KeyRing>,
) -> Result<(), BridgeError> {
    let mut request = TaskRequest {
        message_type: MessageType::TaskRequest,
        message_name: MessageType::TaskRequest.name().to_string(),
        task_id: task_id.to_string(),
        timestamp: UnixTimestamp::now(),
        task_type: "imaging".to_string(),
        requested_capability: requested_capability.to_string(),
        max_amount_sats: cli.max_amount_sats,
        capability_token: Base64Bytes::encode(token_bytes).to_string(),
        commander_pubkey: commander_pubkey.to_string(),
        correlation_id: Some(correlation_id.to_string()),
        commander_signature: None,
    };

    let engine = SchnorrEngine::load();
    let privkey = ring
        .and_then(|ring| ring.commander_privkey_bytes().ok())
        .flatten();
    let signature = privkey.as_deref().and_then(|privkey| {
        let unsigned = serde_json::to_value(&request).expect("request serializes");
        let msg32 = task_hash_for_signature(&unsigned);
        engine.sign(&msg32, privkey).ok()
    });
    request.commander_signature = Some(match signature {
        Some(signature) => hex::encode(signature),
        None => {
            tracing::info!("commander signature mocked");
            String::new()
        }
    });

    send_message(socket, target, &request)
        .await
        .map_err(|err| BridgeError::Settlement(err.into()))?;
    Ok(())
}

/// Phase A then phase B; every early return is a terminal settlement error.
async fn drive(
    cli: &Cli,
    client: &(dyn InvoiceClient + Send + Sync),
    socket: &UdpSocket,
    target: SocketAddr,
    correlation_id: &str,
    record: &mut SettlementRecord,
    store: &mut SettlementStore,
) -> Result<(), SettlementError> {
    let snapshot = wait_for_payment(client, &record.invoice_id, cli.poll_interval, cli.invoice_timeout).await?;
    record.mark_locked(UnixTimestamp::now());
    store.upsert(record.clone())?;
    tracing::info!(
        task_id = %record.task_id,
        status = ?snapshot.status,
        "payment locked"
    );

    let lock = PaymentLock {
        kind: PaymentLock::KIND,
        task_id: record.task_id.clone(),
        correlation_id: correlation_id.to_string(),
        payment_hash: record.payment_hash.clone(),
        amount_sats: cli.max_amount_sats,
        timeout_blocks: cli.timeout_blocks,
        timestamp: UnixTimestamp::now(),
    };
    send_message(socket, target, &lock).await?;
    tracing::info!(
        task_id = %record.task_id,
        payment_hash = %record.payment_hash,
        "payment lock sent"
    );

    wait_for_proof(socket, record, cli.exec_timeout).await?;

    let proof_hash = record.proof_hash.clone();
    record.mark_claimed(&proof_hash, UnixTimestamp::now())?;
    store.upsert(record.clone())?;
    Ok(())
}

/// Polls the invoice until paid or `timeout_sec` elapses.
async fn wait_for_payment(
    client: &(dyn InvoiceClient + Send + Sync),
    invoice_id: &str,
    poll_interval: u64,
    timeout_sec: u64,
) -> Result<scrap_invoice::InvoiceSnapshot, SettlementError> {
    let deadline = Instant::now() + Duration::from_secs(timeout_sec);
    while Instant::now() < deadline {
        let snapshot = client.get_invoice(invoice_id).await?;
        if snapshot.is_paid() {
            return Ok(snapshot);
        }
        tokio::time::sleep(Duration::from_secs(poll_interval)).await;
    }
    Err(SettlementError::InvoiceTimeout)
}

/// Reads executor replies until the matching proof arrives.
async fn wait_for_proof(
    socket: &UdpSocket,
    record: &SettlementRecord,
    timeout_sec: u64,
) -> Result<(), SettlementError> {
    let deadline = Instant::now() + Duration::from_secs(timeout_sec);
    while Instant::now() < deadline {
        let payload: Value = match recv_message(socket, Duration::from_secs(2)).await {
            Ok(Some((payload, _))) => payload,
            Ok(None) => continue,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(error = %err, "dropping undecodable datagram");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        match classify(&payload) {
            SettlementSignal::TaskAccepted { payment_hash } => {
                if payment_hash.as_deref() != Some(record.payment_hash.as_str()) {
                    return Err(SettlementError::PaymentHashMismatch);
                }
                tracing::info!(payment_hash = ?payment_hash, "task accepted");
            }
            SettlementSignal::Proof { task_id, proof_hash } => {
                if task_id.as_deref() != Some(record.task_id.as_str()) {
                    return Err(SettlementError::TaskIdMismatch);
                }
                if proof_hash.as_deref() != Some(record.proof_hash.as_str()) {
                    return Err(SettlementError::ProofHashMismatch);
                }
                tracing::info!(proof_hash = ?proof_hash, "proof received");
                return Ok(());
            }
            SettlementSignal::TaskRejected { details } => {
                return Err(SettlementError::TaskRejected(details));
            }
            SettlementSignal::PaymentClaim { payment_hash } => {
                tracing::info!(payment_hash = ?payment_hash, "payment claim received");
            }
            SettlementSignal::Other => {}
        }
    }
    Err(SettlementError::ProofTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use scrap_types::settlement::SettlementState;
    use serde_json::json;

    fn cli() -> Cli {
        Cli::parse_from([
            "scrap-bridge",
            "--usd",
            "0.10",
            "--target-host",
            "127.0.0.1",
            "--fake",
            "--fake-auto-pay-after",
            "0",
            "--poll-interval",
            "0",
            "--exec-timeout",
            "10",
        ])
    }

    async fn setup(
        dir: &tempfile::TempDir,
    ) -> (FakeInvoiceClient, SettlementRecord, SettlementStore) {
        let client = FakeInvoiceClient::new(0);
        let task_id = "t1".to_string();
        let token_id = format!("{}01", "00".repeat(15));
        let metadata = InvoiceMetadata {
            task_id: task_id.clone(),
            token_id: token_id.clone(),
            payment_hash: compute_payment_hash(&task_id, &token_id),
            proof_hash: String::new(),
        };
        let invoice = client.create_invoice(0.10, &metadata).await.unwrap();

        let record = SettlementRecord::open(
            task_id,
            token_id,
            invoice.invoice_id,
            invoice.invoice_url,
            UnixTimestamp::from_secs(1),
        );
        let mut store = SettlementStore::open(dir.path().join("settlement.json")).unwrap();
        store.upsert(record.clone()).unwrap();
        (client, record, store)
    }

    /// Binds a stand-in executor that answers the payment lock with the given
    /// replies.
    async fn executor_stub(replies: Vec<Value>) -> (UdpSocket, SocketAddr, tokio::task::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = socket.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let lock: Value = serde_json::from_slice(&buf[..len]).unwrap();
            assert_eq!(lock["type"], "payment_lock");
            for reply in replies {
                socket
                    .send_to(&serde_json::to_vec(&reply).unwrap(), from)
                    .await
                    .unwrap();
            }
        });
        let bridge_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (bridge_socket, target, handle)
    }

    #[tokio::test]
    async fn test_drive_happy_path_reaches_claimed() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut record, mut store) = setup(&dir).await;

        let replies = vec![
            json!({
                "message_type": 2,
                "task_id": record.task_id,
                "payment_hash": record.payment_hash,
            }),
            json!({
                "message_type": 4,
                "task_id": record.task_id,
                "proof_hash": record.proof_hash,
            }),
        ];
        let (socket, target, stub) = executor_stub(replies).await;

        drive(&cli(), &client, &socket, target, "corr", &mut record, &mut store)
            .await
            .unwrap();
        stub.await.unwrap();

        assert_eq!(record.state, SettlementState::Claimed);
        assert!(record.locked_at.is_some());
        assert!(record.claimed_at.is_some());

        let persisted = SettlementStore::open(store.path()).unwrap();
        assert_eq!(
            persisted.get("t1").unwrap().state,
            SettlementState::Claimed
        );
    }

    #[tokio::test]
    async fn test_drive_rejection_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut record, mut store) = setup(&dir).await;

        let replies = vec![json!({
            "type": "task_rejected",
            "task_id": record.task_id,
            "details": ["token expired"],
        })];
        let (socket, target, stub) = executor_stub(replies).await;

        let err = drive(&cli(), &client, &socket, target, "corr", &mut record, &mut store)
            .await
            .unwrap_err();
        stub.await.unwrap();
        assert_eq!(err.code(), "task_rejected");
    }

    #[tokio::test]
    async fn test_drive_proof_hash_mismatch_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut record, mut store) = setup(&dir).await;

        let replies = vec![json!({
            "message_type": 4,
            "task_id": record.task_id,
            "proof_hash": "00".repeat(32),
        })];
        let (socket, target, stub) = executor_stub(replies).await;

        let err = drive(&cli(), &client, &socket, target, "corr", &mut record, &mut store)
            .await
            .unwrap_err();
        stub.await.unwrap();
        assert_eq!(err.code(), "proof_hash_mismatch");
        assert_eq!(record.state, SettlementState::LockedAcked);
    }
}
