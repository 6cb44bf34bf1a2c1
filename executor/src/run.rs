//! Request handling and the UDP serve loop.
//!
//! Per request: `RECEIVED → (VALIDATED | REJECTED_TERMINAL) → ACCEPTED →
//! EXECUTING → PROOF_SENT`. Rejection is terminal; malformed traffic and
//! unexpected message types are logged and dropped without a reply.

use serde_json::Value;
use std::collections::HashSet;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UdpSocket;

use scrap_types::crypto::{SchnorrEngine, SigVerdict, sha256};
use scrap_types::keys::KeyRing;
use scrap_types::message::{
    MessageType, Proof, TaskAccept, TaskReject, message_type_of, request_hash,
    task_hash_for_signature,
};
use scrap_types::replay::ReplayCache;
use scrap_types::settlement::{compute_payment_hash, compute_proof_hash};
use scrap_types::timestamp::UnixTimestamp;
use scrap_types::token::{CapabilityToken, TokenIssue, ValidationContext};
use scrap_types::transport::{MAX_DATAGRAM, send_message};
use scrap_types::util::Base64Bytes;
use scrap_types::util::canonical::canonical_json;
use scrap_types::util::fs::read_json;
use scrap_types::util::parse_hex;

use crate::Cli;
use crate::policy::ExecutorPolicy;

/// Everything a request evaluation needs, assembled once at startup.
pub struct ExecutorContext {
    pub node_id: String,
    pub operator_pubkey: Vec<u8>,
    pub executor_pubkey: Option<String>,
    pub executor_privkey: Option<Vec<u8>>,
    pub allow_mock_signatures: bool,
    pub require_commander_sig: bool,
    pub revocation_list_path: Option<PathBuf>,
    pub replay_cache: Option<ReplayCache>,
    pub execute_delay_sec: u64,
    pub engine: SchnorrEngine,
}

/// Outcome of evaluating one `task_request`.
pub enum Evaluated {
    /// Terminal rejection carrying the accumulated issues.
    Reject(TaskReject),
    /// Validation passed; the accept message is ready to send.
    Accept(AcceptPlan),
}

/// An accepted request and the values the proof phase needs.
pub struct AcceptPlan {
    pub accept: TaskAccept,
    pub task_id: String,
    pub payment_hash: String,
    pub notes: Vec<String>,
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Reads the revocation list, tolerating a missing or unreadable file.
fn read_revocations(path: Option<&Path>) -> HashSet<String> {
    let Some(path) = path else {
        return HashSet::new();
    };
    read_json::<Vec<String>>(path)
        .ok()
        .flatten()
        .map(HashSet::from_iter)
        .unwrap_or_default()
}

/// Runs the full validation pipeline over a decoded `task_request`.
///
/// Field presence, token parse, token validation (replay last), subject
/// match, revocation, and the commander signature when policy requires it.
/// Any accumulated issue produces a single reject; otherwise the accept is
/// built with its deterministic payment hash and signed by the executor key.
pub fn evaluate_request(ctx: &ExecutorContext, payload: &Value, now: UnixTimestamp) -> Evaluated {
    let mut issues: Vec<String> = Vec::new();
    let mut notes: Vec<String> = Vec::new();

    let task_id = string_field(payload, "task_id");
    if task_id.is_none() {
        issues.push("missing task_id".to_string());
    }
    let requested_capability = string_field(payload, "requested_capability");
    if requested_capability.is_none() {
        issues.push("missing requested_capability".to_string());
    }
    let commander_pubkey = string_field(payload, "commander_pubkey");
    if commander_pubkey.is_none() {
        issues.push("missing commander_pubkey".to_string());
    }
    let token_b64 = string_field(payload, "capability_token");
    if token_b64.is_none() {
        issues.push("missing capability_token".to_string());
    }

    let token = token_b64.as_deref().and_then(|encoded| {
        let decoded = match Base64Bytes::from(encoded).decode() {
            Ok(decoded) => decoded,
            Err(err) => {
                issues.push(format!("token parse error: {err}"));
                return None;
            }
        };
        match CapabilityToken::from_bytes(&decoded) {
            Ok(token) => Some(token),
            Err(err) => {
                issues.push(format!("token parse error: {err}"));
                None
            }
        }
    });

    let mut token_id_hex = None;
    if let Some(token) = &token {
        let verdict = token.validate(
            &ValidationContext {
                now: now.as_secs(),
                expected_audience: &ctx.node_id,
                required_capability: requested_capability.as_deref(),
                operator_pubkey: &ctx.operator_pubkey,
                allow_mock_signatures: ctx.allow_mock_signatures,
            },
            &ctx.engine,
            ctx.replay_cache.as_ref(),
        );
        issues.extend(verdict.issues.iter().map(TokenIssue::to_string));
        notes.extend(verdict.notes);

        if let Some(commander_pubkey) = &commander_pubkey
            && token.subject != *commander_pubkey
        {
            issues.push(TokenIssue::SubjectMismatch.to_string());
        }

        let revoked = read_revocations(ctx.revocation_list_path.as_deref());
        if revoked.contains(&token.token_id_hex()) {
            issues.push(TokenIssue::Revoked.to_string());
        }

        token_id_hex = Some(token.token_id_hex());
    }

    if ctx.require_commander_sig {
        match string_field(payload, "commander_signature") {
            None => issues.push("missing commander_signature".to_string()),
            Some(signature_hex) => {
                let msg32 = task_hash_for_signature(payload);
                let verdict = match (
                    parse_hex(&signature_hex),
                    commander_pubkey.as_deref().map(parse_hex),
                ) {
                    (Ok(signature), Some(Ok(pubkey))) => {
                        ctx.engine.verify(&msg32, &signature, &pubkey)
                    }
                    _ if !ctx.engine.is_available() => SigVerdict::Undetermined,
                    _ => SigVerdict::Invalid,
                };
                match verdict {
                    SigVerdict::Valid => {}
                    SigVerdict::Invalid => {
                        issues.push("commander signature invalid".to_string())
                    }
                    SigVerdict::Undetermined => {
                        if ctx.allow_mock_signatures {
                            notes.push(
                                "commander signature verification skipped (mock mode)".to_string(),
                            );
                        } else {
                            issues
                                .push("commander signature verification unavailable".to_string());
                        }
                    }
                }
            }
        }
    }

    if !issues.is_empty() {
        return Evaluated::Reject(TaskReject {
            message_type: MessageType::TaskReject,
            message_name: MessageType::TaskReject.name().to_string(),
            task_id,
            timestamp: now,
            reason: "validation_failed".to_string(),
            details: issues,
            notes,
        });
    }

    // All checks passed: both unwraps are guarded by the issue scan above.
    let task_id = task_id.expect("task_id checked");
    let token_id_hex = token_id_hex.expect("token checked");
    let payment_hash = compute_payment_hash(&task_id, &token_id_hex);
    let amount_sats = payload
        .get("max_amount_sats")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let mut accept = TaskAccept {
        message_type: MessageType::TaskAccept,
        message_name: MessageType::TaskAccept.name().to_string(),
        task_id: task_id.clone(),
        timestamp: now,
        in_reply_to: request_hash(payload),
        estimated_duration_sec: ctx.execute_delay_sec,
        payment_hash: payment_hash.clone(),
        amount_sats,
        executor_pubkey: ctx.executor_pubkey.clone(),
        executor_signature: None,
    };

    let signature = ctx.executor_privkey.as_deref().and_then(|privkey| {
        let unsigned = serde_json::to_value(&accept).expect("accept serializes");
        let msg32 = sha256(&canonical_json(&unsigned));
        ctx.engine.sign(&msg32, privkey).ok()
    });
    match signature {
        Some(signature) => accept.executor_signature = Some(hex::encode(signature)),
        None => {
            accept.executor_signature = Some(String::new());
            notes.push("executor signature mocked".to_string());
        }
    }

    Evaluated::Accept(AcceptPlan {
        accept,
        task_id,
        payment_hash,
        notes,
    })
}

/// Builds the proof-of-execution message for an accepted task.
pub fn build_proof(task_id: &str, payment_hash: &str, completed_at: UnixTimestamp) -> Proof {
    let output_summary = serde_json::json!({
        "task_id": task_id,
        "status": "completed",
        "completed_at": completed_at,
    });
    let output_hash = hex::encode(sha256(&canonical_json(&output_summary)));
    Proof {
        message_type: MessageType::Proof,
        message_name: MessageType::Proof.name().to_string(),
        task_id: task_id.to_string(),
        timestamp: completed_at,
        status: "completed".to_string(),
        output_hash,
        proof_hash: compute_proof_hash(task_id, payment_hash),
        payment_hash: payment_hash.to_string(),
    }
}

pub async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let ring = KeyRing::load(&cli.keys)?;
    let policy = ExecutorPolicy::load(&cli.policy)?;

    let ctx = ExecutorContext {
        node_id: policy.node_id.clone(),
        operator_pubkey: ring.operator_pubkey_bytes()?,
        executor_pubkey: ring.executor_pubkey.clone(),
        executor_privkey: ring.executor_privkey_bytes()?,
        allow_mock_signatures: policy.allow_mock_signatures || cli.allow_mock_signatures,
        require_commander_sig: policy.require_commander_sig,
        revocation_list_path: policy.revocation_list_path.clone(),
        replay_cache: policy.replay_cache_path.as_ref().map(ReplayCache::new),
        execute_delay_sec: policy.execute_delay_sec,
        engine: SchnorrEngine::load(),
    };

    let socket = UdpSocket::bind((cli.bind.as_str(), cli.port)).await?;
    tracing::info!(
        bind = %cli.bind,
        port = cli.port,
        node_id = %ctx.node_id,
        engine = ctx.engine.name(),
        "executor started"
    );

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, addr) = socket.recv_from(&mut buf).await?;
        let payload: Value = match serde_json::from_slice(&buf[..len]) {
            Ok(payload) => payload,
            Err(_) => {
                tracing::warn!(source = %addr, "invalid json");
                continue;
            }
        };

        match message_type_of(&payload) {
            Ok(MessageType::TaskRequest) => {}
            other => {
                tracing::warn!(source = %addr, message_type = ?other.ok(), "unexpected message");
                continue;
            }
        }

        match evaluate_request(&ctx, &payload, UnixTimestamp::now()) {
            Evaluated::Reject(reject) => {
                tracing::info!(
                    task_id = ?reject.task_id,
                    details = ?reject.details,
                    notes = ?reject.notes,
                    "task rejected"
                );
                send_message(&socket, addr, &reject).await?;
            }
            Evaluated::Accept(plan) => {
                tracing::info!(
                    task_id = %plan.task_id,
                    payment_hash = %plan.payment_hash,
                    notes = ?plan.notes,
                    "task accepted"
                );
                send_message(&socket, addr, &plan.accept).await?;

                tokio::time::sleep(Duration::from_secs(ctx.execute_delay_sec)).await;

                let proof = build_proof(&plan.task_id, &plan.payment_hash, UnixTimestamp::now());
                tracing::info!(
                    task_id = %plan.task_id,
                    proof_hash = %proof.proof_hash,
                    "proof sent"
                );
                send_message(&socket, addr, &proof).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrap_types::token::{TokenTemplate, attach_signature};
    use serde_json::json;

    const NOW: u64 = 1_700_000_100;

    fn token_bytes() -> Vec<u8> {
        let template = TokenTemplate {
            version: 1,
            issuer: vec![0xAA; 32],
            subject: "commander-pk".to_string(),
            audience: "executor-1".to_string(),
            issued_at: 1_700_000_000,
            expires_at: 1_700_003_600,
            token_id: vec![0x01; 16],
            capabilities: vec!["telemetry.read".to_string()],
            not_before: None,
        };
        attach_signature(&template.encode_body(), &[0u8; 64])
    }

    fn context(dir: &tempfile::TempDir) -> ExecutorContext {
        ExecutorContext {
            node_id: "executor-1".to_string(),
            operator_pubkey: vec![0xAA; 32],
            executor_pubkey: Some("ex-pk".to_string()),
            executor_privkey: None,
            allow_mock_signatures: true,
            require_commander_sig: false,
            revocation_list_path: Some(dir.path().join("revoked.json")),
            replay_cache: Some(ReplayCache::new(dir.path().join("replay_cache.json"))),
            execute_delay_sec: 1,
            engine: SchnorrEngine::unavailable(),
        }
    }

    fn request(capability: &str) -> Value {
        json!({
            "message_type": 1,
            "message_name": "task_request",
            "task_id": "t1",
            "timestamp": NOW,
            "task_type": "imaging",
            "requested_capability": capability,
            "max_amount_sats": 22000,
            "capability_token": Base64Bytes::encode(token_bytes()).to_string(),
            "commander_pubkey": "commander-pk",
        })
    }

    fn details(outcome: Evaluated) -> Vec<String> {
        match outcome {
            Evaluated::Reject(reject) => reject.details,
            Evaluated::Accept(_) => panic!("expected a rejection"),
        }
    }

    #[test]
    fn test_happy_path_accept_and_proof() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let payload = request("telemetry.read");

        let plan = match evaluate_request(&ctx, &payload, UnixTimestamp::from_secs(NOW)) {
            Evaluated::Accept(plan) => plan,
            Evaluated::Reject(reject) => panic!("rejected: {:?}", reject.details),
        };

        // payment_hash = sha256("t1" || token_id_hex || "payment")
        let token_id_hex = "01".repeat(16);
        let expected = hex::encode(sha256(
            format!("t1{token_id_hex}payment").as_bytes(),
        ));
        assert_eq!(plan.payment_hash, expected);
        assert_eq!(plan.accept.in_reply_to, request_hash(&payload));
        assert_eq!(plan.accept.amount_sats, 22000);
        assert_eq!(plan.accept.executor_signature.as_deref(), Some(""));
        assert!(plan.notes.iter().any(|n| n == "executor signature mocked"));

        let proof = build_proof(&plan.task_id, &plan.payment_hash, UnixTimestamp::from_secs(NOW + 1));
        let expected_proof = hex::encode(sha256(
            format!("t1{}proof", plan.payment_hash).as_bytes(),
        ));
        assert_eq!(proof.proof_hash, expected_proof);
        assert_eq!(proof.payment_hash, plan.payment_hash);
        assert_eq!(proof.status, "completed");
    }

    #[test]
    fn test_capability_not_granted() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let outcome = evaluate_request(&ctx, &request("thrust.fire"), UnixTimestamp::from_secs(NOW));
        let details = details(outcome);
        assert!(details.contains(&"capability not granted by token".to_string()));
    }

    #[test]
    fn test_expired_token() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let outcome = evaluate_request(
            &ctx,
            &request("telemetry.read"),
            UnixTimestamp::from_secs(1_700_003_610),
        );
        assert!(details(outcome).contains(&"token expired".to_string()));
    }

    #[test]
    fn test_replay_rejected_on_second_request() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let payload = request("telemetry.read");

        assert!(matches!(
            evaluate_request(&ctx, &payload, UnixTimestamp::from_secs(NOW)),
            Evaluated::Accept(_)
        ));
        let details = details(evaluate_request(&ctx, &payload, UnixTimestamp::from_secs(NOW)));
        assert!(details.contains(&"replay detected (token_id already used)".to_string()));
    }

    #[test]
    fn test_revoked_token() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        std::fs::write(
            dir.path().join("revoked.json"),
            serde_json::to_string(&vec!["01".repeat(16)]).unwrap(),
        )
        .unwrap();

        let details = details(evaluate_request(
            &ctx,
            &request("telemetry.read"),
            UnixTimestamp::from_secs(NOW),
        ));
        assert!(details.contains(&"token revoked".to_string()));
    }

    #[test]
    fn test_subject_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let mut payload = request("telemetry.read");
        payload["commander_pubkey"] = json!("someone-else");

        let details = details(evaluate_request(&ctx, &payload, UnixTimestamp::from_secs(NOW)));
        assert!(details.contains(&"token subject does not match commander_pubkey".to_string()));
    }

    #[test]
    fn test_missing_fields_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let payload = json!({"message_type": 1, "message_name": "task_request"});

        let details = details(evaluate_request(&ctx, &payload, UnixTimestamp::from_secs(NOW)));
        for expected in [
            "missing task_id",
            "missing requested_capability",
            "missing commander_pubkey",
            "missing capability_token",
        ] {
            assert!(details.contains(&expected.to_string()), "{expected}");
        }
    }

    #[test]
    fn test_malformed_token_is_a_parse_issue() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let mut payload = request("telemetry.read");
        payload["capability_token"] = json!("AAEC"); // three arbitrary bytes

        let details = details(evaluate_request(&ctx, &payload, UnixTimestamp::from_secs(NOW)));
        assert!(details.iter().any(|d| d.starts_with("token parse error")));
    }

    #[test]
    fn test_required_commander_signature_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        ctx.require_commander_sig = true;
        ctx.allow_mock_signatures = false;

        let details = details(evaluate_request(
            &ctx,
            &request("telemetry.read"),
            UnixTimestamp::from_secs(NOW),
        ));
        assert!(details.contains(&"missing commander_signature".to_string()));
    }

    #[test]
    fn test_mock_policy_skips_commander_signature() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        ctx.require_commander_sig = true;

        let mut payload = request("telemetry.read");
        payload["commander_signature"] = json!("00".repeat(64));

        match evaluate_request(&ctx, &payload, UnixTimestamp::from_secs(NOW)) {
            Evaluated::Accept(plan) => assert!(
                plan.notes
                    .iter()
                    .any(|n| n.contains("commander signature verification skipped"))
            ),
            Evaluated::Reject(reject) => panic!("rejected: {:?}", reject.details),
        }
    }

    #[test]
    fn test_rejection_does_not_consume_replay_slot() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);

        // Wrong capability first: rejected without touching the cache.
        let rejected = evaluate_request(&ctx, &request("thrust.fire"), UnixTimestamp::from_secs(NOW));
        assert!(matches!(rejected, Evaluated::Reject(_)));

        // The same token then succeeds once.
        assert!(matches!(
            evaluate_request(&ctx, &request("telemetry.read"), UnixTimestamp::from_secs(NOW)),
            Evaluated::Accept(_)
        ));
    }
}
