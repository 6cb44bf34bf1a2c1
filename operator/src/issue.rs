//! Token issuance.

use clap::Args;
use rand::RngCore;
use serde::Serialize;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

use scrap_types::crypto::{CryptoError, SchnorrEngine, TAG_TOKEN, tagged_hash};
use scrap_types::keys::KeyRing;
use scrap_types::timestamp::UnixTimestamp;
use scrap_types::token::{TokenTemplate, attach_signature};
use scrap_types::util::fs::write_json_atomic;
use scrap_types::util::parse_hex;

#[derive(Args, Debug)]
pub struct IssueArgs {
    /// Path to keys.json carrying the operator keypair.
    #[arg(long)]
    pub keys: PathBuf,
    /// Output path for the binary token.
    #[arg(long)]
    pub out: PathBuf,
    /// Optional output path for token metadata JSON.
    #[arg(long)]
    pub meta_out: Option<PathBuf>,
    /// Commander public key the token is issued to.
    #[arg(long)]
    pub subject: String,
    /// Executor node id the token is addressed to.
    #[arg(long)]
    pub audience: String,
    /// Capability to grant; repeatable.
    #[arg(long, required = true)]
    pub capability: Vec<String>,
    /// Validity window length in seconds.
    #[arg(long, default_value_t = 3600)]
    pub expires_in: u32,
    /// Issuance time override (seconds since epoch); defaults to now.
    #[arg(long)]
    pub issued_at: Option<u32>,
    /// Token id override (hex); defaults to 16 random bytes.
    #[arg(long)]
    pub token_id: Option<String>,
    /// Earliest usable time (constraint_after record).
    #[arg(long)]
    pub not_before: Option<u32>,
    /// Write a 64-byte zero placeholder when signing is unavailable.
    #[arg(long)]
    pub allow_mock_signature: bool,
}

#[derive(Serialize)]
struct TokenMeta<'a> {
    token_id: String,
    issued_at: u32,
    expires_at: u32,
    audience: &'a str,
    subject: &'a str,
    capabilities: &'a [String],
    signature_mocked: bool,
}

pub fn run(args: IssueArgs) -> Result<(), Box<dyn Error>> {
    let ring = KeyRing::load(&args.keys)?;
    let operator_pubkey = ring.operator_pubkey_bytes()?;
    let operator_privkey = ring.operator_privkey_bytes()?;

    let issued_at = args
        .issued_at
        .unwrap_or_else(|| UnixTimestamp::now().as_u32());
    let expires_at = issued_at
        .checked_add(args.expires_in)
        .ok_or("expiry overflows the token time width")?;
    let token_id = match &args.token_id {
        Some(hex_str) => parse_hex(hex_str)?,
        None => {
            let mut id = vec![0u8; 16];
            rand::rng().fill_bytes(&mut id);
            id
        }
    };

    let template = TokenTemplate {
        version: 1,
        issuer: operator_pubkey,
        subject: args.subject.clone(),
        audience: args.audience.clone(),
        issued_at,
        expires_at,
        token_id: token_id.clone(),
        capabilities: args.capability.clone(),
        not_before: args.not_before,
    };
    let body = template.encode_body();

    let engine = SchnorrEngine::load();
    let signature = match &operator_privkey {
        Some(privkey) => {
            let msg32 = tagged_hash(TAG_TOKEN, &body);
            match engine.sign(&msg32, privkey) {
                Ok(signature) => Some(signature),
                Err(CryptoError::Unavailable) => None,
                Err(err) => return Err(err.into()),
            }
        }
        None => None,
    };

    let mocked = signature.is_none();
    let signature = match signature {
        Some(signature) => signature,
        None if args.allow_mock_signature => [0u8; 64],
        None => return Err("signature unavailable (provide operator_privkey and the bip340 backend, or pass --allow-mock-signature)".into()),
    };
    let token = attach_signature(&body, &signature);

    if let Some(parent) = args.out.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(&args.out, &token)?;

    if let Some(meta_out) = &args.meta_out {
        let meta = TokenMeta {
            token_id: hex::encode(&token_id),
            issued_at,
            expires_at,
            audience: &args.audience,
            subject: &args.subject,
            capabilities: &args.capability,
            signature_mocked: mocked,
        };
        write_json_atomic(meta_out, &meta)?;
    }

    tracing::info!(
        token_id = %hex::encode(&token_id),
        audience = %args.audience,
        expires_at,
        signature_mocked = mocked,
        "token issued"
    );
    Ok(())
}
