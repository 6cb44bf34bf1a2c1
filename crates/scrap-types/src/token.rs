//! Capability token parsing, issuance, and validation.
//!
//! A capability token is an ascending-ordered TLV container signed by the
//! operator. The executor validates stateless properties first (audience,
//! time window, capability grant, constraints, signature) and consults the
//! replay cache only when everything else passed, so invalid tokens never
//! consume a cache slot.

use thiserror::Error;

use crate::codec::{self, SIGNATURE_TYPE, TlvError, TlvStream};
use crate::crypto::{SchnorrEngine, SigVerdict, TAG_TOKEN, tagged_hash};
use crate::replay::ReplayCache;

pub const TLV_VERSION: u64 = 0;
pub const TLV_ISSUER: u64 = 2;
pub const TLV_SUBJECT: u64 = 4;
pub const TLV_AUDIENCE: u64 = 6;
pub const TLV_ISSUED_AT: u64 = 8;
pub const TLV_EXPIRES_AT: u64 = 10;
pub const TLV_TOKEN_ID: u64 = 12;
pub const TLV_CONSTRAINT_GEO: u64 = 13;
pub const TLV_CAPABILITY: u64 = 14;
pub const TLV_CONSTRAINT_RATE: u64 = 15;
pub const TLV_CONSTRAINT_AMOUNT: u64 = 17;
pub const TLV_CONSTRAINT_AFTER: u64 = 19;
pub const TLV_ROOT_ISSUER: u64 = 20;
pub const TLV_ROOT_TOKEN_ID: u64 = 22;
pub const TLV_PARENT_TOKEN_ID: u64 = 24;
pub const TLV_CHAIN_DEPTH: u64 = 26;

const KNOWN_EVEN_TYPES: [u64; 13] = [
    TLV_VERSION,
    TLV_ISSUER,
    TLV_SUBJECT,
    TLV_AUDIENCE,
    TLV_ISSUED_AT,
    TLV_EXPIRES_AT,
    TLV_TOKEN_ID,
    TLV_CAPABILITY,
    TLV_ROOT_ISSUER,
    TLV_ROOT_TOKEN_ID,
    TLV_PARENT_TOKEN_ID,
    TLV_CHAIN_DEPTH,
    SIGNATURE_TYPE,
];

/// Optional constraint records. Only `after` is enforced; the rest are
/// surfaced as a validation note.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenConstraints {
    pub geo: Option<Vec<u8>>,
    pub rate: Option<Vec<u8>>,
    pub amount: Option<Vec<u8>>,
    pub after: Option<u32>,
}

impl TokenConstraints {
    /// True when any constraint beyond `after` is present.
    pub fn has_unenforced(&self) -> bool {
        self.geo.is_some() || self.rate.is_some() || self.amount.is_some()
    }
}

/// Delegation records. Parsed for forward compatibility; the validation
/// pipeline treats every token as non-delegated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenDelegation {
    pub root_issuer: Option<Vec<u8>>,
    pub root_token_id: Option<Vec<u8>>,
    pub parent_token_id: Option<Vec<u8>>,
    pub chain_depth: Option<Vec<u8>>,
}

/// A parsed capability token.
#[derive(Debug, Clone)]
pub struct CapabilityToken {
    pub version: u8,
    pub issuer: Vec<u8>,
    pub subject: String,
    pub audience: String,
    pub issued_at: u32,
    pub expires_at: u32,
    pub token_id: Vec<u8>,
    pub capabilities: Vec<String>,
    pub constraints: TokenConstraints,
    pub delegation: TokenDelegation,
    pub signature: Option<Vec<u8>>,
    /// Byte prefix the operator signature commits to.
    pub raw_without_signature: Vec<u8>,
}

fn decode_utf8_or_hex(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(s) => s.to_string(),
        Err(_) => hex::encode(value),
    }
}

fn read_u32(stream: &TlvStream, tlv_type: u64, name: &'static str) -> Result<u32, TlvError> {
    let value = stream.record(tlv_type).ok_or(TlvError::MissingField(name))?;
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| TlvError::MalformedField(name))?;
    Ok(u32::from_be_bytes(bytes))
}

impl CapabilityToken {
    /// Parses a token from its TLV encoding.
    ///
    /// Unknown even type numbers are fatal; unknown odd type numbers are
    /// ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TlvError> {
        let stream = codec::parse_tlv(data)?;

        let unknown_even: Vec<u64> = stream
            .records
            .iter()
            .map(|r| r.tlv_type)
            .filter(|t| t % 2 == 0 && !KNOWN_EVEN_TYPES.contains(t))
            .collect();
        if !unknown_even.is_empty() {
            return Err(TlvError::UnknownEvenTypes(unknown_even));
        }

        let version_raw = stream
            .record(TLV_VERSION)
            .ok_or(TlvError::MissingField("version"))?;
        let version = match version_raw {
            [v] => *v,
            _ => return Err(TlvError::MalformedField("version")),
        };
        let issuer = stream
            .record(TLV_ISSUER)
            .ok_or(TlvError::MissingField("issuer"))?
            .to_vec();
        let subject = stream
            .record(TLV_SUBJECT)
            .ok_or(TlvError::MissingField("subject"))?;
        let audience = stream
            .record(TLV_AUDIENCE)
            .ok_or(TlvError::MissingField("audience"))?;
        let issued_at = read_u32(&stream, TLV_ISSUED_AT, "issued_at")?;
        let expires_at = read_u32(&stream, TLV_EXPIRES_AT, "expires_at")?;
        if issued_at > expires_at {
            return Err(TlvError::MalformedField("issued_at exceeds expires_at"));
        }
        let token_id = stream
            .record(TLV_TOKEN_ID)
            .ok_or(TlvError::MissingField("token_id"))?
            .to_vec();

        let capabilities: Vec<String> = stream
            .records_of(TLV_CAPABILITY)
            .into_iter()
            .map(decode_utf8_or_hex)
            .collect();
        if capabilities.is_empty() {
            return Err(TlvError::MissingField("capability"));
        }

        let constraints = TokenConstraints {
            geo: stream.record(TLV_CONSTRAINT_GEO).map(<[u8]>::to_vec),
            rate: stream.record(TLV_CONSTRAINT_RATE).map(<[u8]>::to_vec),
            amount: stream.record(TLV_CONSTRAINT_AMOUNT).map(<[u8]>::to_vec),
            after: match stream.record(TLV_CONSTRAINT_AFTER) {
                None => None,
                Some(value) => {
                    let bytes: [u8; 4] = value
                        .try_into()
                        .map_err(|_| TlvError::MalformedField("constraint_after"))?;
                    Some(u32::from_be_bytes(bytes))
                }
            },
        };

        let delegation = TokenDelegation {
            root_issuer: stream.record(TLV_ROOT_ISSUER).map(<[u8]>::to_vec),
            root_token_id: stream.record(TLV_ROOT_TOKEN_ID).map(<[u8]>::to_vec),
            parent_token_id: stream.record(TLV_PARENT_TOKEN_ID).map(<[u8]>::to_vec),
            chain_depth: stream.record(TLV_CHAIN_DEPTH).map(<[u8]>::to_vec),
        };

        Ok(CapabilityToken {
            version,
            issuer,
            subject: decode_utf8_or_hex(subject),
            audience: decode_utf8_or_hex(audience),
            issued_at,
            expires_at,
            token_id,
            capabilities,
            constraints,
            delegation,
            signature: stream.signature.clone(),
            raw_without_signature: stream.raw_without_signature,
        })
    }

    /// Hex form of the token identifier, used for replay keys, revocation
    /// lists, and the settlement hash binding.
    pub fn token_id_hex(&self) -> String {
        hex::encode(&self.token_id)
    }

    /// Runs the stateless validation pipeline, then the replay check.
    ///
    /// Issue order follows the pipeline: audience, time window, capability
    /// grant, `constraint_after`, signature, replay. The replay cache is
    /// consulted only when no prior issue accumulated.
    pub fn validate(
        &self,
        ctx: &ValidationContext<'_>,
        engine: &SchnorrEngine,
        replay_cache: Option<&ReplayCache>,
    ) -> Verdict {
        let mut issues = Vec::new();
        let mut notes = Vec::new();

        if self.audience != ctx.expected_audience {
            issues.push(TokenIssue::AudienceMismatch {
                token: self.audience.clone(),
                expected: ctx.expected_audience.to_string(),
            });
        }

        if ctx.now < self.issued_at as u64 {
            issues.push(TokenIssue::NotYetValid);
        }
        if ctx.now > self.expires_at as u64 {
            issues.push(TokenIssue::Expired);
        }

        if let Some(required) = ctx.required_capability
            && !self.capabilities.iter().any(|c| c == required)
        {
            issues.push(TokenIssue::CapabilityNotGranted);
        }

        if let Some(not_before) = self.constraints.after
            && ctx.now < not_before as u64
        {
            issues.push(TokenIssue::ConstraintAfterUnsatisfied);
        }

        if self.constraints.has_unenforced() {
            notes.push("constraints present but not enforced".to_string());
        }

        match &self.signature {
            None => issues.push(TokenIssue::MissingSignature),
            Some(signature) => {
                let msg32 = tagged_hash(TAG_TOKEN, &self.raw_without_signature);
                match engine.verify(&msg32, signature, ctx.operator_pubkey) {
                    SigVerdict::Valid => {}
                    SigVerdict::Invalid => issues.push(TokenIssue::SignatureInvalid),
                    SigVerdict::Undetermined => {
                        if ctx.allow_mock_signatures {
                            notes.push("signature verification skipped (mock mode)".to_string());
                        } else {
                            issues.push(TokenIssue::SignatureUnavailable);
                        }
                    }
                }
            }
        }

        // Replay check must come after stateless validation.
        if issues.is_empty()
            && let Some(cache) = replay_cache
        {
            match cache.check_and_add(&self.token_id, self.expires_at, ctx.now) {
                Ok(true) => {}
                Ok(false) => issues.push(TokenIssue::ReplayDetected),
                Err(err) => issues.push(TokenIssue::ReplayCacheFailure(err.to_string())),
            }
        }

        Verdict {
            ok: issues.is_empty(),
            issues,
            notes,
        }
    }
}

/// Inputs to the stateless validation pipeline.
#[derive(Debug, Clone)]
pub struct ValidationContext<'a> {
    /// Current time in seconds since the Unix epoch.
    pub now: u64,
    /// The executor node id the token must be addressed to.
    pub expected_audience: &'a str,
    /// The capability the task request asks to exercise.
    pub required_capability: Option<&'a str>,
    /// Operator public key (x-only or compressed).
    pub operator_pubkey: &'a [u8],
    /// Whether an undetermined signature verdict degrades to a note.
    pub allow_mock_signatures: bool,
}

/// Result of a validation run.
#[derive(Debug)]
pub struct Verdict {
    pub ok: bool,
    pub issues: Vec<TokenIssue>,
    pub notes: Vec<String>,
}

/// Individual validation findings.
///
/// The `Display` form is the protocol-visible detail string carried in
/// `task_reject` messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenIssue {
    #[error("audience mismatch (token={token} expected={expected})")]
    AudienceMismatch { token: String, expected: String },
    #[error("token not yet valid")]
    NotYetValid,
    #[error("token expired")]
    Expired,
    #[error("capability not granted by token")]
    CapabilityNotGranted,
    #[error("constraint_after not satisfied")]
    ConstraintAfterUnsatisfied,
    #[error("missing token signature")]
    MissingSignature,
    #[error("token signature invalid")]
    SignatureInvalid,
    #[error("signature verification unavailable (enable bip340 or allow mock)")]
    SignatureUnavailable,
    #[error("replay detected (token_id already used)")]
    ReplayDetected,
    #[error("replay cache failure: {0}")]
    ReplayCacheFailure(String),
    #[error("token subject does not match commander_pubkey")]
    SubjectMismatch,
    #[error("token revoked")]
    Revoked,
}

/// Field set an operator encodes into a fresh token.
#[derive(Debug, Clone)]
pub struct TokenTemplate {
    pub version: u8,
    pub issuer: Vec<u8>,
    pub subject: String,
    pub audience: String,
    pub issued_at: u32,
    pub expires_at: u32,
    pub token_id: Vec<u8>,
    pub capabilities: Vec<String>,
    pub not_before: Option<u32>,
}

impl TokenTemplate {
    /// Encodes the unsigned token body as ascending TLV records.
    ///
    /// This is the message the operator signature commits to under
    /// `SCRAP/token/v1`.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(codec::encode_record(TLV_VERSION, &[self.version]));
        body.extend(codec::encode_record(TLV_ISSUER, &self.issuer));
        body.extend(codec::encode_record(TLV_SUBJECT, self.subject.as_bytes()));
        body.extend(codec::encode_record(TLV_AUDIENCE, self.audience.as_bytes()));
        body.extend(codec::encode_record(
            TLV_ISSUED_AT,
            &self.issued_at.to_be_bytes(),
        ));
        body.extend(codec::encode_record(
            TLV_EXPIRES_AT,
            &self.expires_at.to_be_bytes(),
        ));
        body.extend(codec::encode_record(TLV_TOKEN_ID, &self.token_id));
        for capability in &self.capabilities {
            body.extend(codec::encode_record(TLV_CAPABILITY, capability.as_bytes()));
        }
        if let Some(not_before) = self.not_before {
            body.extend(codec::encode_record(
                TLV_CONSTRAINT_AFTER,
                &not_before.to_be_bytes(),
            ));
        }
        body
    }
}

/// Appends the trailing signature record to an encoded token body.
pub fn attach_signature(body: &[u8], signature: &[u8; 64]) -> Vec<u8> {
    let mut token = body.to_vec();
    token.extend(codec::encode_record(SIGNATURE_TYPE, signature));
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_record;

    fn template() -> TokenTemplate {
        TokenTemplate {
            version: 1,
            issuer: vec![0xAA; 32],
            subject: "commander-pk-hex".to_string(),
            audience: "executor-1".to_string(),
            issued_at: 1_700_000_000,
            expires_at: 1_700_003_600,
            token_id: vec![0x01; 16],
            capabilities: vec!["telemetry.read".to_string()],
            not_before: None,
        }
    }

    fn ctx<'a>(now: u64, operator_pubkey: &'a [u8]) -> ValidationContext<'a> {
        ValidationContext {
            now,
            expected_audience: "executor-1",
            required_capability: Some("telemetry.read"),
            operator_pubkey,
            allow_mock_signatures: true,
        }
    }

    #[test]
    fn test_parse_roundtrip() {
        let body = template().encode_body();
        let bytes = attach_signature(&body, &[0u8; 64]);
        let token = CapabilityToken::from_bytes(&bytes).unwrap();

        assert_eq!(token.version, 1);
        assert_eq!(token.subject, "commander-pk-hex");
        assert_eq!(token.audience, "executor-1");
        assert_eq!(token.issued_at, 1_700_000_000);
        assert_eq!(token.expires_at, 1_700_003_600);
        assert_eq!(token.token_id_hex(), "01".repeat(16));
        assert_eq!(token.capabilities, vec!["telemetry.read"]);
        assert_eq!(token.signature.as_deref(), Some([0u8; 64].as_slice()));
        assert_eq!(token.raw_without_signature, body);
    }

    #[test]
    fn test_parse_rejects_unknown_even_type() {
        let mut body = template().encode_body();
        body.extend(encode_record(28, b"future"));
        let err = CapabilityToken::from_bytes(&body).unwrap_err();
        assert_eq!(err, TlvError::UnknownEvenTypes(vec![28]));
    }

    #[test]
    fn test_parse_ignores_unknown_odd_type() {
        let mut body = template().encode_body();
        body.extend(encode_record(27, b"vendor extension"));
        let token = CapabilityToken::from_bytes(&body).unwrap();
        assert_eq!(token.capabilities, vec!["telemetry.read"]);
    }

    #[test]
    fn test_parse_requires_capability() {
        let mut no_caps = template();
        no_caps.capabilities.clear();
        let err = CapabilityToken::from_bytes(&no_caps.encode_body()).unwrap_err();
        assert_eq!(err, TlvError::MissingField("capability"));
    }

    #[test]
    fn test_parse_rejects_inverted_window() {
        let mut inverted = template();
        inverted.issued_at = inverted.expires_at + 1;
        assert!(CapabilityToken::from_bytes(&inverted.encode_body()).is_err());
    }

    #[test]
    fn test_validate_happy_path_mock() {
        let bytes = attach_signature(&template().encode_body(), &[0u8; 64]);
        let token = CapabilityToken::from_bytes(&bytes).unwrap();
        let engine = SchnorrEngine::unavailable();
        let verdict = token.validate(&ctx(1_700_000_100, &[0xAA; 32]), &engine, None);
        assert!(verdict.ok, "issues: {:?}", verdict.issues);
        assert!(
            verdict
                .notes
                .iter()
                .any(|n| n.contains("mock mode"))
        );
    }

    #[test]
    fn test_validate_audience_mismatch() {
        let bytes = attach_signature(&template().encode_body(), &[0u8; 64]);
        let token = CapabilityToken::from_bytes(&bytes).unwrap();
        let engine = SchnorrEngine::unavailable();
        let mut context = ctx(1_700_000_100, &[0xAA; 32]);
        context.expected_audience = "executor-2";
        let verdict = token.validate(&context, &engine, None);
        assert!(!verdict.ok);
        assert!(matches!(
            verdict.issues[0],
            TokenIssue::AudienceMismatch { .. }
        ));
    }

    #[test]
    fn test_validate_time_window() {
        let bytes = attach_signature(&template().encode_body(), &[0u8; 64]);
        let token = CapabilityToken::from_bytes(&bytes).unwrap();
        let engine = SchnorrEngine::unavailable();

        let early = token.validate(&ctx(1_699_999_999, &[0xAA; 32]), &engine, None);
        assert!(early.issues.contains(&TokenIssue::NotYetValid));

        let late = token.validate(&ctx(1_700_003_601, &[0xAA; 32]), &engine, None);
        assert!(late.issues.contains(&TokenIssue::Expired));
        assert_eq!(late.issues[0].to_string(), "token expired");
    }

    #[test]
    fn test_validate_capability_not_granted() {
        let bytes = attach_signature(&template().encode_body(), &[0u8; 64]);
        let token = CapabilityToken::from_bytes(&bytes).unwrap();
        let engine = SchnorrEngine::unavailable();
        let mut context = ctx(1_700_000_100, &[0xAA; 32]);
        context.required_capability = Some("thrust.fire");
        let verdict = token.validate(&context, &engine, None);
        assert!(verdict.issues.contains(&TokenIssue::CapabilityNotGranted));
        assert_eq!(
            verdict.issues[0].to_string(),
            "capability not granted by token"
        );
    }

    #[test]
    fn test_validate_constraint_after() {
        let mut gated = template();
        gated.not_before = Some(1_700_001_000);
        let bytes = attach_signature(&gated.encode_body(), &[0u8; 64]);
        let token = CapabilityToken::from_bytes(&bytes).unwrap();
        let engine = SchnorrEngine::unavailable();

        let early = token.validate(&ctx(1_700_000_100, &[0xAA; 32]), &engine, None);
        assert!(
            early
                .issues
                .contains(&TokenIssue::ConstraintAfterUnsatisfied)
        );

        let late = token.validate(&ctx(1_700_001_001, &[0xAA; 32]), &engine, None);
        assert!(late.ok, "issues: {:?}", late.issues);
    }

    #[test]
    fn test_validate_missing_signature() {
        let token = CapabilityToken::from_bytes(&template().encode_body()).unwrap();
        let engine = SchnorrEngine::unavailable();
        let verdict = token.validate(&ctx(1_700_000_100, &[0xAA; 32]), &engine, None);
        assert!(verdict.issues.contains(&TokenIssue::MissingSignature));
    }

    #[test]
    fn test_validate_undetermined_without_mock_policy() {
        let bytes = attach_signature(&template().encode_body(), &[0u8; 64]);
        let token = CapabilityToken::from_bytes(&bytes).unwrap();
        let engine = SchnorrEngine::unavailable();
        let mut context = ctx(1_700_000_100, &[0xAA; 32]);
        context.allow_mock_signatures = false;
        let verdict = token.validate(&context, &engine, None);
        assert!(verdict.issues.contains(&TokenIssue::SignatureUnavailable));
    }

    #[cfg(feature = "bip340")]
    #[test]
    fn test_validate_real_signature() {
        let engine = SchnorrEngine::load();
        let privkey = [0x42u8; 32];
        let pubkey = engine.derive_xonly_pubkey(&privkey).unwrap();

        let mut fields = template();
        fields.issuer = pubkey.to_vec();
        let body = fields.encode_body();
        let msg32 = tagged_hash(TAG_TOKEN, &body);
        let signature = engine.sign(&msg32, &privkey).unwrap();
        let token = CapabilityToken::from_bytes(&attach_signature(&body, &signature)).unwrap();

        let mut context = ctx(1_700_000_100, &pubkey);
        context.allow_mock_signatures = false;
        let verdict = token.validate(&context, &engine, None);
        assert!(verdict.ok, "issues: {:?}", verdict.issues);

        // A different operator key must fail verification.
        let other = engine.derive_xonly_pubkey(&[0x43u8; 32]).unwrap();
        context.operator_pubkey = &other;
        let verdict = token.validate(&context, &engine, None);
        assert!(verdict.issues.contains(&TokenIssue::SignatureInvalid));
    }

    #[test]
    fn test_validate_replay_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReplayCache::new(dir.path().join("replay_cache.json"));
        let bytes = attach_signature(&template().encode_body(), &[0u8; 64]);
        let token = CapabilityToken::from_bytes(&bytes).unwrap();
        let engine = SchnorrEngine::unavailable();
        let context = ctx(1_700_000_100, &[0xAA; 32]);

        let first = token.validate(&context, &engine, Some(&cache));
        assert!(first.ok, "issues: {:?}", first.issues);

        let second = token.validate(&context, &engine, Some(&cache));
        assert!(second.issues.contains(&TokenIssue::ReplayDetected));
        assert_eq!(
            second.issues[0].to_string(),
            "replay detected (token_id already used)"
        );
    }

    #[test]
    fn test_invalid_token_does_not_consume_cache_slot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReplayCache::new(dir.path().join("replay_cache.json"));
        let bytes = attach_signature(&template().encode_body(), &[0u8; 64]);
        let token = CapabilityToken::from_bytes(&bytes).unwrap();
        let engine = SchnorrEngine::unavailable();

        // Expired run fails without touching the cache.
        let expired = token.validate(&ctx(1_800_000_000, &[0xAA; 32]), &engine, Some(&cache));
        assert!(!expired.ok);

        // A valid run afterwards still gets the slot.
        let valid = token.validate(&ctx(1_700_000_100, &[0xAA; 32]), &engine, Some(&cache));
        assert!(valid.ok, "issues: {:?}", valid.issues);
    }
}
