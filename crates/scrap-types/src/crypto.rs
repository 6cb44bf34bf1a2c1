//! SHA-256, tagged hashes, and the Schnorr engine abstraction.
//!
//! All protocol hashes are SHA-256. Domain separation uses the tagged-hash
//! construction `sha256(sha256(tag) || sha256(tag) || msg)` with one tag per
//! protocol surface. Signatures are BIP-340 Schnorr over secp256k1; the
//! engine is a sum type so deployments without the `bip340` feature degrade
//! to an explicit "undetermined" verdict that call sites resolve against the
//! mock-signature policy.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[cfg(feature = "bip340")]
use secp256k1::{All, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey, schnorr};

/// Domain tag for capability token signatures.
pub const TAG_TOKEN: &str = "SCRAP/token/v1";
/// Domain tag for the settlement binding between task, token, and invoice.
pub const TAG_BINDING: &str = "SCRAP/binding/v1";
/// Domain tag for proof-of-execution digests.
pub const TAG_PROOF: &str = "SCRAP/proof/v1";
/// Domain tag for commander signatures over canonical task requests.
pub const TAG_TASK: &str = "SCRAP/task/v1";

/// Computes SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes SHA-256 over the UTF-8 concatenation of `parts`, hex-encoded.
///
/// This is the derivation behind the settlement hashes: each part is fed to
/// the hasher in order with no separator.
pub fn sha256_hex_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Computes the domain-separated tagged hash
/// `sha256(sha256(tag) || sha256(tag) || msg)`.
pub fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = sha256(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

/// Normalizes a public key to its 32-byte x-only form.
///
/// Accepts either a 32-byte x-only key or a 33-byte compressed key with an
/// `02`/`03` parity prefix.
pub fn xonly_pubkey(pubkey: &[u8]) -> Result<[u8; 32], CryptoError> {
    match pubkey.len() {
        32 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(pubkey);
            Ok(out)
        }
        33 if pubkey[0] == 2 || pubkey[0] == 3 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(&pubkey[1..]);
            Ok(out)
        }
        _ => Err(CryptoError::UnexpectedKeyLength(pubkey.len())),
    }
}

/// Errors raised by signing operations and key normalization.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature engine unavailable")]
    Unavailable,
    #[error("unexpected public key length {0}")]
    UnexpectedKeyLength(usize),
    #[error("invalid secret key")]
    InvalidSecretKey,
}

/// Outcome of a signature verification.
///
/// `Undetermined` means the engine could not attempt verification at all;
/// callers must consult the `allow_mock_signatures` policy before treating it
/// as anything other than a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigVerdict {
    Valid,
    Invalid,
    Undetermined,
}

/// BIP-340 Schnorr sign/verify over secp256k1, or an explicit absence.
pub enum SchnorrEngine {
    #[cfg(feature = "bip340")]
    Secp(Secp256k1<All>),
    Unavailable,
}

impl SchnorrEngine {
    /// Loads the best available engine.
    pub fn load() -> Self {
        #[cfg(feature = "bip340")]
        {
            SchnorrEngine::Secp(Secp256k1::new())
        }
        #[cfg(not(feature = "bip340"))]
        {
            SchnorrEngine::Unavailable
        }
    }

    /// An engine whose every operation reports undetermined.
    pub fn unavailable() -> Self {
        SchnorrEngine::Unavailable
    }

    /// True when real signatures can be produced and checked.
    pub fn is_available(&self) -> bool {
        !matches!(self, SchnorrEngine::Unavailable)
    }

    /// Engine name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "bip340")]
            SchnorrEngine::Secp(_) => "secp256k1",
            SchnorrEngine::Unavailable => "unavailable",
        }
    }

    /// Signs a 32-byte message with a 32-byte secret key.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Unavailable`] when no backend is compiled in;
    /// [`CryptoError::InvalidSecretKey`] when the key is not a valid scalar.
    pub fn sign(&self, msg32: &[u8; 32], privkey: &[u8]) -> Result<[u8; 64], CryptoError> {
        match self {
            #[cfg(feature = "bip340")]
            SchnorrEngine::Secp(secp) => {
                let secret =
                    SecretKey::from_slice(privkey).map_err(|_| CryptoError::InvalidSecretKey)?;
                let keypair = Keypair::from_secret_key(secp, &secret);
                let signature = secp.sign_schnorr(&Message::from_digest(*msg32), &keypair);
                Ok(signature.serialize())
            }
            SchnorrEngine::Unavailable => Err(CryptoError::Unavailable),
        }
    }

    /// Verifies a 64-byte signature over a 32-byte message.
    ///
    /// Malformed keys and signatures are `Invalid`, not errors: a token
    /// carrying garbage bytes failed verification, full stop. `Undetermined`
    /// is reserved for the engine itself being absent.
    pub fn verify(&self, msg32: &[u8; 32], sig64: &[u8], pubkey: &[u8]) -> SigVerdict {
        match self {
            #[cfg(feature = "bip340")]
            SchnorrEngine::Secp(secp) => {
                let Ok(xonly) = xonly_pubkey(pubkey) else {
                    return SigVerdict::Invalid;
                };
                let Ok(pubkey) = XOnlyPublicKey::from_slice(&xonly) else {
                    return SigVerdict::Invalid;
                };
                let Ok(signature) = schnorr::Signature::from_slice(sig64) else {
                    return SigVerdict::Invalid;
                };
                match secp.verify_schnorr(&signature, &Message::from_digest(*msg32), &pubkey) {
                    Ok(()) => SigVerdict::Valid,
                    Err(_) => SigVerdict::Invalid,
                }
            }
            SchnorrEngine::Unavailable => SigVerdict::Undetermined,
        }
    }

    /// Derives the x-only public key for a secret key, hex-encoded.
    pub fn derive_xonly_pubkey(&self, privkey: &[u8]) -> Result<[u8; 32], CryptoError> {
        match self {
            #[cfg(feature = "bip340")]
            SchnorrEngine::Secp(secp) => {
                let secret =
                    SecretKey::from_slice(privkey).map_err(|_| CryptoError::InvalidSecretKey)?;
                let keypair = Keypair::from_secret_key(secp, &secret);
                Ok(keypair.x_only_public_key().0.serialize())
            }
            SchnorrEngine::Unavailable => Err(CryptoError::Unavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_hash_matches_construction() {
        let msg = b"some message";
        let tag_hash = sha256(TAG_TOKEN.as_bytes());
        let mut preimage = Vec::new();
        preimage.extend_from_slice(&tag_hash);
        preimage.extend_from_slice(&tag_hash);
        preimage.extend_from_slice(msg);
        assert_eq!(tagged_hash(TAG_TOKEN, msg), sha256(&preimage));
    }

    #[test]
    fn test_tagged_hash_separates_domains() {
        let msg = b"same message";
        assert_ne!(tagged_hash(TAG_TOKEN, msg), tagged_hash(TAG_TASK, msg));
    }

    #[test]
    fn test_sha256_hex_parts_concatenates() {
        assert_eq!(
            sha256_hex_parts(&["ab", "cd"]),
            hex::encode(sha256(b"abcd"))
        );
    }

    #[test]
    fn test_xonly_pubkey_accepts_both_widths() {
        let x = [5u8; 32];
        assert_eq!(xonly_pubkey(&x).unwrap(), x);
        let mut compressed = vec![2u8];
        compressed.extend_from_slice(&x);
        assert_eq!(xonly_pubkey(&compressed).unwrap(), x);
        assert!(xonly_pubkey(&[0u8; 31]).is_err());
        let mut bad_prefix = vec![4u8];
        bad_prefix.extend_from_slice(&x);
        assert!(xonly_pubkey(&bad_prefix).is_err());
    }

    #[test]
    fn test_unavailable_engine_is_undetermined() {
        let engine = SchnorrEngine::unavailable();
        assert!(!engine.is_available());
        assert!(matches!(
            engine.sign(&[0u8; 32], &[1u8; 32]),
            Err(CryptoError::Unavailable)
        ));
        assert_eq!(
            engine.verify(&[0u8; 32], &[0u8; 64], &[1u8; 32]),
            SigVerdict::Undetermined
        );
    }

    #[cfg(feature = "bip340")]
    #[test]
    fn test_sign_verify_roundtrip() {
        let engine = SchnorrEngine::load();
        let privkey = [0x17u8; 32];
        let pubkey = engine.derive_xonly_pubkey(&privkey).unwrap();
        let msg32 = tagged_hash(TAG_TOKEN, b"token body");

        let signature = engine.sign(&msg32, &privkey).unwrap();
        assert_eq!(engine.verify(&msg32, &signature, &pubkey), SigVerdict::Valid);

        let other = tagged_hash(TAG_TOKEN, b"different body");
        assert_eq!(
            engine.verify(&other, &signature, &pubkey),
            SigVerdict::Invalid
        );
    }

    #[cfg(feature = "bip340")]
    #[test]
    fn test_garbage_key_is_invalid_not_undetermined() {
        let engine = SchnorrEngine::load();
        let verdict = engine.verify(&[0u8; 32], &[0u8; 64], &[0xFFu8; 32]);
        assert_eq!(verdict, SigVerdict::Invalid);
    }
}
