//! Trusted authority keys and signature verification.
//!
//! The gate talks to the signature scheme only through [`SignatureVerifier`],
//! so a deployment can swap in whatever scheme its authority uses.  The
//! shipped scheme is Ed25519:
//!
//! - [`TrustedAuthorityKey`] – the verifying half, stored by the kernel.
//! - [`AuthoritySigner`] – the signing half, held off-chain by the authority
//!   to mint [`AuthorizationPayload`]s.
//!
//! Verification uses `verify_strict`, which rejects small-order keys and
//! non-canonical signatures.

use std::fmt;

use ed25519_dalek::{SECRET_KEY_LENGTH, Signature, Signer, SigningKey, VerifyingKey};
use heartbeat_types::{AuthorizationPayload, KernelError};

use crate::canonical::canonical_message;

/// A public-key signature scheme bound to one authority key.
pub trait SignatureVerifier: Send + Sync {
    /// Short scheme identifier used in logs (e.g. `"ed25519"`).
    fn scheme(&self) -> &'static str;

    /// Exact signature length this scheme produces.
    fn signature_len(&self) -> usize;

    /// Return `Ok(())` when `signature` is the authority's signature over
    /// `message`, or [`KernelError::Authorization`] otherwise.
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), KernelError>;
}

// ────────────────────────────────────────────────────────────────────────────
// TrustedAuthorityKey
// ────────────────────────────────────────────────────────────────────────────

/// The Ed25519 public key of the single trusted authority.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TrustedAuthorityKey {
    key: VerifyingKey,
}

impl TrustedAuthorityKey {
    /// Parse a 32-byte compressed Ed25519 point.
    ///
    /// # Errors
    ///
    /// [`KernelError::Construction`] for a wrong length, a bytes string that
    /// is not a curve point, or a weak (small-order) key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KernelError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            KernelError::Construction(format!(
                "authority public key must be 32 bytes, found {}",
                bytes.len()
            ))
        })?;
        let key = VerifyingKey::from_bytes(&arr).map_err(|e| {
            KernelError::Construction(format!("authority public key is not a valid point: {e}"))
        })?;
        if key.is_weak() {
            return Err(KernelError::Construction(
                "authority public key has small order".to_string(),
            ));
        }
        Ok(Self { key })
    }

    /// Parse a hex encoded key, with or without a `0x` prefix.
    pub fn from_hex(raw: &str) -> Result<Self, KernelError> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(trimmed).map_err(|e| {
            KernelError::Construction(format!("authority public key is not hex: {e}"))
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.key.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key.as_bytes())
    }
}

impl fmt::Debug for TrustedAuthorityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrustedAuthorityKey({})", self.to_hex())
    }
}

impl SignatureVerifier for TrustedAuthorityKey {
    fn scheme(&self) -> &'static str {
        "ed25519"
    }

    fn signature_len(&self) -> usize {
        Signature::BYTE_SIZE
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), KernelError> {
        let sig = Signature::from_slice(signature).map_err(|_| {
            KernelError::MalformedPayload(format!(
                "signature must be {} bytes, found {}",
                Signature::BYTE_SIZE,
                signature.len()
            ))
        })?;
        self.key.verify_strict(message, &sig).map_err(|_| {
            KernelError::Authorization(
                "signature does not verify against the trusted authority key".to_string(),
            )
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// AuthoritySigner
// ────────────────────────────────────────────────────────────────────────────

/// Off-chain signing side of the trusted authority.
///
/// # Example
///
/// ```
/// use heartbeat_kernel::authority::{AuthoritySigner, SignatureVerifier};
/// use heartbeat_kernel::canonical::canonical_message;
///
/// let signer = AuthoritySigner::from_secret_bytes(&[7u8; 32]);
/// let payload = signer.sign(b"assertion", b"aux", "ping");
///
/// let key = signer.trusted_key();
/// let msg = canonical_message(&payload.assertion, &payload.auxiliary, "ping");
/// assert!(key.verify(&msg, &payload.signature).is_ok());
/// ```
pub struct AuthoritySigner {
    signing_key: SigningKey,
}

impl AuthoritySigner {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn from_secret_bytes(secret: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::new(SigningKey::from_bytes(secret))
    }

    /// Parse a hex encoded 32-byte secret key.
    pub fn from_hex(raw: &str) -> Result<Self, KernelError> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(trimmed)
            .map_err(|e| KernelError::Construction(format!("signing key is not hex: {e}")))?;
        let secret: [u8; SECRET_KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            KernelError::Construction(format!(
                "signing key must be {SECRET_KEY_LENGTH} bytes, found {}",
                b.len()
            ))
        })?;
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// The public key a kernel must be constructed with to accept this
    /// signer's payloads.
    pub fn trusted_key(&self) -> TrustedAuthorityKey {
        TrustedAuthorityKey {
            key: self.signing_key.verifying_key(),
        }
    }

    /// Sign `(assertion, auxiliary)` for use with `context`.
    pub fn sign(&self, assertion: &[u8], auxiliary: &[u8], context: &str) -> AuthorizationPayload {
        let message = canonical_message(assertion, auxiliary, context);
        let signature = self.signing_key.sign(&message);
        AuthorizationPayload {
            assertion: assertion.to_vec(),
            auxiliary: auxiliary.to_vec(),
            signature: signature.to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for AuthoritySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthoritySigner")
            .field("public_key", &self.trusted_key().to_hex())
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(seed: u8) -> AuthoritySigner {
        AuthoritySigner::from_secret_bytes(&[seed; 32])
    }

    #[test]
    fn valid_signature_verifies() {
        let s = signer(1);
        let payload = s.sign(b"a", b"b", "ctx");
        let msg = canonical_message(b"a", b"b", "ctx");
        assert!(s.trusted_key().verify(&msg, &payload.signature).is_ok());
    }

    #[test]
    fn other_key_is_rejected() {
        let payload = signer(1).sign(b"a", b"b", "ctx");
        let msg = canonical_message(b"a", b"b", "ctx");
        let result = signer(2).trusted_key().verify(&msg, &payload.signature);
        assert!(matches!(result, Err(KernelError::Authorization(_))));
    }

    #[test]
    fn short_signature_is_malformed() {
        let result = signer(1).trusted_key().verify(b"msg", &[0u8; 10]);
        assert!(matches!(result, Err(KernelError::MalformedPayload(_))));
    }

    #[test]
    fn key_hex_roundtrip() {
        let key = signer(3).trusted_key();
        let parsed = TrustedAuthorityKey::from_hex(&format!("0x{}", key.to_hex())).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn wrong_length_key_fails_construction() {
        assert!(matches!(
            TrustedAuthorityKey::from_bytes(&[1u8; 20]),
            Err(KernelError::Construction(_))
        ));
        // A 20-byte Ethereum-style address is not an Ed25519 key.
        assert!(matches!(
            TrustedAuthorityKey::from_hex("0x493f395c80C178Ae32Ef3b88325739E80073118A"),
            Err(KernelError::Construction(_))
        ));
    }

    #[test]
    fn weak_key_fails_construction() {
        // The identity point encodes as 1 followed by zeros and has small order.
        let mut identity = [0u8; 32];
        identity[0] = 1;
        assert!(matches!(
            TrustedAuthorityKey::from_bytes(&identity),
            Err(KernelError::Construction(_))
        ));
    }

    #[test]
    fn signer_hex_roundtrip() {
        let s = signer(9);
        let parsed = AuthoritySigner::from_hex(&s.secret_hex()).unwrap();
        assert_eq!(parsed.trusted_key(), s.trusted_key());
    }

    #[test]
    fn signer_debug_redacts_secret() {
        let s = signer(9);
        let debug = format!("{s:?}");
        assert!(!debug.contains(&s.secret_hex()));
        assert!(debug.contains("<redacted>"));
    }
}
