//! Canonical message encoding shared by the authority (signer) and the
//! gate (verifier).
//!
//! # Version 1
//!
//! ```text
//! b"heartbeat.kernel/authorization/v1\0"
//! || u64_be(len(assertion)) || assertion
//! || u64_be(len(auxiliary)) || auxiliary
//! || u64_be(len(context))   || context (UTF-8)
//! ```
//!
//! Every field is length-prefixed, so moving bytes from one field into a
//! neighbour always yields a different message.  The domain separator keeps
//! these signatures from being valid for any other protocol that happens to
//! use the same key.

use sha2::{Digest, Sha256};

/// Encoding version produced by [`canonical_message`].
pub const CANONICAL_VERSION: u8 = 1;

/// Domain separator prefixed to every version-1 message.
pub const CANONICAL_DOMAIN: &[u8] = b"heartbeat.kernel/authorization/v1\0";

/// Build the exact byte string the trusted authority signs.
pub fn canonical_message(assertion: &[u8], auxiliary: &[u8], context: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        CANONICAL_DOMAIN.len() + 3 * 8 + assertion.len() + auxiliary.len() + context.len(),
    );
    out.extend_from_slice(CANONICAL_DOMAIN);
    for field in [assertion, auxiliary, context.as_bytes()] {
        out.extend_from_slice(&(field.len() as u64).to_be_bytes());
        out.extend_from_slice(field);
    }
    out
}

/// Hex SHA-256 of a canonical message, used to correlate logs and events
/// with the attestation that authorized them.
pub fn message_digest(message: &[u8]) -> String {
    hex::encode(Sha256::digest(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_domain_then_length_prefixed_fields() {
        let msg = canonical_message(b"ab", b"", "c");
        let mut expected = CANONICAL_DOMAIN.to_vec();
        expected.extend_from_slice(&2u64.to_be_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&0u64.to_be_bytes());
        expected.extend_from_slice(&1u64.to_be_bytes());
        expected.extend_from_slice(b"c");
        assert_eq!(msg, expected);
    }

    #[test]
    fn moving_bytes_across_fields_changes_the_message() {
        let base = canonical_message(b"abc", b"def", "ctx");
        assert_ne!(base, canonical_message(b"ab", b"cdef", "ctx"));
        assert_ne!(base, canonical_message(b"abcdef", b"", "ctx"));
        assert_ne!(base, canonical_message(b"abc", b"de", "fctx"));
        assert_ne!(base, canonical_message(b"def", b"abc", "ctx"));
    }

    #[test]
    fn domain_names_the_encoding_version() {
        let suffix = format!("/v{CANONICAL_VERSION}\0");
        assert!(CANONICAL_DOMAIN.ends_with(suffix.as_bytes()));
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(
            canonical_message(b"x", b"y", "ping"),
            canonical_message(b"x", b"y", "ping")
        );
    }

    #[test]
    fn digest_is_hex_sha256() {
        let digest = message_digest(b"");
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
