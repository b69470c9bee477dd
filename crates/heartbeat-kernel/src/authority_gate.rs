//! [`AuthorityGate`] – the single interception point in front of the
//! protected action.
//!
//! Every call walks the same per-invocation state machine:
//!
//! ```text
//! Received ──► Verifying ──► Authorized ──► Executed
//!     │            │             │
//!     └────────────┴─────────────┴────────► Rejected
//! ```
//!
//! 1. **Received** – structural checks on the payload.  Oversized fields, an
//!    empty assertion or a signature of the wrong length produce
//!    [`KernelError::MalformedPayload`].
//! 2. **Verifying** – the canonical message of `(assertion, auxiliary,
//!    context)` is rebuilt and the signature checked against the trusted
//!    authority.  A mismatch produces [`KernelError::Authorization`].
//! 3. **Authorized** – claims embedded in the assertion are decoded.  A JSON
//!    object that is not valid claims is [`KernelError::MalformedPayload`];
//!    an elapsed `not_after` or a replay guard refusal produces
//!    [`KernelError::ExpiredOrReplayed`].  Then the wrapped action runs.
//! 4. **Executed** – the replay guard records the assertion and the action's
//!    result is returned.
//!
//! Nothing is mutated before the action runs, and the replay guard is only
//! updated after the action succeeded, so a rejected call leaves no trace.
//!
//! # Example
//!
//! ```
//! use heartbeat_kernel::{AuthorityGate, AuthoritySigner};
//! use heartbeat_types::KernelError;
//!
//! let signer = AuthoritySigner::from_secret_bytes(&[3u8; 32]);
//! let mut gate = AuthorityGate::new(signer.trusted_key());
//!
//! let payload = signer.sign(b"assertion", b"", "ping");
//!
//! // Bound to "ping" → allowed.
//! let out = gate.guard(&payload, "ping", 0, |call| Ok(call.context.len()));
//! assert_eq!(out, Ok(4));
//!
//! // Replayed for "pong" → rejected, the action never runs.
//! let out = gate.guard(&payload, "pong", 0, |_| -> Result<(), KernelError> {
//!     unreachable!()
//! });
//! assert!(matches!(out, Err(KernelError::Authorization(_))));
//! ```

use std::fmt;

use heartbeat_types::{AssertionClaims, AuthorizationPayload, KernelError};
use tracing::{debug, info, warn};

use crate::authority::{SignatureVerifier, TrustedAuthorityKey};
use crate::canonical::{CANONICAL_VERSION, canonical_message, message_digest};
use crate::replay::{NoReplayGuard, ReplayGuard, decode_claims};

/// Largest accepted assertion, auxiliary or context field, in bytes.
pub const MAX_FIELD_BYTES: usize = 16 * 1024;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Per-invocation gate state.  Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStage {
    Received,
    Verifying,
    Authorized,
    Executed,
    Rejected,
}

impl fmt::Display for GateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateStage::Received => "received",
            GateStage::Verifying => "verifying",
            GateStage::Authorized => "authorized",
            GateStage::Executed => "executed",
            GateStage::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// A verified invocation, handed to the protected action.
#[derive(Debug, Clone)]
pub struct AuthorizedCall<'a> {
    pub context: &'a str,
    pub assertion: &'a [u8],
    pub auxiliary: &'a [u8],
    /// Claims decoded from the assertion, if it carried any.
    pub claims: Option<AssertionClaims>,
    /// Hex SHA-256 of the canonical message that was verified.
    pub message_digest: String,
    /// Chain time the verification was performed at.
    pub verified_at: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// AuthorityGate
// ────────────────────────────────────────────────────────────────────────────

/// Verifies authorization payloads against one trusted authority and runs
/// the protected action only for genuine ones.
pub struct AuthorityGate {
    verifier: Box<dyn SignatureVerifier>,
    replay_guard: Box<dyn ReplayGuard>,
}

impl AuthorityGate {
    /// Gate backed by an Ed25519 authority key and no replay tracking.
    pub fn new(key: TrustedAuthorityKey) -> Self {
        Self::with_verifier(Box::new(key))
    }

    /// Gate backed by any [`SignatureVerifier`].
    pub fn with_verifier(verifier: Box<dyn SignatureVerifier>) -> Self {
        Self {
            verifier,
            replay_guard: Box::new(NoReplayGuard),
        }
    }

    /// Replace the replay guard.
    pub fn with_replay_guard(mut self, guard: Box<dyn ReplayGuard>) -> Self {
        self.replay_guard = guard;
        self
    }

    pub fn replay_guard(&self) -> &dyn ReplayGuard {
        self.replay_guard.as_ref()
    }

    /// Run the Received → Verifying → Authorized checks without executing
    /// anything or touching the replay guard.
    ///
    /// # Errors
    ///
    /// - [`KernelError::MalformedPayload`] – structurally invalid payload, or
    ///   missing claims when the replay guard requires them.
    /// - [`KernelError::Authorization`] – signature does not verify for this
    ///   context under the trusted key.
    /// - [`KernelError::ExpiredOrReplayed`] – `not_after` has passed or the
    ///   replay guard refused the assertion.
    pub fn authorize<'a>(
        &self,
        payload: &'a AuthorizationPayload,
        context: &'a str,
        now: u64,
    ) -> Result<AuthorizedCall<'a>, KernelError> {
        debug!(stage = %GateStage::Received, "gate evaluation started");
        self.check_structure(payload, context)?;

        debug!(
            stage = %GateStage::Verifying,
            scheme = self.verifier.scheme(),
            canonical_version = CANONICAL_VERSION
        );
        let message = canonical_message(&payload.assertion, &payload.auxiliary, context);
        self.verifier.verify(&message, &payload.signature)?;

        let claims = decode_claims(&payload.assertion)?;
        if self.replay_guard.requires_claims() && claims.is_none() {
            return Err(KernelError::MalformedPayload(
                "assertion does not carry the claims required for replay protection".to_string(),
            ));
        }
        if let Some(not_after) = claims.as_ref().and_then(|c| c.not_after)
            && now > not_after
        {
            return Err(KernelError::ExpiredOrReplayed(format!(
                "assertion expired at {not_after}, now {now}"
            )));
        }
        self.replay_guard.check(claims.as_ref(), now)?;

        let call = AuthorizedCall {
            context,
            assertion: &payload.assertion,
            auxiliary: &payload.auxiliary,
            claims,
            message_digest: message_digest(&message),
            verified_at: now,
        };
        debug!(stage = %GateStage::Authorized, digest = %call.message_digest);
        Ok(call)
    }

    /// Authorize the call and, only if that succeeds, run `action`.
    ///
    /// The replay guard records the assertion after `action` returns `Ok`.
    /// Errors from `action` are propagated unchanged.
    pub fn guard<T, F>(
        &mut self,
        payload: &AuthorizationPayload,
        context: &str,
        now: u64,
        action: F,
    ) -> Result<T, KernelError>
    where
        F: FnOnce(&AuthorizedCall<'_>) -> Result<T, KernelError>,
    {
        let call = match self.authorize(payload, context, now) {
            Ok(call) => call,
            Err(e) => {
                warn!(stage = %GateStage::Rejected, context, error = %e, "protected call rejected");
                return Err(e);
            }
        };

        let value = match action(&call) {
            Ok(value) => value,
            Err(e) => {
                warn!(stage = %GateStage::Rejected, context, error = %e, "protected action failed");
                return Err(e);
            }
        };

        self.replay_guard.consume(call.claims.as_ref(), now);
        info!(stage = %GateStage::Executed, context, digest = %call.message_digest, "protected call executed");
        Ok(value)
    }

    fn check_structure(
        &self,
        payload: &AuthorizationPayload,
        context: &str,
    ) -> Result<(), KernelError> {
        if payload.assertion.is_empty() {
            return Err(KernelError::MalformedPayload(
                "assertion must not be empty".to_string(),
            ));
        }
        for (field, len) in [
            ("assertion", payload.assertion.len()),
            ("auxiliary", payload.auxiliary.len()),
            ("context", context.len()),
        ] {
            if len > MAX_FIELD_BYTES {
                return Err(KernelError::MalformedPayload(format!(
                    "{field} is {len} bytes, limit is {MAX_FIELD_BYTES}"
                )));
            }
        }
        let expected = self.verifier.signature_len();
        if payload.signature.len() != expected {
            return Err(KernelError::MalformedPayload(format!(
                "signature must be {expected} bytes, found {}",
                payload.signature.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::AuthoritySigner;
    use crate::replay::{NonceLedger, encode_claims};
    use heartbeat_types::Nonce;

    fn authority() -> AuthoritySigner {
        AuthoritySigner::from_secret_bytes(&[11u8; 32])
    }

    fn gate_for(signer: &AuthoritySigner) -> AuthorityGate {
        AuthorityGate::new(signer.trusted_key())
    }

    fn run(gate: &mut AuthorityGate, payload: &AuthorizationPayload, ctx: &str) -> Result<String, KernelError> {
        gate.guard(payload, ctx, 1_000, |call| Ok(call.context.to_string()))
    }

    #[test]
    fn valid_payload_runs_the_action() {
        let signer = authority();
        let mut gate = gate_for(&signer);
        let payload = signer.sign(b"assert", b"aux", "ping");
        assert_eq!(run(&mut gate, &payload, "ping"), Ok("ping".to_string()));
    }

    #[test]
    fn every_single_byte_signature_flip_is_rejected() {
        let signer = authority();
        let mut gate = gate_for(&signer);
        let payload = signer.sign(b"assert", b"aux", "ping");

        for i in 0..payload.signature.len() {
            let mut tampered = payload.clone();
            tampered.signature[i] ^= 0x01;
            let result = run(&mut gate, &tampered, "ping");
            assert!(
                matches!(result, Err(KernelError::Authorization(_))),
                "flip at byte {i} was not rejected: {result:?}"
            );
        }
    }

    #[test]
    fn context_mismatch_is_rejected() {
        let signer = authority();
        let mut gate = gate_for(&signer);
        let payload = signer.sign(b"assert", b"aux", "pong");
        assert!(matches!(
            run(&mut gate, &payload, "ping"),
            Err(KernelError::Authorization(_))
        ));
    }

    #[test]
    fn signature_for_a_different_triple_is_rejected() {
        let signer = authority();
        let mut gate = gate_for(&signer);
        let other = signer.sign(b"other", b"aux", "ping");
        let mut payload = signer.sign(b"assert", b"aux", "ping");
        payload.signature = other.signature;
        assert!(matches!(
            run(&mut gate, &payload, "ping"),
            Err(KernelError::Authorization(_))
        ));
    }

    #[test]
    fn boundary_splicing_is_rejected() {
        let signer = authority();
        let mut gate = gate_for(&signer);
        let payload = signer.sign(b"abc", b"def", "ctx");

        let mut spliced = payload.clone();
        spliced.assertion = b"ab".to_vec();
        spliced.auxiliary = b"cdef".to_vec();
        assert!(matches!(
            run(&mut gate, &spliced, "ctx"),
            Err(KernelError::Authorization(_))
        ));

        let mut swapped = payload.clone();
        swapped.assertion = payload.auxiliary.clone();
        swapped.auxiliary = payload.assertion.clone();
        assert!(matches!(
            run(&mut gate, &swapped, "ctx"),
            Err(KernelError::Authorization(_))
        ));
    }

    #[test]
    fn foreign_authority_is_rejected() {
        let mut gate = gate_for(&authority());
        let impostor = AuthoritySigner::from_secret_bytes(&[12u8; 32]);
        let payload = impostor.sign(b"assert", b"", "ping");
        assert!(matches!(
            run(&mut gate, &payload, "ping"),
            Err(KernelError::Authorization(_))
        ));
    }

    #[test]
    fn structural_problems_are_malformed() {
        let signer = authority();
        let mut gate = gate_for(&signer);

        let mut short_sig = signer.sign(b"assert", b"", "ping");
        short_sig.signature.truncate(63);
        assert!(matches!(
            run(&mut gate, &short_sig, "ping"),
            Err(KernelError::MalformedPayload(_))
        ));

        let empty_assertion = signer.sign(b"", b"", "ping");
        assert!(matches!(
            run(&mut gate, &empty_assertion, "ping"),
            Err(KernelError::MalformedPayload(_))
        ));

        let oversized = signer.sign(&vec![0u8; MAX_FIELD_BYTES + 1], b"", "ping");
        assert!(matches!(
            run(&mut gate, &oversized, "ping"),
            Err(KernelError::MalformedPayload(_))
        ));

        let long_ctx = "x".repeat(MAX_FIELD_BYTES + 1);
        let payload = signer.sign(b"assert", b"", &long_ctx);
        assert!(matches!(
            run(&mut gate, &payload, &long_ctx),
            Err(KernelError::MalformedPayload(_))
        ));
    }

    #[test]
    fn rejected_call_never_runs_the_action() {
        let signer = authority();
        let mut gate = gate_for(&signer);
        let payload = signer.sign(b"assert", b"", "pong");

        let mut ran = false;
        let result = gate.guard(&payload, "ping", 0, |_| {
            ran = true;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!ran);
    }

    #[test]
    fn verification_is_idempotent_without_replay_tracking() {
        let signer = authority();
        let mut gate = gate_for(&signer);
        let payload = signer.sign(b"assert", b"aux", "ping");
        for _ in 0..3 {
            assert_eq!(run(&mut gate, &payload, "ping"), Ok("ping".to_string()));
        }
    }

    #[test]
    fn expired_assertion_is_rejected() {
        let signer = authority();
        let mut gate = gate_for(&signer);
        let claims = AssertionClaims {
            not_after: Some(500),
            ..Default::default()
        };
        let payload = signer.sign(&encode_claims(&claims), b"", "ping");

        assert!(gate.guard(&payload, "ping", 500, |_| Ok(())).is_ok());
        assert!(matches!(
            gate.guard(&payload, "ping", 501, |_| Ok(())),
            Err(KernelError::ExpiredOrReplayed(_))
        ));
    }

    #[test]
    fn off_schema_claims_never_skip_the_expiry_check() {
        let signer = authority();
        let mut gate = gate_for(&signer);
        for raw in [
            r#"{"not_after":500,"attributes":{"tier":1}}"#,
            r#"{"not_after":"500"}"#,
            r#"{"not_after":500,"nonce":"abcd"}"#,
            r#"{"notAfter":500}"#,
        ] {
            let payload = signer.sign(raw.as_bytes(), b"", "ping");
            let result = gate.guard(&payload, "ping", 10_000, |_| Ok(()));
            assert!(
                matches!(result, Err(KernelError::MalformedPayload(_))),
                "{raw} was accepted: {result:?}"
            );
        }
    }

    #[test]
    fn off_schema_claims_from_a_foreign_key_are_unauthorized() {
        let mut gate = gate_for(&authority());
        let impostor = AuthoritySigner::from_secret_bytes(&[12u8; 32]);
        let payload = impostor.sign(br#"{"notAfter":500}"#, b"", "ping");
        assert!(matches!(
            run(&mut gate, &payload, "ping"),
            Err(KernelError::Authorization(_))
        ));
    }

    #[test]
    fn nonce_ledger_blocks_reuse() {
        let signer = authority();
        let mut gate = gate_for(&signer).with_replay_guard(Box::new(NonceLedger::new()));
        let claims = AssertionClaims {
            nonce: Some(Nonce([1; 32])),
            ..Default::default()
        };
        let payload = signer.sign(&encode_claims(&claims), b"", "ping");

        assert!(run(&mut gate, &payload, "ping").is_ok());
        assert!(matches!(
            run(&mut gate, &payload, "ping"),
            Err(KernelError::ExpiredOrReplayed(_))
        ));
    }

    #[test]
    fn nonce_ledger_requires_claims() {
        let signer = authority();
        let mut gate = gate_for(&signer).with_replay_guard(Box::new(NonceLedger::new()));
        let payload = signer.sign(b"opaque", b"", "ping");
        assert!(matches!(
            run(&mut gate, &payload, "ping"),
            Err(KernelError::MalformedPayload(_))
        ));
    }

    #[test]
    fn failed_action_does_not_consume_the_nonce() {
        let signer = authority();
        let mut gate = gate_for(&signer).with_replay_guard(Box::new(NonceLedger::new()));
        let claims = AssertionClaims {
            nonce: Some(Nonce([2; 32])),
            ..Default::default()
        };
        let payload = signer.sign(&encode_claims(&claims), b"", "ping");

        let failed: Result<(), KernelError> = gate.guard(&payload, "ping", 0, |_| {
            Err(KernelError::InvariantViolation("boom".to_string()))
        });
        assert!(matches!(failed, Err(KernelError::InvariantViolation(_))));

        // The nonce is still fresh.
        assert!(run(&mut gate, &payload, "ping").is_ok());
    }

    #[test]
    fn authorized_call_exposes_claims_and_digest() {
        let signer = authority();
        let gate = gate_for(&signer);
        let mut claims = AssertionClaims::default();
        claims
            .attributes
            .insert("tier".to_string(), "gold".to_string());
        let payload = signer.sign(&encode_claims(&claims), b"aux", "ping");

        let call = gate.authorize(&payload, "ping", 7).unwrap();
        assert_eq!(call.claims, Some(claims));
        assert_eq!(call.auxiliary, b"aux");
        assert_eq!(call.verified_at, 7);
        assert_eq!(
            call.message_digest,
            message_digest(&canonical_message(&payload.assertion, b"aux", "ping"))
        );
    }

    #[test]
    fn stage_display_names() {
        assert_eq!(GateStage::Received.to_string(), "received");
        assert_eq!(GateStage::Rejected.to_string(), "rejected");
    }
}
