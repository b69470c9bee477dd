//! Replay protection extension point.
//!
//! The gate is stateless by default ([`NoReplayGuard`]): the same valid
//! payload and context authorize every time they are presented.  Deployments
//! that need single-use authorizations install a [`NonceLedger`], which
//! requires every assertion to carry a nonce in its [`AssertionClaims`] and
//! remembers the nonces it has already accepted.
//!
//! Guards are two-phase.  [`ReplayGuard::check`] runs before the protected
//! action; [`ReplayGuard::consume`] runs only after the action succeeded, so
//! a failed call never burns a nonce.

use std::collections::BTreeMap;

use heartbeat_types::{AssertionClaims, ConsumedNonce, KernelError, Nonce};

/// Decode structured claims from assertion bytes.
///
/// Bytes that are not a JSON object are opaque and yield `Ok(None)`.  A JSON
/// object is always read as claims.
///
/// # Errors
///
/// [`KernelError::MalformedPayload`] when a JSON object does not match the
/// claims schema (unknown field, wrong type, bad nonce).
pub fn decode_claims(assertion: &[u8]) -> Result<Option<AssertionClaims>, KernelError> {
    let value: serde_json::Value = match serde_json::from_slice(assertion) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    if !value.is_object() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| KernelError::MalformedPayload(format!("assertion claims are invalid: {e}")))
}

/// Encode claims into assertion bytes understood by [`decode_claims`].
pub fn encode_claims(claims: &AssertionClaims) -> Vec<u8> {
    // Serializing a struct of strings, integers and a string map cannot fail.
    serde_json::to_vec(claims).unwrap_or_default()
}

/// Decides whether an authorized assertion may be used (again).
pub trait ReplayGuard: Send + Sync {
    /// When `true`, assertions without decodable claims and a nonce are
    /// rejected as malformed before [`check`](Self::check) runs.
    fn requires_claims(&self) -> bool;

    /// Reject with [`KernelError::ExpiredOrReplayed`] if the assertion has
    /// already been used.  Must not change state.
    fn check(&self, claims: Option<&AssertionClaims>, now: u64) -> Result<(), KernelError>;

    /// Record that the assertion was used by a successful call.
    fn consume(&mut self, claims: Option<&AssertionClaims>, now: u64);

    /// Nonces this guard has recorded, for snapshots.  Stateless guards
    /// return nothing.
    fn consumed_nonces(&self) -> Vec<ConsumedNonce> {
        Vec::new()
    }
}

/// Stateless default: nothing is tracked.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReplayGuard;

impl ReplayGuard for NoReplayGuard {
    fn requires_claims(&self) -> bool {
        false
    }

    fn check(&self, _claims: Option<&AssertionClaims>, _now: u64) -> Result<(), KernelError> {
        Ok(())
    }

    fn consume(&mut self, _claims: Option<&AssertionClaims>, _now: u64) {}
}

/// Set of nonces already spent by successful protected calls.
///
/// A nonce whose assertion carried `not_after` is forgotten once that time
/// has passed: the gate rejects the expired assertion before the ledger is
/// asked, so the entry is dead weight.  Assertions without `not_after` keep
/// their nonce forever; authorities that issue many of them should set an
/// expiry to keep the ledger small.
///
/// # Example
///
/// ```
/// use heartbeat_kernel::replay::{NonceLedger, ReplayGuard};
/// use heartbeat_types::{AssertionClaims, Nonce};
///
/// let mut ledger = NonceLedger::new();
/// let claims = AssertionClaims { nonce: Some(Nonce([1; 32])), ..Default::default() };
///
/// assert!(ledger.check(Some(&claims), 0).is_ok());
/// ledger.consume(Some(&claims), 0);
/// assert!(ledger.check(Some(&claims), 0).is_err());
/// ```
#[derive(Debug, Default, Clone)]
pub struct NonceLedger {
    consumed: BTreeMap<Nonce, Option<u64>>,
}

impl NonceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from previously consumed nonces.
    pub fn from_consumed(consumed: impl IntoIterator<Item = ConsumedNonce>) -> Self {
        Self {
            consumed: consumed
                .into_iter()
                .map(|entry| (entry.nonce, entry.not_after))
                .collect(),
        }
    }

    pub fn is_consumed(&self, nonce: &Nonce) -> bool {
        self.consumed.contains_key(nonce)
    }

    pub fn len(&self) -> usize {
        self.consumed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty()
    }

    /// Forget nonces whose assertions expired before `now`.
    pub fn prune(&mut self, now: u64) {
        self.consumed
            .retain(|_, not_after| not_after.is_none_or(|t| t >= now));
    }
}

impl ReplayGuard for NonceLedger {
    fn requires_claims(&self) -> bool {
        true
    }

    fn check(&self, claims: Option<&AssertionClaims>, _now: u64) -> Result<(), KernelError> {
        let nonce = claims.and_then(|c| c.nonce.as_ref()).ok_or_else(|| {
            KernelError::MalformedPayload("assertion carries no nonce".to_string())
        })?;
        if self.consumed.contains_key(nonce) {
            return Err(KernelError::ExpiredOrReplayed(format!(
                "nonce {} has already been used",
                nonce.to_hex()
            )));
        }
        Ok(())
    }

    fn consume(&mut self, claims: Option<&AssertionClaims>, now: u64) {
        self.prune(now);
        if let Some(c) = claims
            && let Some(nonce) = c.nonce
        {
            self.consumed.insert(nonce, c.not_after);
        }
    }

    fn consumed_nonces(&self) -> Vec<ConsumedNonce> {
        self.consumed
            .iter()
            .map(|(nonce, not_after)| ConsumedNonce {
                nonce: *nonce,
                not_after: *not_after,
            })
            .collect()
    }
}
