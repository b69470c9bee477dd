use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Status marker reported by every heartbeat read.
pub const STATUS_OK: &str = "OK";

/// Default kernel name used when no identity is configured.
pub const DEFAULT_KERNEL_NAME: &str = "heartbeat.kernel";
/// Default kernel version used when no identity is configured.
pub const DEFAULT_KERNEL_VERSION: &str = "1.0.0";
/// Default kernel description used when no identity is configured.
pub const DEFAULT_KERNEL_DESCRIPTION: &str =
    "A minimal kernel that returns health status and current block timestamp for on-chain monitoring";

/// Static identity metadata of a deployed kernel.  Set once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KernelIdentity {
    pub name: String,
    pub version: String,
    pub description: String,
}

impl KernelIdentity {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }

    /// Reject identities with an empty (or whitespace-only) name or version.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.name.trim().is_empty() {
            return Err(KernelError::Construction(
                "kernel name must not be empty".to_string(),
            ));
        }
        if self.version.trim().is_empty() {
            return Err(KernelError::Construction(
                "kernel version must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for KernelIdentity {
    fn default() -> Self {
        Self::new(
            DEFAULT_KERNEL_NAME,
            DEFAULT_KERNEL_VERSION,
            DEFAULT_KERNEL_DESCRIPTION,
        )
    }
}

/// Host readings captured exactly once, when the kernel becomes active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeploymentRecord {
    /// Chain time (seconds) at construction; baseline for every uptime value.
    pub deployed_at: u64,
    /// Block height (or host sequence number) at construction.
    pub deployed_height: u64,
}

/// Signed attestation presented to unlock the protected heartbeat.
///
/// All three fields travel as lowercase hex strings in JSON (an optional
/// `0x` prefix is accepted on input).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AuthorizationPayload {
    /// The authority's assertion.  Either opaque bytes or a JSON-encoded
    /// [`AssertionClaims`] object.
    #[serde(with = "hex_bytes")]
    #[schemars(with = "String")]
    pub assertion: Vec<u8>,
    /// Supporting data bound into the signature alongside the assertion.
    #[serde(with = "hex_bytes")]
    #[schemars(with = "String")]
    pub auxiliary: Vec<u8>,
    /// Signature over the canonical message of `(assertion, auxiliary, context)`.
    #[serde(with = "hex_bytes")]
    #[schemars(with = "String")]
    pub signature: Vec<u8>,
}

/// 32-byte single-use value carried inside an assertion.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nonce(pub [u8; 32]);

impl Nonce {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(raw: &str) -> Result<Self, KernelError> {
        let trimmed = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes = hex::decode(trimmed)
            .map_err(|e| KernelError::MalformedPayload(format!("nonce is not hex: {e}")))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            KernelError::MalformedPayload(format!("nonce must be 32 bytes, found {}", b.len()))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", self.to_hex())
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Nonce::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Structured claims an authority may embed in the assertion bytes.
///
/// Every field is optional.  `not_after` is enforced whenever present;
/// `nonce` is only tracked when the kernel is configured with a replay guard.
/// Unknown fields are rejected so a misspelt `not_after` cannot go unseen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssertionClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Nonce>,
    /// Last chain time (inclusive) at which the assertion is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<u64>,
    /// Authority-attested parameters surfaced in the heartbeat event.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// A nonce spent by a successful protected call, kept until its assertion
/// can no longer be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedNonce {
    pub nonce: Nonce,
    /// The assertion's `not_after`.  `None` keeps the nonce forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<u64>,
}

/// Result of `execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Heartbeat {
    pub status: String,
    pub timestamp: u64,
}

/// Result of `execute_extended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub height: u64,
    /// `timestamp - deployed_at`.
    pub uptime: u64,
}

/// Result of `deployment_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeploymentInfo {
    pub deployed_at: u64,
    pub uptime: u64,
}

/// Emitted by a successful protected heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub id: Uuid,
    pub context: String,
    pub timestamp: u64,
    pub height: u64,
    pub uptime: u64,
    /// Hex SHA-256 of the canonical message the authority signed.
    pub message_digest: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// Errors surfaced by the kernel.  Every variant is terminal for the call
/// that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelError {
    #[error("Construction Error: {0}")]
    Construction(String),

    #[error("Authorization Denied: {0}")]
    Authorization(String),

    #[error("Malformed Payload: {0}")]
    MalformedPayload(String),

    #[error("Expired Or Replayed Assertion: {0}")]
    ExpiredOrReplayed(String),

    #[error("Invariant Violation: {0}")]
    InvariantViolation(String),
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let trimmed = raw.strip_prefix("0x").unwrap_or(&raw);
        hex::decode(trimmed).map_err(serde::de::Error::custom)
    }
}
