//! [`HeartbeatKernel`] – the deployed unit: heartbeat state plus one gated
//! entry point.
//!
//! Reads take `&self` and never mutate anything.  The protected heartbeat
//! takes `&mut self` because its action appends a [`HeartbeatEvent`]; the
//! borrow checker therefore serializes it against every other call.  Hosts
//! that share a kernel between threads wrap it in a `RwLock`.

use std::sync::Arc;

use heartbeat_types::{
    AuthorizationPayload, DeploymentInfo, DeploymentRecord, Heartbeat, HealthStatus,
    ConsumedNonce, HeartbeatEvent, KernelError, KernelIdentity, STATUS_OK,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::authority::TrustedAuthorityKey;
use crate::authority_gate::AuthorityGate;
use crate::env::ChainEnv;
use crate::heartbeat_state::HeartbeatState;
use crate::replay::{NonceLedger, ReplayGuard};

/// Events kept by default; older ones are dropped first.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Receipt returned by a successful protected heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeartbeat {
    pub status: String,
    pub event: HeartbeatEvent,
}

/// Serializable image of a deployed kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSnapshot {
    pub identity: KernelIdentity,
    pub record: DeploymentRecord,
    /// Hex Ed25519 public key of the trusted authority.
    pub authority_key: String,
    #[serde(default)]
    pub replay_protection: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumed_nonces: Vec<ConsumedNonce>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<HeartbeatEvent>,
}

/// Health-reporting kernel with a single authority-gated heartbeat.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use heartbeat_kernel::{AuthoritySigner, HeartbeatKernel};
/// use heartbeat_kernel::env::ManualEnv;
/// use heartbeat_types::KernelIdentity;
///
/// let authority = AuthoritySigner::from_secret_bytes(&[5u8; 32]);
/// let env = ManualEnv::new(1_000, 1);
/// let mut kernel = HeartbeatKernel::deploy(
///     KernelIdentity::default(),
///     authority.trusted_key(),
///     Arc::new(env.clone()),
/// )
/// .unwrap();
///
/// assert!(kernel.is_healthy());
/// assert_eq!(kernel.execute().status, "OK");
///
/// let payload = authority.sign(b"attested", b"", "ping");
/// let receipt = kernel.protected_heartbeat(&payload, "ping").unwrap();
/// assert_eq!(receipt.event.context, "ping");
/// assert_eq!(kernel.events().len(), 1);
/// ```
pub struct HeartbeatKernel {
    state: HeartbeatState,
    authority_key: TrustedAuthorityKey,
    gate: AuthorityGate,
    events: Vec<HeartbeatEvent>,
    event_capacity: usize,
}

impl HeartbeatKernel {
    /// Construct a kernel: validate the identity, fix the deployment record
    /// from `env`, and store the authority key.
    ///
    /// # Errors
    ///
    /// [`KernelError::Construction`] when the identity is invalid.
    pub fn deploy(
        identity: KernelIdentity,
        authority_key: TrustedAuthorityKey,
        env: Arc<dyn ChainEnv>,
    ) -> Result<Self, KernelError> {
        let state = HeartbeatState::new(identity, env)?;
        let record = state.record();
        info!(
            name = %state.metadata().name,
            version = %state.metadata().version,
            deployed_at = record.deployed_at,
            deployed_height = record.deployed_height,
            authority = %authority_key.to_hex(),
            "kernel deployed"
        );
        Ok(Self::assemble(state, authority_key, Vec::new()))
    }

    /// Rebuild a kernel from a [`KernelSnapshot`].  The deployment record is
    /// taken from the snapshot, never re-read from `env`.
    pub fn restore(snapshot: KernelSnapshot, env: Arc<dyn ChainEnv>) -> Result<Self, KernelError> {
        let authority_key = TrustedAuthorityKey::from_hex(&snapshot.authority_key)?;
        let state = HeartbeatState::restore(snapshot.identity, snapshot.record, env)?;
        let kernel = Self::assemble(state, authority_key, snapshot.events);
        if snapshot.replay_protection {
            let ledger = NonceLedger::from_consumed(snapshot.consumed_nonces);
            Ok(kernel.with_replay_guard(Box::new(ledger)))
        } else {
            Ok(kernel)
        }
    }

    fn assemble(
        state: HeartbeatState,
        authority_key: TrustedAuthorityKey,
        events: Vec<HeartbeatEvent>,
    ) -> Self {
        Self {
            state,
            authority_key,
            gate: AuthorityGate::new(authority_key),
            events,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Install a replay guard in front of the protected heartbeat.
    pub fn with_replay_guard(mut self, guard: Box<dyn ReplayGuard>) -> Self {
        self.gate = self.gate.with_replay_guard(guard);
        self
    }

    /// Keep at most `capacity` events (minimum one), dropping the oldest.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        trim_oldest(&mut self.events, self.event_capacity);
        self
    }

    pub fn snapshot(&self) -> KernelSnapshot {
        let guard = self.gate.replay_guard();
        KernelSnapshot {
            identity: self.state.metadata().clone(),
            record: self.state.record(),
            authority_key: self.authority_key.to_hex(),
            replay_protection: guard.requires_claims(),
            consumed_nonces: guard.consumed_nonces(),
            events: self.events.clone(),
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub fn execute(&self) -> Heartbeat {
        self.state.execute()
    }

    pub fn execute_extended(&self) -> Result<HealthStatus, KernelError> {
        self.state.execute_extended()
    }

    pub fn is_healthy(&self) -> bool {
        self.state.is_healthy()
    }

    pub fn metadata(&self) -> &KernelIdentity {
        self.state.metadata()
    }

    pub fn deployment_info(&self) -> Result<DeploymentInfo, KernelError> {
        self.state.deployment_info()
    }

    pub fn deployment_record(&self) -> DeploymentRecord {
        self.state.record()
    }

    pub fn token_authority_public_key(&self) -> &TrustedAuthorityKey {
        &self.authority_key
    }

    /// Retained events emitted by successful protected heartbeats, oldest
    /// first.
    pub fn events(&self) -> &[HeartbeatEvent] {
        &self.events
    }

    // ── Protected entry point ────────────────────────────────────────────

    /// Heartbeat that only runs for a payload the trusted authority signed
    /// for exactly this `context`.
    ///
    /// On success a [`HeartbeatEvent`] is appended and returned in the
    /// receipt.  On any error the event log and replay guard are unchanged.
    ///
    /// # Errors
    ///
    /// - [`KernelError::MalformedPayload`]
    /// - [`KernelError::Authorization`]
    /// - [`KernelError::ExpiredOrReplayed`]
    /// - [`KernelError::InvariantViolation`] – chain time precedes deployment.
    #[instrument(skip(self, payload), fields(kernel = %self.state.metadata().name))]
    pub fn protected_heartbeat(
        &mut self,
        payload: &AuthorizationPayload,
        context: &str,
    ) -> Result<ProtectedHeartbeat, KernelError> {
        let now = self.state.env().timestamp();
        let state = &self.state;
        let events = &mut self.events;
        let capacity = self.event_capacity;

        self.gate.guard(payload, context, now, |call| {
            let uptime = state.uptime_at(call.verified_at)?;
            let event = HeartbeatEvent {
                id: Uuid::new_v4(),
                context: call.context.to_string(),
                timestamp: call.verified_at,
                height: state.env().block_height(),
                uptime,
                message_digest: call.message_digest.clone(),
                attributes: call
                    .claims
                    .as_ref()
                    .map(|c| c.attributes.clone())
                    .unwrap_or_default(),
            };
            events.push(event.clone());
            trim_oldest(events, capacity);
            Ok(ProtectedHeartbeat {
                status: STATUS_OK.to_string(),
                event,
            })
        })
    }
}

fn trim_oldest(events: &mut Vec<HeartbeatEvent>, capacity: usize) {
    if events.len() > capacity {
        let excess = events.len() - capacity;
        events.drain(..excess);
    }
}
