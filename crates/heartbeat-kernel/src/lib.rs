//! `heartbeat-kernel` – liveness reporting behind a single authority gate.
//!
//! A kernel reports constant or derived liveness data to anyone and runs
//! exactly one privileged operation, the protected heartbeat, for callers
//! holding an attestation from its trusted authority.
//!
//! # Modules
//!
//! - [`heartbeat_state`] – [`HeartbeatState`][heartbeat_state::HeartbeatState]:
//!   identity, the write-once deployment record, and the derived reads
//!   (`execute`, `execute_extended`, `deployment_info`, …).
//! - [`authority_gate`] – [`AuthorityGate`][authority_gate::AuthorityGate]:
//!   the interception point that verifies an
//!   [`AuthorizationPayload`][heartbeat_types::AuthorizationPayload] before
//!   the wrapped action runs.
//! - [`authority`] – the trusted authority key, the pluggable
//!   [`SignatureVerifier`][authority::SignatureVerifier] seam and the
//!   off-chain [`AuthoritySigner`][authority::AuthoritySigner].
//! - [`canonical`] – the versioned message encoding shared by signer and
//!   verifier.
//! - [`replay`] – optional single-use enforcement for assertions.
//! - [`env`] – the clock and block height supplied by the host.
//! - [`kernel`] – [`HeartbeatKernel`][kernel::HeartbeatKernel], everything
//!   above assembled into one deployable unit.

pub mod authority;
pub mod authority_gate;
pub mod canonical;
pub mod env;
pub mod heartbeat_state;
pub mod kernel;
pub mod replay;

pub use authority::{AuthoritySigner, SignatureVerifier, TrustedAuthorityKey};
pub use authority_gate::{AuthorityGate, AuthorizedCall, GateStage, MAX_FIELD_BYTES};
pub use canonical::{CANONICAL_VERSION, canonical_message};
pub use env::{ChainEnv, ManualEnv, SystemEnv};
pub use heartbeat_state::HeartbeatState;
pub use kernel::{DEFAULT_EVENT_CAPACITY, HeartbeatKernel, KernelSnapshot, ProtectedHeartbeat};
pub use replay::{NoReplayGuard, NonceLedger, ReplayGuard};
