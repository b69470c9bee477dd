//! [`HeartbeatState`] – identity, deployment time and derived liveness reads.
//!
//! The only persisted fact is the [`DeploymentRecord`] captured at
//! construction.  Every other value (current time, height, uptime) is read
//! from the [`ChainEnv`] on demand and never cached.

use std::sync::Arc;

use heartbeat_types::{
    DeploymentInfo, DeploymentRecord, Heartbeat, HealthStatus, KernelError, KernelIdentity,
    STATUS_OK,
};
use tracing::error;

use crate::env::ChainEnv;

/// Read-only liveness reporting for one deployed kernel.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use heartbeat_kernel::env::ManualEnv;
/// use heartbeat_kernel::heartbeat_state::HeartbeatState;
/// use heartbeat_types::KernelIdentity;
///
/// let env = ManualEnv::new(1_000, 1);
/// let state = HeartbeatState::new(KernelIdentity::default(), Arc::new(env.clone())).unwrap();
///
/// env.advance(30);
/// let info = state.deployment_info().unwrap();
/// assert_eq!(info.deployed_at, 1_000);
/// assert_eq!(info.uptime, 30);
/// ```
pub struct HeartbeatState {
    identity: KernelIdentity,
    record: DeploymentRecord,
    env: Arc<dyn ChainEnv>,
}

impl HeartbeatState {
    /// Validate `identity` and fix the deployment record from the current
    /// environment readings.
    pub fn new(identity: KernelIdentity, env: Arc<dyn ChainEnv>) -> Result<Self, KernelError> {
        identity.validate()?;
        let record = DeploymentRecord {
            deployed_at: env.timestamp(),
            deployed_height: env.block_height(),
        };
        Ok(Self {
            identity,
            record,
            env,
        })
    }

    /// Rebuild a state from a record captured by an earlier [`new`](Self::new).
    pub fn restore(
        identity: KernelIdentity,
        record: DeploymentRecord,
        env: Arc<dyn ChainEnv>,
    ) -> Result<Self, KernelError> {
        identity.validate()?;
        Ok(Self {
            identity,
            record,
            env,
        })
    }

    /// `("OK", now)`.
    pub fn execute(&self) -> Heartbeat {
        Heartbeat {
            status: STATUS_OK.to_string(),
            timestamp: self.env.timestamp(),
        }
    }

    /// Status, time, height and uptime in one reading.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvariantViolation`] when the environment reports a time
    /// earlier than the deployment time.
    pub fn execute_extended(&self) -> Result<HealthStatus, KernelError> {
        let timestamp = self.env.timestamp();
        let height = self.env.block_height();
        let uptime = self.uptime_at(timestamp)?;
        Ok(HealthStatus {
            status: STATUS_OK.to_string(),
            timestamp,
            height,
            uptime,
        })
    }

    /// Always `true`.  Placeholder until real health checks exist.
    pub fn is_healthy(&self) -> bool {
        true
    }

    pub fn metadata(&self) -> &KernelIdentity {
        &self.identity
    }

    /// `(deployed_at, uptime)`.
    ///
    /// # Errors
    ///
    /// Same invariant as [`execute_extended`](Self::execute_extended).
    pub fn deployment_info(&self) -> Result<DeploymentInfo, KernelError> {
        let uptime = self.uptime_at(self.env.timestamp())?;
        Ok(DeploymentInfo {
            deployed_at: self.record.deployed_at,
            uptime,
        })
    }

    pub fn deployed_at(&self) -> u64 {
        self.record.deployed_at
    }

    pub fn record(&self) -> DeploymentRecord {
        self.record
    }

    pub(crate) fn env(&self) -> &dyn ChainEnv {
        self.env.as_ref()
    }

    pub(crate) fn uptime_at(&self, timestamp: u64) -> Result<u64, KernelError> {
        timestamp
            .checked_sub(self.record.deployed_at)
            .ok_or_else(|| {
                error!(
                    timestamp,
                    deployed_at = self.record.deployed_at,
                    "chain time is earlier than deployment time"
                );
                KernelError::InvariantViolation(format!(
                    "current time {timestamp} precedes deployment time {}",
                    self.record.deployed_at
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::ManualEnv;

    fn deployed_at(t0: u64) -> (HeartbeatState, ManualEnv) {
        let env = ManualEnv::new(t0, 100);
        let state = HeartbeatState::new(KernelIdentity::default(), Arc::new(env.clone()))
            .expect("valid identity");
        (state, env)
    }

    #[test]
    fn deployed_at_equals_construction_time() {
        let (state, _) = deployed_at(1_700_000_000);
        assert_eq!(state.deployed_at(), 1_700_000_000);
        assert_eq!(state.record().deployed_height, 100);
    }

    #[test]
    fn deployment_info_starts_at_zero_uptime() {
        let (state, env) = deployed_at(5_000);
        assert_eq!(
            state.deployment_info().unwrap(),
            DeploymentInfo {
                deployed_at: 5_000,
                uptime: 0
            }
        );

        env.advance(42);
        assert_eq!(
            state.deployment_info().unwrap(),
            DeploymentInfo {
                deployed_at: 5_000,
                uptime: 42
            }
        );
    }

    #[test]
    fn execute_reports_ok_and_current_time() {
        let (state, env) = deployed_at(10);
        let first = state.execute();
        assert_eq!(first.status, "OK");
        assert_eq!(first.timestamp, 10);

        env.advance(1);
        let second = state.execute();
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn execute_extended_uptime_is_time_minus_deployment() {
        let (state, env) = deployed_at(1_000);
        env.advance(15);
        env.mine();

        let status = state.execute_extended().unwrap();
        assert_eq!(status.status, "OK");
        assert_eq!(status.timestamp, 1_015);
        assert_eq!(status.height, 101);
        assert_eq!(status.uptime, status.timestamp - state.deployed_at());
    }

    #[test]
    fn clock_before_deployment_is_an_invariant_violation() {
        let (state, env) = deployed_at(1_000);
        env.set_timestamp(999);
        assert!(matches!(
            state.execute_extended(),
            Err(KernelError::InvariantViolation(_))
        ));
        assert!(matches!(
            state.deployment_info(),
            Err(KernelError::InvariantViolation(_))
        ));
        // Plain execute has no failure mode.
        assert_eq!(state.execute().timestamp, 999);
    }

    #[test]
    fn is_healthy_is_always_true() {
        let (state, env) = deployed_at(0);
        assert!(state.is_healthy());
        env.advance(1_000_000);
        assert!(state.is_healthy());
    }

    #[test]
    fn metadata_is_the_construction_identity() {
        let identity = KernelIdentity::new("probe.kernel", "2.1.0", "probe");
        let state =
            HeartbeatState::new(identity.clone(), Arc::new(ManualEnv::new(0, 0))).unwrap();
        assert_eq!(state.metadata(), &identity);
    }

    #[test]
    fn invalid_identity_fails_construction() {
        let result = HeartbeatState::new(
            KernelIdentity::new("", "1.0.0", ""),
            Arc::new(ManualEnv::default()),
        );
        assert!(matches!(result, Err(KernelError::Construction(_))));
    }

    #[test]
    fn restore_keeps_the_original_record() {
        let env = ManualEnv::new(9_000, 50);
        let record = DeploymentRecord {
            deployed_at: 8_000,
            deployed_height: 40,
        };
        let state =
            HeartbeatState::restore(KernelIdentity::default(), record, Arc::new(env)).unwrap();
        assert_eq!(state.record(), record);
        assert_eq!(state.deployment_info().unwrap().uptime, 1_000);
    }
}
