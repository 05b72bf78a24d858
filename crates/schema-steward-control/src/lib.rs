#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use schema_steward_domain::{
    ClaimOutcome, ExecutionId, ExecutionRequest, KillSwitchState, RollbackRecord, StatusUpdate,
    VerificationMetricsSubmission,
};
use tracing::warn;

mod http;

pub use http::{HttpControlPlane, HttpControlPlaneConfig};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of the claim coordinator.
///
/// `claim` is the only concurrency-control primitive: a [`ClaimOutcome::Conflict`]
/// means another owner is responsible and the caller must not proceed.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    async fn list_pending(
        &self,
        limit: usize,
        connection_ids: &[String],
    ) -> Result<Vec<ExecutionRequest>>;

    #[allow(clippy::missing_errors_doc)]
    async fn claim(&self, execution_id: ExecutionId) -> Result<ClaimOutcome>;

    #[allow(clippy::missing_errors_doc)]
    async fn update_status(&self, execution_id: ExecutionId, update: &StatusUpdate) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    async fn submit_verification_metrics(
        &self,
        submission: &VerificationMetricsSubmission,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    async fn submit_rollback(&self, record: &RollbackRecord) -> Result<()>;
}

#[async_trait]
pub trait KillSwitchSource: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    async fn fetch(&self, connection_id: &str) -> Result<KillSwitchState>;
}

/// Fail-closed view over a [`KillSwitchSource`].
///
/// Every check is a fresh read. An error, a timeout or an unparseable answer
/// all count as "blocked".
#[derive(Clone)]
pub struct KillSwitchGate {
    source: Arc<dyn KillSwitchSource>,
    timeout: Duration,
}

impl KillSwitchGate {
    #[must_use]
    pub fn new(source: Arc<dyn KillSwitchSource>) -> Self {
        Self {
            source,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn check(&self, connection_id: &str) -> KillSwitchState {
        match tokio::time::timeout(self.timeout, self.source.fetch(connection_id)).await {
            Ok(Ok(state)) => state,
            Ok(Err(err)) => {
                warn!(connection_id, error = %err, "kill switch unreadable; treating as active");
                KillSwitchState::fully_blocked(format!("kill switch unreadable: {err}"))
            }
            Err(_) => {
                warn!(
                    connection_id,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "kill switch check timed out; treating as active"
                );
                KillSwitchState::fully_blocked("kill switch check timed out")
            }
        }
    }

    pub async fn is_blocked(&self, connection_id: &str) -> bool {
        self.check(connection_id).await.is_blocked()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use schema_steward_domain::KillSwitchState;

    use super::{KillSwitchGate, KillSwitchSource};

    struct Fixed(KillSwitchState, AtomicUsize);

    #[async_trait]
    impl KillSwitchSource for Fixed {
        async fn fetch(&self, _connection_id: &str) -> Result<KillSwitchState> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl KillSwitchSource for Broken {
        async fn fetch(&self, _connection_id: &str) -> Result<KillSwitchState> {
            Err(anyhow!("connection refused"))
        }
    }

    struct Stalled;

    #[async_trait]
    impl KillSwitchSource for Stalled {
        async fn fetch(&self, _connection_id: &str) -> Result<KillSwitchState> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(KillSwitchState::default())
        }
    }

    #[tokio::test]
    async fn open_switches_do_not_block_and_each_check_is_fresh() {
        let source = Arc::new(Fixed(KillSwitchState::default(), AtomicUsize::new(0)));
        let gate = KillSwitchGate::new(source.clone());
        assert!(!gate.is_blocked("conn-a").await);
        assert!(!gate.is_blocked("conn-a").await);
        assert_eq!(source.1.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn either_flag_blocks() {
        for state in [
            KillSwitchState {
                global_active: true,
                connection_active: false,
                reason: None,
            },
            KillSwitchState {
                global_active: false,
                connection_active: true,
                reason: Some("maintenance".to_string()),
            },
        ] {
            let gate = KillSwitchGate::new(Arc::new(Fixed(state, AtomicUsize::new(0))));
            assert!(gate.is_blocked("conn-a").await);
        }
    }

    #[tokio::test]
    async fn source_error_fails_closed() {
        let gate = KillSwitchGate::new(Arc::new(Broken));
        let state = gate.check("conn-a").await;
        assert!(state.global_active && state.connection_active);
        assert!(state
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("connection refused")));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_closed() {
        let gate = KillSwitchGate::new(Arc::new(Stalled)).with_timeout(Duration::from_millis(50));
        assert!(gate.is_blocked("conn-a").await);
    }
}
