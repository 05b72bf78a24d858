use std::sync::Arc;
use std::time::Duration;

use schema_steward_domain::ExecutionStatus;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Disposition, ExecutionOrchestrator, ExecutionReport};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PollerStats {
    pub polls: u64,
    pub poll_errors: u64,
    pub completed: u64,
    pub failed: u64,
    pub rolled_back: u64,
    pub claim_lost: u64,
    pub not_served: u64,
}

impl PollerStats {
    fn record(&mut self, report: &ExecutionReport) {
        match &report.disposition {
            Disposition::Finalized { status, .. } => match status {
                ExecutionStatus::Completed => self.completed += 1,
                ExecutionStatus::RolledBack => self.rolled_back += 1,
                _ => self.failed += 1,
            },
            Disposition::ClaimLost => self.claim_lost += 1,
            Disposition::NotServed => self.not_served += 1,
        }
    }
}

/// Cooperative work loop: one execution at a time, to completion.
///
/// Cancellation is only observed between executions and during the idle
/// sleep; a claimed execution always reaches a terminal state.
pub struct Poller {
    orchestrator: Arc<ExecutionOrchestrator>,
    config: PollerConfig,
}

impl Poller {
    #[must_use]
    pub fn new(orchestrator: Arc<ExecutionOrchestrator>, config: PollerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Fetch one batch for the served connections and run each item.
    ///
    /// # Errors
    /// Returns the coordinator error when the pending list cannot be fetched.
    pub async fn poll_once(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<ExecutionReport>> {
        let connection_ids = self.orchestrator.targets().connection_ids();
        let pending = self
            .orchestrator
            .control()
            .list_pending(self.config.batch_size, &connection_ids)
            .await?;

        let mut reports = Vec::with_capacity(pending.len());
        for request in pending {
            if cancel.is_cancelled() {
                info!("stop requested; leaving remaining pending executions");
                break;
            }
            reports.push(self.orchestrator.execute(request).await);
        }
        Ok(reports)
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> PollerStats {
        let mut stats = PollerStats::default();
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "poller started"
        );

        while !cancel.is_cancelled() {
            stats.polls += 1;
            match self.poll_once(&cancel).await {
                Ok(reports) => {
                    for report in &reports {
                        stats.record(report);
                    }
                }
                Err(err) => {
                    stats.poll_errors += 1;
                    warn!(error = %format!("{err:#}"), "failed to fetch pending executions");
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!(
            polls = stats.polls,
            completed = stats.completed,
            rolled_back = stats.rolled_back,
            failed = stats.failed,
            "poller stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use schema_steward_audit_core::AuditSink;
    use schema_steward_audit_sqlite::SqliteAuditStore;
    use schema_steward_control::{ControlPlane, KillSwitchGate, KillSwitchSource};
    use schema_steward_domain::{
        ClaimOutcome, ExecutionId, ExecutionRequest, KillSwitchState, RollbackRecord,
        StatusUpdate, VerificationMetricsSubmission,
    };
    use schema_steward_target::StaticTargetRegistry;
    use tokio_util::sync::CancellationToken;
    use ulid::Ulid;

    use super::{Poller, PollerConfig};
    use crate::{ExecutionOrchestrator, OrchestratorConfig};

    #[derive(Default)]
    struct Flaky {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl ControlPlane for Flaky {
        async fn list_pending(
            &self,
            _limit: usize,
            _connection_ids: &[String],
        ) -> Result<Vec<ExecutionRequest>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("coordinator unavailable"))
        }

        async fn claim(&self, _execution_id: ExecutionId) -> Result<ClaimOutcome> {
            Err(anyhow!("unused"))
        }

        async fn update_status(
            &self,
            _execution_id: ExecutionId,
            _update: &StatusUpdate,
        ) -> Result<()> {
            Ok(())
        }

        async fn submit_verification_metrics(
            &self,
            _submission: &VerificationMetricsSubmission,
        ) -> Result<()> {
            Ok(())
        }

        async fn submit_rollback(&self, _record: &RollbackRecord) -> Result<()> {
            Ok(())
        }
    }

    struct Clear;

    #[async_trait]
    impl KillSwitchSource for Clear {
        async fn fetch(&self, _connection_id: &str) -> Result<KillSwitchState> {
            Ok(KillSwitchState::default())
        }
    }

    fn poller(control: Arc<Flaky>) -> Poller {
        let path = std::env::temp_dir().join(format!("steward-poller-{}.sqlite", Ulid::new()));
        let audit = Arc::new(SqliteAuditStore::open(&path).unwrap_or_else(|_| unreachable!()));
        assert!(audit.migrate().is_ok());
        let orchestrator = ExecutionOrchestrator::new(
            control,
            KillSwitchGate::new(Arc::new(Clear)),
            Arc::new(StaticTargetRegistry::new()),
            audit,
            OrchestratorConfig::default(),
        );
        Poller::new(
            Arc::new(orchestrator),
            PollerConfig {
                interval: Duration::from_secs(30),
                batch_size: 5,
            },
        )
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_polling() {
        let control = Arc::new(Flaky::default());
        let poller = poller(control.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = poller.run(cancel).await;
        assert_eq!(stats.polls, 0);
        assert_eq!(control.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_are_counted_and_the_loop_keeps_ticking() {
        let control = Arc::new(Flaky::default());
        let poller = poller(control.clone());
        let cancel = CancellationToken::new();

        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(75)).await;
                cancel.cancel();
            })
        };

        let stats = poller.run(cancel).await;
        assert!(stopper.await.is_ok());
        assert_eq!(stats.polls, 3);
        assert_eq!(stats.poll_errors, 3);
        assert_eq!(control.polls.load(Ordering::SeqCst), 3);
    }
}
