use anyhow::{anyhow, Result};
use async_trait::async_trait;
use schema_steward_control::{ControlPlane, KillSwitchSource};
use schema_steward_domain::{
    ClaimOutcome, ExecutionId, ExecutionRequest, KillSwitchState, RollbackRecord, StatusUpdate,
    VerificationMetricsSubmission,
};

use crate::ClaimCoordinator;

/// In-process [`ControlPlane`] over a [`ClaimCoordinator`] database.
///
/// Used when the agent and coordinator share a host, and by integration tests.
#[derive(Debug, Clone)]
pub struct LocalControlPlane {
    coordinator: ClaimCoordinator,
}

impl LocalControlPlane {
    #[must_use]
    pub fn new(coordinator: ClaimCoordinator) -> Self {
        Self { coordinator }
    }

    #[must_use]
    pub fn coordinator(&self) -> &ClaimCoordinator {
        &self.coordinator
    }

    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(ClaimCoordinator) -> Result<T> + Send + 'static,
    {
        let coordinator = self.coordinator.clone();
        tokio::task::spawn_blocking(move || op(coordinator))
            .await
            .map_err(|err| anyhow!("{operation_label} join failure: {err}"))?
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn list_pending(
        &self,
        limit: usize,
        connection_ids: &[String],
    ) -> Result<Vec<ExecutionRequest>> {
        let connection_ids = connection_ids.to_vec();
        self.run_blocking("list_pending", move |coordinator| {
            Ok(coordinator.list_pending(limit, &connection_ids)?)
        })
        .await
    }

    async fn claim(&self, execution_id: ExecutionId) -> Result<ClaimOutcome> {
        self.run_blocking("claim", move |coordinator| {
            Ok(coordinator.claim(execution_id)?)
        })
        .await
    }

    async fn update_status(&self, execution_id: ExecutionId, update: &StatusUpdate) -> Result<()> {
        let update = update.clone();
        self.run_blocking("update_status", move |coordinator| {
            coordinator.update_status(execution_id, &update)?;
            Ok(())
        })
        .await
    }

    async fn submit_verification_metrics(
        &self,
        submission: &VerificationMetricsSubmission,
    ) -> Result<()> {
        let submission = submission.clone();
        self.run_blocking("submit_verification_metrics", move |coordinator| {
            coordinator.record_verification_metrics(&submission)?;
            Ok(())
        })
        .await
    }

    async fn submit_rollback(&self, record: &RollbackRecord) -> Result<()> {
        let record = record.clone();
        self.run_blocking("submit_rollback", move |coordinator| {
            Ok(coordinator.record_rollback(&record)?)
        })
        .await
    }
}

#[async_trait]
impl KillSwitchSource for LocalControlPlane {
    async fn fetch(&self, connection_id: &str) -> Result<KillSwitchState> {
        let connection_id = connection_id.to_string();
        self.run_blocking("kill_switch", move |coordinator| {
            Ok(coordinator.kill_switch(Some(&connection_id))?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use schema_steward_control::{ControlPlane, KillSwitchGate};
    use schema_steward_domain::{ClaimOutcome, ExecutionId, KillSwitchUpdate, NewExecution};
    use std::sync::Arc;
    use ulid::Ulid;

    use super::LocalControlPlane;
    use crate::ClaimCoordinator;

    fn local_plane() -> LocalControlPlane {
        let path = std::env::temp_dir().join(format!("steward-local-{}.sqlite", Ulid::new()));
        let coordinator = ClaimCoordinator::new(path);
        assert!(coordinator.migrate().is_ok());
        LocalControlPlane::new(coordinator)
    }

    #[tokio::test]
    async fn claim_round_trips_through_the_trait() {
        let plane = local_plane();
        let record = plane
            .coordinator()
            .create_execution(&NewExecution {
                connection_id: "conn-a".to_string(),
                action: "ADD_INDEX".to_string(),
                table_name: "orders".to_string(),
                index_name: "idx_orders_status".to_string(),
                columns: vec!["status".to_string()],
                query_fingerprints: Vec::new(),
            })
            .unwrap_or_else(|_| unreachable!());
        let id = ExecutionId::parse(&record.id).unwrap_or_else(|_| unreachable!());

        let pending = plane
            .list_pending(5, &[])
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(pending.len(), 1);

        let first = plane.claim(id).await.unwrap_or_else(|_| unreachable!());
        assert!(matches!(first, ClaimOutcome::Claimed(_)));
        let second = plane.claim(id).await.unwrap_or_else(|_| unreachable!());
        assert!(matches!(second, ClaimOutcome::Conflict { .. }));
    }

    #[tokio::test]
    async fn gate_reads_switches_from_the_store() {
        let plane = local_plane();
        let gate = KillSwitchGate::new(Arc::new(plane.clone()));
        assert!(!gate.is_blocked("conn-a").await);

        assert!(plane
            .coordinator()
            .set_kill_switch(&KillSwitchUpdate {
                connection_id: Some("conn-a".to_string()),
                active: true,
                reason: None,
            })
            .is_ok());
        assert!(gate.is_blocked("conn-a").await);
        assert!(!gate.is_blocked("conn-b").await);
    }
}
