#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schema_steward_domain::{
    now_utc, validate_identifiers, ExecutionId, FailReason, Identifier, MetricSnapshot,
    RollbackRecord, RollbackStatus, RollbackType, StewardError,
};
use schema_steward_verify::{add_index_sql, drop_index_sql};
use tracing::{info, instrument, warn};

mod mysql;

pub use mysql::{snapshot_from_digest, DigestRow, MySqlTarget};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("could not connect to target database: {0}")]
    Connect(String),
    /// The database rejected the statement; the message is the server's own.
    #[error("{0}")]
    Statement(String),
    #[error(transparent)]
    Invalid(#[from] StewardError),
}

/// The production database a change is applied to.
///
/// Implementations open a connection per call and release it before
/// returning, so nothing is held across the observation wait.
#[async_trait]
pub trait TargetDatabase: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    async fn execute_ddl(&self, sql: &str) -> Result<(), TargetError>;

    /// Aggregated statement statistics for exactly these fingerprints.
    /// Unknown fingerprints produce no row.
    #[allow(clippy::missing_errors_doc)]
    async fn digest_stats(&self, fingerprints: &[String])
        -> Result<Vec<MetricSnapshot>, TargetError>;

    #[allow(clippy::missing_errors_doc)]
    async fn index_exists(&self, table: &Identifier, index: &Identifier)
        -> Result<bool, TargetError>;
}

/// Maps `connectionId`s to the databases this agent is allowed to change.
pub trait TargetRegistry: Send + Sync {
    fn resolve(&self, connection_id: &str) -> Option<Arc<dyn TargetDatabase>>;

    fn connection_ids(&self) -> Vec<String>;

    fn serves(&self, connection_id: &str) -> bool {
        self.resolve(connection_id).is_some()
    }
}

#[derive(Clone, Default)]
pub struct StaticTargetRegistry {
    targets: BTreeMap<String, Arc<dyn TargetDatabase>>,
}

impl StaticTargetRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_target(
        mut self,
        connection_id: impl Into<String>,
        target: Arc<dyn TargetDatabase>,
    ) -> Self {
        self.insert(connection_id, target);
        self
    }

    pub fn insert(&mut self, connection_id: impl Into<String>, target: Arc<dyn TargetDatabase>) {
        self.targets.insert(connection_id.into(), target);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl TargetRegistry for StaticTargetRegistry {
    fn resolve(&self, connection_id: &str) -> Option<Arc<dyn TargetDatabase>> {
        self.targets.get(connection_id).cloned()
    }

    fn connection_ids(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }
}

pub struct MetricsSampler {
    target: Arc<dyn TargetDatabase>,
}

impl MetricsSampler {
    #[must_use]
    pub fn new(target: Arc<dyn TargetDatabase>) -> Self {
        Self { target }
    }

    /// # Errors
    /// Returns the target's error when the statistics query fails.
    pub async fn sample(
        &self,
        fingerprints: &[String],
    ) -> Result<Vec<MetricSnapshot>, TargetError> {
        if fingerprints.is_empty() {
            return Ok(Vec::new());
        }
        self.target.digest_stats(fingerprints).await
    }

    /// Activity of each fingerprint during the observation window.
    ///
    /// Digest counters are cumulative, so the second read is reduced by
    /// `baseline` with [`window_delta`] and tagged with the window length.
    ///
    /// # Errors
    /// Returns the target's error when the statistics query fails.
    pub async fn sample_after(
        &self,
        fingerprints: &[String],
        baseline: &[MetricSnapshot],
        window_minutes: u32,
    ) -> Result<Vec<MetricSnapshot>, TargetError> {
        let cumulative = self.sample(fingerprints).await?;
        Ok(window_delta(baseline, &cumulative, window_minutes))
    }
}

/// Subtract a baseline read from a later cumulative read, per fingerprint.
///
/// Fingerprints with no executions in between are left out, so they are not
/// compared at all. A fingerprint whose execution count went backwards had
/// its counters reset (`TRUNCATE` of the summary table or a server restart);
/// its later read then only covers activity since the reset and is taken as
/// the window. Any other counter that went backwards clamps to zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn window_delta(
    baseline: &[MetricSnapshot],
    cumulative: &[MetricSnapshot],
    window_minutes: u32,
) -> Vec<MetricSnapshot> {
    let baseline: BTreeMap<&str, &MetricSnapshot> = baseline
        .iter()
        .map(|snapshot| (snapshot.fingerprint.as_str(), snapshot))
        .collect();

    cumulative
        .iter()
        .filter_map(|later| {
            let mut window = match baseline.get(later.fingerprint.as_str()) {
                Some(base) if later.execution_count >= base.execution_count => {
                    let execution_count = later.execution_count - base.execution_count;
                    let total_ms = later.avg_latency_ms * later.execution_count as f64
                        - base.avg_latency_ms * base.execution_count as f64;
                    let avg_latency_ms = if execution_count == 0 {
                        0.0
                    } else {
                        total_ms.max(0.0) / execution_count as f64
                    };
                    MetricSnapshot {
                        fingerprint: later.fingerprint.clone(),
                        execution_count,
                        avg_latency_ms,
                        rows_examined: later.rows_examined.saturating_sub(base.rows_examined),
                        full_scan_count: later
                            .full_scan_count
                            .saturating_sub(base.full_scan_count),
                        sample_count: execution_count,
                        window_minutes: None,
                    }
                }
                _ => later.clone(),
            };
            if window.execution_count == 0 {
                return None;
            }
            window.window_minutes = Some(window_minutes);
            Some(window)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    pub applied_sql: String,
}

pub struct ChangeExecutor {
    target: Arc<dyn TargetDatabase>,
}

impl ChangeExecutor {
    #[must_use]
    pub fn new(target: Arc<dyn TargetDatabase>) -> Self {
        Self { target }
    }

    /// Build and run the online `ADD INDEX` statement.
    ///
    /// # Errors
    /// Returns [`TargetError::Invalid`] before any I/O when a name fails
    /// validation, otherwise the database error as reported.
    #[instrument(skip(self, columns), fields(column_count = columns.len()))]
    pub async fn apply_add_index(
        &self,
        table_name: &str,
        index_name: &str,
        columns: &[String],
    ) -> Result<AppliedChange, TargetError> {
        let table = Identifier::parse(table_name)?;
        let index = Identifier::parse(index_name)?;
        let columns = validate_identifiers(columns)?;

        let applied_sql = add_index_sql(&table, &index, &columns);
        self.target.execute_ddl(&applied_sql).await?;
        info!(sql = %applied_sql, "index ddl applied");
        Ok(AppliedChange { applied_sql })
    }

    /// # Errors
    /// Returns the target's error when the catalog cannot be read.
    pub async fn index_exists(
        &self,
        table: &Identifier,
        index: &Identifier,
    ) -> Result<bool, TargetError> {
        self.target.index_exists(table, index).await
    }
}

pub struct RollbackAgent {
    target: Arc<dyn TargetDatabase>,
}

impl RollbackAgent {
    #[must_use]
    pub fn new(target: Arc<dyn TargetDatabase>) -> Self {
        Self { target }
    }

    /// Drop the index the pipeline just added. Runs once; a failure is
    /// recorded on the returned record and never retried.
    #[instrument(skip_all, fields(table = %table, index = %index))]
    pub async fn drop_index(
        &self,
        execution_id: ExecutionId,
        table: &Identifier,
        index: &Identifier,
        trigger_reason: FailReason,
    ) -> RollbackRecord {
        let rollback_sql = drop_index_sql(table, index);
        let (status, error_text) = match self.target.execute_ddl(&rollback_sql).await {
            Ok(()) => {
                info!(%execution_id, reason = %trigger_reason, "rollback applied");
                (RollbackStatus::Completed, None)
            }
            Err(err) => {
                warn!(%execution_id, reason = %trigger_reason, error = %err, "rollback ddl failed");
                (RollbackStatus::Failed, Some(err.to_string()))
            }
        };

        RollbackRecord {
            execution_id,
            rollback_type: RollbackType::Auto,
            trigger_reason,
            rollback_sql,
            status,
            error_text,
            recorded_at: now_utc(),
        }
    }
}
