use std::time::Duration;

use async_trait::async_trait;
use schema_steward_domain::{Identifier, MetricSnapshot};
use sqlx::{Connection, MySqlConnection, Row};
use tracing::debug;

use crate::{TargetDatabase, TargetError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const PICOSECONDS_PER_MILLISECOND: f64 = 1_000_000_000.0;

/// One `performance_schema` digest summary, summed across schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestRow {
    pub digest: String,
    pub exec_count: u64,
    pub timer_wait_ps: u64,
    pub rows_examined: u64,
    pub full_scans: u64,
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn snapshot_from_digest(row: DigestRow) -> MetricSnapshot {
    let avg_latency_ms = if row.exec_count == 0 {
        0.0
    } else {
        row.timer_wait_ps as f64 / row.exec_count as f64 / PICOSECONDS_PER_MILLISECOND
    };
    MetricSnapshot {
        fingerprint: row.digest,
        execution_count: row.exec_count,
        avg_latency_ms,
        rows_examined: row.rows_examined,
        full_scan_count: row.full_scans,
        sample_count: row.exec_count,
        window_minutes: None,
    }
}

fn digest_query(fingerprint_count: usize) -> String {
    let placeholders = vec!["?"; fingerprint_count].join(", ");
    format!(
        "SELECT DIGEST AS digest,
                CAST(SUM(COUNT_STAR) AS UNSIGNED) AS exec_count,
                CAST(SUM(SUM_TIMER_WAIT) AS UNSIGNED) AS timer_wait_ps,
                CAST(SUM(SUM_ROWS_EXAMINED) AS UNSIGNED) AS rows_examined,
                CAST(SUM(SUM_NO_INDEX_USED) AS UNSIGNED) AS full_scans
         FROM performance_schema.events_statements_summary_by_digest
         WHERE DIGEST IN ({placeholders})
         GROUP BY DIGEST
         ORDER BY DIGEST"
    )
}

/// A MySQL-compatible target reached through a DSN.
///
/// No pool: every call opens its own connection and closes it before returning.
#[derive(Clone)]
pub struct MySqlTarget {
    dsn: String,
    connect_timeout: Duration,
}

impl std::fmt::Debug for MySqlTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlTarget")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl MySqlTarget {
    #[must_use]
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<MySqlConnection, TargetError> {
        match tokio::time::timeout(self.connect_timeout, MySqlConnection::connect(&self.dsn)).await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => Err(TargetError::Connect(err.to_string())),
            Err(_) => Err(TargetError::Connect(format!(
                "timed out after {} ms",
                self.connect_timeout.as_millis()
            ))),
        }
    }

    async fn release(conn: MySqlConnection) {
        if let Err(err) = conn.close().await {
            debug!(error = %err, "target connection did not close cleanly");
        }
    }
}

#[async_trait]
impl TargetDatabase for MySqlTarget {
    async fn execute_ddl(&self, sql: &str) -> Result<(), TargetError> {
        let mut conn = self.connect().await?;
        let result = sqlx::Executor::execute(&mut conn, sqlx::raw_sql(sql)).await;
        Self::release(conn).await;
        result
            .map(|_| ())
            .map_err(|err| TargetError::Statement(err.to_string()))
    }

    async fn digest_stats(
        &self,
        fingerprints: &[String],
    ) -> Result<Vec<MetricSnapshot>, TargetError> {
        if fingerprints.is_empty() {
            return Ok(Vec::new());
        }
        let sql = digest_query(fingerprints.len());
        let mut conn = self.connect().await?;
        let mut query = sqlx::query(&sql);
        for fingerprint in fingerprints {
            query = query.bind(fingerprint.as_str());
        }
        let result = query.fetch_all(&mut conn).await;
        Self::release(conn).await;

        let rows = result.map_err(|err| TargetError::Statement(err.to_string()))?;
        rows.iter()
            .map(|row| {
                Ok(snapshot_from_digest(DigestRow {
                    digest: row.try_get("digest")?,
                    exec_count: row.try_get("exec_count")?,
                    timer_wait_ps: row.try_get("timer_wait_ps")?,
                    rows_examined: row.try_get("rows_examined")?,
                    full_scans: row.try_get("full_scans")?,
                }))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|err| TargetError::Statement(err.to_string()))
    }

    async fn index_exists(
        &self,
        table: &Identifier,
        index: &Identifier,
    ) -> Result<bool, TargetError> {
        let mut conn = self.connect().await?;
        let result: Result<i64, sqlx::Error> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.STATISTICS
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND INDEX_NAME = ?",
        )
        .bind(table.as_str())
        .bind(index.as_str())
        .fetch_one(&mut conn)
        .await;
        Self::release(conn).await;
        result
            .map(|count| count > 0)
            .map_err(|err| TargetError::Statement(err.to_string()))
    }
}
