#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use schema_steward_domain::{
    format_rfc3339, now_utc, parse_rfc3339, ClaimOutcome, ExecutionId, ExecutionRequest,
    ExecutionStatus, FailReason, KillSwitchState, KillSwitchUpdate, NewExecution, RollbackRecord,
    StatusHistoryEntry, StatusUpdate, VerificationMetricsSubmission,
};

mod local;
pub mod service;

pub use local::LocalControlPlane;

const COORDINATOR_SCHEMA_VERSION: i64 = 1;

/// Reserved kill-switch scope for the process-wide switch.
pub const GLOBAL_SCOPE: &str = "*";

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS executions (
  id TEXT PRIMARY KEY,
  connection_id TEXT NOT NULL,
  action TEXT NOT NULL,
  table_name TEXT NOT NULL,
  index_name TEXT NOT NULL,
  columns_json TEXT NOT NULL,
  query_fingerprints_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('scheduled','pending','running','completed','failed','rolled_back')),
  fail_reason TEXT,
  message TEXT,
  created_at TEXT NOT NULL,
  started_at TEXT,
  completed_at TEXT
);

CREATE TABLE IF NOT EXISTS execution_status_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  execution_id TEXT NOT NULL,
  from_status TEXT,
  to_status TEXT NOT NULL,
  fail_reason TEXT,
  message TEXT,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (execution_id) REFERENCES executions(id)
);

CREATE TABLE IF NOT EXISTS kill_switches (
  scope TEXT PRIMARY KEY,
  active INTEGER NOT NULL CHECK (active IN (0,1)),
  reason TEXT,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS verification_metrics (
  execution_id TEXT PRIMARY KEY,
  before_json TEXT NOT NULL,
  after_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (execution_id) REFERENCES executions(id)
);

CREATE TABLE IF NOT EXISTS rollbacks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  execution_id TEXT NOT NULL,
  rollback_type TEXT NOT NULL,
  trigger_reason TEXT NOT NULL,
  rollback_sql TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('completed','failed')),
  error_text TEXT,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (execution_id) REFERENCES executions(id)
);

CREATE INDEX IF NOT EXISTS idx_executions_claimable ON executions(status, created_at, id);
CREATE INDEX IF NOT EXISTS idx_history_execution ON execution_status_history(execution_id, id);

CREATE TRIGGER IF NOT EXISTS trg_executions_no_delete
BEFORE DELETE ON executions
BEGIN
  SELECT RAISE(FAIL, 'executions are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS trg_history_no_update
BEFORE UPDATE ON execution_status_history
BEGIN
  SELECT RAISE(FAIL, 'execution_status_history is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_history_no_delete
BEFORE DELETE ON execution_status_history
BEGIN
  SELECT RAISE(FAIL, 'execution_status_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_rollbacks_no_update
BEFORE UPDATE ON rollbacks
BEGIN
  SELECT RAISE(FAIL, 'rollbacks is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_rollbacks_no_delete
BEFORE DELETE ON rollbacks
BEGIN
  SELECT RAISE(FAIL, 'rollbacks is append-only');
END;
";

const EXECUTION_COLUMNS: &str = "id, connection_id, action, table_name, index_name, columns_json,
    query_fingerprints_json, status, fail_reason, message, created_at, started_at, completed_at";

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("execution not found: {0}")]
    NotFound(String),
    #[error("invalid status transition for {execution_id}: {from} -> {to}")]
    InvalidTransition {
        execution_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    #[error("validation failed: {0}")]
    Invalid(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Relational source of truth for execution ownership.
///
/// Every operation opens its own connection, so clones are cheap and can be
/// moved onto blocking threads.
#[derive(Debug, Clone)]
pub struct ClaimCoordinator {
    db_path: PathBuf,
}

impl ClaimCoordinator {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> CoordinatorResult<Connection> {
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!(
                "failed to open sqlite database at {}",
                self.db_path.display()
            )
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        Ok(conn)
    }

    /// # Errors
    /// Returns an error when the schema cannot be applied.
    pub fn migrate(&self) -> CoordinatorResult<()> {
        let conn = self.connect()?;
        conn.execute_batch(SCHEMA_V1)
            .context("failed to apply coordinator schema")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![COORDINATOR_SCHEMA_VERSION, format_rfc3339(now_utc())?],
        )
        .context("failed to record coordinator migration")?;
        Ok(())
    }

    /// Register an approved change in `scheduled`.
    ///
    /// Identifier safety is enforced by the agent; here only presence is checked.
    ///
    /// # Errors
    /// Returns [`CoordinatorError::Invalid`] for empty fields or an empty column list.
    pub fn create_execution(&self, new: &NewExecution) -> CoordinatorResult<ExecutionRequest> {
        for (field, value) in [
            ("connectionId", new.connection_id.as_str()),
            ("action", new.action.as_str()),
            ("tableName", new.table_name.as_str()),
            ("indexName", new.index_name.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(CoordinatorError::Invalid(format!("{field} MUST be non-empty")));
            }
        }
        if new.columns.is_empty() {
            return Err(CoordinatorError::Invalid(
                "columns MUST be non-empty".to_string(),
            ));
        }

        let id = ExecutionId::new().to_string();
        let created_at = now_utc();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO executions(
                id, connection_id, action, table_name, index_name, columns_json,
                query_fingerprints_json, status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'scheduled', ?8)",
            params![
                id,
                new.connection_id,
                new.action,
                new.table_name,
                new.index_name,
                serde_json::to_string(&new.columns).map_err(anyhow::Error::from)?,
                serde_json::to_string(&new.query_fingerprints).map_err(anyhow::Error::from)?,
                format_rfc3339(created_at)?,
            ],
        )
        .context("failed to insert execution")?;
        insert_history(&tx, &id, None, ExecutionStatus::Scheduled, None, None)?;
        let record = select_execution(&tx, &id)?
            .ok_or_else(|| CoordinatorError::NotFound(id.clone()))?;
        tx.commit()?;
        Ok(record)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn get_execution(
        &self,
        execution_id: ExecutionId,
    ) -> CoordinatorResult<Option<ExecutionRequest>> {
        let conn = self.connect()?;
        select_execution(&conn, &execution_id.to_string())
    }

    /// Claimable executions, oldest first.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_pending(
        &self,
        limit: usize,
        connection_ids: &[String],
    ) -> CoordinatorResult<Vec<ExecutionRequest>> {
        let conn = self.connect()?;
        let mut sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE status IN ('scheduled','pending')"
        );
        if !connection_ids.is_empty() {
            let placeholders = vec!["?"; connection_ids.len()].join(", ");
            sql.push_str(&format!(" AND connection_id IN ({placeholders})"));
        }
        sql.push_str(&format!(
            " ORDER BY created_at ASC, id ASC LIMIT {}",
            i64::try_from(limit).unwrap_or(i64::MAX)
        ));

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(connection_ids.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(execution_from_row(row)?);
        }
        Ok(out)
    }

    /// Atomically move one execution from `scheduled`/`pending` to `running`.
    ///
    /// The conditional `UPDATE` is the only ownership primitive: when it
    /// touches no row the caller gets [`ClaimOutcome::Conflict`].
    ///
    /// # Errors
    /// Returns an error only for storage failures; losing the race is not an error.
    pub fn claim(&self, execution_id: ExecutionId) -> CoordinatorResult<ClaimOutcome> {
        let id = execution_id.to_string();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = select_status(&tx, &id)?;
        let claimed = tx
            .query_row(
                &format!(
                    "UPDATE executions SET status = 'running', started_at = ?2
                     WHERE id = ?1 AND status IN ('scheduled','pending')
                     RETURNING {EXECUTION_COLUMNS}"
                ),
                params![id, format_rfc3339(now_utc())?],
                |row| Ok(execution_from_row(row)),
            )
            .optional()?
            .transpose()?;

        let outcome = match claimed {
            Some(record) => {
                insert_history(
                    &tx,
                    &id,
                    previous,
                    ExecutionStatus::Running,
                    None,
                    Some("claimed"),
                )?;
                ClaimOutcome::Claimed(Some(record))
            }
            None => ClaimOutcome::Conflict {
                reason: match previous {
                    Some(status) => format!("execution {id} is {status}, not claimable"),
                    None => format!("execution {id} does not exist"),
                },
            },
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Apply a status report, enforcing forward-only transitions.
    ///
    /// Repeating the current terminal status is accepted and changes nothing.
    ///
    /// # Errors
    /// Returns [`CoordinatorError::NotFound`] or [`CoordinatorError::InvalidTransition`].
    pub fn update_status(
        &self,
        execution_id: ExecutionId,
        update: &StatusUpdate,
    ) -> CoordinatorResult<ExecutionRequest> {
        let id = execution_id.to_string();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current =
            select_status(&tx, &id)?.ok_or_else(|| CoordinatorError::NotFound(id.clone()))?;
        if !current.permits_update_to(update.status) {
            return Err(CoordinatorError::InvalidTransition {
                execution_id: id,
                from: current,
                to: update.status,
            });
        }

        if !(current.is_terminal() && current == update.status) {
            let completed_at = if update.status.is_terminal() {
                Some(format_rfc3339(now_utc())?)
            } else {
                None
            };
            tx.execute(
                "UPDATE executions SET
                    status = ?2,
                    fail_reason = COALESCE(?3, fail_reason),
                    message = COALESCE(?4, message),
                    completed_at = COALESCE(?5, completed_at)
                 WHERE id = ?1",
                params![
                    id,
                    update.status.as_str(),
                    update.fail_reason.map(FailReason::as_str),
                    update.message,
                    completed_at,
                ],
            )
            .context("failed to update execution status")?;
            insert_history(
                &tx,
                &id,
                Some(current),
                update.status,
                update.fail_reason,
                update.message.as_deref(),
            )?;
        }

        let record =
            select_execution(&tx, &id)?.ok_or_else(|| CoordinatorError::NotFound(id.clone()))?;
        tx.commit()?;
        Ok(record)
    }

    /// # Errors
    /// Returns [`CoordinatorError::NotFound`] for unknown executions.
    pub fn status_history(
        &self,
        execution_id: ExecutionId,
    ) -> CoordinatorResult<Vec<StatusHistoryEntry>> {
        let id = execution_id.to_string();
        let conn = self.connect()?;
        if select_status(&conn, &id)?.is_none() {
            return Err(CoordinatorError::NotFound(id));
        }
        let mut stmt = conn.prepare(
            "SELECT from_status, to_status, fail_reason, message, recorded_at
             FROM execution_status_history
             WHERE execution_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let from_raw: Option<String> = row.get(0)?;
            let to_raw: String = row.get(1)?;
            let reason_raw: Option<String> = row.get(2)?;
            out.push(StatusHistoryEntry {
                execution_id,
                from_status: from_raw.as_deref().map(parse_status).transpose()?,
                to_status: parse_status(&to_raw)?,
                fail_reason: reason_raw.as_deref().map(parse_fail_reason).transpose()?,
                message: row.get(3)?,
                recorded_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
            });
        }
        Ok(out)
    }

    /// Current switch state for one connection (or only the global switch).
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn kill_switch(&self, connection_id: Option<&str>) -> CoordinatorResult<KillSwitchState> {
        let conn = self.connect()?;
        let (global_active, global_reason) = select_switch(&conn, GLOBAL_SCOPE)?;
        let (connection_active, connection_reason) = match connection_id {
            Some(scope) if !scope.is_empty() && scope != GLOBAL_SCOPE => {
                select_switch(&conn, scope)?
            }
            _ => (false, None),
        };
        let reason = if connection_active {
            connection_reason.or(global_reason)
        } else if global_active {
            global_reason
        } else {
            None
        };
        Ok(KillSwitchState {
            global_active,
            connection_active,
            reason,
        })
    }

    /// # Errors
    /// Returns an error when the store cannot be written.
    pub fn set_kill_switch(&self, update: &KillSwitchUpdate) -> CoordinatorResult<KillSwitchState> {
        let scope = match update.connection_id.as_deref() {
            Some(scope) if scope.trim().is_empty() => {
                return Err(CoordinatorError::Invalid(
                    "connectionId MUST be non-empty when present".to_string(),
                ))
            }
            Some(scope) => scope.to_string(),
            None => GLOBAL_SCOPE.to_string(),
        };
        {
            let conn = self.connect()?;
            conn.execute(
                "INSERT INTO kill_switches(scope, active, reason, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(scope) DO UPDATE SET
                    active = excluded.active,
                    reason = excluded.reason,
                    updated_at = excluded.updated_at",
                params![
                    scope,
                    i64::from(update.active),
                    update.reason,
                    format_rfc3339(now_utc())?,
                ],
            )
            .context("failed to update kill switch")?;
        }
        self.kill_switch(update.connection_id.as_deref())
    }

    /// Store the before/after metrics of one execution. Later submissions for
    /// the same execution are ignored; returns whether this one was stored.
    ///
    /// # Errors
    /// Returns [`CoordinatorError::NotFound`] for unknown executions.
    pub fn record_verification_metrics(
        &self,
        submission: &VerificationMetricsSubmission,
    ) -> CoordinatorResult<bool> {
        let id = submission.execution_id.to_string();
        let conn = self.connect()?;
        if select_status(&conn, &id)?.is_none() {
            return Err(CoordinatorError::NotFound(id));
        }
        let inserted = conn
            .execute(
                "INSERT INTO verification_metrics(execution_id, before_json, after_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(execution_id) DO NOTHING",
                params![
                    id,
                    serde_json::to_string(&submission.before_metrics)
                        .map_err(anyhow::Error::from)?,
                    serde_json::to_string(&submission.after_metrics)
                        .map_err(anyhow::Error::from)?,
                    format_rfc3339(now_utc())?,
                ],
            )
            .context("failed to store verification metrics")?;
        Ok(inserted > 0)
    }

    /// # Errors
    /// Returns [`CoordinatorError::NotFound`] for unknown executions.
    pub fn record_rollback(&self, record: &RollbackRecord) -> CoordinatorResult<()> {
        let id = record.execution_id.to_string();
        let conn = self.connect()?;
        if select_status(&conn, &id)?.is_none() {
            return Err(CoordinatorError::NotFound(id));
        }
        conn.execute(
            "INSERT INTO rollbacks(
                execution_id, rollback_type, trigger_reason, rollback_sql,
                status, error_text, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                record.rollback_type.as_str(),
                record.trigger_reason.as_str(),
                record.rollback_sql,
                record.status.as_str(),
                record.error_text,
                format_rfc3339(record.recorded_at)?,
            ],
        )
        .context("failed to store rollback")?;
        Ok(())
    }
}

fn select_execution(conn: &Connection, id: &str) -> CoordinatorResult<Option<ExecutionRequest>> {
    let record = conn
        .query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
            params![id],
            |row| Ok(execution_from_row(row)),
        )
        .optional()?
        .transpose()?;
    Ok(record)
}

fn select_status(conn: &Connection, id: &str) -> CoordinatorResult<Option<ExecutionStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM executions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.as_deref().map(parse_status).transpose()?)
}

fn select_switch(conn: &Connection, scope: &str) -> CoordinatorResult<(bool, Option<String>)> {
    let row: Option<(i64, Option<String>)> = conn
        .query_row(
            "SELECT active, reason FROM kill_switches WHERE scope = ?1",
            params![scope],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(match row {
        Some((active, reason)) => (active != 0, reason),
        None => (false, None),
    })
}

fn insert_history(
    conn: &Connection,
    execution_id: &str,
    from: Option<ExecutionStatus>,
    to: ExecutionStatus,
    fail_reason: Option<FailReason>,
    message: Option<&str>,
) -> CoordinatorResult<()> {
    conn.execute(
        "INSERT INTO execution_status_history(
            execution_id, from_status, to_status, fail_reason, message, recorded_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            execution_id,
            from.map(ExecutionStatus::as_str),
            to.as_str(),
            fail_reason.map(FailReason::as_str),
            message,
            format_rfc3339(now_utc())?,
        ],
    )
    .context("failed to append status history")?;
    Ok(())
}

fn execution_from_row(row: &Row<'_>) -> anyhow::Result<ExecutionRequest> {
    let columns_raw: String = row.get(5)?;
    let fingerprints_raw: String = row.get(6)?;
    let status_raw: String = row.get(7)?;
    let reason_raw: Option<String> = row.get(8)?;
    let started_raw: Option<String> = row.get(11)?;
    let completed_raw: Option<String> = row.get(12)?;
    Ok(ExecutionRequest {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        action: row.get(2)?,
        table_name: row.get(3)?,
        index_name: row.get(4)?,
        columns: serde_json::from_str(&columns_raw).context("invalid columns_json")?,
        query_fingerprints: serde_json::from_str(&fingerprints_raw)
            .context("invalid query_fingerprints_json")?,
        status: parse_status(&status_raw)?,
        fail_reason: reason_raw.as_deref().map(parse_fail_reason).transpose()?,
        message: row.get(9)?,
        created_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
        started_at: started_raw.as_deref().map(parse_rfc3339).transpose()?,
        completed_at: completed_raw.as_deref().map(parse_rfc3339).transpose()?,
    })
}

fn parse_status(value: &str) -> anyhow::Result<ExecutionStatus> {
    ExecutionStatus::parse(value).ok_or_else(|| anyhow!("unknown execution status: {value}"))
}

fn parse_fail_reason(value: &str) -> anyhow::Result<FailReason> {
    FailReason::parse(value).ok_or_else(|| anyhow!("unknown fail reason: {value}"))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use schema_steward_domain::{
        ClaimOutcome, ExecutionId, ExecutionStatus, FailReason, KillSwitchUpdate, MetricSnapshot,
        NewExecution, RollbackRecord, RollbackStatus, RollbackType, StatusUpdate,
        VerificationMetricsSubmission,
    };
    use ulid::Ulid;

    use super::{ClaimCoordinator, CoordinatorError};

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "steward-coordinator-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn coordinator(name: &str) -> ClaimCoordinator {
        let coordinator = ClaimCoordinator::new(temp_db_path(name));
        assert!(coordinator.migrate().is_ok());
        coordinator
    }

    fn fixture_new(connection_id: &str) -> NewExecution {
        NewExecution {
            connection_id: connection_id.to_string(),
            action: "ADD_INDEX".to_string(),
            table_name: "orders".to_string(),
            index_name: "idx_orders_customer_id".to_string(),
            columns: vec!["customer_id".to_string()],
            query_fingerprints: vec!["digest-a".to_string()],
        }
    }

    fn create(coordinator: &ClaimCoordinator, connection_id: &str) -> ExecutionId {
        let record = coordinator
            .create_execution(&fixture_new(connection_id))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(record.status, ExecutionStatus::Scheduled);
        ExecutionId::parse(&record.id).unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn migrate_is_idempotent() {
        let coordinator = coordinator("migrate");
        assert!(coordinator.migrate().is_ok());
    }

    #[test]
    fn create_rejects_empty_columns() {
        let coordinator = coordinator("create-invalid");
        let mut new = fixture_new("conn-a");
        new.columns.clear();
        assert!(matches!(
            coordinator.create_execution(&new),
            Err(CoordinatorError::Invalid(_))
        ));
    }

    #[test]
    fn second_claim_conflicts() {
        let coordinator = coordinator("claim-twice");
        let id = create(&coordinator, "conn-a");

        let first = coordinator.claim(id).unwrap_or_else(|_| unreachable!());
        match first {
            ClaimOutcome::Claimed(record) => {
                let record = record.unwrap_or_else(|| unreachable!());
                assert_eq!(record.status, ExecutionStatus::Running);
                assert!(record.started_at.is_some());
            }
            ClaimOutcome::Conflict { reason } => panic!("first claim lost: {reason}"),
        }
        let second = coordinator.claim(id).unwrap_or_else(|_| unreachable!());
        assert!(matches!(second, ClaimOutcome::Conflict { reason } if reason.contains("running")));
    }

    #[test]
    fn claim_of_unknown_execution_conflicts() {
        let coordinator = coordinator("claim-unknown");
        let outcome = coordinator
            .claim(ExecutionId::new())
            .unwrap_or_else(|_| unreachable!());
        assert!(
            matches!(
                outcome,
                ClaimOutcome::Conflict { reason } if reason.contains("does not exist")
            )
        );
    }

    #[test]
    fn concurrent_claims_have_exactly_one_winner() {
        let coordinator = coordinator("claim-race");
        let id = create(&coordinator, "conn-a");
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let coordinator = ClaimCoordinator::new(coordinator.db_path());
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    coordinator.claim(id)
                })
            })
            .collect();

        let mut winners = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.join().unwrap_or_else(|_| unreachable!()) {
                Ok(ClaimOutcome::Claimed(_)) => winners += 1,
                Ok(ClaimOutcome::Conflict { .. }) => conflicts += 1,
                Err(err) => panic!("claim errored: {err}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(conflicts, contenders - 1);
    }

    #[test]
    fn pending_is_fifo_and_filtered_by_connection() {
        let coordinator = coordinator("pending");
        let first = create(&coordinator, "conn-a");
        let _other = create(&coordinator, "conn-b");
        let third = create(&coordinator, "conn-a");

        let pending = coordinator
            .list_pending(10, &["conn-a".to_string()])
            .unwrap_or_else(|_| unreachable!());
        let ids: Vec<String> = pending.iter().map(|record| record.id.clone()).collect();
        assert_eq!(ids, vec![first.to_string(), third.to_string()]);

        assert!(coordinator.claim(first).is_ok());
        let all = coordinator
            .list_pending(10, &[])
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(all.len(), 2);
        let limited = coordinator
            .list_pending(1, &[])
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn status_updates_only_move_forward_and_repeat_idempotently() {
        let coordinator = coordinator("transitions");
        let id = create(&coordinator, "conn-a");

        let premature =
            coordinator.update_status(id, &StatusUpdate::new(ExecutionStatus::Completed));
        assert!(matches!(
            premature,
            Err(CoordinatorError::InvalidTransition { .. })
        ));

        assert!(coordinator.claim(id).is_ok());
        let update = StatusUpdate::new(ExecutionStatus::RolledBack)
            .with_reason(FailReason::KillSwitch)
            .with_message("kill switch activated after ddl");
        let record = coordinator
            .update_status(id, &update)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(record.status, ExecutionStatus::RolledBack);
        assert_eq!(record.fail_reason, Some(FailReason::KillSwitch));
        assert!(record.completed_at.is_some());

        assert!(coordinator.update_status(id, &update).is_ok());
        assert!(matches!(
            coordinator.update_status(id, &StatusUpdate::new(ExecutionStatus::Completed)),
            Err(CoordinatorError::InvalidTransition { .. })
        ));

        let history = coordinator
            .status_history(id)
            .unwrap_or_else(|_| unreachable!());
        let transitions: Vec<ExecutionStatus> =
            history.iter().map(|entry| entry.to_status).collect();
        assert_eq!(
            transitions,
            vec![
                ExecutionStatus::Scheduled,
                ExecutionStatus::Running,
                ExecutionStatus::RolledBack
            ]
        );
    }

    #[test]
    fn unclaimed_execution_may_be_rejected_as_failed() {
        let coordinator = coordinator("pre-claim-fail");
        let id = create(&coordinator, "conn-a");
        let update = StatusUpdate::new(ExecutionStatus::Failed)
            .with_reason(FailReason::OutOfScope)
            .with_message("action DROP_TABLE is not supported");
        let record = coordinator
            .update_status(id, &update)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(matches!(
            coordinator.claim(id),
            Ok(ClaimOutcome::Conflict { .. })
        ));
    }

    #[test]
    fn unknown_execution_status_update_is_not_found() {
        let coordinator = coordinator("not-found");
        assert!(matches!(
            coordinator.update_status(
                ExecutionId::new(),
                &StatusUpdate::new(ExecutionStatus::Failed)
            ),
            Err(CoordinatorError::NotFound(_))
        ));
    }

    #[test]
    fn kill_switch_scopes_combine() {
        let coordinator = coordinator("kill-switch");
        let state = coordinator
            .kill_switch(Some("conn-a"))
            .unwrap_or_else(|_| unreachable!());
        assert!(!state.is_blocked());

        let state = coordinator
            .set_kill_switch(&KillSwitchUpdate {
                connection_id: Some("conn-a".to_string()),
                active: true,
                reason: Some("replica lag".to_string()),
            })
            .unwrap_or_else(|_| unreachable!());
        assert!(state.connection_active && !state.global_active);
        assert_eq!(state.reason.as_deref(), Some("replica lag"));

        let other = coordinator
            .kill_switch(Some("conn-b"))
            .unwrap_or_else(|_| unreachable!());
        assert!(!other.is_blocked());

        assert!(coordinator
            .set_kill_switch(&KillSwitchUpdate {
                connection_id: None,
                active: true,
                reason: Some("freeze".to_string()),
            })
            .is_ok());
        let other = coordinator
            .kill_switch(Some("conn-b"))
            .unwrap_or_else(|_| unreachable!());
        assert!(other.global_active && !other.connection_active);
        assert_eq!(other.reason.as_deref(), Some("freeze"));
    }

    #[test]
    fn metrics_are_stored_once_and_rollbacks_append() {
        let coordinator = coordinator("metrics");
        let id = create(&coordinator, "conn-a");
        let snapshot = MetricSnapshot {
            fingerprint: "digest-a".to_string(),
            execution_count: 20,
            avg_latency_ms: 3.0,
            rows_examined: 200,
            full_scan_count: 0,
            sample_count: 20,
            window_minutes: None,
        };
        let submission = VerificationMetricsSubmission {
            execution_id: id,
            before_metrics: vec![snapshot.clone()],
            after_metrics: vec![snapshot],
        };
        assert!(matches!(
            coordinator.record_verification_metrics(&submission),
            Ok(true)
        ));
        assert!(matches!(
            coordinator.record_verification_metrics(&submission),
            Ok(false)
        ));

        let rollback = RollbackRecord {
            execution_id: id,
            rollback_type: RollbackType::Auto,
            trigger_reason: FailReason::VerificationFailed,
            rollback_sql: "ALTER TABLE `orders` DROP INDEX `idx_orders_customer_id`".to_string(),
            status: RollbackStatus::Completed,
            error_text: None,
            recorded_at: time::OffsetDateTime::now_utc(),
        };
        assert!(coordinator.record_rollback(&rollback).is_ok());

        let mut orphan = rollback;
        orphan.execution_id = ExecutionId::new();
        assert!(matches!(
            coordinator.record_rollback(&orphan),
            Err(CoordinatorError::NotFound(_))
        ));
    }
}
