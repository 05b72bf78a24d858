#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use schema_steward_audit_core::AuditSink;
use schema_steward_domain::{
    format_rfc3339, now_utc, parse_rfc3339, AttemptId, AttemptRecord, AttemptStatus, AuditEvent,
    AuditEventRow, AuditEventType, ExecutionId, FailReason, MetricPhase, MetricSnapshot,
    RollbackRecord, RollbackStatus, RollbackType, SnapshotRow,
};
use ulid::Ulid;

const AUDIT_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attempts (
  attempt_id TEXT PRIMARY KEY,
  execution_id TEXT NOT NULL,
  connection_id TEXT NOT NULL,
  agent_id TEXT NOT NULL,
  action TEXT NOT NULL,
  table_name TEXT NOT NULL,
  index_name TEXT NOT NULL,
  columns_json TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('in_progress','completed','failed','rolled_back','claim_lost')),
  fail_reason TEXT,
  message TEXT
);

CREATE TABLE IF NOT EXISTS audit_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  attempt_id TEXT NOT NULL,
  execution_id TEXT NOT NULL,
  event_type TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  actor TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL,
  FOREIGN KEY (attempt_id) REFERENCES attempts(attempt_id)
);

CREATE TABLE IF NOT EXISTS metric_snapshots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  attempt_id TEXT NOT NULL,
  phase TEXT NOT NULL CHECK (phase IN ('baseline','after')),
  fingerprint TEXT NOT NULL,
  execution_count INTEGER NOT NULL,
  avg_latency_ms REAL NOT NULL,
  rows_examined INTEGER NOT NULL,
  full_scan_count INTEGER NOT NULL,
  sample_count INTEGER NOT NULL,
  window_minutes INTEGER,
  captured_at TEXT NOT NULL,
  FOREIGN KEY (attempt_id) REFERENCES attempts(attempt_id)
);

CREATE TABLE IF NOT EXISTS rollbacks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  attempt_id TEXT NOT NULL,
  execution_id TEXT NOT NULL,
  rollback_type TEXT NOT NULL,
  trigger_reason TEXT NOT NULL,
  rollback_sql TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('completed','failed')),
  error_text TEXT,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (attempt_id) REFERENCES attempts(attempt_id)
);

CREATE INDEX IF NOT EXISTS idx_attempts_execution ON attempts(execution_id, started_at);
CREATE INDEX IF NOT EXISTS idx_events_attempt ON audit_events(attempt_id, event_seq);
CREATE INDEX IF NOT EXISTS idx_snapshots_attempt ON metric_snapshots(attempt_id, phase);

CREATE TRIGGER IF NOT EXISTS trg_audit_events_no_update
BEFORE UPDATE ON audit_events
BEGIN
  SELECT RAISE(FAIL, 'audit_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_audit_events_no_delete
BEFORE DELETE ON audit_events
BEGIN
  SELECT RAISE(FAIL, 'audit_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_metric_snapshots_no_update
BEFORE UPDATE ON metric_snapshots
BEGIN
  SELECT RAISE(FAIL, 'metric_snapshots is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_metric_snapshots_no_delete
BEFORE DELETE ON metric_snapshots
BEGIN
  SELECT RAISE(FAIL, 'metric_snapshots is append-only');
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

CREATE TRIGGER IF NOT EXISTS trg_attempts_no_delete
BEFORE DELETE ON attempts
BEGIN
  SELECT RAISE(FAIL, 'attempts are never deleted');
END;
CREATE TRIGGER IF NOT EXISTS trg_attempts_finish_once
BEFORE UPDATE ON attempts
WHEN OLD.status <> 'in_progress'
BEGIN
  SELECT RAISE(FAIL, 'attempt already finished');
END;
";

const ATTEMPT_COLUMNS: &str = "attempt_id, execution_id, connection_id, agent_id, action,
    table_name, index_name, columns_json, started_at, ended_at, status, fail_reason, message";

pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    /// Open or create a `SQLite` audit database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("audit store connection lock poisoned"))
    }
}

impl AuditSink for SqliteAuditStore {
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_V1)
            .context("failed to apply audit schema")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![AUDIT_SCHEMA_VERSION, format_rfc3339(now_utc())?],
        )
        .context("failed to record audit migration")?;
        Ok(())
    }

    fn insert_attempt(&self, attempt: &AttemptRecord) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO attempts(
                    attempt_id, execution_id, connection_id, agent_id, action,
                    table_name, index_name, columns_json, started_at, ended_at,
                    status, fail_reason, message
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    attempt.attempt_id.to_string(),
                    attempt.execution_id,
                    attempt.connection_id,
                    attempt.agent_id,
                    attempt.action,
                    attempt.table_name,
                    attempt.index_name,
                    serde_json::to_string(&attempt.columns)?,
                    format_rfc3339(attempt.started_at)?,
                    attempt.ended_at.map(format_rfc3339).transpose()?,
                    attempt.status.as_str(),
                    attempt.fail_reason.map(FailReason::as_str),
                    attempt.message,
                ],
            )
            .context("failed to insert attempt")?;
        Ok(())
    }

    fn finish_attempt(
        &self,
        attempt_id: AttemptId,
        status: AttemptStatus,
        fail_reason: Option<FailReason>,
        message: Option<&str>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE attempts SET status = ?2, ended_at = ?3, fail_reason = ?4, message = ?5
                 WHERE attempt_id = ?1",
                params![
                    attempt_id.to_string(),
                    status.as_str(),
                    format_rfc3339(now_utc())?,
                    fail_reason.map(FailReason::as_str),
                    message,
                ],
            )
            .context("failed to finish attempt")?;
        Ok(())
    }

    fn append_event(&self, event: &AuditEvent) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_events(
                event_id, attempt_id, execution_id, event_type, occurred_at, recorded_at,
                actor, payload_json, payload_hash, prev_event_hash, event_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.event_id.to_string(),
                event.attempt_id.to_string(),
                event.execution_id,
                event.event_type.as_str(),
                format_rfc3339(event.occurred_at)?,
                format_rfc3339(now_utc())?,
                event.actor,
                serde_json::to_string(&event.payload_json)?,
                event.payload_hash,
                event.prev_event_hash,
                event.event_hash,
            ],
        )
        .context("failed to append audit event")?;
        Ok(conn.last_insert_rowid())
    }

    fn append_metric_snapshots(
        &self,
        attempt_id: AttemptId,
        phase: MetricPhase,
        snapshots: &[MetricSnapshot],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let captured_at = format_rfc3339(now_utc())?;
        for snapshot in snapshots {
            tx.execute(
                "INSERT INTO metric_snapshots(
                    attempt_id, phase, fingerprint, execution_count, avg_latency_ms,
                    rows_examined, full_scan_count, sample_count, window_minutes, captured_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    attempt_id.to_string(),
                    phase.as_str(),
                    snapshot.fingerprint,
                    to_sql_count(snapshot.execution_count)?,
                    snapshot.avg_latency_ms,
                    to_sql_count(snapshot.rows_examined)?,
                    to_sql_count(snapshot.full_scan_count)?,
                    to_sql_count(snapshot.sample_count)?,
                    snapshot.window_minutes,
                    captured_at,
                ],
            )
            .context("failed to append metric snapshot")?;
        }
        tx.commit().context("failed to commit metric snapshots")?;
        Ok(())
    }

    fn append_rollback(&self, attempt_id: AttemptId, record: &RollbackRecord) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO rollbacks(
                    attempt_id, execution_id, rollback_type, trigger_reason,
                    rollback_sql, status, error_text, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    attempt_id.to_string(),
                    record.execution_id.to_string(),
                    record.rollback_type.as_str(),
                    record.trigger_reason.as_str(),
                    record.rollback_sql,
                    record.status.as_str(),
                    record.error_text,
                    format_rfc3339(record.recorded_at)?,
                ],
            )
            .context("failed to append rollback")?;
        Ok(())
    }

    fn list_attempts(&self, limit: usize) -> Result<Vec<AttemptRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts ORDER BY started_at DESC, attempt_id DESC LIMIT ?1"
        ))?;
        let mut rows = stmt.query(params![i64::try_from(limit).unwrap_or(i64::MAX)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(attempt_from_row(row)?);
        }
        Ok(out)
    }

    fn get_attempt(&self, attempt_id: AttemptId) -> Result<Option<AttemptRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE attempt_id = ?1"
        ))?;
        let attempt = stmt
            .query_row(params![attempt_id.to_string()], |row| Ok(attempt_from_row(row)))
            .optional()?;
        attempt.transpose()
    }

    fn list_events_for_attempt(&self, attempt_id: AttemptId) -> Result<Vec<AuditEventRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT
                event_seq, event_id, attempt_id, execution_id, event_type,
                occurred_at, actor, payload_json, payload_hash, prev_event_hash, event_hash
             FROM audit_events
             WHERE attempt_id = ?1
             ORDER BY event_seq ASC",
        )?;

        let mut rows = stmt.query(params![attempt_id.to_string()])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let event_id_raw: String = row.get(1)?;
            let attempt_id_raw: String = row.get(2)?;
            let event_type_raw: String = row.get(4)?;
            let payload_raw: String = row.get(7)?;
            out.push(AuditEventRow {
                event_seq: row.get(0)?,
                event: AuditEvent {
                    event_id: Ulid::from_str(&event_id_raw)
                        .map_err(|err| anyhow!("invalid event_id ULID: {err}"))?,
                    attempt_id: parse_attempt_id(&attempt_id_raw)?,
                    execution_id: row.get(3)?,
                    event_type: AuditEventType::parse(&event_type_raw)
                        .ok_or_else(|| anyhow!("unknown audit event type: {event_type_raw}"))?,
                    occurred_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
                    actor: row.get(6)?,
                    payload_json: serde_json::from_str(&payload_raw)
                        .context("invalid payload_json")?,
                    payload_hash: row.get(8)?,
                    prev_event_hash: row.get(9)?,
                    event_hash: row.get(10)?,
                },
            });
        }

        Ok(out)
    }

    fn list_snapshots(&self, attempt_id: AttemptId) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT phase, fingerprint, execution_count, avg_latency_ms, rows_examined,
                    full_scan_count, sample_count, window_minutes
             FROM metric_snapshots
             WHERE attempt_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![attempt_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let phase_raw: String = row.get(0)?;
            out.push(SnapshotRow {
                attempt_id,
                phase: MetricPhase::parse(&phase_raw)
                    .ok_or_else(|| anyhow!("unknown metric phase: {phase_raw}"))?,
                snapshot: MetricSnapshot {
                    fingerprint: row.get(1)?,
                    execution_count: from_sql_count(row.get(2)?)?,
                    avg_latency_ms: row.get(3)?,
                    rows_examined: from_sql_count(row.get(4)?)?,
                    full_scan_count: from_sql_count(row.get(5)?)?,
                    sample_count: from_sql_count(row.get(6)?)?,
                    window_minutes: row.get(7)?,
                },
            });
        }
        Ok(out)
    }

    fn list_rollbacks(&self, attempt_id: AttemptId) -> Result<Vec<RollbackRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT execution_id, rollback_type, trigger_reason, rollback_sql, status,
                    error_text, recorded_at
             FROM rollbacks
             WHERE attempt_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![attempt_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let execution_id_raw: String = row.get(0)?;
            let rollback_type_raw: String = row.get(1)?;
            let trigger_raw: String = row.get(2)?;
            let status_raw: String = row.get(4)?;
            if rollback_type_raw != RollbackType::Auto.as_str() {
                return Err(anyhow!("unknown rollback type: {rollback_type_raw}"));
            }
            out.push(RollbackRecord {
                execution_id: ExecutionId::parse(&execution_id_raw)?,
                rollback_type: RollbackType::Auto,
                trigger_reason: FailReason::parse(&trigger_raw)
                    .ok_or_else(|| anyhow!("unknown trigger reason: {trigger_raw}"))?,
                rollback_sql: row.get(3)?,
                status: RollbackStatus::parse(&status_raw)
                    .ok_or_else(|| anyhow!("unknown rollback status: {status_raw}"))?,
                error_text: row.get(5)?,
                recorded_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
            });
        }
        Ok(out)
    }
}

fn attempt_from_row(row: &Row<'_>) -> Result<AttemptRecord> {
    let attempt_id_raw: String = row.get(0)?;
    let columns_raw: String = row.get(7)?;
    let ended_raw: Option<String> = row.get(9)?;
    let status_raw: String = row.get(10)?;
    let reason_raw: Option<String> = row.get(11)?;
    Ok(AttemptRecord {
        attempt_id: parse_attempt_id(&attempt_id_raw)?,
        execution_id: row.get(1)?,
        connection_id: row.get(2)?,
        agent_id: row.get(3)?,
        action: row.get(4)?,
        table_name: row.get(5)?,
        index_name: row.get(6)?,
        columns: serde_json::from_str(&columns_raw).context("invalid columns_json")?,
        started_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
        ended_at: ended_raw.as_deref().map(parse_rfc3339).transpose()?,
        status: AttemptStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown attempt status: {status_raw}"))?,
        fail_reason: reason_raw
            .map(|raw| FailReason::parse(&raw).ok_or_else(|| anyhow!("unknown fail reason: {raw}")))
            .transpose()?,
        message: row.get(12)?,
    })
}

fn parse_attempt_id(value: &str) -> Result<AttemptId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid attempt_id ULID: {err}"))?;
    Ok(AttemptId(ulid))
}

fn to_sql_count(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("counter too large for sqlite: {value}"))
}

fn from_sql_count(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("negative counter in sqlite: {value}"))
}

/// Newest attempt recorded for an execution id, if any.
///
/// # Errors
/// Returns an error when the attempt table cannot be read.
pub fn latest_attempt_for_execution(
    store: &SqliteAuditStore,
    execution_id: &str,
) -> Result<Option<AttemptRecord>> {
    let conn = store.conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE execution_id = ?1
         ORDER BY started_at DESC, attempt_id DESC LIMIT 1"
    ))?;
    let attempt = stmt
        .query_row(params![execution_id], |row| Ok(attempt_from_row(row)))
        .optional()?;
    attempt.transpose()
}
