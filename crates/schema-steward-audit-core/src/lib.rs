#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use schema_steward_domain::{
    format_rfc3339, hash_json, now_utc, AttemptId, AttemptRecord, AttemptStatus, AuditEvent,
    AuditEventRow, AuditEventType, FailReason, MetricPhase, MetricSnapshot, RollbackRecord,
    SnapshotRow,
};
use serde::Serialize;
use serde_json::{json, Value};
use ulid::Ulid;

/// Local append-only record of every pipeline attempt.
pub trait AuditSink: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_attempt(&self, attempt: &AttemptRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn finish_attempt(
        &self,
        attempt_id: AttemptId,
        status: AttemptStatus,
        fail_reason: Option<FailReason>,
        message: Option<&str>,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &AuditEvent) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn append_metric_snapshots(
        &self,
        attempt_id: AttemptId,
        phase: MetricPhase,
        snapshots: &[MetricSnapshot],
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_rollback(&self, attempt_id: AttemptId, record: &RollbackRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_attempts(&self, limit: usize) -> Result<Vec<AttemptRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_attempt(&self, attempt_id: AttemptId) -> Result<Option<AttemptRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events_for_attempt(&self, attempt_id: AttemptId) -> Result<Vec<AuditEventRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_snapshots(&self, attempt_id: AttemptId) -> Result<Vec<SnapshotRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_rollbacks(&self, attempt_id: AttemptId) -> Result<Vec<RollbackRecord>>;
}

/// Fields covered by `event_hash`. The payload is covered through its own hash.
///
/// # Errors
/// Returns an error if the timestamp cannot be formatted.
pub fn event_hash_material(event: &AuditEvent) -> Result<Value> {
    Ok(json!({
        "event_id": event.event_id,
        "attempt_id": event.attempt_id,
        "execution_id": event.execution_id,
        "event_type": event.event_type,
        "occurred_at": format_rfc3339(event.occurred_at)?,
        "actor": event.actor,
        "payload_hash": event.payload_hash,
        "prev_event_hash": event.prev_event_hash,
    }))
}

/// Hash-linked event writer for one attempt.
pub struct AuditChain {
    sink: Arc<dyn AuditSink>,
    attempt_id: AttemptId,
    execution_id: String,
    actor: String,
    prev_event_hash: Option<String>,
}

impl AuditChain {
    #[must_use]
    pub fn new(
        sink: Arc<dyn AuditSink>,
        attempt_id: AttemptId,
        execution_id: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            attempt_id,
            execution_id: execution_id.into(),
            actor: actor.into(),
            prev_event_hash: None,
        }
    }

    #[must_use]
    pub fn attempt_id(&self) -> AttemptId {
        self.attempt_id
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    /// Append one event linked to the previous one in this attempt.
    ///
    /// # Errors
    /// Returns an error when hashing or the sink write fails; the chain head
    /// only advances on success.
    pub fn emit(
        &mut self,
        event_type: AuditEventType,
        payload: impl Serialize,
    ) -> Result<AuditEventRow> {
        let payload_json = serde_json::to_value(payload)?;
        let payload_hash = hash_json(&payload_json)?;
        let mut event = AuditEvent {
            event_id: Ulid::new(),
            attempt_id: self.attempt_id,
            execution_id: self.execution_id.clone(),
            event_type,
            occurred_at: now_utc(),
            actor: self.actor.clone(),
            payload_json,
            payload_hash,
            prev_event_hash: self.prev_event_hash.clone(),
            event_hash: String::new(),
        };
        event.event_hash = hash_json(&event_hash_material(&event)?)?;

        let event_seq = self.sink.append_event(&event)?;
        self.prev_event_hash = Some(event.event_hash.clone());
        Ok(AuditEventRow { event_seq, event })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChainReport {
    pub attempt_id: AttemptId,
    pub events: usize,
    pub chain_valid: bool,
    pub first_invalid_seq: Option<i64>,
}

/// Recompute every payload and event hash and check each link.
///
/// # Errors
/// Returns an error only when hashing itself fails.
pub fn verify_chain(attempt_id: AttemptId, rows: &[AuditEventRow]) -> Result<ChainReport> {
    let mut prev: Option<String> = None;
    for row in rows {
        let event = &row.event;
        let linked = event.prev_event_hash == prev;
        let payload_ok = hash_json(&event.payload_json)? == event.payload_hash;
        let event_ok = hash_json(&event_hash_material(event)?)? == event.event_hash;
        if !(linked && payload_ok && event_ok) {
            return Ok(ChainReport {
                attempt_id,
                events: rows.len(),
                chain_valid: false,
                first_invalid_seq: Some(row.event_seq),
            });
        }
        prev = Some(event.event_hash.clone());
    }

    Ok(ChainReport {
        attempt_id,
        events: rows.len(),
        chain_valid: true,
        first_invalid_seq: None,
    })
}
