#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;
use uuid::Uuid;

pub type DateTimeUtc = OffsetDateTime;

/// Longest identifier the target database accepts for tables, columns and indexes.
pub const MAX_IDENTIFIER_LEN: usize = 64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StewardError {
    #[error("out of scope: {0}")]
    OutOfScope(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("claim failed: {0}")]
    ClaimFailed(String),
    #[error("kill switch active: {0}")]
    KillSwitch(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("verification failed: {0}")]
    VerificationFailed(String),
    #[error("rollback failed: {0}")]
    RollbackFailed(String),
}

impl StewardError {
    #[must_use]
    pub fn fail_reason(&self) -> FailReason {
        match self {
            Self::OutOfScope(_) => FailReason::OutOfScope,
            Self::Validation(_) => FailReason::ValidationError,
            Self::ClaimFailed(_) => FailReason::ClaimFailed,
            Self::KillSwitch(_) => FailReason::KillSwitch,
            Self::Execution(_) => FailReason::ExecutionError,
            Self::VerificationFailed(_) => FailReason::VerificationFailed,
            Self::RollbackFailed(_) => FailReason::RollbackFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the opaque execution token handed out by the coordinator.
    ///
    /// # Errors
    /// Returns [`StewardError::Validation`] when the token is not a well-formed UUID.
    pub fn parse(value: &str) -> Result<Self, StewardError> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|err| StewardError::Validation(format!("execution id is not a UUID: {err}")))
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = StewardError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

/// One local run of the pipeline against one execution request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AttemptId(pub Ulid);

impl AttemptId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AttemptId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Scheduled,
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    #[must_use]
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Scheduled | Self::Pending)
    }

    /// Whether a status report may move a record from `self` to `next`.
    ///
    /// Entering `running` is reserved for the claim transition, so an
    /// unclaimed record may only be reported as `failed` (pre-claim rejection).
    /// Repeating the current terminal status is an idempotent no-op.
    #[must_use]
    pub fn permits_update_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Scheduled | Self::Pending, Self::Failed)
            | (
                Self::Running,
                Self::Running | Self::Completed | Self::Failed | Self::RolledBack,
            ) => true,
            (current, next) if current.is_terminal() => current == next,
            _ => false,
        }
    }
}

impl Display for ExecutionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    OutOfScope,
    ValidationError,
    ClaimFailed,
    KillSwitch,
    ExecutionError,
    VerificationFailed,
    RollbackFailed,
}

impl FailReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutOfScope => "out_of_scope",
            Self::ValidationError => "validation_error",
            Self::ClaimFailed => "claim_failed",
            Self::KillSwitch => "kill_switch",
            Self::ExecutionError => "execution_error",
            Self::VerificationFailed => "verification_failed",
            Self::RollbackFailed => "rollback_failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "out_of_scope" => Some(Self::OutOfScope),
            "validation_error" => Some(Self::ValidationError),
            "claim_failed" => Some(Self::ClaimFailed),
            "kill_switch" => Some(Self::KillSwitch),
            "execution_error" => Some(Self::ExecutionError),
            "verification_failed" => Some(Self::VerificationFailed),
            "rollback_failed" => Some(Self::RollbackFailed),
            _ => None,
        }
    }
}

impl Display for FailReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of schema changes the pipeline is allowed to apply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum ChangeAction {
    #[serde(rename = "ADD_INDEX")]
    AddIndex,
}

impl ChangeAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddIndex => "ADD_INDEX",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ADD_INDEX" => Some(Self::AddIndex),
            _ => None,
        }
    }
}

/// One approved change request as stored by the coordinator.
///
/// `action` and `id` stay raw strings here: a record with an unknown action
/// or a malformed id still has to be readable so it can be rejected.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub id: String,
    pub connection_id: String,
    pub action: String,
    pub table_name: String,
    pub index_name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub query_fingerprints: Vec<String>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<FailReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<DateTimeUtc>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<DateTimeUtc>,
}

/// Payload the approval workflow submits to schedule a change.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewExecution {
    pub connection_id: String,
    pub action: String,
    pub table_name: String,
    pub index_name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub query_fingerprints: Vec<String>,
}

/// A table, index or column name that passed [`validate_identifier`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// # Errors
    /// Returns [`StewardError::Validation`] when `name` is not a safe SQL identifier.
    pub fn parse(name: &str) -> Result<Self, StewardError> {
        validate_identifier(name).map(|valid| Self(valid.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Backtick-quoted form for interpolation into DDL.
    #[must_use]
    pub fn quoted(&self) -> String {
        format!("`{}`", self.0)
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identifier {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

/// Accept only `^[A-Za-z_][A-Za-z0-9_]{0,63}$`.
///
/// DDL identifiers cannot be bound as statement parameters, so this check is
/// the only thing standing between request data and generated SQL.
///
/// # Errors
/// Returns [`StewardError::Validation`] for empty names, a leading digit,
/// any character outside `[A-Za-z0-9_]`, or names longer than 64 characters.
pub fn validate_identifier(name: &str) -> Result<&str, StewardError> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(StewardError::Validation(
            "identifier MUST be non-empty".to_string(),
        ));
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(StewardError::Validation(format!(
            "identifier {name:?} MUST start with a letter or underscore"
        )));
    }
    if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_')) {
        return Err(StewardError::Validation(format!(
            "identifier {name:?} contains characters outside [A-Za-z0-9_]"
        )));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(StewardError::Validation(format!(
            "identifier exceeds {MAX_IDENTIFIER_LEN} characters (got {})",
            name.len()
        )));
    }
    Ok(name)
}

/// Validate every name in a non-empty list.
///
/// # Errors
/// Returns [`StewardError::Validation`] for an empty list or the first invalid name.
pub fn validate_identifiers(names: &[String]) -> Result<Vec<Identifier>, StewardError> {
    if names.is_empty() {
        return Err(StewardError::Validation(
            "identifier list MUST be non-empty".to_string(),
        ));
    }
    names.iter().map(|name| Identifier::parse(name)).collect()
}

/// The narrow, fully validated input the pipeline operates on.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ValidatedChange {
    pub execution_id: ExecutionId,
    pub connection_id: String,
    pub action: ChangeAction,
    pub table: Identifier,
    pub index: Identifier,
    pub columns: Vec<Identifier>,
    pub query_fingerprints: Vec<String>,
}

impl ValidatedChange {
    /// Scope check first, then id and identifier validation; nothing here touches I/O.
    ///
    /// # Errors
    /// Returns [`StewardError::OutOfScope`] for any action other than `ADD_INDEX`
    /// and [`StewardError::Validation`] for a malformed id, an empty connection id,
    /// an empty column list or any unsafe identifier.
    pub fn from_request(request: &ExecutionRequest) -> Result<Self, StewardError> {
        let action = ChangeAction::parse(&request.action).ok_or_else(|| {
            StewardError::OutOfScope(format!(
                "action {:?} is not supported; only ADD_INDEX is in scope",
                request.action
            ))
        })?;

        let execution_id = ExecutionId::parse(&request.id)?;
        if request.connection_id.trim().is_empty() {
            return Err(StewardError::Validation(
                "connection_id MUST be non-empty".to_string(),
            ));
        }
        let table = Identifier::parse(&request.table_name)?;
        let index = Identifier::parse(&request.index_name)?;
        let columns = validate_identifiers(&request.columns)?;

        Ok(Self {
            execution_id,
            connection_id: request.connection_id.clone(),
            action,
            table,
            index,
            columns,
            query_fingerprints: request.query_fingerprints.clone(),
        })
    }
}

/// Aggregated performance counters for one query fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub fingerprint: String,
    pub execution_count: u64,
    pub avg_latency_ms: f64,
    pub rows_examined: u64,
    pub full_scan_count: u64,
    pub sample_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_minutes: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricPhase {
    Baseline,
    After,
}

impl MetricPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::After => "after",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "baseline" => Some(Self::Baseline),
            "after" => Some(Self::After),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Success,
    Failed,
    Inconclusive,
}

impl VerificationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Inconclusive => "inconclusive",
        }
    }
}

/// Positive percentages mean the change made things worse.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricComparison {
    pub latency_change_pct: f64,
    pub rows_examined_change_pct: f64,
    pub full_scan_increased: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub status: VerificationStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<MetricComparison>,
    pub total_sample_count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Completed,
    Failed,
}

impl RollbackStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RollbackType {
    Auto,
}

impl RollbackType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
        }
    }
}

/// One compensating-DDL attempt. Never retried.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRecord {
    pub execution_id: ExecutionId,
    pub rollback_type: RollbackType,
    pub trigger_reason: FailReason,
    pub rollback_sql: String,
    pub status: RollbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KillSwitchState {
    pub global_active: bool,
    pub connection_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl KillSwitchState {
    /// The state assumed whenever the authority cannot be read.
    #[must_use]
    pub fn fully_blocked(reason: impl Into<String>) -> Self {
        Self {
            global_active: true,
            connection_active: true,
            reason: Some(reason.into()),
        }
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.global_active || self.connection_active
    }
}

/// Operator request to flip a kill switch, globally or for one connection.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KillSwitchUpdate {
    #[serde(default)]
    pub connection_id: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<FailReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusUpdate {
    #[must_use]
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            fail_reason: None,
            message: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: FailReason) -> Self {
        self.fail_reason = Some(reason);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMetricsSubmission {
    pub execution_id: ExecutionId,
    pub before_metrics: Vec<MetricSnapshot>,
    pub after_metrics: Vec<MetricSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum ClaimOutcome {
    /// Ownership was granted. The returned record is informational; a caller
    /// that cannot read it still owns the execution.
    Claimed(Option<ExecutionRequest>),
    Conflict { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub execution_id: ExecutionId,
    pub from_status: Option<ExecutionStatus>,
    pub to_status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<FailReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: DateTimeUtc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Completed,
    Failed,
    RolledBack,
    ClaimLost,
}

impl AttemptStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::ClaimLost => "claim_lost",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            "claim_lost" => Some(Self::ClaimLost),
            _ => None,
        }
    }
}

impl From<ExecutionStatus> for AttemptStatus {
    fn from(value: ExecutionStatus) -> Self {
        match value {
            ExecutionStatus::Scheduled | ExecutionStatus::Pending | ExecutionStatus::Running => {
                Self::InProgress
            }
            ExecutionStatus::Completed => Self::Completed,
            ExecutionStatus::Failed => Self::Failed,
            ExecutionStatus::RolledBack => Self::RolledBack,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AttemptStarted,
    ScopeRejected,
    ValidationRejected,
    ClaimLost,
    Claimed,
    KillSwitchChecked,
    BaselineCaptured,
    DdlApplied,
    DdlFailed,
    IndexVerified,
    ObservationStarted,
    AfterCaptured,
    VerificationEvaluated,
    RollbackCompleted,
    RollbackFailed,
    StatusReportFailed,
    AttemptFinished,
    Warning,
    Error,
}

impl AuditEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AttemptStarted => "attempt_started",
            Self::ScopeRejected => "scope_rejected",
            Self::ValidationRejected => "validation_rejected",
            Self::ClaimLost => "claim_lost",
            Self::Claimed => "claimed",
            Self::KillSwitchChecked => "kill_switch_checked",
            Self::BaselineCaptured => "baseline_captured",
            Self::DdlApplied => "ddl_applied",
            Self::DdlFailed => "ddl_failed",
            Self::IndexVerified => "index_verified",
            Self::ObservationStarted => "observation_started",
            Self::AfterCaptured => "after_captured",
            Self::VerificationEvaluated => "verification_evaluated",
            Self::RollbackCompleted => "rollback_completed",
            Self::RollbackFailed => "rollback_failed",
            Self::StatusReportFailed => "status_report_failed",
            Self::AttemptFinished => "attempt_finished",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "attempt_started" => Some(Self::AttemptStarted),
            "scope_rejected" => Some(Self::ScopeRejected),
            "validation_rejected" => Some(Self::ValidationRejected),
            "claim_lost" => Some(Self::ClaimLost),
            "claimed" => Some(Self::Claimed),
            "kill_switch_checked" => Some(Self::KillSwitchChecked),
            "baseline_captured" => Some(Self::BaselineCaptured),
            "ddl_applied" => Some(Self::DdlApplied),
            "ddl_failed" => Some(Self::DdlFailed),
            "index_verified" => Some(Self::IndexVerified),
            "observation_started" => Some(Self::ObservationStarted),
            "after_captured" => Some(Self::AfterCaptured),
            "verification_evaluated" => Some(Self::VerificationEvaluated),
            "rollback_completed" => Some(Self::RollbackCompleted),
            "rollback_failed" => Some(Self::RollbackFailed),
            "status_report_failed" => Some(Self::StatusReportFailed),
            "attempt_finished" => Some(Self::AttemptFinished),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttemptRecord {
    pub attempt_id: AttemptId,
    pub execution_id: String,
    pub connection_id: String,
    pub agent_id: String,
    pub action: String,
    pub table_name: String,
    pub index_name: String,
    pub columns: Vec<String>,
    pub started_at: DateTimeUtc,
    pub ended_at: Option<DateTimeUtc>,
    pub status: AttemptStatus,
    pub fail_reason: Option<FailReason>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditEvent {
    pub event_id: Ulid,
    pub attempt_id: AttemptId,
    pub execution_id: String,
    pub event_type: AuditEventType,
    pub occurred_at: DateTimeUtc,
    pub actor: String,
    pub payload_json: Value,
    pub payload_hash: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditEventRow {
    pub event_seq: i64,
    pub event: AuditEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRow {
    pub attempt_id: AttemptId,
    pub phase: MetricPhase,
    pub snapshot: MetricSnapshot,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// # Errors
/// Returns an error if the timestamp cannot be represented in RFC 3339.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

/// # Errors
/// Returns an error if `value` is not an RFC 3339 timestamp.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}
