#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use schema_steward_audit_core::{AuditChain, AuditSink};
use schema_steward_control::{ControlPlane, KillSwitchGate};
use schema_steward_domain::{
    now_utc, AttemptId, AttemptRecord, AttemptStatus, AuditEventType, ClaimOutcome, ExecutionId,
    ExecutionRequest, ExecutionStatus, FailReason, KillSwitchState, MetricPhase, MetricSnapshot,
    RollbackRecord, RollbackStatus, StatusUpdate, StewardError, ValidatedChange,
    VerificationMetricsSubmission, VerificationOutcome, VerificationStatus,
};
use schema_steward_target::{
    ChangeExecutor, MetricsSampler, RollbackAgent, TargetDatabase, TargetRegistry,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, info_span, warn, Instrument};

mod poller;

pub use poller::{Poller, PollerConfig, PollerStats};

pub const DEFAULT_OBSERVATION_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Recorded as the actor on every audit event.
    pub agent_id: String,
    pub observation_window: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_id: "schema-steward-agent".to_string(),
            observation_window: DEFAULT_OBSERVATION_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disposition {
    /// This attempt decided the execution's terminal status.
    Finalized {
        status: ExecutionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        fail_reason: Option<FailReason>,
    },
    /// Another owner holds the execution, or the claim could not be confirmed.
    ClaimLost,
    /// The connection belongs to a different agent.
    NotServed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<AttemptId>,
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackRecord>,
}

impl ExecutionReport {
    #[must_use]
    pub fn final_status(&self) -> Option<ExecutionStatus> {
        match &self.disposition {
            Disposition::Finalized { status, .. } => Some(*status),
            Disposition::ClaimLost | Disposition::NotServed => None,
        }
    }

    #[must_use]
    pub fn fail_reason(&self) -> Option<FailReason> {
        match &self.disposition {
            Disposition::Finalized { fail_reason, .. } => *fail_reason,
            Disposition::ClaimLost | Disposition::NotServed => None,
        }
    }
}

/// Terminal decision for one claimed execution.
#[derive(Debug, Clone)]
struct Resolution {
    status: ExecutionStatus,
    fail_reason: Option<FailReason>,
    message: String,
    verification: Option<VerificationOutcome>,
    rollback: Option<RollbackRecord>,
}

impl Resolution {
    fn new(
        status: ExecutionStatus,
        fail_reason: Option<FailReason>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            fail_reason,
            message: message.into(),
            verification: None,
            rollback: None,
        }
    }

    fn failed(err: &StewardError) -> Self {
        Self::new(ExecutionStatus::Failed, Some(err.fail_reason()), err.to_string())
    }

    /// The cause keeps its reason; the rollback outcome is appended to its text.
    fn rolled_back(cause: &StewardError, rollback: RollbackRecord) -> Self {
        let mut resolution = Self::new(
            ExecutionStatus::RolledBack,
            Some(cause.fail_reason()),
            rollback_message(cause, &rollback),
        );
        resolution.rollback = Some(rollback);
        resolution
    }
}

/// State carried through one claimed attempt.
struct ClaimedAttempt {
    chain: AuditChain,
    change: ValidatedChange,
    target: Arc<dyn TargetDatabase>,
    applied_sql: Option<String>,
}

/// Runs the end-to-end pipeline for one execution request.
///
/// Holds no locks: correctness across agents rests entirely on the
/// coordinator's atomic claim.
pub struct ExecutionOrchestrator {
    control: Arc<dyn ControlPlane>,
    kill_switch: KillSwitchGate,
    targets: Arc<dyn TargetRegistry>,
    audit: Arc<dyn AuditSink>,
    config: OrchestratorConfig,
}

impl ExecutionOrchestrator {
    #[must_use]
    pub fn new(
        control: Arc<dyn ControlPlane>,
        kill_switch: KillSwitchGate,
        targets: Arc<dyn TargetRegistry>,
        audit: Arc<dyn AuditSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            control,
            kill_switch,
            targets,
            audit,
            config,
        }
    }

    #[must_use]
    pub fn control(&self) -> &Arc<dyn ControlPlane> {
        &self.control
    }

    #[must_use]
    pub fn targets(&self) -> &Arc<dyn TargetRegistry> {
        &self.targets
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Drive one request to a terminal state, or step aside when it belongs
    /// to someone else.
    ///
    /// Never returns an error: every failure after the claim is mapped onto a
    /// terminal status, and reporting failures are logged only.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionReport {
        let Some(target) = self.targets.resolve(&request.connection_id) else {
            debug!(
                execution_id = %request.id,
                connection_id = %request.connection_id,
                "connection not served by this agent; skipping"
            );
            return ExecutionReport {
                execution_id: request.id,
                attempt_id: None,
                disposition: Disposition::NotServed,
                message: None,
                applied_sql: None,
                verification: None,
                rollback: None,
            };
        };

        let attempt_id = AttemptId::new();
        let span = info_span!(
            "execution",
            execution_id = %request.id,
            attempt_id = %attempt_id,
            connection_id = %request.connection_id
        );
        self.execute_attempt(request, attempt_id, target)
            .instrument(span)
            .await
    }

    async fn execute_attempt(
        &self,
        request: ExecutionRequest,
        attempt_id: AttemptId,
        target: Arc<dyn TargetDatabase>,
    ) -> ExecutionReport {
        self.open_attempt(&request, attempt_id);
        let mut chain = AuditChain::new(
            self.audit.clone(),
            attempt_id,
            request.id.clone(),
            self.config.agent_id.clone(),
        );
        self.record(
            &mut chain,
            AuditEventType::AttemptStarted,
            json!({
                "connection_id": request.connection_id,
                "action": request.action,
                "table_name": request.table_name,
                "index_name": request.index_name,
                "columns": request.columns,
                "query_fingerprints": request.query_fingerprints,
            }),
        );

        // Steps 1 and 2: nothing below touches the target or the coordinator.
        let change = match ValidatedChange::from_request(&request) {
            Ok(change) => change,
            Err(err) => return self.reject(chain, &request, &err).await,
        };

        // Step 3.
        let execution_id = change.execution_id;
        match self.control.claim(execution_id).await {
            Ok(ClaimOutcome::Claimed(_)) => {
                info!(step = "claim", "execution claimed");
                self.record(&mut chain, AuditEventType::Claimed, json!({}));
            }
            Ok(ClaimOutcome::Conflict { reason }) => {
                info!(step = "claim", %reason, "claim lost; another owner is responsible");
                return self.claim_lost(chain, &request, &StewardError::ClaimFailed(reason));
            }
            Err(err) => {
                warn!(step = "claim", error = %err, "claim call failed; abandoning attempt");
                let err = StewardError::ClaimFailed(format!("{err:#}"));
                return self.claim_lost(chain, &request, &err);
            }
        }

        let mut attempt = ClaimedAttempt {
            chain,
            change,
            target,
            applied_sql: None,
        };
        let resolution = match self.drive_claimed(&mut attempt).await {
            Ok(resolution) => resolution,
            Err(err) => {
                error!(error = %format!("{err:#}"), "unexpected pipeline error");
                self.record(
                    &mut attempt.chain,
                    AuditEventType::Error,
                    json!({"error": format!("{err:#}"), "applied_sql": attempt.applied_sql}),
                );
                Resolution::failed(&StewardError::Execution(format!("{err:#}")))
            }
        };

        self.finalize(attempt, resolution).await
    }

    /// Steps 4 to 11. An `Err` here becomes `failed`/`execution_error`.
    async fn drive_claimed(&self, attempt: &mut ClaimedAttempt) -> Result<Resolution> {
        let connection_id = attempt.change.connection_id.clone();
        let fingerprints = attempt.change.query_fingerprints.clone();
        let sampler = MetricsSampler::new(attempt.target.clone());

        // Step 4.
        let pre = self.kill_switch.check(&connection_id).await;
        self.record_kill_switch(&mut attempt.chain, "pre_ddl", &pre);
        if pre.is_blocked() {
            let reason = pre.reason.unwrap_or_else(|| "kill switch active".to_string());
            info!(step = "kill_switch_pre", %reason, "blocked before ddl");
            return Ok(Resolution::failed(&StewardError::KillSwitch(format!(
                "blocked before ddl: {reason}"
            ))));
        }

        // Step 5.
        let baseline = sampler
            .sample(&fingerprints)
            .await
            .context("failed to capture baseline metrics")?;
        info!(step = "baseline", snapshots = baseline.len(), "baseline captured");
        self.record_snapshots(&mut attempt.chain, MetricPhase::Baseline, &baseline);

        // Step 6.
        let executor = ChangeExecutor::new(attempt.target.clone());
        let columns: Vec<String> = attempt
            .change
            .columns
            .iter()
            .map(|column| column.as_str().to_string())
            .collect();
        let applied = match executor
            .apply_add_index(
                attempt.change.table.as_str(),
                attempt.change.index.as_str(),
                &columns,
            )
            .await
        {
            Ok(applied) => applied,
            Err(err) => {
                warn!(step = "ddl", error = %err, "ddl failed");
                self.record(
                    &mut attempt.chain,
                    AuditEventType::DdlFailed,
                    json!({"error": err.to_string()}),
                );
                return Ok(Resolution::failed(&StewardError::Execution(err.to_string())));
            }
        };
        attempt.applied_sql = Some(applied.applied_sql.clone());
        self.record(
            &mut attempt.chain,
            AuditEventType::DdlApplied,
            json!({"sql": applied.applied_sql}),
        );

        // Step 7.
        let post = self.kill_switch.check(&connection_id).await;
        self.record_kill_switch(&mut attempt.chain, "post_ddl", &post);
        if post.is_blocked() {
            let reason = post.reason.unwrap_or_else(|| "kill switch active".to_string());
            info!(
                step = "kill_switch_post",
                %reason,
                "kill switch activated after ddl; rolling back"
            );
            let cause = StewardError::KillSwitch(format!("activated after ddl: {reason}"));
            let rollback = self.rollback(attempt, cause.fail_reason()).await;
            return Ok(Resolution::rolled_back(&cause, rollback));
        }

        let exists = executor
            .index_exists(&attempt.change.table, &attempt.change.index)
            .await
            .context("failed to confirm index in schema catalog")?;
        self.record(
            &mut attempt.chain,
            AuditEventType::IndexVerified,
            json!({"exists": exists}),
        );
        if !exists {
            warn!(step = "index_check", "index missing from catalog after ddl");
            return Ok(Resolution::failed(&StewardError::VerificationFailed(format!(
                "index {} not found on {} after ddl",
                attempt.change.index, attempt.change.table
            ))));
        }

        // Step 8. No target connection is open across the wait.
        let window = self.config.observation_window;
        let window_minutes = u32::try_from(window.as_secs() / 60).unwrap_or(u32::MAX);
        self.record(
            &mut attempt.chain,
            AuditEventType::ObservationStarted,
            json!({"window_seconds": window.as_secs(), "window_minutes": window_minutes}),
        );
        self.report(
            &mut attempt.chain,
            attempt.change.execution_id,
            StatusUpdate::new(ExecutionStatus::Running).with_message(format!(
                "index applied; observing for {window_minutes} minute(s)"
            )),
        )
        .await;
        info!(step = "observe", window_secs = window.as_secs(), "observation window started");
        tokio::time::sleep(window).await;

        // Step 9.
        let after = sampler
            .sample_after(&fingerprints, &baseline, window_minutes)
            .await
            .context("failed to capture after metrics")?;
        info!(step = "after", snapshots = after.len(), "after metrics captured");
        self.record_snapshots(&mut attempt.chain, MetricPhase::After, &after);
        self.submit_metrics(
            &mut attempt.chain,
            attempt.change.execution_id,
            baseline.clone(),
            after.clone(),
        )
        .await;

        // Step 10.
        let outcome = schema_steward_verify::evaluate(&baseline, &after);
        info!(
            step = "verify",
            status = outcome.status.as_str(),
            total_sample_count = outcome.total_sample_count,
            "verification evaluated"
        );
        self.record(
            &mut attempt.chain,
            AuditEventType::VerificationEvaluated,
            serde_json::to_value(&outcome).unwrap_or(Value::Null),
        );

        // Step 11.
        let mut resolution = match outcome.status {
            VerificationStatus::Success | VerificationStatus::Inconclusive => Resolution::new(
                ExecutionStatus::Completed,
                None,
                outcome.message.clone(),
            ),
            VerificationStatus::Failed => {
                let cause = StewardError::VerificationFailed(outcome.message.clone());
                let rollback = self.rollback(attempt, cause.fail_reason()).await;
                Resolution::rolled_back(&cause, rollback)
            }
        };
        resolution.verification = Some(outcome);
        Ok(resolution)
    }

    /// Single compensating attempt. A failure is escalated and recorded, the
    /// execution still ends `rolled_back` with the original trigger.
    async fn rollback(&self, attempt: &mut ClaimedAttempt, trigger: FailReason) -> RollbackRecord {
        let agent = RollbackAgent::new(attempt.target.clone());
        let record = agent
            .drop_index(
                attempt.change.execution_id,
                &attempt.change.table,
                &attempt.change.index,
                trigger,
            )
            .await;

        let event_type = match record.status {
            RollbackStatus::Completed => AuditEventType::RollbackCompleted,
            RollbackStatus::Failed => {
                error!(
                    step = "rollback",
                    trigger = %trigger,
                    sql = %record.rollback_sql,
                    error = record.error_text.as_deref().unwrap_or("unknown"),
                    "rollback failed; index left in place, operator action required"
                );
                AuditEventType::RollbackFailed
            }
        };
        self.record(
            &mut attempt.chain,
            event_type,
            serde_json::to_value(&record).unwrap_or(Value::Null),
        );
        if let Err(err) = self.audit.append_rollback(attempt.chain.attempt_id(), &record) {
            warn!(error = %err, "failed to store rollback in audit log");
        }
        if let Err(err) = self.control.submit_rollback(&record).await {
            warn!(error = %err, "failed to submit rollback record");
            self.record(
                &mut attempt.chain,
                AuditEventType::Warning,
                json!({"operation": "submit_rollback", "error": format!("{err:#}")}),
            );
        }
        record
    }

    async fn finalize(
        &self,
        mut attempt: ClaimedAttempt,
        resolution: Resolution,
    ) -> ExecutionReport {
        let execution_id = attempt.change.execution_id;
        let mut update =
            StatusUpdate::new(resolution.status).with_message(resolution.message.clone());
        if let Some(reason) = resolution.fail_reason {
            update = update.with_reason(reason);
        }
        self.report(&mut attempt.chain, execution_id, update).await;
        self.close_attempt(
            &mut attempt.chain,
            AttemptStatus::from(resolution.status),
            resolution.fail_reason,
            &resolution.message,
        );
        info!(
            status = %resolution.status,
            fail_reason = resolution.fail_reason.map(FailReason::as_str),
            "execution finished"
        );

        ExecutionReport {
            execution_id: execution_id.to_string(),
            attempt_id: Some(attempt.chain.attempt_id()),
            disposition: Disposition::Finalized {
                status: resolution.status,
                fail_reason: resolution.fail_reason,
            },
            message: Some(resolution.message),
            applied_sql: attempt.applied_sql,
            verification: resolution.verification,
            rollback: resolution.rollback,
        }
    }

    /// Scope or validation failure before any side effect.
    async fn reject(
        &self,
        mut chain: AuditChain,
        request: &ExecutionRequest,
        err: &StewardError,
    ) -> ExecutionReport {
        let reason = err.fail_reason();
        let message = err.to_string();
        let event_type = match err {
            StewardError::OutOfScope(_) => AuditEventType::ScopeRejected,
            _ => AuditEventType::ValidationRejected,
        };
        info!(step = "validate", reason = reason.as_str(), %message, "request rejected");
        self.record(&mut chain, event_type, json!({"reason": reason, "message": message}));

        // A malformed id cannot be addressed on the coordinator; the audit log is all we have.
        match ExecutionId::parse(&request.id) {
            Ok(execution_id) => {
                self.report(
                    &mut chain,
                    execution_id,
                    StatusUpdate::new(ExecutionStatus::Failed)
                        .with_reason(reason)
                        .with_message(message.clone()),
                )
                .await;
            }
            Err(_) => warn!("execution id is not a UUID; status not reported"),
        }
        self.close_attempt(&mut chain, AttemptStatus::Failed, Some(reason), &message);

        ExecutionReport {
            execution_id: request.id.clone(),
            attempt_id: Some(chain.attempt_id()),
            disposition: Disposition::Finalized {
                status: ExecutionStatus::Failed,
                fail_reason: Some(reason),
            },
            message: Some(message),
            applied_sql: None,
            verification: None,
            rollback: None,
        }
    }

    fn claim_lost(
        &self,
        mut chain: AuditChain,
        request: &ExecutionRequest,
        err: &StewardError,
    ) -> ExecutionReport {
        let reason = err.to_string();
        self.record(&mut chain, AuditEventType::ClaimLost, json!({"reason": reason}));
        self.close_attempt(
            &mut chain,
            AttemptStatus::ClaimLost,
            Some(err.fail_reason()),
            &reason,
        );
        ExecutionReport {
            execution_id: request.id.clone(),
            attempt_id: Some(chain.attempt_id()),
            disposition: Disposition::ClaimLost,
            message: Some(reason),
            applied_sql: None,
            verification: None,
            rollback: None,
        }
    }

    /// Best effort: a failed report never changes the outcome.
    async fn report(
        &self,
        chain: &mut AuditChain,
        execution_id: ExecutionId,
        update: StatusUpdate,
    ) {
        if let Err(err) = self.control.update_status(execution_id, &update).await {
            warn!(status = %update.status, error = %err, "status report failed");
            self.record(
                chain,
                AuditEventType::StatusReportFailed,
                json!({"status": update.status, "error": format!("{err:#}")}),
            );
        }
    }

    async fn submit_metrics(
        &self,
        chain: &mut AuditChain,
        execution_id: ExecutionId,
        before_metrics: Vec<MetricSnapshot>,
        after_metrics: Vec<MetricSnapshot>,
    ) {
        let submission = VerificationMetricsSubmission {
            execution_id,
            before_metrics,
            after_metrics,
        };
        if let Err(err) = self.control.submit_verification_metrics(&submission).await {
            warn!(error = %err, "failed to submit verification metrics");
            self.record(
                chain,
                AuditEventType::Warning,
                json!({"operation": "submit_verification_metrics", "error": format!("{err:#}")}),
            );
        }
    }

    fn open_attempt(&self, request: &ExecutionRequest, attempt_id: AttemptId) {
        let attempt = AttemptRecord {
            attempt_id,
            execution_id: request.id.clone(),
            connection_id: request.connection_id.clone(),
            agent_id: self.config.agent_id.clone(),
            action: request.action.clone(),
            table_name: request.table_name.clone(),
            index_name: request.index_name.clone(),
            columns: request.columns.clone(),
            started_at: now_utc(),
            ended_at: None,
            status: AttemptStatus::InProgress,
            fail_reason: None,
            message: None,
        };
        if let Err(err) = self.audit.insert_attempt(&attempt) {
            warn!(error = %err, "failed to open audit attempt");
        }
    }

    fn close_attempt(
        &self,
        chain: &mut AuditChain,
        status: AttemptStatus,
        fail_reason: Option<FailReason>,
        message: &str,
    ) {
        self.record(
            chain,
            AuditEventType::AttemptFinished,
            json!({"status": status, "fail_reason": fail_reason, "message": message}),
        );
        if let Err(err) =
            self.audit
                .finish_attempt(chain.attempt_id(), status, fail_reason, Some(message))
        {
            warn!(error = %err, "failed to close audit attempt");
        }
    }

    fn record(&self, chain: &mut AuditChain, event_type: AuditEventType, payload: Value) {
        if let Err(err) = chain.emit(event_type, payload) {
            warn!(event_type = event_type.as_str(), error = %err, "audit write failed");
        }
    }

    fn record_kill_switch(&self, chain: &mut AuditChain, phase: &str, state: &KillSwitchState) {
        self.record(
            chain,
            AuditEventType::KillSwitchChecked,
            json!({"phase": phase, "state": state, "blocked": state.is_blocked()}),
        );
    }

    fn record_snapshots(
        &self,
        chain: &mut AuditChain,
        phase: MetricPhase,
        snapshots: &[MetricSnapshot],
    ) {
        let event_type = match phase {
            MetricPhase::Baseline => AuditEventType::BaselineCaptured,
            MetricPhase::After => AuditEventType::AfterCaptured,
        };
        let fingerprints: Vec<&str> = snapshots
            .iter()
            .map(|snapshot| snapshot.fingerprint.as_str())
            .collect();
        self.record(
            chain,
            event_type,
            json!({"snapshots": snapshots.len(), "fingerprints": fingerprints}),
        );
        if let Err(err) = self
            .audit
            .append_metric_snapshots(chain.attempt_id(), phase, snapshots)
        {
            warn!(phase = phase.as_str(), error = %err, "failed to store metric snapshots");
        }
    }
}

fn rollback_message(cause: &StewardError, rollback: &RollbackRecord) -> String {
    match rollback.status {
        RollbackStatus::Completed => format!("{cause}; rolled back"),
        RollbackStatus::Failed => {
            let failure = StewardError::RollbackFailed(
                rollback
                    .error_text
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            );
            format!("{cause}; {failure}")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use schema_steward_audit_core::{verify_chain, AuditSink};
    use schema_steward_audit_sqlite::SqliteAuditStore;
    use schema_steward_control::{ControlPlane, KillSwitchGate, KillSwitchSource};
    use schema_steward_domain::{
        now_utc, AttemptStatus, AuditEventType, ClaimOutcome, ExecutionId, ExecutionRequest,
        ExecutionStatus, FailReason, Identifier, KillSwitchState, MetricSnapshot, RollbackRecord,
        RollbackStatus, RollbackType, StatusUpdate, StewardError, VerificationMetricsSubmission,
    };
    use schema_steward_target::{StaticTargetRegistry, TargetDatabase, TargetError};
    use ulid::Ulid;

    use super::{
        rollback_message, Disposition, ExecutionOrchestrator, OrchestratorConfig, Resolution,
    };

    #[derive(Default)]
    struct ScriptedControl {
        claim_error: bool,
        claim_granted: bool,
        status_error: bool,
        claims: AtomicUsize,
        updates: Mutex<Vec<StatusUpdate>>,
    }

    #[async_trait]
    impl ControlPlane for ScriptedControl {
        async fn list_pending(
            &self,
            _limit: usize,
            _connection_ids: &[String],
        ) -> Result<Vec<ExecutionRequest>> {
            Ok(Vec::new())
        }

        async fn claim(&self, _execution_id: ExecutionId) -> Result<ClaimOutcome> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            if self.claim_error {
                return Err(anyhow!("connection refused"));
            }
            if self.claim_granted {
                return Ok(ClaimOutcome::Claimed(None));
            }
            Ok(ClaimOutcome::Conflict {
                reason: "already running".to_string(),
            })
        }

        async fn update_status(
            &self,
            _execution_id: ExecutionId,
            update: &StatusUpdate,
        ) -> Result<()> {
            self.updates
                .lock()
                .map_err(|_| anyhow!("poisoned"))?
                .push(update.clone());
            if self.status_error {
                return Err(anyhow!("coordinator unavailable"));
            }
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

    #[derive(Default)]
    struct NoopTarget {
        statements: AtomicUsize,
    }

    #[async_trait]
    impl TargetDatabase for NoopTarget {
        async fn execute_ddl(&self, _sql: &str) -> Result<(), TargetError> {
            self.statements.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn digest_stats(
            &self,
            _fingerprints: &[String],
        ) -> Result<Vec<MetricSnapshot>, TargetError> {
            self.statements.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn index_exists(
            &self,
            _table: &Identifier,
            _index: &Identifier,
        ) -> Result<bool, TargetError> {
            Ok(true)
        }
    }

    struct Harness {
        orchestrator: ExecutionOrchestrator,
        control: Arc<ScriptedControl>,
        target: Arc<NoopTarget>,
        audit: Arc<SqliteAuditStore>,
    }

    fn harness(control: ScriptedControl) -> Harness {
        let path = std::env::temp_dir().join(format!("steward-orch-unit-{}.sqlite", Ulid::new()));
        let audit = Arc::new(SqliteAuditStore::open(&path).unwrap_or_else(|_| unreachable!()));
        assert!(audit.migrate().is_ok());
        let control = Arc::new(control);
        let target = Arc::new(NoopTarget::default());
        let registry = StaticTargetRegistry::new().with_target("conn-a", target.clone());
        let orchestrator = ExecutionOrchestrator::new(
            control.clone(),
            KillSwitchGate::new(Arc::new(Clear)),
            Arc::new(registry),
            audit.clone(),
            OrchestratorConfig {
                agent_id: "agent-test".to_string(),
                observation_window: Duration::ZERO,
            },
        );
        Harness {
            orchestrator,
            control,
            target,
            audit,
        }
    }

    fn request(connection_id: &str) -> ExecutionRequest {
        ExecutionRequest {
            id: ExecutionId::new().to_string(),
            connection_id: connection_id.to_string(),
            action: "ADD_INDEX".to_string(),
            table_name: "orders".to_string(),
            index_name: "idx_orders_customer_id".to_string(),
            columns: vec!["customer_id".to_string()],
            query_fingerprints: vec!["digest-a".to_string()],
            status: ExecutionStatus::Scheduled,
            fail_reason: None,
            message: None,
            created_at: now_utc(),
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn unserved_connection_is_skipped_without_claiming() {
        let h = harness(ScriptedControl::default());
        let report = h.orchestrator.execute(request("conn-other")).await;
        assert_eq!(report.disposition, Disposition::NotServed);
        assert!(report.attempt_id.is_none());
        assert_eq!(h.control.claims.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lost_claim_touches_nothing_and_reports_nothing() {
        let h = harness(ScriptedControl::default());
        let report = h.orchestrator.execute(request("conn-a")).await;
        assert_eq!(report.disposition, Disposition::ClaimLost);
        assert_eq!(h.target.statements.load(Ordering::SeqCst), 0);
        assert!(h
            .control
            .updates
            .lock()
            .unwrap_or_else(|_| unreachable!())
            .is_empty());

        let attempt_id = report.attempt_id.unwrap_or_else(|| unreachable!());
        let attempt = h
            .audit
            .get_attempt(attempt_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(attempt.status, AttemptStatus::ClaimLost);
    }

    #[tokio::test]
    async fn claim_transport_error_is_treated_as_claim_failure() {
        let h = harness(ScriptedControl {
            claim_error: true,
            ..ScriptedControl::default()
        });
        let report = h.orchestrator.execute(request("conn-a")).await;
        assert_eq!(report.disposition, Disposition::ClaimLost);
        assert!(report.message.as_deref().is_some_and(|message| {
            message.starts_with("claim failed:") && message.contains("connection refused")
        }));
        assert_eq!(h.target.statements.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resolutions_take_reason_and_text_from_the_cause() {
        let failed = Resolution::failed(&StewardError::KillSwitch("blocked before ddl".into()));
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.fail_reason, Some(FailReason::KillSwitch));
        assert_eq!(failed.message, "kill switch active: blocked before ddl");

        let cause = StewardError::VerificationFailed("full scan count increased".into());
        let record = RollbackRecord {
            execution_id: ExecutionId::new(),
            rollback_type: RollbackType::Auto,
            trigger_reason: cause.fail_reason(),
            rollback_sql: "ALTER TABLE `orders` DROP INDEX `idx_orders_customer_id`".to_string(),
            status: RollbackStatus::Failed,
            error_text: Some("Lock wait timeout exceeded".to_string()),
            recorded_at: now_utc(),
        };
        assert_eq!(
            rollback_message(&cause, &record),
            "verification failed: full scan count increased; \
             rollback failed: Lock wait timeout exceeded"
        );

        let resolution = Resolution::rolled_back(&cause, record);
        assert_eq!(resolution.status, ExecutionStatus::RolledBack);
        assert_eq!(resolution.fail_reason, Some(FailReason::VerificationFailed));
        assert!(resolution.rollback.is_some());
    }

    #[tokio::test]
    async fn grant_without_record_still_owns_the_execution() {
        let h = harness(ScriptedControl {
            claim_granted: true,
            ..ScriptedControl::default()
        });
        let report = h.orchestrator.execute(request("conn-a")).await;
        assert_ne!(report.disposition, Disposition::ClaimLost);
        assert_eq!(report.final_status(), Some(ExecutionStatus::Completed));
        assert!(h.target.statements.load(Ordering::SeqCst) > 0);

        let updates = h.control.updates.lock().unwrap_or_else(|_| unreachable!());
        assert_eq!(
            updates.last().map(|update| update.status),
            Some(ExecutionStatus::Completed)
        );
    }

    #[tokio::test]
    async fn malformed_id_is_audited_but_never_reported() {
        let h = harness(ScriptedControl::default());
        let mut bad = request("conn-a");
        bad.id = "not-a-uuid".to_string();

        let report = h.orchestrator.execute(bad).await;
        assert_eq!(report.final_status(), Some(ExecutionStatus::Failed));
        assert_eq!(report.fail_reason(), Some(FailReason::ValidationError));
        assert_eq!(h.control.claims.load(Ordering::SeqCst), 0);
        assert!(h
            .control
            .updates
            .lock()
            .unwrap_or_else(|_| unreachable!())
            .is_empty());

        let attempt_id = report.attempt_id.unwrap_or_else(|| unreachable!());
        let events = h
            .audit
            .list_events_for_attempt(attempt_id)
            .unwrap_or_else(|_| unreachable!());
        assert!(events
            .iter()
            .any(|row| row.event.event_type == AuditEventType::ValidationRejected));
        let chain = verify_chain(attempt_id, &events).unwrap_or_else(|_| unreachable!());
        assert!(chain.chain_valid);
    }

    #[tokio::test]
    async fn unsafe_identifier_fails_before_claim() {
        let h = harness(ScriptedControl::default());
        let mut bad = request("conn-a");
        bad.table_name = "orders`; DROP TABLE users; --".to_string();

        let report = h.orchestrator.execute(bad).await;
        assert_eq!(report.fail_reason(), Some(FailReason::ValidationError));
        assert_eq!(h.control.claims.load(Ordering::SeqCst), 0);
        assert_eq!(h.target.statements.load(Ordering::SeqCst), 0);

        let updates = h.control.updates.lock().unwrap_or_else(|_| unreachable!());
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, ExecutionStatus::Failed);
        assert_eq!(updates[0].fail_reason, Some(FailReason::ValidationError));
    }

    #[tokio::test]
    async fn failed_status_report_does_not_change_the_outcome() {
        let h = harness(ScriptedControl {
            status_error: true,
            ..ScriptedControl::default()
        });
        let mut out_of_scope = request("conn-a");
        out_of_scope.action = "DROP_TABLE".to_string();

        let report = h.orchestrator.execute(out_of_scope).await;
        assert_eq!(report.final_status(), Some(ExecutionStatus::Failed));
        assert_eq!(report.fail_reason(), Some(FailReason::OutOfScope));

        let attempt_id = report.attempt_id.unwrap_or_else(|| unreachable!());
        let events = h
            .audit
            .list_events_for_attempt(attempt_id)
            .unwrap_or_else(|_| unreachable!());
        assert!(events
            .iter()
            .any(|row| row.event.event_type == AuditEventType::StatusReportFailed));
    }
}
