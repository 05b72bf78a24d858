use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use schema_steward_domain::{
    ClaimOutcome, ExecutionId, ExecutionRequest, KillSwitchState, KillSwitchUpdate, NewExecution,
    RollbackRecord, StatusHistoryEntry, StatusUpdate, VerificationMetricsSubmission,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{ClaimCoordinator, CoordinatorError, CoordinatorResult};

pub const SERVICE_CONTRACT_VERSION: &str = "coordinator.v1";

const DEFAULT_PENDING_LIMIT: usize = 10;
const MAX_PENDING_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct ServiceState {
    coordinator: ClaimCoordinator,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

impl ServiceState {
    #[must_use]
    pub fn new(coordinator: ClaimCoordinator, operation_timeout: Duration) -> Self {
        Self {
            coordinator,
            operation_timeout,
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    service_contract_version: &'static str,
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsAccepted {
    execution_id: ExecutionId,
    stored: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingQuery {
    limit: Option<usize>,
    connection_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KillSwitchQuery {
    connection_id: Option<String>,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    claims_won_total: AtomicU64,
    claims_conflict_total: AtomicU64,
    invalid_json_total: AtomicU64,
    invalid_transition_total: AtomicU64,
    not_found_total: AtomicU64,
    store_unavailable_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    claims_won_total: u64,
    claims_conflict_total: u64,
    invalid_json_total: u64,
    invalid_transition_total: u64,
    not_found_total: u64,
    store_unavailable_total: u64,
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" | "validation_error" => &self.invalid_json_total,
            "invalid_transition" => &self.invalid_transition_total,
            "not_found" => &self.not_found_total,
            "store_unavailable" => &self.store_unavailable_total,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            claims_won_total: self.claims_won_total.load(Ordering::Relaxed),
            claims_conflict_total: self.claims_conflict_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            invalid_transition_total: self.invalid_transition_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
        }
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn parse_execution_id(&self, raw: &str) -> Result<ExecutionId, ServiceFailure> {
        ExecutionId::parse(raw).map_err(|err| {
            self.telemetry.record_failure("validation_error", false);
            Self::failure(StatusCode::BAD_REQUEST, "validation_error", err.to_string(), None)
        })
    }

    fn classify(err: &CoordinatorError) -> ServiceFailure {
        match err {
            CoordinatorError::NotFound(id) => Self::failure(
                StatusCode::NOT_FOUND,
                "not_found",
                err.to_string(),
                Some(json!({"executionId": id})),
            ),
            CoordinatorError::InvalidTransition {
                execution_id,
                from,
                to,
            } => Self::failure(
                StatusCode::CONFLICT,
                "invalid_transition",
                err.to_string(),
                Some(json!({"executionId": execution_id, "from": from, "to": to})),
            ),
            CoordinatorError::Invalid(_) => {
                Self::failure(StatusCode::BAD_REQUEST, "validation_error", err.to_string(), None)
            }
            CoordinatorError::Sqlite(_) | CoordinatorError::Storage(_) => Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                format!("{err:#}"),
                None,
            ),
        }
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ClaimCoordinator) -> CoordinatorResult<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let coordinator = self.coordinator.clone();
        let handle = tokio::task::spawn_blocking(move || op(coordinator));
        let timeout_ms = u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX);
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                Self::failure(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "timeout",
                    format!("{operation_label} timed out after {timeout_ms} ms"),
                    Some(json!({ "timeout_ms": timeout_ms })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify(&err);
                if failure.status.is_server_error() {
                    warn!(
                        operation = operation_label,
                        error = %failure.message,
                        "coordinator operation failed"
                    );
                }
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

pub fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/executions", post(create_execution))
        .route("/executions/pending", get(list_pending))
        .route("/executions/:execution_id", get(get_execution))
        .route("/executions/:execution_id/claim", post(claim_execution))
        .route("/executions/:execution_id/status", patch(update_status))
        .route("/executions/:execution_id/history", get(status_history))
        .route("/kill-switch", get(get_kill_switch).put(set_kill_switch))
        .route("/verification-metrics", post(submit_verification_metrics))
        .route("/rollbacks", post(submit_rollback))
        .with_state(state)
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn create_execution(
    State(state): State<ServiceState>,
    payload: Result<Json<NewExecution>, JsonRejection>,
) -> Result<(StatusCode, Json<ExecutionRequest>), ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let record = state
        .run_blocking("create_execution", move |coordinator| {
            coordinator.create_execution(&request)
        })
        .await?;
    info!(execution_id = %record.id, connection_id = %record.connection_id, "execution scheduled");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_pending(
    State(state): State<ServiceState>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Vec<ExecutionRequest>>, ServiceFailure> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PENDING_LIMIT)
        .min(MAX_PENDING_LIMIT);
    let connection_ids: Vec<String> = query
        .connection_id
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    let records = state
        .run_blocking("list_pending", move |coordinator| {
            coordinator.list_pending(limit, &connection_ids)
        })
        .await?;
    Ok(Json(records))
}

async fn get_execution(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ExecutionRequest>, ServiceFailure> {
    let execution_id = state.parse_execution_id(&raw_id)?;
    let record = state
        .run_blocking("get_execution", move |coordinator| {
            coordinator
                .get_execution(execution_id)?
                .ok_or_else(|| CoordinatorError::NotFound(execution_id.to_string()))
        })
        .await?;
    Ok(Json(record))
}

async fn claim_execution(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<Option<ExecutionRequest>>, ServiceFailure> {
    let execution_id = state.parse_execution_id(&raw_id)?;
    let outcome = state
        .run_blocking("claim", move |coordinator| coordinator.claim(execution_id))
        .await?;
    match outcome {
        ClaimOutcome::Claimed(record) => {
            state.telemetry.claims_won_total.fetch_add(1, Ordering::Relaxed);
            info!(%execution_id, "execution claimed");
            Ok(Json(record))
        }
        ClaimOutcome::Conflict { reason } => {
            state
                .telemetry
                .claims_conflict_total
                .fetch_add(1, Ordering::Relaxed);
            Err(ServiceState::failure(
                StatusCode::CONFLICT,
                "claim_conflict",
                reason,
                Some(json!({"executionId": execution_id})),
            ))
        }
    }
}

async fn update_status(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<StatusUpdate>, JsonRejection>,
) -> Result<Json<ExecutionRequest>, ServiceFailure> {
    let execution_id = state.parse_execution_id(&raw_id)?;
    let Json(update) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let record = state
        .run_blocking("update_status", move |coordinator| {
            coordinator.update_status(execution_id, &update)
        })
        .await?;
    info!(execution_id = %record.id, status = %record.status, "execution status updated");
    Ok(Json(record))
}

async fn status_history(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<Vec<StatusHistoryEntry>>, ServiceFailure> {
    let execution_id = state.parse_execution_id(&raw_id)?;
    let history = state
        .run_blocking("status_history", move |coordinator| {
            coordinator.status_history(execution_id)
        })
        .await?;
    Ok(Json(history))
}

async fn get_kill_switch(
    State(state): State<ServiceState>,
    Query(query): Query<KillSwitchQuery>,
) -> Result<Json<KillSwitchState>, ServiceFailure> {
    let kill_switch = state
        .run_blocking("kill_switch", move |coordinator| {
            coordinator.kill_switch(query.connection_id.as_deref())
        })
        .await?;
    Ok(Json(kill_switch))
}

async fn set_kill_switch(
    State(state): State<ServiceState>,
    payload: Result<Json<KillSwitchUpdate>, JsonRejection>,
) -> Result<Json<KillSwitchState>, ServiceFailure> {
    let Json(update) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let scope = update.connection_id.clone();
    let active = update.active;
    let kill_switch = state
        .run_blocking("set_kill_switch", move |coordinator| {
            coordinator.set_kill_switch(&update)
        })
        .await?;
    warn!(scope = scope.as_deref().unwrap_or("global"), active, "kill switch changed");
    Ok(Json(kill_switch))
}

async fn submit_verification_metrics(
    State(state): State<ServiceState>,
    payload: Result<Json<VerificationMetricsSubmission>, JsonRejection>,
) -> Result<Json<MetricsAccepted>, ServiceFailure> {
    let Json(submission) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let execution_id = submission.execution_id;
    let stored = state
        .run_blocking("record_verification_metrics", move |coordinator| {
            coordinator.record_verification_metrics(&submission)
        })
        .await?;
    Ok(Json(MetricsAccepted {
        execution_id,
        stored,
    }))
}

async fn submit_rollback(
    State(state): State<ServiceState>,
    payload: Result<Json<RollbackRecord>, JsonRejection>,
) -> Result<StatusCode, ServiceFailure> {
    let Json(record) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let execution_id = record.execution_id;
    let rollback_status = record.status;
    state
        .run_blocking("record_rollback", move |coordinator| {
            coordinator.record_rollback(&record)
        })
        .await?;
    info!(%execution_id, status = rollback_status.as_str(), "rollback recorded");
    Ok(StatusCode::CREATED)
}
