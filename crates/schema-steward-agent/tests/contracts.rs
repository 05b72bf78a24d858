use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use schema_steward_domain::{
    ExecutionId, ExecutionRequest, ExecutionStatus, FailReason, KillSwitchState, MetricSnapshot,
    RollbackRecord, RollbackStatus, RollbackType, StatusUpdate, VerificationMetricsSubmission,
};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

fn contract_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../contracts/v1")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize contract root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn validation_errors(schema_file: &str, value: &Value) -> Vec<String> {
    let schema_path = contract_root().join(schema_file);
    let schema = read_json(&schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect())
        .unwrap_or_default()
}

fn assert_schema(schema_file: &str, value: &impl Serialize) {
    let value = serde_json::to_value(value)
        .unwrap_or_else(|err| panic!("failed to serialize for {schema_file}: {err}"));
    let errors = validation_errors(schema_file, &value);
    assert!(
        errors.is_empty(),
        "schema validation failed for {schema_file}:\n{}",
        errors.join("\n")
    );
}

fn fixed_time() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_767_225_600)
        .unwrap_or_else(|err| panic!("invalid fixed timestamp: {err}"))
}

fn snapshot(fingerprint: &str, latency: f64) -> MetricSnapshot {
    MetricSnapshot {
        fingerprint: fingerprint.to_string(),
        execution_count: 40,
        avg_latency_ms: latency,
        rows_examined: 12_000,
        full_scan_count: 0,
        sample_count: 40,
        window_minutes: None,
    }
}

fn request() -> ExecutionRequest {
    ExecutionRequest {
        id: ExecutionId::new().to_string(),
        connection_id: "conn-primary".to_string(),
        action: "ADD_INDEX".to_string(),
        table_name: "orders".to_string(),
        index_name: "idx_orders_customer_id".to_string(),
        columns: vec!["customer_id".to_string(), "created_at".to_string()],
        query_fingerprints: vec!["3f9a1c".to_string()],
        status: ExecutionStatus::Running,
        fail_reason: None,
        message: None,
        created_at: fixed_time(),
        started_at: Some(fixed_time()),
        completed_at: None,
    }
}

#[test]
fn execution_request_matches_contract() {
    assert_schema("execution_request.schema.json", &request());

    let mut finished = request();
    finished.status = ExecutionStatus::RolledBack;
    finished.fail_reason = Some(FailReason::KillSwitch);
    finished.message = Some("kill switch activated after ddl; rolled back".to_string());
    finished.completed_at = Some(fixed_time());
    assert_schema("execution_request.schema.json", &finished);
}

#[test]
fn status_updates_match_contract() {
    assert_schema(
        "status_update.schema.json",
        &StatusUpdate::new(ExecutionStatus::Completed),
    );
    assert_schema(
        "status_update.schema.json",
        &StatusUpdate::new(ExecutionStatus::Failed)
            .with_reason(FailReason::ExecutionError)
            .with_message("Duplicate key name 'idx_orders_customer_id'"),
    );
}

#[test]
fn kill_switch_states_match_contract() {
    assert_schema("kill_switch_state.schema.json", &KillSwitchState::default());
    assert_schema(
        "kill_switch_state.schema.json",
        &KillSwitchState::fully_blocked("kill switch unreadable"),
    );
}

#[test]
fn metrics_submission_matches_contract() {
    let mut after = snapshot("3f9a1c", 1.2);
    after.window_minutes = Some(5);
    let submission = VerificationMetricsSubmission {
        execution_id: ExecutionId::new(),
        before_metrics: vec![snapshot("3f9a1c", 8.4)],
        after_metrics: vec![after],
    };
    assert_schema("verification_metrics_submission.schema.json", &submission);
}

#[test]
fn rollback_records_match_contract() {
    let completed = RollbackRecord {
        execution_id: ExecutionId::new(),
        rollback_type: RollbackType::Auto,
        trigger_reason: FailReason::VerificationFailed,
        rollback_sql: "ALTER TABLE `orders` DROP INDEX `idx_orders_customer_id`".to_string(),
        status: RollbackStatus::Completed,
        error_text: None,
        recorded_at: fixed_time(),
    };
    assert_schema("rollback_record.schema.json", &completed);

    let failed = RollbackRecord {
        status: RollbackStatus::Failed,
        error_text: Some("Lock wait timeout exceeded".to_string()),
        trigger_reason: FailReason::KillSwitch,
        ..completed
    };
    assert_schema("rollback_record.schema.json", &failed);
}

#[test]
fn contract_rejects_out_of_scope_rollback_trigger() {
    let record = RollbackRecord {
        execution_id: ExecutionId::new(),
        rollback_type: RollbackType::Auto,
        trigger_reason: FailReason::OutOfScope,
        rollback_sql: "ALTER TABLE `orders` DROP INDEX `idx_a`".to_string(),
        status: RollbackStatus::Completed,
        error_text: None,
        recorded_at: fixed_time(),
    };
    let value = serde_json::to_value(&record)
        .unwrap_or_else(|err| panic!("failed to serialize rollback record: {err}"));
    assert!(!validation_errors("rollback_record.schema.json", &value).is_empty());
}
