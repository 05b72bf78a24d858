use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use schema_steward_domain::{
    ensure_non_empty, ClaimOutcome, ExecutionId, ExecutionRequest, KillSwitchState,
    RollbackRecord, StatusUpdate, VerificationMetricsSubmission,
};
use serde_json::Value;
use tracing::warn;

use crate::{ControlPlane, KillSwitchSource, DEFAULT_CALL_TIMEOUT};

#[derive(Debug, Clone)]
pub struct HttpControlPlaneConfig {
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
}

impl HttpControlPlaneConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: None,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// JSON-over-HTTP client for the coordinator service.
///
/// `ureq` is blocking, so each call runs on the blocking pool and is bounded
/// by both the agent timeout and an outer `tokio` timeout.
#[derive(Clone)]
pub struct HttpControlPlane {
    base_url: String,
    agent: ureq::Agent,
    bearer_token: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpControlPlane")
            .field("base_url", &self.base_url)
            .field("has_token", &self.bearer_token.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpControlPlane {
    /// # Errors
    /// Returns an error when `base_url` is empty.
    pub fn new(config: HttpControlPlaneConfig) -> Result<Self> {
        ensure_non_empty("base_url", &config.base_url)?;
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            agent,
            bearer_token: config.bearer_token,
            timeout: config.timeout,
        })
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let mut req = self
            .agent
            .request(method, &format!("{}{path}", self.base_url))
            .set("accept", "application/json");
        if let Some(token) = &self.bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }
        req
    }

    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Self) -> Result<T> + Send + 'static,
    {
        let client = self.clone();
        let handle = tokio::task::spawn_blocking(move || op(client));
        let joined = tokio::time::timeout(self.timeout, handle)
            .await
            .map_err(|_| {
                anyhow!(
                    "{operation_label} timed out after {} ms",
                    self.timeout.as_millis()
                )
            })?;
        joined.map_err(|err| anyhow!("{operation_label} join failure: {err}"))?
    }
}

fn require_success(
    operation_label: &str,
    result: Result<ureq::Response, ureq::Error>,
) -> Result<ureq::Response> {
    match result {
        Ok(response) => Ok(response),
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            Err(anyhow!(
                "{operation_label} rejected with http status {code}: {body}"
            ))
        }
        Err(ureq::Error::Transport(err)) => {
            Err(anyhow!("{operation_label} transport failure: {err}"))
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn list_pending(
        &self,
        limit: usize,
        connection_ids: &[String],
    ) -> Result<Vec<ExecutionRequest>> {
        let connection_filter = connection_ids.join(",");
        self.run_blocking("list_pending", move |client| {
            let mut req = client
                .request("GET", "/executions/pending")
                .query("limit", &limit.to_string());
            if !connection_filter.is_empty() {
                req = req.query("connectionId", &connection_filter);
            }
            let response = require_success("list_pending", req.call())?;
            Ok(response.into_json::<Vec<ExecutionRequest>>()?)
        })
        .await
    }

    async fn claim(&self, execution_id: ExecutionId) -> Result<ClaimOutcome> {
        self.run_blocking("claim", move |client| {
            let req = client.request("POST", &format!("/executions/{execution_id}/claim"));
            match req.call() {
                Ok(response) => {
                    let status = response.status();
                    let record = match response.into_json::<ExecutionRequest>() {
                        Ok(record) => Some(record),
                        Err(err) => {
                            warn!(
                                %execution_id,
                                status,
                                error = %err,
                                "claim granted with unreadable body"
                            );
                            None
                        }
                    };
                    Ok(ClaimOutcome::Claimed(record))
                }
                Err(ureq::Error::Status(code, response)) => {
                    let body = response.into_string().unwrap_or_default();
                    Ok(ClaimOutcome::Conflict {
                        reason: format!("http status {code}: {body}"),
                    })
                }
                Err(ureq::Error::Transport(err)) => Err(anyhow!("claim transport failure: {err}")),
            }
        })
        .await
    }

    async fn update_status(&self, execution_id: ExecutionId, update: &StatusUpdate) -> Result<()> {
        let body = serde_json::to_value(update)?;
        self.run_blocking("update_status", move |client| {
            let req = client
                .request("PATCH", &format!("/executions/{execution_id}/status"))
                .set("content-type", "application/json");
            require_success("update_status", req.send_json(body))?;
            Ok(())
        })
        .await
    }

    async fn submit_verification_metrics(
        &self,
        submission: &VerificationMetricsSubmission,
    ) -> Result<()> {
        let body = serde_json::to_value(submission)?;
        self.run_blocking("submit_verification_metrics", move |client| {
            let req = client
                .request("POST", "/verification-metrics")
                .set("content-type", "application/json");
            require_success("submit_verification_metrics", req.send_json(body))?;
            Ok(())
        })
        .await
    }

    async fn submit_rollback(&self, record: &RollbackRecord) -> Result<()> {
        let body = serde_json::to_value(record)?;
        self.run_blocking("submit_rollback", move |client| {
            let req = client
                .request("POST", "/rollbacks")
                .set("content-type", "application/json");
            require_success("submit_rollback", req.send_json(body))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl KillSwitchSource for HttpControlPlane {
    async fn fetch(&self, connection_id: &str) -> Result<KillSwitchState> {
        let connection_id = connection_id.to_string();
        self.run_blocking("kill_switch", move |client| {
            let req = client
                .request("GET", "/kill-switch")
                .query("connectionId", &connection_id);
            let response = require_success("kill_switch", req.call())?;
            let raw: Value = response.into_json()?;
            let state: KillSwitchState = serde_json::from_value(raw)
                .map_err(|err| anyhow!("malformed kill switch payload: {err}"))?;
            Ok(state)
        })
        .await
    }
}
