//! Adapter that runs audits on an external executor over HTTP.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use auditq_core::{
    AuditContext, AuditId, AuditPipeline, ExecutionError, JobId, TenantId,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    job_id: JobId,
    audit_id: AuditId,
    tenant_id: TenantId,
    attempt: i32,
    payload: &'a Value,
}

/// POSTs each claimed job to `endpoint` and maps the answer:
/// 2xx is the result, 4xx is terminal, 5xx and network errors are retryable.
#[derive(Clone)]
pub struct HttpAuditPipeline {
    client: reqwest::Client,
    endpoint: String,
}

impl fmt::Debug for HttpAuditPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAuditPipeline")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl HttpAuditPipeline {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("auditq/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl AuditPipeline for HttpAuditPipeline {
    async fn execute(
        &self,
        ctx: &AuditContext,
        payload: &Value,
    ) -> Result<Value, ExecutionError> {
        let request = ExecuteRequest {
            job_id: ctx.job_id,
            audit_id: ctx.audit_id,
            tenant_id: ctx.tenant_id,
            attempt: ctx.attempt,
            payload,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutionError::retryable("executor timed out")
                } else {
                    ExecutionError::retryable(format!("executor unreachable: {e}"))
                }
            })?;

        let status = response.status();
        debug!(
            target: "auditq::worker",
            job_id = %ctx.job_id,
            status = status.as_u16(),
            "executor answered"
        );
        let body = response.text().await.map_err(|e| {
            ExecutionError::retryable(format!("failed to read executor response: {e}"))
        })?;
        classify(status.as_u16(), &body)
    }
}

fn classify(status: u16, body: &str) -> Result<Value, ExecutionError> {
    match status {
        200..=299 if body.trim().is_empty() => Ok(Value::Null),
        200..=299 => serde_json::from_str(body).map_err(|e| {
            ExecutionError::terminal(format!("executor returned invalid JSON: {e}"))
        }),
        400..=499 => Err(ExecutionError::terminal(error_message(status, body))),
        _ => Err(ExecutionError::retryable(error_message(status, body))),
    }
}

fn error_message(status: u16, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return format!("executor answered {status}");
    }
    let mut cut = body.len().min(ERROR_BODY_LIMIT);
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("executor answered {status}: {}", &body[..cut])
}
