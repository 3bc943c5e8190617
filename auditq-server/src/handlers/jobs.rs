use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use auditq_core::{AuditId, AuditJob, JobId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::infra::{app_state::AppState, errors::AppResult};

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub tenant_id: TenantId,
    pub audit_id: AuditId,
    #[serde(default)]
    pub payload: Value,
    pub idempotency_key: String,
    pub max_attempts: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: JobId,
    pub created: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub canceled: bool,
}

/// 202 for a new job, 200 when the idempotency key was already accepted.
pub async fn enqueue_job(
    State(state): State<AppState>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<EnqueueResponse>)> {
    let Json(request) = body?;
    let enqueued = state
        .jobs
        .enqueue(
            request.tenant_id,
            request.audit_id,
            request.payload,
            request.idempotency_key,
            request.max_attempts,
        )
        .await?;

    let status = if enqueued.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(EnqueueResponse {
            job_id: enqueued.job_id,
            created: enqueued.created,
        }),
    ))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<AuditJob>> {
    Ok(Json(state.jobs.get(job_id).await?))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<CancelResponse>> {
    let canceled = state.jobs.cancel(job_id).await?;
    Ok(Json(CancelResponse { job_id, canceled }))
}

pub async fn list_audit_jobs(
    State(state): State<AppState>,
    Path(audit_id): Path<AuditId>,
) -> AppResult<Json<Vec<AuditJob>>> {
    Ok(Json(state.jobs.jobs_for_audit(audit_id).await?))
}
