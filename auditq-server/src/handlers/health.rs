use axum::{Json, extract::State};
use auditq_core::JobStats;
use serde::{Deserialize, Serialize};

use crate::infra::{app_state::AppState, errors::AppResult};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub queue_backend: String,
    pub jobs: JobStats,
}

pub async fn health(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let jobs = state.jobs.stats().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        queue_backend: state.jobs.queue().kind().as_str().to_string(),
        jobs,
    }))
}
