use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{
    handlers::{events, health, jobs, webhooks},
    infra::app_state::AppState,
};

pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(jobs::enqueue_job))
        .route("/jobs/{job_id}", get(jobs::get_job))
        .route("/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .route("/audits/{audit_id}/jobs", get(jobs::list_audit_jobs))
        .route("/audits/{audit_id}/events", get(events::list_events))
        .route(
            "/tenants/{tenant_id}/webhooks",
            post(webhooks::register_webhook).get(webhooks::list_tenant_webhooks),
        )
        .route(
            "/webhooks/{webhook_id}/deliveries",
            get(webhooks::list_deliveries),
        )
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .nest("/v1", create_v1_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
