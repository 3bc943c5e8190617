use std::str::FromStr;

use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
};
use auditq_core::{
    TenantId, WebhookId,
    webhook::{DeliveryStatus, NewWebhook, Webhook, WebhookDelivery},
};
use serde::Deserialize;
use tracing::info;

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

#[derive(Debug, Deserialize)]
pub struct RegisterWebhookRequest {
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveriesQuery {
    pub status: Option<String>,
}

pub async fn register_webhook(
    State(state): State<AppState>,
    Path(tenant_id): Path<TenantId>,
    body: Result<Json<RegisterWebhookRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<Webhook>)> {
    let Json(request) = body?;
    let new_webhook = NewWebhook {
        tenant_id,
        url: request.url,
        secret: request.secret,
        events: request.events,
    };
    new_webhook.validate()?;

    let webhook = state.webhooks().register(new_webhook).await?;
    info!(
        target: "auditq::webhook",
        webhook_id = %webhook.webhook_id,
        %tenant_id,
        "webhook registered"
    );
    Ok((StatusCode::CREATED, Json(webhook)))
}

pub async fn list_tenant_webhooks(
    State(state): State<AppState>,
    Path(tenant_id): Path<TenantId>,
) -> AppResult<Json<Vec<Webhook>>> {
    Ok(Json(state.webhooks().list_for_tenant(tenant_id).await?))
}

pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(webhook_id): Path<WebhookId>,
    query: Result<Query<DeliveriesQuery>, QueryRejection>,
) -> AppResult<Json<Vec<WebhookDelivery>>> {
    let Query(query) = query?;
    let status = query
        .status
        .as_deref()
        .map(DeliveryStatus::from_str)
        .transpose()
        .map_err(AppError::from)?;

    // 404 for unknown webhooks rather than an empty list.
    state.webhooks().get(webhook_id).await?;
    Ok(Json(
        state.webhooks().list_deliveries(webhook_id, status).await?,
    ))
}
