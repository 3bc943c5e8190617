use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::WebhookStore;
use crate::{
    clock::{Clock, SharedClock},
    error::{PipelineError, Result},
    ids::{DeliveryId, TenantId, WebhookId},
    store::lease_deadline,
    webhook::{
        DeliveryFailure, DeliveryStatus, DueDelivery, NewDelivery, NewWebhook,
        Webhook, WebhookDelivery,
    },
};

const DELIVERY_COLUMNS: &str = "delivery_id, webhook_id, tenant_id, \
     event_type, payload, status, attempts, max_attempts, next_retry_at, \
     response_code, response_body, error_message, created_at, delivered_at";

#[derive(Debug, FromRow)]
struct WebhookRow {
    webhook_id: Uuid,
    tenant_id: Uuid,
    url: String,
    secret: String,
    events: Vec<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<WebhookRow> for Webhook {
    fn from(row: WebhookRow) -> Self {
        Webhook {
            webhook_id: WebhookId(row.webhook_id),
            tenant_id: TenantId(row.tenant_id),
            url: row.url,
            secret: row.secret,
            events: row.events,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DeliveryRow {
    delivery_id: Uuid,
    webhook_id: Uuid,
    tenant_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_retry_at: DateTime<Utc>,
    response_code: Option<i32>,
    response_body: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeliveryRow> for WebhookDelivery {
    type Error = PipelineError;

    fn try_from(row: DeliveryRow) -> Result<Self> {
        Ok(WebhookDelivery {
            delivery_id: DeliveryId(row.delivery_id),
            webhook_id: WebhookId(row.webhook_id),
            tenant_id: TenantId(row.tenant_id),
            event_type: row.event_type,
            payload: row.payload,
            status: row.status.parse()?,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            next_retry_at: row.next_retry_at,
            response_code: row.response_code,
            response_body: row.response_body,
            error_message: row.error_message,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct DueRow {
    #[sqlx(flatten)]
    delivery: DeliveryRow,
    url: String,
    secret: String,
    is_active: bool,
}

#[derive(Clone)]
pub struct PgWebhookStore {
    pool: PgPool,
    clock: SharedClock,
}

impl fmt::Debug for PgWebhookStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgWebhookStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PgWebhookStore {
    pub fn new(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl WebhookStore for PgWebhookStore {
    async fn register(&self, webhook: NewWebhook) -> Result<Webhook> {
        webhook.validate()?;
        let webhook = webhook.into_webhook(self.clock.now());
        let row = sqlx::query_as::<_, WebhookRow>(
            r#"
            INSERT INTO webhooks (
                webhook_id, tenant_id, url, secret, events, is_active,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, TRUE, $6)
            RETURNING webhook_id, tenant_id, url, secret, events, is_active,
                      created_at
            "#,
        )
        .bind(webhook.webhook_id.as_uuid())
        .bind(webhook.tenant_id.as_uuid())
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(&webhook.events)
        .bind(webhook.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get(&self, webhook_id: WebhookId) -> Result<Webhook> {
        sqlx::query_as::<_, WebhookRow>(
            r#"
            SELECT webhook_id, tenant_id, url, secret, events, is_active,
                   created_at
            FROM webhooks
            WHERE webhook_id = $1
            "#,
        )
        .bind(webhook_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Webhook::from)
        .ok_or_else(|| PipelineError::NotFound(format!("webhook {webhook_id}")))
    }

    async fn list_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, WebhookRow>(
            r#"
            SELECT webhook_id, tenant_id, url, secret, events, is_active,
                   created_at
            FROM webhooks
            WHERE tenant_id = $1
            ORDER BY created_at, webhook_id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Webhook::from).collect())
    }

    async fn set_active(
        &self,
        webhook_id: WebhookId,
        is_active: bool,
    ) -> Result<Webhook> {
        sqlx::query_as::<_, WebhookRow>(
            r#"
            UPDATE webhooks
            SET is_active = $2
            WHERE webhook_id = $1
            RETURNING webhook_id, tenant_id, url, secret, events, is_active,
                      created_at
            "#,
        )
        .bind(webhook_id.as_uuid())
        .bind(is_active)
        .fetch_optional(&self.pool)
        .await?
        .map(Webhook::from)
        .ok_or_else(|| PipelineError::NotFound(format!("webhook {webhook_id}")))
    }

    async fn subscribed(
        &self,
        tenant_id: TenantId,
        event_type: &str,
    ) -> Result<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, WebhookRow>(
            r#"
            SELECT webhook_id, tenant_id, url, secret, events, is_active,
                   created_at
            FROM webhooks
            WHERE tenant_id = $1
              AND is_active
              AND $2 = ANY(events)
            ORDER BY created_at, webhook_id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Webhook::from).collect())
    }

    async fn create_deliveries(
        &self,
        deliveries: Vec<NewDelivery>,
    ) -> Result<Vec<WebhookDelivery>> {
        let now = self.clock.now();
        let sql = format!(
            r#"
            INSERT INTO webhook_deliveries (
                delivery_id, webhook_id, tenant_id, event_type, payload,
                status, attempts, max_attempts, next_retry_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $7)
            RETURNING {DELIVERY_COLUMNS}
            "#
        );

        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(deliveries.len());
        for new in deliveries {
            let delivery = new.into_delivery(now);
            let row = sqlx::query_as::<_, DeliveryRow>(&sql)
                .bind(delivery.delivery_id.as_uuid())
                .bind(delivery.webhook_id.as_uuid())
                .bind(delivery.tenant_id.as_uuid())
                .bind(&delivery.event_type)
                .bind(&delivery.payload)
                .bind(delivery.max_attempts)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
            created.push(WebhookDelivery::try_from(row)?);
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn due_deliveries(
        &self,
        limit: usize,
        in_flight: Duration,
    ) -> Result<Vec<DueDelivery>> {
        let now = self.clock.now();
        let sql = format!(
            r#"
            WITH due AS (
                SELECT delivery_id
                FROM webhook_deliveries
                WHERE status = 'pending'
                  AND attempts < max_attempts
                  AND next_retry_at <= $1
                ORDER BY next_retry_at, delivery_id
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            ), claimed AS (
                UPDATE webhook_deliveries d
                SET next_retry_at = $3
                FROM due
                WHERE d.delivery_id = due.delivery_id
                RETURNING d.*
            )
            SELECT c.{columns}, w.url, w.secret, w.is_active
            FROM claimed c
            JOIN webhooks w ON w.webhook_id = c.webhook_id
            ORDER BY c.created_at, c.delivery_id
            "#,
            columns = DELIVERY_COLUMNS.replace(", ", ", c."),
        );
        let rows = sqlx::query_as::<_, DueRow>(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(lease_deadline(now, in_flight))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DueDelivery {
                    delivery: WebhookDelivery::try_from(row.delivery)?,
                    url: row.url,
                    secret: row.secret,
                    is_active: row.is_active,
                })
            })
            .collect()
    }

    async fn record_success(
        &self,
        delivery_id: DeliveryId,
        response_code: i32,
        response_body: Option<String>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'delivered',
                attempts = attempts + 1,
                response_code = $2,
                response_body = $3,
                error_message = NULL,
                delivered_at = $4
            WHERE delivery_id = $1 AND status = 'pending'
            "#,
        )
        .bind(delivery_id.as_uuid())
        .bind(response_code)
        .bind(response_body)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn record_failure(
        &self,
        delivery_id: DeliveryId,
        failure: DeliveryFailure,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET attempts = attempts + 1,
                status = CASE WHEN $3::timestamptz IS NULL
                              THEN 'failed' ELSE 'pending' END,
                next_retry_at = COALESCE($3, next_retry_at),
                response_code = $4,
                response_body = $5,
                error_message = $6
            WHERE delivery_id = $1
              AND status = 'pending'
              AND attempts = $2
            "#,
        )
        .bind(delivery_id.as_uuid())
        .bind(failure.expected_attempts)
        .bind(failure.next_retry_at)
        .bind(failure.response_code)
        .bind(failure.response_body)
        .bind(failure.error_message)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn get_delivery(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<WebhookDelivery> {
        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries \
             WHERE delivery_id = $1"
        );
        sqlx::query_as::<_, DeliveryRow>(&sql)
            .bind(delivery_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(WebhookDelivery::try_from)
            .transpose()?
            .ok_or_else(|| {
                PipelineError::NotFound(format!("delivery {delivery_id}"))
            })
    }

    async fn list_deliveries(
        &self,
        webhook_id: WebhookId,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<WebhookDelivery>> {
        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries \
             WHERE webhook_id = $1 AND ($2::text IS NULL OR status = $2) \
             ORDER BY created_at, delivery_id"
        );
        sqlx::query_as::<_, DeliveryRow>(&sql)
            .bind(webhook_id.as_uuid())
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(WebhookDelivery::try_from)
            .collect()
    }
}
