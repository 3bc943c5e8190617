use std::time::Duration;

use async_trait::async_trait;

use super::{
    DeliveryFailure, DeliveryStatus, DueDelivery, NewDelivery, NewWebhook,
    Webhook, WebhookDelivery,
};
use crate::{
    error::Result,
    ids::{DeliveryId, TenantId, WebhookId},
};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::MemoryWebhookStore;
#[cfg(feature = "database")]
pub use postgres::PgWebhookStore;

/// Tenants own webhook rows; delivery rows are written by the notifier
/// (insert) and the drainer (every later update) only.
#[async_trait]
pub trait WebhookStore: Send + Sync + std::fmt::Debug {
    async fn register(&self, webhook: NewWebhook) -> Result<Webhook>;

    async fn get(&self, webhook_id: WebhookId) -> Result<Webhook>;

    async fn list_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<Webhook>>;

    async fn set_active(
        &self,
        webhook_id: WebhookId,
        is_active: bool,
    ) -> Result<Webhook>;

    /// Active webhooks of `tenant_id` subscribed to `event_type`.
    async fn subscribed(
        &self,
        tenant_id: TenantId,
        event_type: &str,
    ) -> Result<Vec<Webhook>>;

    async fn create_deliveries(
        &self,
        deliveries: Vec<NewDelivery>,
    ) -> Result<Vec<WebhookDelivery>>;

    /// Claim up to `limit` pending deliveries whose retry time has come.
    /// Claimed rows are hidden from other drainers for `in_flight`.
    async fn due_deliveries(
        &self,
        limit: usize,
        in_flight: Duration,
    ) -> Result<Vec<DueDelivery>>;

    /// Mark delivered. A row that is no longer pending is left untouched and
    /// `false` is returned.
    async fn record_success(
        &self,
        delivery_id: DeliveryId,
        response_code: i32,
        response_body: Option<String>,
    ) -> Result<bool>;

    /// Count a failed attempt; applied only while the row is pending with
    /// `failure.expected_attempts`.
    async fn record_failure(
        &self,
        delivery_id: DeliveryId,
        failure: DeliveryFailure,
    ) -> Result<bool>;

    async fn get_delivery(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<WebhookDelivery>;

    async fn list_deliveries(
        &self,
        webhook_id: WebhookId,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<WebhookDelivery>>;
}
