use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::WebhookStore;
use crate::{
    clock::{Clock, SharedClock, SystemClock},
    error::{PipelineError, Result},
    ids::{DeliveryId, TenantId, WebhookId},
    store::lease_deadline,
    webhook::{
        DeliveryFailure, DeliveryStatus, DueDelivery, NewDelivery, NewWebhook,
        Webhook, WebhookDelivery,
    },
};

#[derive(Default)]
struct Outbox {
    webhooks: HashMap<WebhookId, Webhook>,
    deliveries: HashMap<DeliveryId, WebhookDelivery>,
}

#[derive(Clone)]
pub struct MemoryWebhookStore {
    outbox: Arc<Mutex<Outbox>>,
    clock: SharedClock,
}

impl fmt::Debug for MemoryWebhookStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MemoryWebhookStore");
        match self.outbox.try_lock() {
            Ok(outbox) => {
                debug
                    .field("webhooks", &outbox.webhooks.len())
                    .field("deliveries", &outbox.deliveries.len());
            }
            Err(_) => {
                debug.field("outbox", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl Default for MemoryWebhookStore {
    fn default() -> Self {
        Self::new(SystemClock::shared())
    }
}

impl MemoryWebhookStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            outbox: Arc::new(Mutex::new(Outbox::default())),
            clock,
        }
    }
}

fn sorted_by_creation(mut rows: Vec<WebhookDelivery>) -> Vec<WebhookDelivery> {
    rows.sort_by_key(|d| (d.created_at, d.delivery_id));
    rows
}

#[async_trait]
impl WebhookStore for MemoryWebhookStore {
    async fn register(&self, webhook: NewWebhook) -> Result<Webhook> {
        webhook.validate()?;
        let webhook = webhook.into_webhook(self.clock.now());
        self.outbox
            .lock()
            .await
            .webhooks
            .insert(webhook.webhook_id, webhook.clone());
        Ok(webhook)
    }

    async fn get(&self, webhook_id: WebhookId) -> Result<Webhook> {
        self.outbox
            .lock()
            .await
            .webhooks
            .get(&webhook_id)
            .cloned()
            .ok_or_else(|| {
                PipelineError::NotFound(format!("webhook {webhook_id}"))
            })
    }

    async fn list_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<Webhook>> {
        let outbox = self.outbox.lock().await;
        let mut hooks: Vec<Webhook> = outbox
            .webhooks
            .values()
            .filter(|w| w.tenant_id == tenant_id)
            .cloned()
            .collect();
        hooks.sort_by_key(|w| (w.created_at, w.webhook_id));
        Ok(hooks)
    }

    async fn set_active(
        &self,
        webhook_id: WebhookId,
        is_active: bool,
    ) -> Result<Webhook> {
        let mut outbox = self.outbox.lock().await;
        let webhook = outbox.webhooks.get_mut(&webhook_id).ok_or_else(|| {
            PipelineError::NotFound(format!("webhook {webhook_id}"))
        })?;
        webhook.is_active = is_active;
        Ok(webhook.clone())
    }

    async fn subscribed(
        &self,
        tenant_id: TenantId,
        event_type: &str,
    ) -> Result<Vec<Webhook>> {
        Ok(self
            .list_for_tenant(tenant_id)
            .await?
            .into_iter()
            .filter(|w| w.is_active && w.subscribes_to(event_type))
            .collect())
    }

    async fn create_deliveries(
        &self,
        deliveries: Vec<NewDelivery>,
    ) -> Result<Vec<WebhookDelivery>> {
        let now = self.clock.now();
        let mut outbox = self.outbox.lock().await;
        let mut created = Vec::with_capacity(deliveries.len());
        for new in deliveries {
            if !outbox.webhooks.contains_key(&new.webhook_id) {
                return Err(PipelineError::NotFound(format!(
                    "webhook {}",
                    new.webhook_id
                )));
            }
            let delivery = new.into_delivery(now);
            outbox
                .deliveries
                .insert(delivery.delivery_id, delivery.clone());
            created.push(delivery);
        }
        Ok(created)
    }

    async fn due_deliveries(
        &self,
        limit: usize,
        in_flight: Duration,
    ) -> Result<Vec<DueDelivery>> {
        let now = self.clock.now();
        let hidden_until = lease_deadline(now, in_flight);
        let mut outbox = self.outbox.lock().await;

        let mut due: Vec<(chrono::DateTime<chrono::Utc>, DeliveryId)> = outbox
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Pending
                    && d.attempts < d.max_attempts
                    && d.next_retry_at <= now
            })
            .map(|d| (d.next_retry_at, d.delivery_id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, delivery_id) in due {
            let Some(delivery) = outbox.deliveries.get_mut(&delivery_id) else {
                continue;
            };
            delivery.next_retry_at = hidden_until;
            let delivery = delivery.clone();
            let Some(webhook) = outbox.webhooks.get(&delivery.webhook_id) else {
                continue;
            };
            claimed.push(DueDelivery {
                url: webhook.url.clone(),
                secret: webhook.secret.clone(),
                is_active: webhook.is_active,
                delivery,
            });
        }
        Ok(claimed)
    }

    async fn record_success(
        &self,
        delivery_id: DeliveryId,
        response_code: i32,
        response_body: Option<String>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut outbox = self.outbox.lock().await;
        let delivery =
            outbox.deliveries.get_mut(&delivery_id).ok_or_else(|| {
                PipelineError::NotFound(format!("delivery {delivery_id}"))
            })?;
        if delivery.status != DeliveryStatus::Pending {
            return Ok(false);
        }
        delivery.status = DeliveryStatus::Delivered;
        delivery.attempts += 1;
        delivery.response_code = Some(response_code);
        delivery.response_body = response_body;
        delivery.error_message = None;
        delivery.delivered_at = Some(now);
        Ok(true)
    }

    async fn record_failure(
        &self,
        delivery_id: DeliveryId,
        failure: DeliveryFailure,
    ) -> Result<bool> {
        let mut outbox = self.outbox.lock().await;
        let delivery =
            outbox.deliveries.get_mut(&delivery_id).ok_or_else(|| {
                PipelineError::NotFound(format!("delivery {delivery_id}"))
            })?;
        if delivery.status != DeliveryStatus::Pending
            || delivery.attempts != failure.expected_attempts
        {
            return Ok(false);
        }
        delivery.attempts += 1;
        delivery.response_code = failure.response_code;
        delivery.response_body = failure.response_body;
        delivery.error_message = Some(failure.error_message);
        match failure.next_retry_at {
            Some(at) => delivery.next_retry_at = at,
            None => delivery.status = DeliveryStatus::Failed,
        }
        Ok(true)
    }

    async fn get_delivery(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<WebhookDelivery> {
        self.outbox
            .lock()
            .await
            .deliveries
            .get(&delivery_id)
            .cloned()
            .ok_or_else(|| {
                PipelineError::NotFound(format!("delivery {delivery_id}"))
            })
    }

    async fn list_deliveries(
        &self,
        webhook_id: WebhookId,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<WebhookDelivery>> {
        let outbox = self.outbox.lock().await;
        Ok(sorted_by_creation(
            outbox
                .deliveries
                .values()
                .filter(|d| d.webhook_id == webhook_id)
                .filter(|d| status.is_none_or(|s| d.status == s))
                .cloned()
                .collect(),
        ))
    }
}
