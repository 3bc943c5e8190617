use std::{fmt, sync::Arc};

use serde::Serialize;
use tracing::debug;

use super::{NewDelivery, WebhookDelivery, WebhookStore};
use crate::{
    clock::{Clock, SharedClock},
    error::Result,
    ids::{AuditId, TenantId},
};

/// Wire body posted to tenant endpoints.
#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    event_type: &'a str,
    audit_id: AuditId,
    tenant_id: TenantId,
    timestamp: String,
    data: serde_json::Value,
}

/// Turns pipeline outcomes into pending deliveries, one per active webhook
/// subscribed to the event. Sending is left to the
/// [`DeliveryWorker`](super::DeliveryWorker).
#[derive(Clone)]
pub struct WebhookNotifier {
    store: Arc<dyn WebhookStore>,
    clock: SharedClock,
    max_attempts: i32,
}

impl fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("store", &self.store)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl WebhookNotifier {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        clock: SharedClock,
        max_attempts: i32,
    ) -> Self {
        Self {
            store,
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn WebhookStore> {
        &self.store
    }

    pub async fn notify(
        &self,
        tenant_id: TenantId,
        audit_id: AuditId,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<Vec<WebhookDelivery>> {
        let webhooks = self.store.subscribed(tenant_id, event_type).await?;
        if webhooks.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::to_value(WebhookBody {
            event_type,
            audit_id,
            tenant_id,
            timestamp: self.clock.now().to_rfc3339(),
            data,
        })?;
        let deliveries = webhooks
            .iter()
            .map(|webhook| NewDelivery {
                webhook_id: webhook.webhook_id,
                tenant_id,
                event_type: event_type.to_string(),
                payload: body.clone(),
                max_attempts: self.max_attempts,
            })
            .collect();

        let created = self.store.create_deliveries(deliveries).await?;
        debug!(
            target: "auditq::webhook",
            %audit_id,
            event_type,
            deliveries = created.len(),
            "queued webhook deliveries"
        );
        Ok(created)
    }
}
