//! At-least-once webhook notification: a durable outbox of deliveries per
//! tenant webhook, drained independently of job execution.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, Result},
    ids::{DeliveryId, TenantId, WebhookId},
};

pub mod backoff;
pub mod drainer;
pub mod notifier;
pub mod signing;
pub mod store;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use drainer::DeliveryWorker;
pub use notifier::WebhookNotifier;
pub use signing::{sign, verify_signature};
pub use store::{MemoryWebhookStore, WebhookStore};
#[cfg(feature = "database")]
pub use store::PgWebhookStore;
pub use transport::{DeliveryResponse, HttpTransport, WebhookTransport};

pub const AUDIT_COMPLETED: &str = "audit.completed";
pub const AUDIT_FAILED: &str = "audit.failed";
pub const AUDIT_CANCELED: &str = "audit.canceled";

pub const KNOWN_EVENTS: [&str; 3] = [AUDIT_COMPLETED, AUDIT_FAILED, AUDIT_CANCELED];

pub const DEFAULT_DELIVERY_ATTEMPTS: i32 = 5;

/// Error recorded on deliveries whose webhook was switched off after the
/// delivery was queued.
pub const WEBHOOK_INACTIVE: &str = "webhook inactive";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub webhook_id: WebhookId,
    pub tenant_id: TenantId,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub events: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|ev| ev == event_type)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct NewWebhook {
    pub tenant_id: TenantId,
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
}

impl NewWebhook {
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.url).map_err(|e| {
            PipelineError::InvalidInput(format!("webhook url: {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PipelineError::InvalidInput(
                "webhook url must be http or https".into(),
            ));
        }
        if self.secret.is_empty() {
            return Err(PipelineError::InvalidInput(
                "webhook secret must not be empty".into(),
            ));
        }
        if self.events.is_empty() {
            return Err(PipelineError::InvalidInput(
                "webhook must subscribe to at least one event".into(),
            ));
        }
        if let Some(unknown) =
            self.events.iter().find(|ev| !KNOWN_EVENTS.contains(&ev.as_str()))
        {
            return Err(PipelineError::InvalidInput(format!(
                "unknown webhook event '{unknown}'"
            )));
        }
        Ok(())
    }

    pub(crate) fn into_webhook(self, now: DateTime<Utc>) -> Webhook {
        let mut events = self.events;
        events.sort();
        events.dedup();
        Webhook {
            webhook_id: WebhookId::new(),
            tenant_id: self.tenant_id,
            url: self.url,
            secret: self.secret,
            events,
            is_active: true,
            created_at: now,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown delivery status '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub delivery_id: DeliveryId,
    pub webhook_id: WebhookId,
    pub tenant_id: TenantId,
    pub event_type: String,
    /// The JSON body posted to the endpoint.
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewDelivery {
    pub webhook_id: WebhookId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
}

impl NewDelivery {
    pub(crate) fn into_delivery(self, now: DateTime<Utc>) -> WebhookDelivery {
        WebhookDelivery {
            delivery_id: DeliveryId::new(),
            webhook_id: self.webhook_id,
            tenant_id: self.tenant_id,
            event_type: self.event_type,
            payload: self.payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            next_retry_at: now,
            response_code: None,
            response_body: None,
            error_message: None,
            created_at: now,
            delivered_at: None,
        }
    }
}

/// A claimed delivery plus the endpoint details needed to send it.
#[derive(Clone, PartialEq)]
pub struct DueDelivery {
    pub delivery: WebhookDelivery,
    pub url: String,
    pub secret: String,
    pub is_active: bool,
}

impl fmt::Debug for DueDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DueDelivery")
            .field("delivery_id", &self.delivery.delivery_id)
            .field("url", &self.url)
            .field("secret", &"<redacted>")
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// Outcome of one failed attempt, computed by the drainer.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryFailure {
    /// Attempts recorded on the row when it was claimed.
    pub expected_attempts: i32,
    /// `None` gives up: the row becomes `failed`.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: String,
}
