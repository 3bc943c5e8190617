use std::{fmt, sync::Arc, time::Duration};

use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    BackoffPolicy, DeliveryFailure, DueDelivery, WEBHOOK_INACTIVE,
    WebhookStore,
    signing::{ATTEMPT_HEADER, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER},
    transport::{DeliveryResponse, OutboundWebhook, WebhookTransport},
};
use crate::{
    clock::{Clock, SharedClock},
    config::WebhookConfig,
    error::{DeliveryError, Result},
    store::lease_deadline,
    webhook::sign,
};

const SEND_CONCURRENCY: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Failed attempt with retries left.
    Retrying,
    /// Gave up.
    Failed,
    /// The row changed under us (another drainer got there first).
    Skipped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.delivered + self.retrying + self.failed + self.skipped
    }

    fn add(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered += 1,
            DeliveryOutcome::Retrying => self.retrying += 1,
            DeliveryOutcome::Failed => self.failed += 1,
            DeliveryOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Drains due webhook deliveries: sign, POST, record, schedule the retry.
/// Delivery errors stay in here; a dead endpoint never affects jobs.
#[derive(Clone)]
pub struct DeliveryWorker {
    store: Arc<dyn WebhookStore>,
    transport: Arc<dyn WebhookTransport>,
    clock: SharedClock,
    backoff: BackoffPolicy,
    batch_size: usize,
    in_flight: Duration,
    drain_interval: Duration,
    response_body_limit: usize,
}

impl fmt::Debug for DeliveryWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryWorker")
            .field("store", &self.store)
            .field("transport", &self.transport)
            .field("backoff", &self.backoff)
            .field("batch_size", &self.batch_size)
            .field("drain_interval", &self.drain_interval)
            .finish()
    }
}

/// Cut `body` to at most `limit` bytes without splitting a character.
pub(crate) fn truncate_body(mut body: String, limit: usize) -> String {
    if body.len() > limit {
        let mut cut = limit;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        transport: Arc<dyn WebhookTransport>,
        clock: SharedClock,
        config: &WebhookConfig,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            backoff: BackoffPolicy::from(config),
            batch_size: config.batch_size.max(1),
            in_flight: config.in_flight_timeout(),
            drain_interval: config.drain_interval(),
            response_body_limit: config.response_body_limit,
        }
    }

    /// Send every delivery that is due right now, once.
    pub async fn drain_once(&self) -> Result<DrainReport> {
        let due = self
            .store
            .due_deliveries(self.batch_size, self.in_flight)
            .await?;
        if due.is_empty() {
            return Ok(DrainReport::default());
        }

        let outcomes: Vec<DeliveryOutcome> = stream::iter(due)
            .map(|due| self.deliver(due))
            .buffer_unordered(SEND_CONCURRENCY)
            .collect()
            .await;

        let mut report = DrainReport::default();
        for outcome in outcomes {
            report.add(outcome);
        }
        debug!(target: "auditq::webhook", ?report, "drained webhook deliveries");
        Ok(report)
    }

    /// Drain until `shutdown` fires. A full batch is followed immediately by
    /// another pass; otherwise the loop idles for the drain interval.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(target: "auditq::webhook", "delivery drainer started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let idle = match self.drain_once().await {
                Ok(report) => report.total() < self.batch_size,
                Err(err) => {
                    error!(target: "auditq::webhook", "drain pass failed: {err}");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.drain_interval) => {}
                }
            }
        }
        info!(target: "auditq::webhook", "delivery drainer stopped");
    }

    async fn deliver(&self, due: DueDelivery) -> DeliveryOutcome {
        let delivery_id = due.delivery.delivery_id;
        match self.attempt(due).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Row stays hidden until the in-flight window passes, then
                // it is picked up again.
                error!(
                    target: "auditq::webhook",
                    %delivery_id,
                    "failed to record delivery attempt: {err}"
                );
                DeliveryOutcome::Skipped
            }
        }
    }

    async fn attempt(&self, due: DueDelivery) -> Result<DeliveryOutcome> {
        let delivery = &due.delivery;
        let attempt = delivery.attempts + 1;

        if !due.is_active {
            let recorded = self
                .store
                .record_failure(
                    delivery.delivery_id,
                    DeliveryFailure {
                        expected_attempts: delivery.attempts,
                        next_retry_at: None,
                        response_code: None,
                        response_body: None,
                        error_message: WEBHOOK_INACTIVE.to_string(),
                    },
                )
                .await?;
            warn!(
                target: "auditq::webhook",
                delivery_id = %delivery.delivery_id,
                webhook_id = %delivery.webhook_id,
                "webhook inactive; delivery dropped"
            );
            return Ok(if recorded {
                DeliveryOutcome::Failed
            } else {
                DeliveryOutcome::Skipped
            });
        }

        let sent = self.send(&due, attempt).await;
        let failure = match sent {
            Ok(response) if response.is_success() => {
                let body = truncate_body(response.body, self.response_body_limit);
                let recorded = self
                    .store
                    .record_success(
                        delivery.delivery_id,
                        i32::from(response.status),
                        Some(body),
                    )
                    .await?;
                if recorded {
                    info!(
                        target: "auditq::webhook",
                        delivery_id = %delivery.delivery_id,
                        attempt,
                        status = response.status,
                        "webhook delivered"
                    );
                    return Ok(DeliveryOutcome::Delivered);
                }
                return Ok(DeliveryOutcome::Skipped);
            }
            Ok(DeliveryResponse { status, body }) => {
                let body = truncate_body(body, self.response_body_limit);
                let err = DeliveryError::Status {
                    code: status,
                    body: body.clone(),
                };
                (Some(i32::from(status)), Some(body), err)
            }
            Err(err) => (None, None, err),
        };

        let (response_code, response_body, err) = failure;
        let give_up = attempt >= delivery.max_attempts;
        let next_retry_at = (!give_up).then(|| {
            lease_deadline(self.clock.now(), self.backoff.delay(attempt))
        });
        let recorded = self
            .store
            .record_failure(
                delivery.delivery_id,
                DeliveryFailure {
                    expected_attempts: delivery.attempts,
                    next_retry_at,
                    response_code,
                    response_body,
                    error_message: err.to_string(),
                },
            )
            .await?;

        if !recorded {
            return Ok(DeliveryOutcome::Skipped);
        }
        if give_up {
            warn!(
                target: "auditq::webhook",
                delivery_id = %delivery.delivery_id,
                attempt,
                "webhook delivery failed permanently: {err}"
            );
            Ok(DeliveryOutcome::Failed)
        } else {
            debug!(
                target: "auditq::webhook",
                delivery_id = %delivery.delivery_id,
                attempt,
                next_retry_at = ?next_retry_at,
                "webhook delivery failed; will retry: {err}"
            );
            Ok(DeliveryOutcome::Retrying)
        }
    }

    async fn send(
        &self,
        due: &DueDelivery,
        attempt: i32,
    ) -> std::result::Result<DeliveryResponse, DeliveryError> {
        let body = serde_json::to_vec(&due.delivery.payload)
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        let signature = sign(&due.secret, &body)?;
        self.transport
            .post(OutboundWebhook {
                url: due.url.clone(),
                body,
                headers: vec![
                    (SIGNATURE_HEADER, signature),
                    (EVENT_HEADER, due.delivery.event_type.clone()),
                    (DELIVERY_HEADER, due.delivery.delivery_id.to_string()),
                    (ATTEMPT_HEADER, attempt.to_string()),
                ],
            })
            .await
    }
}
