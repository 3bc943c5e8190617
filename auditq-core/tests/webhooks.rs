mod support;

use std::sync::Arc;

use anyhow::Result;
use auditq_core::{
    AuditId, Clock, TenantId,
    webhook::{
        AUDIT_COMPLETED, AUDIT_FAILED, DeliveryStatus, DeliveryWorker,
        WEBHOOK_INACTIVE, WebhookStore, WebhookTransport,
        signing::{DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER},
        verify_signature,
    },
};
use serde_json::json;
use support::{Harness, ScriptedTransport, header, new_webhook, webhook_config};

const FLAKY: &str = "https://tenant.example/flaky";
const DEAD: &str = "https://tenant.example/dead";

fn drainer(h: &Harness, transport: Arc<ScriptedTransport>) -> DeliveryWorker {
    DeliveryWorker::new(
        h.webhooks.clone() as Arc<dyn WebhookStore>,
        transport as Arc<dyn WebhookTransport>,
        h.shared_clock.clone(),
        &webhook_config(),
    )
}

#[tokio::test]
async fn flaky_endpoint_delivers_and_dead_endpoint_gives_up() -> Result<()> {
    let h = Harness::embedded();
    let tenant = TenantId::new();
    let flaky = h
        .webhooks
        .register(new_webhook(tenant, FLAKY, &[AUDIT_COMPLETED]))
        .await?;
    let dead = h
        .webhooks
        .register(new_webhook(tenant, DEAD, &[AUDIT_COMPLETED, AUDIT_FAILED]))
        .await?;

    let created = h
        .notifier
        .notify(tenant, AuditId::new(), AUDIT_COMPLETED, json!({ "score": 91 }))
        .await?;
    assert_eq!(created.len(), 2);

    let transport = ScriptedTransport::new();
    transport.script(FLAKY, [500, 200]);
    transport.always(DEAD, 500);
    let worker = drainer(&h, transport.clone());

    for _ in 0..8 {
        worker.drain_once().await?;
        // Past the one-hour backoff cap.
        h.advance(2 * 3600);
    }

    let flaky_rows = h.webhooks.list_deliveries(flaky.webhook_id, None).await?;
    assert_eq!(flaky_rows.len(), 1);
    assert_eq!(flaky_rows[0].status, DeliveryStatus::Delivered);
    assert_eq!(flaky_rows[0].attempts, 2);
    assert_eq!(flaky_rows[0].response_code, Some(200));
    assert!(flaky_rows[0].delivered_at.is_some());

    let dead_rows = h.webhooks.list_deliveries(dead.webhook_id, None).await?;
    assert_eq!(dead_rows.len(), 1);
    assert_eq!(dead_rows[0].status, DeliveryStatus::Failed);
    assert_eq!(dead_rows[0].attempts, 5);
    assert_eq!(dead_rows[0].response_code, Some(500));

    assert_eq!(transport.sent_to(FLAKY), 2);
    assert_eq!(transport.sent_to(DEAD), 5);
    Ok(())
}

#[tokio::test]
async fn failed_attempt_is_not_retried_before_backoff() -> Result<()> {
    let h = Harness::embedded();
    let tenant = TenantId::new();
    h.webhooks
        .register(new_webhook(tenant, DEAD, &[AUDIT_FAILED]))
        .await?;
    h.notifier
        .notify(tenant, AuditId::new(), AUDIT_FAILED, json!({}))
        .await?;

    let transport = ScriptedTransport::new();
    transport.always(DEAD, 503);
    let worker = drainer(&h, transport.clone());

    let first = worker.drain_once().await?;
    assert_eq!(first.retrying, 1);
    // Jittered delay is at least half the 30s base.
    h.advance(10);
    assert_eq!(worker.drain_once().await?.total(), 0);
    h.advance(30);
    assert_eq!(worker.drain_once().await?.retrying, 1);
    assert_eq!(transport.sent_to(DEAD), 2);
    Ok(())
}

#[tokio::test]
async fn retry_delays_grow_until_the_attempt_budget_runs_out() -> Result<()> {
    let h = Harness::embedded();
    let tenant = TenantId::new();
    h.webhooks
        .register(new_webhook(tenant, DEAD, &[AUDIT_COMPLETED]))
        .await?;
    let created = h
        .notifier
        .notify(tenant, AuditId::new(), AUDIT_COMPLETED, json!({}))
        .await?;
    let delivery_id = created[0].delivery_id;

    let transport = ScriptedTransport::new();
    transport.always(DEAD, 500);
    let worker = drainer(&h, transport.clone());

    let mut previous = chrono::Duration::zero();
    for attempt in 1..=5 {
        let attempted_at = h.clock.now();
        assert_eq!(worker.drain_once().await?.total(), 1);
        let row = h.webhooks.get_delivery(delivery_id).await?;
        assert_eq!(row.attempts, attempt);

        if attempt < 5 {
            assert_eq!(row.status, DeliveryStatus::Pending);
            let delay = row.next_retry_at - attempted_at;
            // 30s doubling per attempt, jittered down to no less than half.
            let full = chrono::Duration::seconds(30 << (attempt - 1));
            assert!(delay <= full, "attempt {attempt}: {delay} over {full}");
            assert!(delay >= full / 2, "attempt {attempt}: {delay} under half of {full}");
            assert!(delay >= previous, "attempt {attempt}: {delay} shrank from {previous}");
            previous = delay;
        } else {
            assert_eq!(row.status, DeliveryStatus::Failed);
        }
        h.advance(2 * 3600);
    }

    assert_eq!(worker.drain_once().await?.total(), 0);
    assert_eq!(transport.sent_to(DEAD), 5);
    Ok(())
}

#[tokio::test]
async fn posted_body_is_signed_and_verifiable() -> Result<()> {
    let h = Harness::embedded();
    let tenant = TenantId::new();
    let audit = AuditId::new();
    let hook = h
        .webhooks
        .register(new_webhook(tenant, FLAKY, &[AUDIT_COMPLETED]))
        .await?;
    let created = h
        .notifier
        .notify(tenant, audit, AUDIT_COMPLETED, json!({ "score": 12 }))
        .await?;

    let transport = ScriptedTransport::new();
    drainer(&h, transport.clone()).drain_once().await?;

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let request = &sent[0];
    let signature = header(request, SIGNATURE_HEADER).expect("signature header");
    assert!(signature.starts_with("sha256="));
    assert!(verify_signature(&hook.secret, &request.body, signature));
    assert!(!verify_signature("wrong secret", &request.body, signature));
    assert_eq!(header(request, EVENT_HEADER), Some(AUDIT_COMPLETED));
    assert_eq!(
        header(request, DELIVERY_HEADER),
        Some(created[0].delivery_id.to_string().as_str())
    );

    let body: serde_json::Value = serde_json::from_slice(&request.body)?;
    assert_eq!(body["event_type"], AUDIT_COMPLETED);
    assert_eq!(body["audit_id"], json!(audit));
    assert_eq!(body["tenant_id"], json!(tenant));
    assert_eq!(body["data"]["score"], 12);
    assert!(body["timestamp"].is_string());
    Ok(())
}

#[tokio::test]
async fn deliveries_to_deactivated_webhooks_fail_without_sending() -> Result<()> {
    let h = Harness::embedded();
    let tenant = TenantId::new();
    let hook = h
        .webhooks
        .register(new_webhook(tenant, FLAKY, &[AUDIT_COMPLETED]))
        .await?;
    h.notifier
        .notify(tenant, AuditId::new(), AUDIT_COMPLETED, json!({}))
        .await?;
    h.webhooks.set_active(hook.webhook_id, false).await?;

    let transport = ScriptedTransport::new();
    let report = drainer(&h, transport.clone()).drain_once().await?;
    assert_eq!(report.failed, 1);
    assert!(transport.sent().is_empty());

    let rows = h.webhooks.list_deliveries(hook.webhook_id, None).await?;
    assert_eq!(rows[0].status, DeliveryStatus::Failed);
    assert_eq!(rows[0].error_message.as_deref(), Some(WEBHOOK_INACTIVE));

    // Inactive webhooks get no new deliveries at all.
    let created = h
        .notifier
        .notify(tenant, AuditId::new(), AUDIT_COMPLETED, json!({}))
        .await?;
    assert!(created.is_empty());
    Ok(())
}

#[tokio::test]
async fn only_subscribed_webhooks_of_the_tenant_are_notified() -> Result<()> {
    let h = Harness::embedded();
    let tenant = TenantId::new();
    h.webhooks
        .register(new_webhook(tenant, FLAKY, &[AUDIT_FAILED]))
        .await?;
    h.webhooks
        .register(new_webhook(TenantId::new(), DEAD, &[AUDIT_COMPLETED]))
        .await?;

    let created = h
        .notifier
        .notify(tenant, AuditId::new(), AUDIT_COMPLETED, json!({}))
        .await?;
    assert!(created.is_empty());
    Ok(())
}
