#![cfg(feature = "e2e")]

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use auditq_core::{
    AuditId, Clock, FailOutcome, JobStatus, ManualClock, NewJob, PipelineError,
    SharedClock, TenantId,
    events::{
        EventStore, EventType, NewProgressEvent, PgEventStore,
        postgres::AUDIT_APPEND_LOCK,
    },
    job::LEASE_EXHAUSTED_ERROR,
    store::{JobStore, PgJobStore},
    webhook::{
        AUDIT_COMPLETED, DeliveryFailure, DeliveryStatus, NewDelivery, NewWebhook,
        PgWebhookStore, WebhookStore,
    },
};
use serde_json::json;
use sqlx::PgPool;

const LEASE: Duration = Duration::from_secs(60);

fn clock() -> (ManualClock, SharedClock) {
    let clock = ManualClock::default();
    let shared: SharedClock = Arc::new(clock.clone());
    (clock, shared)
}

fn new_job(key: &str) -> NewJob {
    NewJob::new(TenantId::new(), AuditId::new(), json!({ "k": key }), key)
}

#[sqlx::test(migrator = "auditq_core::db::MIGRATOR")]
async fn duplicate_key_reports_existing_job(pool: PgPool) -> Result<()> {
    let (_, shared) = clock();
    let store = PgJobStore::new(pool, shared);
    let first = store.create(new_job("dup")).await?;

    match store.create(new_job("dup")).await {
        Err(PipelineError::DuplicateIdempotencyKey { existing }) => {
            assert_eq!(existing, first.job_id)
        }
        other => panic!("expected duplicate key error, got {other:?}"),
    }
    Ok(())
}

#[sqlx::test(migrator = "auditq_core::db::MIGRATOR")]
async fn concurrent_claims_are_disjoint(pool: PgPool) -> Result<()> {
    let (_, shared) = clock();
    let store = Arc::new(PgJobStore::new(pool, shared));
    for i in 0..20 {
        store.create(new_job(&format!("c{i}"))).await?;
    }

    let mut tasks = Vec::new();
    for w in 0..5 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let worker = format!("w{w}");
            let mut mine = Vec::new();
            while let Some(job) = store.claim_next(&worker, LEASE).await? {
                mine.push(job.job_id);
            }
            Ok::<_, PipelineError>(mine)
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await?? {
            assert!(seen.insert(id));
        }
    }
    assert_eq!(seen.len(), 20);
    Ok(())
}

#[sqlx::test(migrator = "auditq_core::db::MIGRATOR")]
async fn lease_guard_and_retry_exhaustion(pool: PgPool) -> Result<()> {
    let (clock, shared) = clock();
    let store = PgJobStore::new(pool, shared);
    let job = store.create(new_job("retry").with_max_attempts(3)).await?;

    let claimed = store.claim_next("w1", LEASE).await?.expect("job");
    clock.advance(chrono::Duration::seconds(61));
    let reclaimed = store.claim_next("w2", LEASE).await?.expect("reclaimed");
    assert_eq!(reclaimed.attempt, 2);
    assert_eq!(reclaimed.started_at, claimed.started_at);

    let err = store.ack(job.job_id, "w1").await.unwrap_err();
    assert!(matches!(err, PipelineError::LeaseMismatch { .. }));

    assert_eq!(
        store.fail(job.job_id, "w2", "503", true).await?,
        FailOutcome::Requeued
    );
    store.claim_next("w3", LEASE).await?.expect("third attempt");
    assert_eq!(
        store.fail(job.job_id, "w3", "503", true).await?,
        FailOutcome::Failed
    );
    assert!(store.claim_next("w4", LEASE).await?.is_none());

    let stored = store.get(job.job_id).await?;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempt, 3);
    Ok(())
}

#[sqlx::test(migrator = "auditq_core::db::MIGRATOR")]
async fn abandoned_final_attempt_is_failed(pool: PgPool) -> Result<()> {
    let (clock, shared) = clock();
    let store = PgJobStore::new(pool, shared);
    let job = store.create(new_job("final").with_max_attempts(1)).await?;
    store.claim_next("w1", LEASE).await?.expect("job");

    clock.advance(chrono::Duration::seconds(61));
    assert!(store.claim_job(job.job_id, "w2", LEASE).await?.is_none());

    let stored = store.get(job.job_id).await?;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.last_error.as_deref(), Some(LEASE_EXHAUSTED_ERROR));
    Ok(())
}

#[sqlx::test(migrator = "auditq_core::db::MIGRATOR")]
async fn cancel_and_stats(pool: PgPool) -> Result<()> {
    let (_, shared) = clock();
    let store = PgJobStore::new(pool, shared);
    let a = store.create(new_job("a")).await?;
    let b = store.create(new_job("b")).await?;
    store.claim_job(b.job_id, "w", LEASE).await?.expect("b");

    assert!(store.cancel(a.job_id).await?);
    assert!(!store.cancel(b.job_id).await?);

    let stats = store.stats().await?;
    assert_eq!(stats.canceled, 1);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.queued, 0);
    Ok(())
}

#[sqlx::test(migrator = "auditq_core::db::MIGRATOR")]
async fn events_keep_order_per_audit(pool: PgPool) -> Result<()> {
    let (clock, shared) = clock();
    let events = PgEventStore::new(pool, shared);
    let audit = AuditId::new();

    let first = events
        .append(NewProgressEvent::new(audit, None, EventType::StatusChanged, "queued"))
        .await?;
    clock.advance(chrono::Duration::seconds(-5));
    let second = events
        .append(
            NewProgressEvent::new(audit, None, EventType::StepDone, "crawl")
                .with_progress(50),
        )
        .await?;

    assert!(second.event_id > first.event_id);
    assert!(second.created_at >= first.created_at);
    let after = events.list(audit, Some(first.event_id)).await?;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].progress_pct, Some(50));
    Ok(())
}

#[sqlx::test(migrator = "auditq_core::db::MIGRATOR")]
async fn late_committing_append_is_not_skipped_by_cursor(pool: PgPool) -> Result<()> {
    let (_, shared) = clock();
    let events = Arc::new(PgEventStore::new(pool.clone(), shared));
    let audit = AuditId::new();

    // An append still in flight: lock taken, row inserted, not committed.
    let mut slow = pool.begin().await?;
    sqlx::query(AUDIT_APPEND_LOCK)
        .bind(audit.as_uuid())
        .execute(&mut *slow)
        .await?;
    let slow_id: i64 = sqlx::query_scalar(
        "INSERT INTO progress_events (audit_id, event_type, message, created_at) \
         VALUES ($1, 'status_changed', 'slow', now()) RETURNING event_id",
    )
    .bind(audit.as_uuid())
    .fetch_one(&mut *slow)
    .await?;

    let fast = {
        let events = events.clone();
        tokio::spawn(async move {
            events
                .append(NewProgressEvent::new(audit, None, EventType::StepDone, "fast"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!fast.is_finished(), "second append must wait for the first");
    assert!(events.list(audit, None).await?.is_empty());

    slow.commit().await?;
    let fast = fast.await??;
    assert!(fast.event_id > slow_id);

    // A reader that starts from scratch sees both, in commit order.
    let seen = events.list(audit, None).await?;
    let messages: Vec<&str> = seen.iter().map(|ev| ev.message.as_str()).collect();
    assert_eq!(messages, ["slow", "fast"]);
    assert!(seen[1].created_at >= seen[0].created_at);
    assert_eq!(events.list(audit, Some(slow_id)).await?.len(), 1);
    Ok(())
}

#[sqlx::test(migrator = "auditq_core::db::MIGRATOR")]
async fn delivery_claims_hide_rows_and_failures_are_optimistic(
    pool: PgPool,
) -> Result<()> {
    let (clock, shared) = clock();
    let store = PgWebhookStore::new(pool, shared);
    let tenant = TenantId::new();
    let hook = store
        .register(NewWebhook {
            tenant_id: tenant,
            url: "https://tenant.example/hook".into(),
            secret: "s3cret".into(),
            events: vec![AUDIT_COMPLETED.into()],
        })
        .await?;
    let created = store
        .create_deliveries(vec![NewDelivery {
            webhook_id: hook.webhook_id,
            tenant_id: tenant,
            event_type: AUDIT_COMPLETED.into(),
            payload: json!({ "event_type": AUDIT_COMPLETED }),
            max_attempts: 5,
        }])
        .await?;
    let delivery_id = created[0].delivery_id;

    let due = store.due_deliveries(10, Duration::from_secs(25)).await?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].secret, "s3cret");
    assert!(store.due_deliveries(10, Duration::from_secs(25)).await?.is_empty());

    let failure = DeliveryFailure {
        expected_attempts: 0,
        next_retry_at: Some(clock.now() + chrono::Duration::seconds(30)),
        response_code: Some(500),
        response_body: Some("oops".into()),
        error_message: "HTTP 500".into(),
    };
    assert!(store.record_failure(delivery_id, failure.clone()).await?);
    // Same expected attempt count again: the row already moved on.
    assert!(!store.record_failure(delivery_id, failure).await?);

    clock.advance(chrono::Duration::seconds(31));
    let due = store.due_deliveries(10, Duration::from_secs(25)).await?;
    assert_eq!(due.len(), 1);
    assert!(store.record_success(delivery_id, 200, Some("ok".into())).await?);

    let row = store.get_delivery(delivery_id).await?;
    assert_eq!(row.status, DeliveryStatus::Delivered);
    assert_eq!(row.attempts, 2);
    assert_eq!(
        store
            .list_deliveries(hook.webhook_id, Some(DeliveryStatus::Delivered))
            .await?
            .len(),
        1
    );
    Ok(())
}
