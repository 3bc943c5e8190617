mod support;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use auditq_core::{
    AuditContext, AuditId, AuditPipeline, ExecutionError, JobOutcome, JobStatus,
    ManualClock, NewJob, TenantId,
    config::LeaseConfig,
    events::EventType,
    queue::QueueBackend,
    store::JobStore,
    webhook::{AUDIT_COMPLETED, AUDIT_FAILED, WebhookStore},
};
use serde_json::{Value, json};
use support::{Harness, ScriptedPipeline, Step, new_webhook};
use tokio_util::sync::CancellationToken;

fn lease() -> LeaseConfig {
    LeaseConfig {
        lease_secs: 60,
        renew_at_fraction: 0.5,
    }
}

fn new_job(tenant: TenantId, key: &str) -> NewJob {
    NewJob::new(tenant, AuditId::new(), json!({ "site": key }), key)
}

async fn messages(h: &Harness, audit_id: AuditId) -> Result<Vec<(EventType, String)>> {
    Ok(h.recorder
        .list_events(audit_id, None)
        .await?
        .into_iter()
        .map(|ev| (ev.event_type, ev.message))
        .collect())
}

#[tokio::test]
async fn successful_run_acks_and_notifies() -> Result<()> {
    let h = Harness::embedded();
    let tenant = TenantId::new();
    let hook = h
        .webhooks
        .register(new_webhook(tenant, "https://hooks.example/done", &[AUDIT_COMPLETED]))
        .await?;
    let enqueued = h.queue.enqueue(new_job(tenant, "ok")).await?;
    let job = h.store.get(enqueued.job_id).await?;

    let pipeline = ScriptedPipeline::new([Step::Succeed(json!({ "score": 87 }))]);
    let worker = h.worker("w1", pipeline.clone(), lease());

    let ran = worker.run_once().await?;
    assert_eq!(ran, Some((enqueued.job_id, JobOutcome::Done)));
    assert_eq!(h.store.get(enqueued.job_id).await?.status, JobStatus::Done);

    let events = h.recorder.list_events(job.audit_id, None).await?;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].message, "running");
    assert_eq!(events[1].message, "done");
    assert_eq!(events[1].progress_pct, Some(100));
    assert!(events[0].event_id < events[1].event_id);

    let deliveries = h.webhooks.list_deliveries(hook.webhook_id, None).await?;
    assert_eq!(deliveries.len(), 1);
    let body = &deliveries[0].payload;
    assert_eq!(body["event_type"], AUDIT_COMPLETED);
    assert_eq!(body["audit_id"], json!(job.audit_id));
    assert_eq!(body["data"]["result"]["score"], 87);
    Ok(())
}

#[tokio::test]
async fn idle_worker_reports_nothing_claimed() -> Result<()> {
    let h = Harness::embedded();
    let worker = h.worker("w1", ScriptedPipeline::new([]), lease());
    assert_eq!(worker.run_once().await?, None);
    Ok(())
}

#[tokio::test]
async fn retryable_error_requeues_then_succeeds() -> Result<()> {
    let h = Harness::embedded();
    let enqueued = h.queue.enqueue(new_job(TenantId::new(), "flaky")).await?;
    let pipeline = ScriptedPipeline::new([Step::Retryable("upstream 502")]);
    let worker = h.worker("w1", pipeline.clone(), lease());

    assert_eq!(worker.run_once().await?.map(|r| r.1), Some(JobOutcome::Requeued));
    let job = h.store.get(enqueued.job_id).await?;
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.last_error.as_deref(), Some("upstream 502"));

    assert_eq!(worker.run_once().await?.map(|r| r.1), Some(JobOutcome::Done));
    assert_eq!(pipeline.attempts(), vec![1, 2]);

    let timeline: Vec<String> = messages(&h, job.audit_id)
        .await?
        .into_iter()
        .map(|(_, msg)| msg)
        .collect();
    assert_eq!(timeline, ["running", "queued", "running", "done"]);
    Ok(())
}

#[tokio::test]
async fn terminal_error_fails_without_retry() -> Result<()> {
    let h = Harness::embedded();
    let tenant = TenantId::new();
    let hook = h
        .webhooks
        .register(new_webhook(tenant, "https://hooks.example/fail", &[AUDIT_FAILED]))
        .await?;
    let enqueued = h.queue.enqueue(new_job(tenant, "broken")).await?;
    let pipeline = ScriptedPipeline::new([Step::Terminal("robots.txt forbids crawl")]);
    let worker = h.worker("w1", pipeline.clone(), lease());

    assert_eq!(worker.run_once().await?.map(|r| r.1), Some(JobOutcome::Failed));
    let job = h.store.get(enqueued.job_id).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt, 1);
    assert_eq!(pipeline.attempts(), vec![1]);

    let timeline = messages(&h, job.audit_id).await?;
    assert!(timeline.contains(&(
        EventType::Error,
        "robots.txt forbids crawl".to_string()
    )));

    let deliveries = h.webhooks.list_deliveries(hook.webhook_id, None).await?;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].payload["data"]["error"], "robots.txt forbids crawl");
    Ok(())
}

#[tokio::test]
async fn panic_in_pipeline_is_treated_as_retryable() -> Result<()> {
    let h = Harness::embedded();
    let enqueued = h.queue.enqueue(new_job(TenantId::new(), "panicky")).await?;
    let pipeline = ScriptedPipeline::new([Step::Panic("boom")]);
    let worker = h.worker("w1", pipeline, lease());

    assert_eq!(worker.run_once().await?.map(|r| r.1), Some(JobOutcome::Requeued));
    let job = h.store.get(enqueued.job_id).await?;
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.last_error.as_deref(), Some("pipeline panicked: boom"));
    Ok(())
}

/// Advances the shared manual clock in step with tokio's paused clock, so
/// the job runs well past its original lease.
#[derive(Debug)]
struct LongPipeline {
    clock: ManualClock,
    rounds: u32,
    step_secs: u64,
}

#[async_trait]
impl AuditPipeline for LongPipeline {
    async fn execute(
        &self,
        ctx: &AuditContext,
        _payload: &Value,
    ) -> Result<Value, ExecutionError> {
        for round in 0..self.rounds {
            self.clock
                .advance(chrono::Duration::seconds(self.step_secs as i64));
            tokio::time::sleep(Duration::from_secs(self.step_secs)).await;
            ctx.step_done(&format!("round {round}"), None)
                .await
                .map_err(|e| ExecutionError::retryable(e.to_string()))?;
        }
        Ok(json!({ "rounds": self.rounds }))
    }
}

#[tokio::test(start_paused = true)]
async fn renewal_keeps_a_long_job_leased() -> Result<()> {
    let h = Harness::embedded();
    let enqueued = h.queue.enqueue(new_job(TenantId::new(), "long")).await?;
    // 120s of work against a 60s lease renewed every 30s.
    let pipeline = Arc::new(LongPipeline {
        clock: h.clock.clone(),
        rounds: 3,
        step_secs: 40,
    });
    let worker = h.worker("w1", pipeline, lease());

    assert_eq!(worker.run_once().await?.map(|r| r.1), Some(JobOutcome::Done));
    assert_eq!(h.store.get(enqueued.job_id).await?.status, JobStatus::Done);
    Ok(())
}

/// Lets its lease run out and has another worker take the job mid-run.
#[derive(Debug)]
struct HijackedPipeline {
    clock: ManualClock,
    queue: Arc<dyn QueueBackend>,
}

#[async_trait]
impl AuditPipeline for HijackedPipeline {
    async fn execute(
        &self,
        ctx: &AuditContext,
        _payload: &Value,
    ) -> Result<Value, ExecutionError> {
        self.clock.advance(chrono::Duration::seconds(61));
        let stolen = self
            .queue
            .claim("intruder", Duration::from_secs(60))
            .await
            .map_err(|e| ExecutionError::retryable(e.to_string()))?;
        assert!(stolen.is_some());
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(ctx.lease_lost());
        Ok(json!({}))
    }
}

#[tokio::test(start_paused = true)]
async fn lost_lease_discards_the_result() -> Result<()> {
    let h = Harness::embedded();
    let enqueued = h.queue.enqueue(new_job(TenantId::new(), "hijack")).await?;
    let pipeline = Arc::new(HijackedPipeline {
        clock: h.clock.clone(),
        queue: h.queue.clone(),
    });
    let worker = h.worker("w1", pipeline, lease());

    assert_eq!(worker.run_once().await?.map(|r| r.1), Some(JobOutcome::LeaseLost));
    let job = h.store.get(enqueued.job_id).await?;
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.locked_by.as_deref(), Some("intruder"));
    assert_eq!(job.attempt, 2);
    Ok(())
}

#[tokio::test]
async fn run_loop_drains_queue_and_stops_on_shutdown() -> Result<()> {
    let h = Harness::embedded();
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(h.queue.enqueue(new_job(TenantId::new(), &format!("loop-{i}"))).await?.job_id);
    }

    let worker = Arc::new(h.worker("w1", ScriptedPipeline::new([]), lease()));
    let shutdown = CancellationToken::new();
    let handle = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    let store: Arc<dyn JobStore> = h.store.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.stats().await.map(|s| s.done).unwrap_or(0) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await??;
    for id in ids {
        assert_eq!(store.get(id).await?.status, JobStatus::Done);
    }
    Ok(())
}
