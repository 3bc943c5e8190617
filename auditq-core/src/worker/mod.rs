//! Claim → execute → ack/fail loop around the external audit pipeline.

use std::{
    any::Any,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    config::LeaseConfig,
    error::{ExecutionError, PipelineError, Result},
    events::{EventType, ProgressEvent, ProgressRecorder},
    ids::{AuditId, JobId, TenantId},
    job::{AuditJob, FailOutcome},
    queue::QueueBackend,
    webhook::{AUDIT_COMPLETED, AUDIT_FAILED, WebhookNotifier},
};

mod lease;

use lease::LeaseKeeper;

/// The external audit executor. Implementations must not retry internally;
/// retries are the queue's job.
#[async_trait]
pub trait AuditPipeline: Send + Sync + fmt::Debug {
    async fn execute(
        &self,
        ctx: &AuditContext,
        payload: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ExecutionError>;
}

/// Handle given to the pipeline for the job it is running.
#[derive(Clone)]
pub struct AuditContext {
    pub job_id: JobId,
    pub audit_id: AuditId,
    pub tenant_id: TenantId,
    pub attempt: i32,
    pub max_attempts: i32,
    recorder: ProgressRecorder,
    lease_lost: Arc<AtomicBool>,
}

impl fmt::Debug for AuditContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditContext")
            .field("job_id", &self.job_id)
            .field("audit_id", &self.audit_id)
            .field("attempt", &self.attempt)
            .field("lease_lost", &self.lease_lost())
            .finish()
    }
}

impl AuditContext {
    pub fn new(job: &AuditJob, recorder: ProgressRecorder) -> Self {
        Self {
            job_id: job.job_id,
            audit_id: job.audit_id,
            tenant_id: job.tenant_id,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            recorder,
            lease_lost: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once a renewal found the lease taken. Long pipelines should poll
    /// this and stop early; their result will be discarded anyway.
    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    pub async fn emit(
        &self,
        event_type: EventType,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
        progress_pct: Option<i16>,
    ) -> Result<ProgressEvent> {
        self.recorder
            .emit(
                self.audit_id,
                Some(self.job_id),
                event_type,
                message,
                data,
                progress_pct,
            )
            .await
    }

    pub async fn step_started(&self, step: &str) -> Result<ProgressEvent> {
        self.emit(EventType::StepStarted, step, None, None).await
    }

    pub async fn step_done(
        &self,
        step: &str,
        progress_pct: Option<i16>,
    ) -> Result<ProgressEvent> {
        self.emit(EventType::StepDone, step, None, progress_pct).await
    }

    pub async fn warning(&self, message: &str) -> Result<ProgressEvent> {
        self.emit(EventType::Warning, message, None, None).await
    }

    pub async fn metric(
        &self,
        name: &str,
        value: serde_json::Value,
    ) -> Result<ProgressEvent> {
        self.emit(EventType::Metric, name, Some(json!({ name: value })), None)
            .await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Requeued,
    Failed,
    /// Another worker (or a cancel) owns the job now; our result was dropped.
    LeaseLost,
}

pub struct Worker {
    id: String,
    queue: Arc<dyn QueueBackend>,
    pipeline: Arc<dyn AuditPipeline>,
    recorder: ProgressRecorder,
    notifier: WebhookNotifier,
    lease: LeaseConfig,
    poll_interval: Duration,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("queue", &self.queue.kind())
            .field("pipeline", &self.pipeline)
            .field("lease", &self.lease)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn QueueBackend>,
        pipeline: Arc<dyn AuditPipeline>,
        recorder: ProgressRecorder,
        notifier: WebhookNotifier,
        lease: LeaseConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            pipeline,
            recorder,
            notifier,
            lease,
            poll_interval,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// One loop iteration: claim a job and run it, or wait for work.
    /// Returns `None` when nothing was claimed.
    pub async fn run_once(&self) -> Result<Option<(JobId, JobOutcome)>> {
        let Some(job) = self.queue.claim(&self.id, self.lease.lease()).await?
        else {
            self.queue.wait_for_job(self.poll_interval).await?;
            return Ok(None);
        };
        let job_id = job.job_id;
        let span = info_span!(
            target: "auditq::worker",
            "audit_job",
            %job_id,
            worker = %self.id,
            attempt = job.attempt
        );
        let outcome = self.process(job).instrument(span).await?;
        Ok(Some((job_id, outcome)))
    }

    /// Run until `shutdown` fires. An in-flight job is always finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(target: "auditq::worker", worker = %self.id, "worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let claimed = match self.queue.claim(&self.id, self.lease.lease()).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!(target: "auditq::worker", worker = %self.id, "claim failed: {err}");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    continue;
                }
            };

            match claimed {
                Some(job) => {
                    let job_id = job.job_id;
                    let span = info_span!(
                        target: "auditq::worker",
                        "audit_job",
                        %job_id,
                        worker = %self.id,
                        attempt = job.attempt
                    );
                    if let Err(err) = self.process(job).instrument(span).await {
                        error!(
                            target: "auditq::worker",
                            %job_id,
                            worker = %self.id,
                            "failed to record job outcome: {err}"
                        );
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        waited = self.queue.wait_for_job(self.poll_interval) => {
                            if let Err(err) = waited {
                                warn!(target: "auditq::worker", "wait for job failed: {err}");
                                tokio::select! {
                                    _ = shutdown.cancelled() => break,
                                    _ = tokio::time::sleep(self.poll_interval) => {}
                                }
                            }
                        }
                    }
                }
            }
        }
        info!(target: "auditq::worker", worker = %self.id, "worker stopped");
    }

    async fn process(&self, job: AuditJob) -> Result<JobOutcome> {
        let ctx = AuditContext::new(&job, self.recorder.clone());
        self.record(
            &ctx,
            EventType::StatusChanged,
            "running",
            Some(json!({ "attempt": job.attempt, "worker": self.id })),
            None,
        )
        .await;

        let keeper = LeaseKeeper::spawn(
            Arc::clone(&self.queue),
            job.job_id,
            self.id.clone(),
            self.lease.lease(),
            self.lease.renew_interval(),
            Arc::clone(&ctx.lease_lost),
        );

        let executed = AssertUnwindSafe(self.pipeline.execute(&ctx, &job.payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ExecutionError::retryable(format!(
                    "pipeline panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        if keeper.stop().await {
            warn!(
                target: "auditq::worker",
                job_id = %job.job_id,
                "discarding result; lease was lost"
            );
            return Ok(JobOutcome::LeaseLost);
        }

        match executed {
            Ok(result) => self.complete(&ctx, &job, result).await,
            Err(err) => self.fail(&ctx, &job, err).await,
        }
    }

    async fn complete(
        &self,
        ctx: &AuditContext,
        job: &AuditJob,
        result: serde_json::Value,
    ) -> Result<JobOutcome> {
        match self.queue.mark_done(job.job_id, &self.id).await {
            Ok(_) => {}
            Err(err) if err.is_lease_error() => return Ok(self.lease_lost(job, &err)),
            Err(err) => return Err(err),
        }
        info!(target: "auditq::worker", job_id = %job.job_id, "job done");

        self.record(
            ctx,
            EventType::StatusChanged,
            "done",
            Some(json!({ "attempt": job.attempt })),
            Some(100),
        )
        .await;
        self.notify(
            job,
            AUDIT_COMPLETED,
            json!({ "job_id": job.job_id, "attempt": job.attempt, "result": result }),
        )
        .await;
        Ok(JobOutcome::Done)
    }

    async fn fail(
        &self,
        ctx: &AuditContext,
        job: &AuditJob,
        err: ExecutionError,
    ) -> Result<JobOutcome> {
        let outcome = match self
            .queue
            .mark_failed(job.job_id, &self.id, err.message(), err.is_retryable())
            .await
        {
            Ok(outcome) => outcome,
            Err(lease_err) if lease_err.is_lease_error() => {
                return Ok(self.lease_lost(job, &lease_err));
            }
            Err(other) => return Err(other),
        };

        match outcome {
            FailOutcome::Requeued => {
                warn!(
                    target: "auditq::worker",
                    job_id = %job.job_id,
                    attempt = job.attempt,
                    "attempt failed; job requeued: {err}"
                );
                self.record(
                    ctx,
                    EventType::StatusChanged,
                    "queued",
                    Some(json!({ "attempt": job.attempt, "error": err.message() })),
                    None,
                )
                .await;
                Ok(JobOutcome::Requeued)
            }
            FailOutcome::Failed => {
                warn!(
                    target: "auditq::worker",
                    job_id = %job.job_id,
                    attempt = job.attempt,
                    "job failed: {err}"
                );
                self.record(
                    ctx,
                    EventType::Error,
                    err.message(),
                    Some(json!({
                        "attempt": job.attempt,
                        "retryable": err.is_retryable(),
                    })),
                    None,
                )
                .await;
                self.record(
                    ctx,
                    EventType::StatusChanged,
                    "failed",
                    Some(json!({ "attempt": job.attempt })),
                    None,
                )
                .await;
                self.notify(
                    job,
                    AUDIT_FAILED,
                    json!({
                        "job_id": job.job_id,
                        "attempt": job.attempt,
                        "error": err.message(),
                    }),
                )
                .await;
                Ok(JobOutcome::Failed)
            }
        }
    }

    fn lease_lost(&self, job: &AuditJob, err: &PipelineError) -> JobOutcome {
        warn!(
            target: "auditq::worker",
            job_id = %job.job_id,
            worker = %self.id,
            "dropping outcome: {err}"
        );
        JobOutcome::LeaseLost
    }

    /// Progress events are best effort; a failing event store never changes
    /// the job outcome.
    async fn record(
        &self,
        ctx: &AuditContext,
        event_type: EventType,
        message: &str,
        data: Option<serde_json::Value>,
        progress_pct: Option<i16>,
    ) {
        if let Err(err) = ctx.emit(event_type, message, data, progress_pct).await {
            warn!(
                target: "auditq::worker",
                job_id = %ctx.job_id,
                "failed to record {event_type} event: {err}"
            );
        }
    }

    async fn notify(&self, job: &AuditJob, event_type: &str, data: serde_json::Value) {
        match self
            .notifier
            .notify(job.tenant_id, job.audit_id, event_type, data)
            .await
        {
            Ok(deliveries) => debug!(
                target: "auditq::worker",
                job_id = %job.job_id,
                event_type,
                deliveries = deliveries.len(),
                "webhook deliveries created"
            ),
            Err(err) => error!(
                target: "auditq::worker",
                job_id = %job.job_id,
                event_type,
                "failed to create webhook deliveries: {err}"
            ),
        }
    }
}
