use std::{fmt, sync::Arc, time::Duration};

use serde_json::json;
use tracing::{info, warn};

use crate::{
    error::Result,
    events::{EventType, ProgressEvent, ProgressRecorder},
    ids::{AuditId, JobId, TenantId},
    job::{AuditJob, Enqueued, JobStats, NewJob},
    queue::QueueBackend,
    webhook::{AUDIT_CANCELED, WebhookNotifier},
};

/// Client-facing operations: enqueue, inspect, cancel, read progress.
#[derive(Clone)]
pub struct JobService {
    queue: Arc<dyn QueueBackend>,
    recorder: ProgressRecorder,
    notifier: WebhookNotifier,
    default_max_attempts: i32,
}

impl fmt::Debug for JobService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobService")
            .field("queue", &self.queue.kind())
            .field("default_max_attempts", &self.default_max_attempts)
            .finish()
    }
}

impl JobService {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        recorder: ProgressRecorder,
        notifier: WebhookNotifier,
        default_max_attempts: i32,
    ) -> Self {
        Self {
            queue,
            recorder,
            notifier,
            default_max_attempts,
        }
    }

    pub fn queue(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    pub fn recorder(&self) -> &ProgressRecorder {
        &self.recorder
    }

    pub fn notifier(&self) -> &WebhookNotifier {
        &self.notifier
    }

    /// Accept an audit job. Re-sending the same idempotency key returns the
    /// job id accepted the first time.
    pub async fn enqueue(
        &self,
        tenant_id: TenantId,
        audit_id: AuditId,
        payload: serde_json::Value,
        idempotency_key: impl Into<String>,
        max_attempts: Option<i32>,
    ) -> Result<Enqueued> {
        let new_job = NewJob::new(tenant_id, audit_id, payload, idempotency_key)
            .with_max_attempts(max_attempts.unwrap_or(self.default_max_attempts));
        new_job.validate()?;

        let enqueued = self.queue.enqueue(new_job).await?;
        if enqueued.created {
            info!(
                target: "auditq::queue",
                job_id = %enqueued.job_id,
                %audit_id,
                %tenant_id,
                "job enqueued"
            );
            if let Err(err) = self
                .recorder
                .emit(
                    audit_id,
                    Some(enqueued.job_id),
                    EventType::StatusChanged,
                    "queued",
                    None,
                    None,
                )
                .await
            {
                warn!(target: "auditq::queue", job_id = %enqueued.job_id, "failed to record queued event: {err}");
            }
        }
        Ok(enqueued)
    }

    pub async fn get(&self, job_id: JobId) -> Result<AuditJob> {
        self.queue.store().get(job_id).await
    }

    pub async fn jobs_for_audit(&self, audit_id: AuditId) -> Result<Vec<AuditJob>> {
        self.queue.store().list_for_audit(audit_id).await
    }

    /// Cancel a job that has not started. Running and finished jobs are left
    /// alone and `false` is returned.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool> {
        if !self.queue.store().cancel(job_id).await? {
            return Ok(false);
        }
        let job = self.queue.store().get(job_id).await?;
        info!(target: "auditq::queue", %job_id, "job canceled");

        if let Err(err) = self
            .recorder
            .emit(
                job.audit_id,
                Some(job_id),
                EventType::StatusChanged,
                "canceled",
                None,
                None,
            )
            .await
        {
            warn!(target: "auditq::queue", %job_id, "failed to record canceled event: {err}");
        }
        if let Err(err) = self
            .notifier
            .notify(
                job.tenant_id,
                job.audit_id,
                AUDIT_CANCELED,
                json!({ "job_id": job_id }),
            )
            .await
        {
            warn!(target: "auditq::queue", %job_id, "failed to queue cancel webhooks: {err}");
        }
        Ok(true)
    }

    pub async fn list_events(
        &self,
        audit_id: AuditId,
        since: Option<i64>,
    ) -> Result<Vec<ProgressEvent>> {
        self.recorder.list_events(audit_id, since).await
    }

    pub async fn wait_for_events(
        &self,
        audit_id: AuditId,
        since: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<ProgressEvent>> {
        self.recorder.wait_for_events(audit_id, since, timeout).await
    }

    pub async fn stats(&self) -> Result<JobStats> {
        self.queue.store().stats().await
    }
}
