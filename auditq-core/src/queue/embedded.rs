use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{QueueBackend, create_or_existing};
use crate::{
    config::QueueBackendKind,
    error::Result,
    ids::JobId,
    job::{AuditJob, Enqueued, FailOutcome, NewJob},
    store::JobStore,
};

/// Lease-poll queue: the job store is the queue and idle workers poll it.
#[derive(Clone)]
pub struct EmbeddedQueue {
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
}

impl fmt::Debug for EmbeddedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedQueue")
            .field("store", &self.store)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl EmbeddedQueue {
    pub fn new(store: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }
}

#[async_trait]
impl QueueBackend for EmbeddedQueue {
    fn kind(&self) -> QueueBackendKind {
        QueueBackendKind::Embedded
    }

    fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    async fn enqueue(&self, new_job: NewJob) -> Result<Enqueued> {
        let (enqueued, _) = create_or_existing(self.store.as_ref(), new_job).await?;
        Ok(enqueued)
    }

    async fn claim(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<AuditJob>> {
        self.store.claim_next(worker_id, lease).await
    }

    async fn renew(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<AuditJob> {
        self.store.renew(job_id, worker_id, lease).await
    }

    async fn mark_done(
        &self,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<AuditJob> {
        self.store.ack(job_id, worker_id).await
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome> {
        self.store.fail(job_id, worker_id, error, retryable).await
    }

    async fn wait_for_job(&self, timeout: Duration) -> Result<bool> {
        tokio::time::sleep(timeout.min(self.poll_interval)).await;
        Ok(true)
    }

    /// `claim_next` already treats expired leases as claimable.
    async fn reap_expired(&self) -> Result<u64> {
        Ok(0)
    }
}
