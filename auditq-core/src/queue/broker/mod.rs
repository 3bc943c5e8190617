use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{QueueBackend, create_or_existing};
use crate::{
    clock::{Clock, SharedClock},
    config::QueueBackendKind,
    error::Result,
    ids::JobId,
    job::{AuditJob, Enqueued, FailOutcome, NewJob},
    store::{JobStore, lease_deadline},
};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// Store ids handed out by the broker that the store refused before giving
/// up on this claim round.
const MAX_STALE_IDS_PER_CLAIM: usize = 16;

/// Orphaned ids re-pushed per reap pass.
const ORPHAN_SWEEP_LIMIT: usize = 100;

/// Reliable-queue primitives over a pending list, a processing list and one
/// TTL'd lease key per in-flight id.
///
/// Ids enter `pending` on the left and are claimed from the right, so the
/// lists behave FIFO.
#[async_trait]
pub trait Broker: Send + Sync + fmt::Debug {
    async fn push_pending(&self, job_id: JobId) -> Result<()>;

    /// Atomically move the oldest pending id to `processing` and set its
    /// lease key.
    async fn claim(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobId>>;

    /// Extend the lease key if `worker_id` still owns it.
    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool>;

    /// Drop the id from `processing` and delete its lease key.
    async fn release(&self, job_id: JobId) -> Result<()>;

    /// `release` plus a push back onto `pending`, in one step.
    async fn requeue(&self, job_id: JobId) -> Result<()>;

    /// Move every processing id whose lease key is gone back to `pending`.
    async fn reap_expired(&self) -> Result<Vec<JobId>>;

    /// Push the id unless it already sits on either list. Returns whether it
    /// was pushed.
    async fn ensure_pending(&self, job_id: JobId) -> Result<bool>;

    /// Block up to `timeout` until `pending` is non-empty.
    async fn wait_for_pending(&self, timeout: Duration) -> Result<bool>;
}

/// Queue backed by a [`Broker`] for dispatch and a [`JobStore`] for state.
pub struct BrokerQueue<B> {
    store: Arc<dyn JobStore>,
    broker: B,
    clock: SharedClock,
    /// Jobs must sit unclaimed for this long before the reaper treats them as
    /// missing from the broker lists.
    orphan_grace: Duration,
}

impl<B: fmt::Debug> fmt::Debug for BrokerQueue<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerQueue")
            .field("store", &self.store)
            .field("broker", &self.broker)
            .field("orphan_grace", &self.orphan_grace)
            .finish()
    }
}

impl<B: Broker> BrokerQueue<B> {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: B,
        clock: SharedClock,
        orphan_grace: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            orphan_grace,
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Re-push claimable store jobs that neither broker list knows about,
    /// e.g. after a crash between the store insert and the push.
    async fn sweep_orphans(&self) -> Result<u64> {
        let now = self.clock.now();
        let grace = chrono::TimeDelta::from_std(self.orphan_grace)
            .unwrap_or(chrono::TimeDelta::zero());
        let cutoff = now - grace;
        let mut pushed = 0;
        for job_id in self.store.reclaimable(cutoff, ORPHAN_SWEEP_LIMIT).await? {
            if self.broker.ensure_pending(job_id).await? {
                warn!(
                    target: "auditq::queue",
                    %job_id,
                    "re-pushed job missing from broker lists"
                );
                pushed += 1;
            }
        }
        Ok(pushed)
    }
}

#[async_trait]
impl<B: Broker> QueueBackend for BrokerQueue<B> {
    fn kind(&self) -> QueueBackendKind {
        QueueBackendKind::Redis
    }

    fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    async fn enqueue(&self, new_job: NewJob) -> Result<Enqueued> {
        let (enqueued, created) =
            create_or_existing(self.store.as_ref(), new_job).await?;
        if let Some(job) = created {
            self.broker.push_pending(job.job_id).await?;
            debug!(target: "auditq::queue", job_id = %job.job_id, "pushed job");
        }
        Ok(enqueued)
    }

    async fn claim(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<AuditJob>> {
        for _ in 0..MAX_STALE_IDS_PER_CLAIM {
            let Some(job_id) = self.broker.claim(worker_id, lease).await?
            else {
                return Ok(None);
            };
            if let Some(job) =
                self.store.claim_job(job_id, worker_id, lease).await?
            {
                debug!(
                    target: "auditq::queue",
                    %job_id,
                    worker = worker_id,
                    attempt = job.attempt,
                    "claimed job from broker"
                );
                return Ok(Some(job));
            }
            // Canceled, finished, or still leased elsewhere: drop the id. A
            // job that becomes claimable again is re-pushed by the reaper.
            debug!(
                target: "auditq::queue",
                %job_id,
                "store refused broker id; releasing"
            );
            self.broker.release(job_id).await?;
        }
        Ok(None)
    }

    async fn renew(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<AuditJob> {
        let job = self.store.renew(job_id, worker_id, lease).await?;
        if !self.broker.extend_lease(job_id, worker_id, lease).await? {
            warn!(
                target: "auditq::queue",
                %job_id,
                worker = worker_id,
                "broker lease key missing during renewal"
            );
        }
        Ok(job)
    }

    async fn mark_done(
        &self,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<AuditJob> {
        let job = self.store.ack(job_id, worker_id).await?;
        self.broker.release(job_id).await?;
        Ok(job)
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome> {
        let outcome = self
            .store
            .fail(job_id, worker_id, error, retryable)
            .await?;
        match outcome {
            FailOutcome::Requeued => self.broker.requeue(job_id).await?,
            FailOutcome::Failed => self.broker.release(job_id).await?,
        }
        Ok(outcome)
    }

    async fn wait_for_job(&self, timeout: Duration) -> Result<bool> {
        self.broker.wait_for_pending(timeout).await
    }

    async fn reap_expired(&self) -> Result<u64> {
        let reaped = self.broker.reap_expired().await?;
        let orphans = self.sweep_orphans().await?;
        if !reaped.is_empty() {
            info!(
                target: "auditq::queue",
                reaped = reaped.len(),
                "returned expired leases to pending"
            );
        }
        Ok(reaped.len() as u64 + orphans)
    }
}

/// Deadline for a lease of `lease` starting at the clock's now.
pub(crate) fn lease_expiry(
    clock: &dyn Clock,
    lease: Duration,
) -> chrono::DateTime<chrono::Utc> {
    lease_deadline(clock.now(), lease)
}
