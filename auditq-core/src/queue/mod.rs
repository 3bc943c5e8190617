//! Queue strategies sharing one capability contract.
//!
//! The embedded backend treats the job store as the queue. The broker backend
//! keeps the job ids on a pending/processing list pair and leaves the job
//! store as the system of record for status and attempts.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    config::QueueBackendKind,
    error::{PipelineError, Result},
    ids::JobId,
    job::{AuditJob, Enqueued, FailOutcome, NewJob},
    store::JobStore,
};

pub mod broker;
pub mod embedded;

pub use broker::{Broker, BrokerQueue, MemoryBroker};
#[cfg(feature = "redis")]
pub use broker::RedisBroker;
pub use embedded::EmbeddedQueue;

#[async_trait]
pub trait QueueBackend: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> QueueBackendKind;

    /// The job store behind this queue, for reads and cancellation.
    fn store(&self) -> &Arc<dyn JobStore>;

    /// Accept a job. A repeated idempotency key returns the earlier job id
    /// with `created == false`.
    async fn enqueue(&self, new_job: NewJob) -> Result<Enqueued>;

    async fn claim(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<AuditJob>>;

    async fn renew(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<AuditJob>;

    async fn mark_done(&self, job_id: JobId, worker_id: &str)
    -> Result<AuditJob>;

    async fn mark_failed(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome>;

    /// Wait up to `timeout` for work. `true` means claiming is worth a try.
    async fn wait_for_job(&self, timeout: Duration) -> Result<bool>;

    /// Return abandoned work to the queue. Returns how many jobs moved.
    async fn reap_expired(&self) -> Result<u64>;
}

/// Create the job, folding a duplicate key into the existing job id.
pub(crate) async fn create_or_existing(
    store: &dyn JobStore,
    new_job: NewJob,
) -> Result<(Enqueued, Option<AuditJob>)> {
    match store.create(new_job).await {
        Ok(job) => Ok((
            Enqueued {
                job_id: job.job_id,
                created: true,
            },
            Some(job),
        )),
        Err(PipelineError::DuplicateIdempotencyKey { existing }) => Ok((
            Enqueued {
                job_id: existing,
                created: false,
            },
            None,
        )),
        Err(err) => Err(err),
    }
}
