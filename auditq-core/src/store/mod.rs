//! Durable record of audit jobs and the lease-guarded transitions on them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    error::Result,
    ids::{AuditId, JobId},
    job::{AuditJob, FailOutcome, JobStats, NewJob},
};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::MemoryJobStore;
#[cfg(feature = "database")]
pub use postgres::PgJobStore;

/// Every state transition is a single conditional update; two callers racing
/// on the same job can never both win.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Insert a queued job. Fails with `DuplicateIdempotencyKey` carrying the
    /// existing id when the key was used before.
    async fn create(&self, new_job: NewJob) -> Result<AuditJob>;

    async fn get(&self, job_id: JobId) -> Result<AuditJob>;

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<AuditJob>>;

    /// Claim the oldest claimable job (queued, or running with an expired
    /// lease) for `worker_id`.
    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<AuditJob>>;

    /// Claim one specific job if it is claimable.
    async fn claim_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<AuditJob>>;

    /// Extend the lease held by `worker_id`.
    async fn renew(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<AuditJob>;

    async fn ack(&self, job_id: JobId, worker_id: &str) -> Result<AuditJob>;

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome>;

    /// Cancel a job that has not been claimed yet. Returns false otherwise.
    async fn cancel(&self, job_id: JobId) -> Result<bool>;

    async fn list_for_audit(&self, audit_id: AuditId) -> Result<Vec<AuditJob>>;

    async fn stats(&self) -> Result<JobStats>;

    /// Ids of claimable jobs queued before `before`, oldest first. The broker
    /// reaper uses this to re-push ids that never made it onto its lists.
    async fn reclaimable(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>>;
}

pub(crate) fn lease_deadline(
    now: DateTime<Utc>,
    lease: Duration,
) -> DateTime<Utc> {
    TimeDelta::from_std(lease)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
