use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{JobStore, lease_deadline};
use crate::{
    clock::{Clock, SharedClock, SystemClock},
    error::{PipelineError, Result},
    ids::{AuditId, JobId},
    job::{
        AuditJob, FailOutcome, JobStats, JobStatus, LEASE_EXHAUSTED_ERROR,
        NewJob,
    },
};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, AuditJob>,
    by_key: HashMap<String, JobId>,
}

/// In-process job store. Each operation runs its read and write under one
/// guard, which gives the same atomicity as the Postgres conditional updates.
#[derive(Clone)]
pub struct MemoryJobStore {
    state: Arc<Mutex<State>>,
    clock: SharedClock,
}

impl fmt::Debug for MemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MemoryJobStore");
        debug.field("clock", &self.clock);
        match self.state.try_lock() {
            Ok(state) => {
                debug.field("jobs", &state.jobs.len());
            }
            Err(_) => {
                debug.field("jobs", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(SystemClock::shared())
    }
}

impl MemoryJobStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }
}

fn finalize_exhausted(job: &mut AuditJob, now: DateTime<Utc>) {
    warn!(
        target: "auditq::queue",
        job_id = %job.job_id,
        attempt = job.attempt,
        "lease expired on final attempt; failing job"
    );
    job.status = JobStatus::Failed;
    job.finished_at = Some(now);
    job.locked_by = None;
    job.locked_until = None;
    job.last_error = Some(LEASE_EXHAUSTED_ERROR.to_string());
}

fn apply_claim(
    job: &mut AuditJob,
    worker_id: &str,
    now: DateTime<Utc>,
    lease: Duration,
) {
    job.status = JobStatus::Running;
    job.locked_by = Some(worker_id.to_string());
    job.locked_until = Some(lease_deadline(now, lease));
    job.attempt += 1;
    job.started_at.get_or_insert(now);
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new_job: NewJob) -> Result<AuditJob> {
        new_job.validate()?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.by_key.get(&new_job.idempotency_key) {
            return Err(PipelineError::DuplicateIdempotencyKey {
                existing: *existing,
            });
        }
        let job = new_job.into_job(self.clock.now());
        state
            .by_key
            .insert(job.idempotency_key.clone(), job.job_id);
        state.jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<AuditJob> {
        self.state
            .lock()
            .await
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<AuditJob>> {
        let state = self.state.lock().await;
        Ok(state
            .by_key
            .get(key)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<AuditJob>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Running
                && job.is_claimable(now)
                && job.attempts_exhausted()
            {
                finalize_exhausted(job, now);
            }
        }

        let next = state
            .jobs
            .values()
            .filter(|job| job.is_claimable(now))
            .min_by_key(|job| (job.queued_at, job.job_id))
            .map(|job| job.job_id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        apply_claim(job, worker_id, now, lease);
        debug!(
            target: "auditq::queue",
            job_id = %job.job_id,
            worker = worker_id,
            attempt = job.attempt,
            "claimed job"
        );
        Ok(Some(job.clone()))
    }

    async fn claim_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<AuditJob>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if !job.is_claimable(now) {
            return Ok(None);
        }
        if job.status == JobStatus::Running && job.attempts_exhausted() {
            finalize_exhausted(job, now);
            return Ok(None);
        }
        apply_claim(job, worker_id, now, lease);
        Ok(Some(job.clone()))
    }

    async fn renew(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<AuditJob> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))?;
        if !job.is_leased_by(worker_id, now) {
            return Err(PipelineError::LeaseMismatch { job_id });
        }
        job.locked_until = Some(lease_deadline(now, lease));
        Ok(job.clone())
    }

    async fn ack(&self, job_id: JobId, worker_id: &str) -> Result<AuditJob> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))?;
        if !job.is_leased_by(worker_id, now) {
            return Err(job.lease_error(worker_id, now));
        }
        job.status = JobStatus::Done;
        job.finished_at = Some(now);
        job.locked_by = None;
        job.locked_until = None;
        Ok(job.clone())
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))?;
        if !job.is_leased_by(worker_id, now) {
            return Err(job.lease_error(worker_id, now));
        }
        job.locked_by = None;
        job.locked_until = None;
        job.last_error = Some(error.to_string());
        if retryable && job.attempt < job.max_attempts {
            job.status = JobStatus::Queued;
            Ok(FailOutcome::Requeued)
        } else {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
            Ok(FailOutcome::Failed)
        }
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))?;
        if job.status != JobStatus::Queued {
            return Ok(false);
        }
        job.status = JobStatus::Canceled;
        job.finished_at = Some(now);
        Ok(true)
    }

    async fn list_for_audit(&self, audit_id: AuditId) -> Result<Vec<AuditJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<AuditJob> = state
            .jobs
            .values()
            .filter(|job| job.audit_id == audit_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.queued_at, job.job_id));
        Ok(jobs)
    }

    async fn stats(&self) -> Result<JobStats> {
        let state = self.state.lock().await;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.bump(job.status, 1);
        }
        Ok(stats)
    }

    async fn reclaimable(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut ids: Vec<(DateTime<Utc>, JobId)> = state
            .jobs
            .values()
            .filter(|job| job.queued_at < before && job.is_claimable(now))
            .map(|job| (job.queued_at, job.job_id))
            .collect();
        ids.sort();
        Ok(ids.into_iter().take(limit).map(|(_, id)| id).collect())
    }
}
