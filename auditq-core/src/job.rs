use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, Result},
    ids::{AuditId, JobId, TenantId},
};

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Error recorded when an abandoned job had no attempts left to reclaim.
pub const LEASE_EXHAUSTED_ERROR: &str = "lease expired after final attempt";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Durable record of one audit job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditJob {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub audit_id: AuditId,
    pub status: JobStatus,
    /// Number of claims so far; bumped on every successful claim.
    pub attempt: i32,
    pub max_attempts: i32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub last_error: Option<String>,
}

impl AuditJob {
    /// Whether `worker_id` holds a lease that has not run out at `now`.
    pub fn is_leased_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.locked_by.as_deref() == Some(worker_id)
            && self.locked_until.is_some_and(|until| until >= now)
    }

    /// Queued, or running under a lease that expired before `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => true,
            JobStatus::Running => {
                self.locked_until.is_none_or(|until| until < now)
            }
            _ => false,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Error for a lease-guarded transition that `worker_id` may not make.
    pub(crate) fn lease_error(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> PipelineError {
        let same_holder = self.status == JobStatus::Running
            && self.locked_by.as_deref() == Some(worker_id);
        if same_holder && self.locked_until.is_some_and(|until| until < now) {
            PipelineError::LeaseExpired {
                job_id: self.job_id,
            }
        } else {
            PipelineError::LeaseMismatch {
                job_id: self.job_id,
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub audit_id: AuditId,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(
        tenant_id: TenantId,
        audit_id: AuditId,
        payload: serde_json::Value,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            audit_id,
            payload,
            idempotency_key: idempotency_key.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.idempotency_key.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "idempotency_key must not be empty".into(),
            ));
        }
        if self.max_attempts < 1 {
            return Err(PipelineError::InvalidInput(
                "max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn into_job(self, now: DateTime<Utc>) -> AuditJob {
        AuditJob {
            job_id: JobId::new(),
            tenant_id: self.tenant_id,
            audit_id: self.audit_id,
            status: JobStatus::Queued,
            attempt: 0,
            max_attempts: self.max_attempts,
            queued_at: now,
            started_at: None,
            finished_at: None,
            locked_until: None,
            locked_by: None,
            idempotency_key: self.idempotency_key,
            payload: self.payload,
            last_error: None,
        }
    }
}

/// Result of an enqueue: `created == false` means the idempotency key was
/// already accepted and `job_id` is the earlier job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enqueued {
    pub job_id: JobId,
    pub created: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in the queue for another attempt.
    Requeued,
    /// Terminal; no further attempts.
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub queued: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
    pub canceled: u64,
}

impl JobStats {
    pub(crate) fn bump(&mut self, status: JobStatus, by: u64) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Done => &mut self.done,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Canceled => &mut self.canceled,
        };
        *slot += by;
    }
}
