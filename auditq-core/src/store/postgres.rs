use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{JobStore, lease_deadline};
use crate::{
    clock::{Clock, SharedClock},
    error::{PipelineError, Result},
    ids::{AuditId, JobId},
    job::{
        AuditJob, FailOutcome, JobStats, JobStatus, LEASE_EXHAUSTED_ERROR,
        NewJob,
    },
};

const JOB_COLUMNS: &str = "job_id, tenant_id, audit_id, status, attempt, \
     max_attempts, queued_at, started_at, finished_at, locked_until, \
     locked_by, idempotency_key, payload, last_error";

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: Uuid,
    tenant_id: Uuid,
    audit_id: Uuid,
    status: String,
    attempt: i32,
    max_attempts: i32,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    idempotency_key: String,
    payload: serde_json::Value,
    last_error: Option<String>,
}

impl TryFrom<JobRow> for AuditJob {
    type Error = PipelineError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(AuditJob {
            job_id: JobId(row.job_id),
            tenant_id: row.tenant_id.into(),
            audit_id: row.audit_id.into(),
            status: row.status.parse()?,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            locked_until: row.locked_until,
            locked_by: row.locked_by,
            idempotency_key: row.idempotency_key,
            payload: row.payload,
            last_error: row.last_error,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().map(|c| c.to_string()).as_deref() == Some("23505")
        }
        _ => false,
    }
}

/// Job store on Postgres. Claims use `FOR UPDATE SKIP LOCKED` so concurrent
/// workers never block on, or double-claim, the same row.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    clock: SharedClock,
}

impl fmt::Debug for PgJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgJobStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("clock", &self.clock)
            .finish()
    }
}

impl PgJobStore {
    pub fn new(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<AuditJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM audit_jobs WHERE job_id = $1");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(AuditJob::try_from)
            .transpose()
    }

    /// Resolve why a lease-guarded update matched no row.
    async fn guard_error(
        &self,
        job_id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> PipelineError {
        match self.fetch(job_id).await {
            Ok(Some(job)) => job.lease_error(worker_id, now),
            Ok(None) => PipelineError::NotFound(format!("job {job_id}")),
            Err(err) => err,
        }
    }

    /// Fail abandoned running jobs that have no attempts left.
    async fn sweep_exhausted(
        &self,
        job_id: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let swept = sqlx::query(
            r#"
            UPDATE audit_jobs
            SET status = 'failed',
                finished_at = $1,
                locked_by = NULL,
                locked_until = NULL,
                last_error = $2
            WHERE status = 'running'
              AND locked_until < $1
              AND attempt >= max_attempts
              AND ($3::uuid IS NULL OR job_id = $3)
            "#,
        )
        .bind(now)
        .bind(LEASE_EXHAUSTED_ERROR)
        .bind(job_id.map(|id| id.as_uuid()))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if swept > 0 {
            warn!(
                target: "auditq::queue",
                swept,
                "failed abandoned jobs with no attempts left"
            );
        }
        Ok(swept)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new_job: NewJob) -> Result<AuditJob> {
        new_job.validate()?;
        let job = new_job.into_job(self.clock.now());
        let sql = format!(
            r#"
            INSERT INTO audit_jobs (
                job_id, tenant_id, audit_id, status, attempt, max_attempts,
                queued_at, idempotency_key, payload
            )
            VALUES ($1, $2, $3, 'queued', 0, $4, $5, $6, $7)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.job_id.as_uuid())
            .bind(job.tenant_id.as_uuid())
            .bind(job.audit_id.as_uuid())
            .bind(job.max_attempts)
            .bind(job.queued_at)
            .bind(&job.idempotency_key)
            .bind(&job.payload)
            .fetch_one(&self.pool)
            .await;

        match inserted {
            Ok(row) => AuditJob::try_from(row),
            Err(err) if is_unique_violation(&err) => {
                let existing = self
                    .find_by_idempotency_key(&job.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::Internal(format!(
                            "idempotency key '{}' conflicted but no job holds it",
                            job.idempotency_key
                        ))
                    })?;
                Err(PipelineError::DuplicateIdempotencyKey {
                    existing: existing.job_id,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<AuditJob> {
        self.fetch(job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<AuditJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM audit_jobs WHERE idempotency_key = $1"
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .map(AuditJob::try_from)
            .transpose()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<AuditJob>> {
        let now = self.clock.now();
        self.sweep_exhausted(None, now).await?;

        let sql = format!(
            r#"
            UPDATE audit_jobs
            SET status = 'running',
                locked_by = $1,
                locked_until = $2,
                attempt = attempt + 1,
                started_at = COALESCE(started_at, $3)
            WHERE job_id = (
                SELECT job_id
                FROM audit_jobs
                WHERE status = 'queued'
                   OR (status = 'running'
                       AND locked_until < $3
                       AND attempt < max_attempts)
                ORDER BY queued_at, job_id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let claimed = sqlx::query_as::<_, JobRow>(&sql)
            .bind(worker_id)
            .bind(lease_deadline(now, lease))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .map(AuditJob::try_from)
            .transpose()?;

        if let Some(job) = &claimed {
            debug!(
                target: "auditq::queue",
                job_id = %job.job_id,
                worker = worker_id,
                attempt = job.attempt,
                "claimed job"
            );
        }
        Ok(claimed)
    }

    async fn claim_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<AuditJob>> {
        let now = self.clock.now();
        self.sweep_exhausted(Some(job_id), now).await?;

        let sql = format!(
            r#"
            UPDATE audit_jobs
            SET status = 'running',
                locked_by = $1,
                locked_until = $2,
                attempt = attempt + 1,
                started_at = COALESCE(started_at, $3)
            WHERE job_id = $4
              AND (status = 'queued'
                   OR (status = 'running'
                       AND locked_until < $3
                       AND attempt < max_attempts))
            RETURNING {JOB_COLUMNS}
            "#
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(worker_id)
            .bind(lease_deadline(now, lease))
            .bind(now)
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(AuditJob::try_from)
            .transpose()
    }

    async fn renew(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<AuditJob> {
        let now = self.clock.now();
        let sql = format!(
            r#"
            UPDATE audit_jobs
            SET locked_until = $3
            WHERE job_id = $1
              AND status = 'running'
              AND locked_by = $2
              AND locked_until >= $4
            RETURNING {JOB_COLUMNS}
            "#
        );
        let renewed = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_uuid())
            .bind(worker_id)
            .bind(lease_deadline(now, lease))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match renewed {
            Some(row) => AuditJob::try_from(row),
            None => match self.fetch(job_id).await? {
                Some(_) => Err(PipelineError::LeaseMismatch { job_id }),
                None => Err(PipelineError::NotFound(format!("job {job_id}"))),
            },
        }
    }

    async fn ack(&self, job_id: JobId, worker_id: &str) -> Result<AuditJob> {
        let now = self.clock.now();
        let sql = format!(
            r#"
            UPDATE audit_jobs
            SET status = 'done',
                finished_at = $3,
                locked_by = NULL,
                locked_until = NULL
            WHERE job_id = $1
              AND status = 'running'
              AND locked_by = $2
              AND locked_until >= $3
            RETURNING {JOB_COLUMNS}
            "#
        );
        let acked = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_uuid())
            .bind(worker_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match acked {
            Some(row) => AuditJob::try_from(row),
            None => Err(self.guard_error(job_id, worker_id, now).await),
        }
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome> {
        let now = self.clock.now();
        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE audit_jobs
            SET status = CASE WHEN $4 AND attempt < max_attempts
                              THEN 'queued' ELSE 'failed' END,
                finished_at = CASE WHEN $4 AND attempt < max_attempts
                                   THEN NULL ELSE $5 END,
                locked_by = NULL,
                locked_until = NULL,
                last_error = $3
            WHERE job_id = $1
              AND status = 'running'
              AND locked_by = $2
              AND locked_until >= $5
            RETURNING status
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker_id)
        .bind(error)
        .bind(retryable)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match status.as_deref() {
            Some("queued") => Ok(FailOutcome::Requeued),
            Some(_) => Ok(FailOutcome::Failed),
            None => Err(self.guard_error(job_id, worker_id, now).await),
        }
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool> {
        let now = self.clock.now();
        let canceled: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE audit_jobs
            SET status = 'canceled', finished_at = $2
            WHERE job_id = $1 AND status = 'queued'
            RETURNING job_id
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if canceled.is_some() {
            return Ok(true);
        }
        match self.fetch(job_id).await? {
            Some(_) => Ok(false),
            None => Err(PipelineError::NotFound(format!("job {job_id}"))),
        }
    }

    async fn list_for_audit(&self, audit_id: AuditId) -> Result<Vec<AuditJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM audit_jobs WHERE audit_id = $1 \
             ORDER BY queued_at, job_id"
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(audit_id.as_uuid())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(AuditJob::try_from)
            .collect()
    }

    async fn stats(&self) -> Result<JobStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM audit_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            stats.bump(status.parse::<JobStatus>()?, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn reclaimable(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>> {
        let now = self.clock.now();
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT job_id
            FROM audit_jobs
            WHERE queued_at < $1
              AND (status = 'queued'
                   OR (status = 'running' AND locked_until < $2))
            ORDER BY queued_at, job_id
            LIMIT $3
            "#,
        )
        .bind(before)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(JobId).collect())
    }
}
