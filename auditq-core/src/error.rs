use thiserror::Error;

use crate::ids::JobId;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// The idempotency key was already used; `existing` is the accepted job.
    #[error("Idempotency key already accepted as job {existing}")]
    DuplicateIdempotencyKey { existing: JobId },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller no longer holds the lease (reclaimed, canceled, finished).
    #[error("Lease mismatch for job {job_id}")]
    LeaseMismatch { job_id: JobId },

    /// The caller held the lease but let it run out.
    #[error("Lease expired for job {job_id}")]
    LeaseExpired { job_id: JobId },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[cfg(feature = "redis")]
    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// True for the concurrency-control failures a worker logs and drops.
    pub fn is_lease_error(&self) -> bool {
        matches!(
            self,
            PipelineError::LeaseMismatch { .. }
                | PipelineError::LeaseExpired { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure reported by the external audit pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Transient failure; the job goes back to the queue while attempts remain.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent failure (malformed input and the like); no further attempts.
    #[error("terminal: {0}")]
    Terminal(String),
}

impl ExecutionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ExecutionError::Retryable(msg) | ExecutionError::Terminal(msg) => {
                msg
            }
        }
    }
}

/// Webhook transport failure. Contained inside the delivery subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("endpoint answered {code}")]
    Status { code: u16, body: String },
}
