use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{EventStore, NewProgressEvent, ProgressEvent};
use crate::{
    clock::{Clock, SharedClock},
    error::{PipelineError, Result},
    ids::{AuditId, JobId},
};

/// Transaction-scoped lock on one audit's timeline.
pub const AUDIT_APPEND_LOCK: &str =
    "SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))";

#[derive(Debug, FromRow)]
struct EventRow {
    event_id: i64,
    audit_id: Uuid,
    job_id: Option<Uuid>,
    event_type: String,
    message: String,
    data: Option<serde_json::Value>,
    progress_pct: Option<i16>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for ProgressEvent {
    type Error = PipelineError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(ProgressEvent {
            event_id: row.event_id,
            audit_id: AuditId(row.audit_id),
            job_id: row.job_id.map(JobId),
            event_type: row.event_type.parse()?,
            message: row.message,
            data: row.data,
            progress_pct: row.progress_pct,
            created_at: row.created_at,
        })
    }
}

#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
    clock: SharedClock,
}

impl fmt::Debug for PgEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgEventStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PgEventStore {
    pub fn new(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    /// Appends for one audit are serialized on an advisory lock held until
    /// commit, so `event_id` order is also commit order and a reader
    /// following the cursor cannot skip a late-committing row.
    async fn append(&self, event: NewProgressEvent) -> Result<ProgressEvent> {
        event.validate()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(AUDIT_APPEND_LOCK)
            .bind(event.audit_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, EventRow>(
            r#"
            INSERT INTO progress_events (
                audit_id, job_id, event_type, message, data, progress_pct,
                created_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                GREATEST(
                    $7,
                    COALESCE(
                        (SELECT MAX(created_at)
                         FROM progress_events
                         WHERE audit_id = $1),
                        $7
                    )
                )
            )
            RETURNING event_id, audit_id, job_id, event_type, message, data,
                      progress_pct, created_at
            "#,
        )
        .bind(event.audit_id.as_uuid())
        .bind(event.job_id.map(|id| id.as_uuid()))
        .bind(event.event_type.as_str())
        .bind(&event.message)
        .bind(&event.data)
        .bind(event.progress_pct)
        .bind(self.clock.now())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        ProgressEvent::try_from(row)
    }

    async fn list(
        &self,
        audit_id: AuditId,
        since: Option<i64>,
    ) -> Result<Vec<ProgressEvent>> {
        sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, audit_id, job_id, event_type, message, data,
                   progress_pct, created_at
            FROM progress_events
            WHERE audit_id = $1
              AND ($2::bigint IS NULL OR event_id > $2)
            ORDER BY event_id
            "#,
        )
        .bind(audit_id.as_uuid())
        .bind(since)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ProgressEvent::try_from)
        .collect()
    }
}
