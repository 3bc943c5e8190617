//! Append-only per-audit progress timeline with long-poll reads.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::Instant,
};
use tracing::trace;

use crate::{
    error::{PipelineError, Result},
    ids::{AuditId, JobId},
};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::MemoryEventStore;
#[cfg(feature = "database")]
pub use postgres::PgEventStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StatusChanged,
    StepStarted,
    StepDone,
    Warning,
    Error,
    Metric,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StatusChanged => "status_changed",
            EventType::StepStarted => "step_started",
            EventType::StepDone => "step_done",
            EventType::Warning => "warning",
            EventType::Error => "error",
            EventType::Metric => "metric",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "status_changed" => Ok(EventType::StatusChanged),
            "step_started" => Ok(EventType::StepStarted),
            "step_done" => Ok(EventType::StepDone),
            "warning" => Ok(EventType::Warning),
            "error" => Ok(EventType::Error),
            "metric" => Ok(EventType::Metric),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown event type '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_id: i64,
    pub audit_id: AuditId,
    pub job_id: Option<JobId>,
    pub event_type: EventType,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub progress_pct: Option<i16>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewProgressEvent {
    pub audit_id: AuditId,
    pub job_id: Option<JobId>,
    pub event_type: EventType,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub progress_pct: Option<i16>,
}

impl NewProgressEvent {
    pub fn new(
        audit_id: AuditId,
        job_id: Option<JobId>,
        event_type: EventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            audit_id,
            job_id,
            event_type,
            message: message.into(),
            data: None,
            progress_pct: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_progress(mut self, pct: i16) -> Self {
        self.progress_pct = Some(pct);
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.progress_pct {
            Some(pct) if !(0..=100).contains(&pct) => {
                Err(PipelineError::InvalidInput(format!(
                    "progress_pct {pct} is outside 0..=100"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Event ids grow monotonically; `created_at` never goes backwards within
/// one audit.
#[async_trait]
pub trait EventStore: Send + Sync + fmt::Debug {
    async fn append(&self, event: NewProgressEvent) -> Result<ProgressEvent>;

    /// Events for `audit_id` strictly after the `since` cursor, in order.
    async fn list(
        &self,
        audit_id: AuditId,
        since: Option<i64>,
    ) -> Result<Vec<ProgressEvent>>;
}

const NOTIFY_CAPACITY: usize = 1024;

/// Writes events and wakes long-polling readers.
///
/// Wake-ups are in-process only. Readers also re-check the store every
/// `recheck_interval`, which covers events appended by another process.
#[derive(Clone)]
pub struct ProgressRecorder {
    store: Arc<dyn EventStore>,
    appended: broadcast::Sender<(AuditId, i64)>,
    recheck_interval: Duration,
}

impl fmt::Debug for ProgressRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressRecorder")
            .field("store", &self.store)
            .field("subscribers", &self.appended.receiver_count())
            .field("recheck_interval", &self.recheck_interval)
            .finish()
    }
}

impl ProgressRecorder {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        let (appended, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            store,
            appended,
            recheck_interval: Duration::from_secs(1),
        }
    }

    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    pub async fn record(&self, event: NewProgressEvent) -> Result<ProgressEvent> {
        event.validate()?;
        let stored = self.store.append(event).await?;
        trace!(
            audit_id = %stored.audit_id,
            event_id = stored.event_id,
            event_type = %stored.event_type,
            "progress event appended"
        );
        let _ = self.appended.send((stored.audit_id, stored.event_id));
        Ok(stored)
    }

    pub async fn emit(
        &self,
        audit_id: AuditId,
        job_id: Option<JobId>,
        event_type: EventType,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
        progress_pct: Option<i16>,
    ) -> Result<ProgressEvent> {
        self.record(NewProgressEvent {
            audit_id,
            job_id,
            event_type,
            message: message.into(),
            data,
            progress_pct,
        })
        .await
    }

    pub async fn list_events(
        &self,
        audit_id: AuditId,
        since: Option<i64>,
    ) -> Result<Vec<ProgressEvent>> {
        self.store.list(audit_id, since).await
    }

    /// Return events after `since` as soon as there are any, waiting up to
    /// `timeout`. An empty result means the timeout ran out.
    pub async fn wait_for_events(
        &self,
        audit_id: AuditId,
        since: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<ProgressEvent>> {
        let mut appended = self.appended.subscribe();
        let deadline = Instant::now() + timeout;

        loop {
            let events = self.store.list(audit_id, since).await?;
            if !events.is_empty() {
                return Ok(events);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(events);
            }
            let wake_at = deadline.min(now + self.recheck_interval);

            loop {
                match tokio::time::timeout_at(wake_at, appended.recv()).await {
                    Ok(Ok((id, event_id)))
                        if id == audit_id
                            && since.is_none_or(|cursor| event_id > cursor) =>
                    {
                        break;
                    }
                    Ok(Ok(_)) => continue,
                    Ok(Err(RecvError::Lagged(_))) => break,
                    Ok(Err(RecvError::Closed)) | Err(_) => break,
                }
            }
        }
    }
}
