use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{EventStore, NewProgressEvent, ProgressEvent};
use crate::{
    clock::{Clock, SharedClock, SystemClock},
    error::Result,
    ids::AuditId,
};

#[derive(Default)]
struct Timeline {
    next_id: i64,
    events: Vec<ProgressEvent>,
    latest: HashMap<AuditId, DateTime<Utc>>,
}

#[derive(Clone)]
pub struct MemoryEventStore {
    timeline: Arc<Mutex<Timeline>>,
    clock: SharedClock,
}

impl fmt::Debug for MemoryEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MemoryEventStore");
        match self.timeline.try_lock() {
            Ok(timeline) => {
                debug.field("events", &timeline.events.len());
            }
            Err(_) => {
                debug.field("events", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(SystemClock::shared())
    }
}

impl MemoryEventStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            timeline: Arc::new(Mutex::new(Timeline::default())),
            clock,
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: NewProgressEvent) -> Result<ProgressEvent> {
        event.validate()?;
        let now = self.clock.now();
        let mut timeline = self.timeline.lock().await;
        timeline.next_id += 1;
        let created_at = timeline
            .latest
            .get(&event.audit_id)
            .map_or(now, |prev| now.max(*prev));
        timeline.latest.insert(event.audit_id, created_at);

        let stored = ProgressEvent {
            event_id: timeline.next_id,
            audit_id: event.audit_id,
            job_id: event.job_id,
            event_type: event.event_type,
            message: event.message,
            data: event.data,
            progress_pct: event.progress_pct,
            created_at,
        };
        timeline.events.push(stored.clone());
        Ok(stored)
    }

    async fn list(
        &self,
        audit_id: AuditId,
        since: Option<i64>,
    ) -> Result<Vec<ProgressEvent>> {
        let timeline = self.timeline.lock().await;
        Ok(timeline
            .events
            .iter()
            .filter(|ev| ev.audit_id == audit_id)
            .filter(|ev| since.is_none_or(|cursor| ev.event_id > cursor))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, events::EventType};

    #[tokio::test]
    async fn created_at_never_goes_backwards() {
        let clock = ManualClock::default();
        let store = MemoryEventStore::new(Arc::new(clock.clone()));
        let audit = AuditId::new();

        let first = store
            .append(NewProgressEvent::new(audit, None, EventType::StepStarted, "a"))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(-5));
        let second = store
            .append(NewProgressEvent::new(audit, None, EventType::StepDone, "b"))
            .await
            .unwrap();

        assert!(second.event_id > first.event_id);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn list_filters_by_audit_and_cursor() {
        let store = MemoryEventStore::default();
        let (a, b) = (AuditId::new(), AuditId::new());
        let first = store
            .append(NewProgressEvent::new(a, None, EventType::StepStarted, "1"))
            .await
            .unwrap();
        store
            .append(NewProgressEvent::new(b, None, EventType::StepStarted, "x"))
            .await
            .unwrap();
        store
            .append(NewProgressEvent::new(a, None, EventType::StepDone, "2"))
            .await
            .unwrap();

        let all = store.list(a, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let after = store.list(a, Some(first.event_id)).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].message, "2");
    }
}
