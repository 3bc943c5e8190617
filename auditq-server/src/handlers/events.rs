use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
};
use auditq_core::{AuditId, events::ProgressEvent};
use serde::{Deserialize, Serialize};

use crate::infra::{app_state::AppState, errors::AppResult};

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only events with a larger `event_id`.
    pub since: Option<i64>,
    /// Long-poll up to this long when nothing is newer than `since`.
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub audit_id: AuditId,
    pub events: Vec<ProgressEvent>,
    /// Cursor for the next call.
    pub next_since: Option<i64>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Path(audit_id): Path<AuditId>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> AppResult<Json<EventsResponse>> {
    let Query(query) = query?;

    let events = match query.wait_ms.filter(|ms| *ms > 0) {
        Some(ms) => {
            let wait = Duration::from_millis(ms).min(state.max_event_wait);
            state.jobs.wait_for_events(audit_id, query.since, wait).await?
        }
        None => state.jobs.list_events(audit_id, query.since).await?,
    };

    let next_since = events.last().map(|ev| ev.event_id).or(query.since);
    Ok(Json(EventsResponse {
        audit_id,
        events,
        next_since,
    }))
}
