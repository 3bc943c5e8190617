use std::{fmt, sync::Arc, time::Duration};

use auditq_core::{JobService, webhook::WebhookStore};

/// Upper bound for `wait_ms` on the events endpoint.
pub const MAX_EVENT_WAIT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub jobs: JobService,
    pub max_event_wait: Duration,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(jobs: JobService) -> Self {
        Self {
            jobs,
            max_event_wait: MAX_EVENT_WAIT,
        }
    }

    pub fn webhooks(&self) -> &Arc<dyn WebhookStore> {
        self.jobs.notifier().store()
    }
}
