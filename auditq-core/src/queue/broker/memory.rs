use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use super::{Broker, lease_expiry};
use crate::{
    clock::{Clock, SharedClock, SystemClock},
    error::Result,
    ids::JobId,
};

#[derive(Default)]
struct Lists {
    /// Front is the Redis "left".
    pending: VecDeque<JobId>,
    processing: VecDeque<JobId>,
    leases: HashMap<JobId, (String, DateTime<Utc>)>,
}

impl Lists {
    fn lease_alive(&self, job_id: &JobId, now: DateTime<Utc>) -> bool {
        self.leases
            .get(job_id)
            .is_some_and(|(_, expires)| *expires > now)
    }

    fn remove_processing(&mut self, job_id: JobId) {
        if let Some(pos) = self.processing.iter().position(|id| *id == job_id) {
            self.processing.remove(pos);
        }
        self.leases.remove(&job_id);
    }
}

/// In-process broker with the same list semantics as [`super::RedisBroker`].
/// Lease keys expire against the injected clock.
#[derive(Clone)]
pub struct MemoryBroker {
    lists: Arc<Mutex<Lists>>,
    notify: Arc<Notify>,
    clock: SharedClock,
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MemoryBroker");
        match self.lists.try_lock() {
            Ok(lists) => {
                debug
                    .field("pending", &lists.pending.len())
                    .field("processing", &lists.processing.len());
            }
            Err(_) => {
                debug.field("lists", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(SystemClock::shared())
    }
}

impl MemoryBroker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            lists: Arc::new(Mutex::new(Lists::default())),
            notify: Arc::new(Notify::new()),
            clock,
        }
    }

    pub async fn pending(&self) -> Vec<JobId> {
        self.lists.lock().await.pending.iter().copied().collect()
    }

    pub async fn processing(&self) -> Vec<JobId> {
        self.lists.lock().await.processing.iter().copied().collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push_pending(&self, job_id: JobId) -> Result<()> {
        self.lists.lock().await.pending.push_front(job_id);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn claim(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobId>> {
        let expires = lease_expiry(self.clock.as_ref(), lease);
        let mut lists = self.lists.lock().await;
        let Some(job_id) = lists.pending.pop_back() else {
            return Ok(None);
        };
        lists.processing.push_front(job_id);
        lists
            .leases
            .insert(job_id, (worker_id.to_string(), expires));
        Ok(Some(job_id))
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        let expires = lease_expiry(self.clock.as_ref(), lease);
        let mut lists = self.lists.lock().await;
        if !lists.lease_alive(&job_id, now) {
            return Ok(false);
        }
        match lists.leases.get_mut(&job_id) {
            Some((owner, until)) if owner == worker_id => {
                *until = expires;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, job_id: JobId) -> Result<()> {
        self.lists.lock().await.remove_processing(job_id);
        Ok(())
    }

    async fn requeue(&self, job_id: JobId) -> Result<()> {
        {
            let mut lists = self.lists.lock().await;
            lists.remove_processing(job_id);
            lists.pending.push_front(job_id);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn reap_expired(&self) -> Result<Vec<JobId>> {
        let now = self.clock.now();
        let mut lists = self.lists.lock().await;
        let expired: Vec<JobId> = lists
            .processing
            .iter()
            .copied()
            .filter(|id| !lists.lease_alive(id, now))
            .collect();
        for job_id in &expired {
            lists.remove_processing(*job_id);
            lists.pending.push_back(*job_id);
        }
        drop(lists);
        if !expired.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(expired)
    }

    async fn ensure_pending(&self, job_id: JobId) -> Result<bool> {
        let mut lists = self.lists.lock().await;
        if lists.pending.contains(&job_id) || lists.processing.contains(&job_id)
        {
            return Ok(false);
        }
        lists.pending.push_front(job_id);
        drop(lists);
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn wait_for_pending(&self, timeout: Duration) -> Result<bool> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !self.lists.lock().await.pending.is_empty() {
            return Ok(true);
        }
        if tokio::time::timeout(timeout, notified).await.is_err() {
            return Ok(false);
        }
        Ok(!self.lists.lock().await.pending.is_empty())
    }
}
