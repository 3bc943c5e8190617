use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ids::JobId, queue::QueueBackend};

/// Background renewal of one job lease while the pipeline runs.
#[derive(Debug)]
pub(crate) struct LeaseKeeper {
    stop: CancellationToken,
    lost: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl LeaseKeeper {
    pub(crate) fn spawn(
        queue: Arc<dyn QueueBackend>,
        job_id: JobId,
        worker_id: String,
        lease: Duration,
        every: Duration,
        lost: Arc<AtomicBool>,
    ) -> Self {
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let task_lost = Arc::clone(&lost);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                match queue.renew(job_id, &worker_id, lease).await {
                    Ok(job) => {
                        debug!(
                            target: "auditq::worker",
                            %job_id,
                            worker = %worker_id,
                            locked_until = ?job.locked_until,
                            "lease renewed"
                        );
                    }
                    Err(err) if err.is_lease_error() => {
                        warn!(
                            target: "auditq::worker",
                            %job_id,
                            worker = %worker_id,
                            "lease lost during execution: {err}"
                        );
                        task_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(err) => {
                        // Transient store error: keep trying until the lease
                        // actually runs out.
                        warn!(
                            target: "auditq::worker",
                            %job_id,
                            worker = %worker_id,
                            "lease renewal failed: {err}"
                        );
                    }
                }
            }
        });

        Self { stop, lost, handle }
    }

    /// Stop renewing. Returns true when the lease was lost on the way.
    pub(crate) async fn stop(self) -> bool {
        self.stop.cancel();
        if let Err(err) = self.handle.await {
            warn!(target: "auditq::worker", "lease renewal task failed: {err}");
        }
        self.lost.load(Ordering::SeqCst)
    }
}
