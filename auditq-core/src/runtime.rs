//! Owns the long-running tasks of a pipeline process: the worker pool, the
//! webhook drainer and the broker reaper.

use std::{fmt, sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::{PipelineConfig, QueueBackendKind},
    events::ProgressRecorder,
    queue::QueueBackend,
    webhook::{DeliveryWorker, WebhookNotifier},
    worker::{AuditPipeline, Worker},
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PipelineRuntime {
    config: PipelineConfig,
    queue: Arc<dyn QueueBackend>,
    recorder: ProgressRecorder,
    notifier: WebhookNotifier,
    pipeline: Option<Arc<dyn AuditPipeline>>,
    drainer: Option<DeliveryWorker>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("queue", &self.queue.kind())
            .field("workers", &self.pipeline.as_ref().map(|_| self.config.workers.count))
            .field("drainer", &self.drainer.is_some())
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl PipelineRuntime {
    pub fn new(
        config: PipelineConfig,
        queue: Arc<dyn QueueBackend>,
        recorder: ProgressRecorder,
        notifier: WebhookNotifier,
    ) -> Self {
        Self {
            config,
            queue,
            recorder,
            notifier,
            pipeline: None,
            drainer: None,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `workers.count` workers against this pipeline.
    pub fn with_pipeline(mut self, pipeline: Arc<dyn AuditPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_drainer(mut self, drainer: DeliveryWorker) -> Self {
        self.drainer = Some(drainer);
        self
    }

    pub fn queue(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn worker_id(&self, index: usize) -> String {
        format!(
            "{}-{}-w{index}",
            self.config.workers.id_prefix,
            std::process::id()
        )
    }

    /// Spawn every configured task. Calling `start` twice spawns twice.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;

        if let Some(pipeline) = &self.pipeline {
            for index in 0..self.config.workers.count {
                let worker = Worker::new(
                    self.worker_id(index),
                    Arc::clone(&self.queue),
                    Arc::clone(pipeline),
                    self.recorder.clone(),
                    self.notifier.clone(),
                    self.config.lease.clone(),
                    self.config.queue.poll_interval(),
                );
                let token = self.shutdown.clone();
                handles.push(tokio::spawn(async move { worker.run(token).await }));
            }
        }

        if let Some(drainer) = &self.drainer {
            let drainer = drainer.clone();
            let token = self.shutdown.clone();
            handles.push(tokio::spawn(async move { drainer.run(token).await }));
        }

        if self.queue.kind() == QueueBackendKind::Redis {
            let queue = Arc::clone(&self.queue);
            let every = self.config.queue.reap_interval();
            let token = self.shutdown.clone();
            handles.push(tokio::spawn(reap_loop(queue, every, token)));
        }

        info!(
            target: "auditq::runtime",
            queue = self.queue.kind().as_str(),
            workers = if self.pipeline.is_some() { self.config.workers.count } else { 0 },
            drainer = self.drainer.is_some(),
            "pipeline runtime started"
        );
    }

    /// Cancel every task and wait for them. Workers finish the job they are
    /// running first.
    pub async fn shutdown(&self) {
        info!(target: "auditq::runtime", "shutting down pipeline runtime");
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(target: "auditq::runtime", "pipeline task failed: {err}")
                }
                Err(_) => {
                    warn!(target: "auditq::runtime", "pipeline task timed out during shutdown")
                }
            }
        }
        info!(target: "auditq::runtime", "pipeline runtime stopped");
    }
}

async fn reap_loop(
    queue: Arc<dyn QueueBackend>,
    every: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        match queue.reap_expired().await {
            Ok(0) => {}
            Ok(moved) => {
                info!(target: "auditq::queue", moved, "returned abandoned jobs to pending")
            }
            Err(err) => error!(target: "auditq::queue", "reap pass failed: {err}"),
        }
    }
}
