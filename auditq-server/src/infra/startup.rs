//! Wires stores, queue, recorder, notifier and runtime from [`AppConfig`].

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use auditq_core::{
    JobService, PipelineRuntime, QueueBackendKind, SharedClock, SystemClock,
    db,
    events::{PgEventStore, ProgressRecorder},
    queue::{BrokerQueue, EmbeddedQueue, QueueBackend, RedisBroker},
    store::{JobStore, PgJobStore},
    webhook::{
        DeliveryWorker, HttpTransport, PgWebhookStore, WebhookNotifier,
        WebhookStore, WebhookTransport,
    },
};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::{infra::config::AppConfig, pipeline::HttpAuditPipeline};

/// Which long-running tasks this process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// HTTP API, plus workers when an executor endpoint is configured.
    Serve,
    /// Workers and drainer, no HTTP.
    Worker,
    /// Webhook drainer only.
    Drain,
}

#[derive(Debug)]
pub struct PipelineStack {
    pub pool: PgPool,
    pub service: JobService,
    pub runtime: PipelineRuntime,
}

pub async fn connect_database(config: &AppConfig) -> Result<PgPool> {
    db::connect(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to Postgres")
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    db::migrate(pool)
        .await
        .context("failed to apply database migrations")
}

async fn build_queue(
    config: &AppConfig,
    store: Arc<dyn JobStore>,
    clock: SharedClock,
) -> Result<Arc<dyn QueueBackend>> {
    let queue_config = &config.pipeline.queue;
    let queue: Arc<dyn QueueBackend> = match queue_config.backend {
        QueueBackendKind::Embedded => {
            Arc::new(EmbeddedQueue::new(store, queue_config.poll_interval()))
        }
        QueueBackendKind::Redis => {
            let redis = config
                .redis
                .as_ref()
                .context("redis queue backend selected without a redis url")?;
            let broker = RedisBroker::connect(&redis.url, &queue_config.key_prefix)
                .await
                .context("failed to connect to Redis")?;
            // Jobs queued in Postgres but never pushed get one lease of slack.
            Arc::new(BrokerQueue::new(
                store,
                broker,
                clock,
                config.pipeline.lease.lease(),
            ))
        }
    };
    info!(target: "auditq::queue", backend = queue_config.backend.as_str(), "queue backend ready");
    Ok(queue)
}

/// Build the full pipeline for `role`. Nothing is spawned until
/// [`PipelineRuntime::start`] is called.
pub async fn build_stack(config: &AppConfig, role: Role) -> Result<PipelineStack> {
    let pool = connect_database(config).await?;
    let clock = SystemClock::shared();

    let store: Arc<dyn JobStore> =
        Arc::new(PgJobStore::new(pool.clone(), clock.clone()));
    let queue = build_queue(config, store, clock.clone()).await?;
    let recorder = ProgressRecorder::new(Arc::new(PgEventStore::new(
        pool.clone(),
        clock.clone(),
    )));
    let webhooks: Arc<dyn WebhookStore> =
        Arc::new(PgWebhookStore::new(pool.clone(), clock.clone()));
    let notifier = WebhookNotifier::new(
        Arc::clone(&webhooks),
        clock.clone(),
        config.pipeline.webhooks.max_attempts,
    );

    let service = JobService::new(
        Arc::clone(&queue),
        recorder.clone(),
        notifier.clone(),
        config.pipeline.jobs.default_max_attempts,
    );

    let webhook_config = &config.pipeline.webhooks;
    let transport: Arc<dyn WebhookTransport> = Arc::new(
        HttpTransport::new(webhook_config.request_timeout(), &webhook_config.user_agent)
            .context("failed to build webhook HTTP client")?,
    );
    let drainer = DeliveryWorker::new(webhooks, transport, clock, webhook_config);

    let mut runtime =
        PipelineRuntime::new(config.pipeline.clone(), queue, recorder, notifier)
            .with_drainer(drainer);

    if role != Role::Drain {
        match &config.executor.endpoint {
            Some(endpoint) => {
                let pipeline =
                    HttpAuditPipeline::new(endpoint, config.executor.timeout())
                        .context("failed to build executor HTTP client")?;
                runtime = runtime.with_pipeline(Arc::new(pipeline));
            }
            None if role == Role::Worker => {
                bail!(
                    "`auditq worker` needs [pipeline].endpoint or AUDITQ_PIPELINE_ENDPOINT"
                );
            }
            None => {
                warn!("no pipeline endpoint configured; serving the API without workers");
            }
        }
    }

    Ok(PipelineStack {
        pool,
        service,
        runtime,
    })
}
