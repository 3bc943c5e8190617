#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use auditq_core::{
    AuditContext, AuditPipeline, DeliveryError, ExecutionError, ManualClock,
    SharedClock, TenantId,
    config::{LeaseConfig, WebhookConfig},
    events::{MemoryEventStore, ProgressRecorder},
    queue::{EmbeddedQueue, QueueBackend},
    store::{JobStore, MemoryJobStore},
    webhook::{
        DeliveryResponse, MemoryWebhookStore, NewWebhook, WebhookNotifier, WebhookStore,
        WebhookTransport, transport::OutboundWebhook,
    },
    worker::Worker,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// In-memory wiring of every pipeline component on one manual clock.
pub struct Harness {
    pub clock: ManualClock,
    pub shared_clock: SharedClock,
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<dyn QueueBackend>,
    pub recorder: ProgressRecorder,
    pub webhooks: Arc<MemoryWebhookStore>,
    pub notifier: WebhookNotifier,
}

impl Harness {
    pub fn embedded() -> Self {
        let clock = ManualClock::default();
        let shared_clock: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(MemoryJobStore::new(shared_clock.clone()));
        let queue: Arc<dyn QueueBackend> = Arc::new(EmbeddedQueue::new(
            store.clone() as Arc<dyn JobStore>,
            Duration::from_millis(10),
        ));
        Self::with_queue(clock, shared_clock, store, queue)
    }

    pub fn with_queue(
        clock: ManualClock,
        shared_clock: SharedClock,
        store: Arc<MemoryJobStore>,
        queue: Arc<dyn QueueBackend>,
    ) -> Self {
        let recorder = ProgressRecorder::new(Arc::new(MemoryEventStore::new(
            shared_clock.clone(),
        )))
        .with_recheck_interval(Duration::from_millis(50));
        let webhooks = Arc::new(MemoryWebhookStore::new(shared_clock.clone()));
        let notifier = WebhookNotifier::new(
            webhooks.clone() as Arc<dyn WebhookStore>,
            shared_clock.clone(),
            5,
        );
        Self {
            clock,
            shared_clock,
            store,
            queue,
            recorder,
            webhooks,
            notifier,
        }
    }

    pub fn worker(
        &self,
        id: &str,
        pipeline: Arc<dyn AuditPipeline>,
        lease: LeaseConfig,
    ) -> Worker {
        Worker::new(
            id,
            self.queue.clone(),
            pipeline,
            self.recorder.clone(),
            self.notifier.clone(),
            lease,
            Duration::from_millis(10),
        )
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

pub fn new_webhook(tenant_id: TenantId, url: &str, events: &[&str]) -> NewWebhook {
    NewWebhook {
        tenant_id,
        url: url.to_string(),
        secret: format!("secret-for-{url}"),
        events: events.iter().map(|ev| ev.to_string()).collect(),
    }
}

pub fn webhook_config() -> WebhookConfig {
    WebhookConfig {
        batch_size: 16,
        ..WebhookConfig::default()
    }
}

#[derive(Debug)]
pub enum Step {
    Succeed(Value),
    Retryable(&'static str),
    Terminal(&'static str),
    Panic(&'static str),
}

/// Pipeline that replays a fixed script, one step per call. Once the script
/// runs out every call succeeds.
#[derive(Debug, Default)]
pub struct ScriptedPipeline {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<i32>>,
}

impl ScriptedPipeline {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Attempt numbers seen, in call order.
    pub fn attempts(&self) -> Vec<i32> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AuditPipeline for ScriptedPipeline {
    async fn execute(
        &self,
        ctx: &AuditContext,
        _payload: &Value,
    ) -> Result<Value, ExecutionError> {
        self.calls.lock().push(ctx.attempt);
        let step = self.steps.lock().pop_front();
        match step {
            None => Ok(json!({ "score": 100 })),
            Some(Step::Succeed(value)) => Ok(value),
            Some(Step::Retryable(msg)) => Err(ExecutionError::retryable(msg)),
            Some(Step::Terminal(msg)) => Err(ExecutionError::terminal(msg)),
            Some(Step::Panic(msg)) => panic!("{msg}"),
        }
    }
}

/// Transport answering from per-URL status scripts; unscripted calls get 200.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<u16>>>,
    always: Mutex<HashMap<String, u16>>,
    sent: Mutex<Vec<OutboundWebhook>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, statuses: impl IntoIterator<Item = u16>) {
        self.scripts
            .lock()
            .insert(url.to_string(), statuses.into_iter().collect());
    }

    pub fn always(&self, url: &str, status: u16) {
        self.always.lock().insert(url.to_string(), status);
    }

    pub fn sent(&self) -> Vec<OutboundWebhook> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, url: &str) -> usize {
        self.sent.lock().iter().filter(|req| req.url == url).count()
    }
}

#[async_trait]
impl WebhookTransport for ScriptedTransport {
    async fn post(
        &self,
        request: OutboundWebhook,
    ) -> Result<DeliveryResponse, DeliveryError> {
        let url = request.url.clone();
        self.sent.lock().push(request);

        let scripted = self
            .scripts
            .lock()
            .get_mut(&url)
            .and_then(|statuses| statuses.pop_front());
        let status = scripted
            .or_else(|| self.always.lock().get(&url).copied())
            .unwrap_or(200);
        Ok(DeliveryResponse {
            status,
            body: format!("status {status}"),
        })
    }
}

pub fn header<'a>(request: &'a OutboundWebhook, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
