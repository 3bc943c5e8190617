use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime knobs for the execution pipeline.
///
/// Every section has defaults, so a deployment only spells out what it
/// changes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub lease: LeaseConfig,
    pub jobs: JobsConfig,
    pub workers: WorkerConfig,
    pub webhooks: WebhookConfig,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    /// The job store doubles as the queue.
    #[default]
    Embedded,
    /// Reliable-queue lists on Redis.
    Redis,
}

impl QueueBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueBackendKind::Embedded => "embedded",
            QueueBackendKind::Redis => "redis",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackendKind,
    /// Prefix for broker keys (`{prefix}:pending`, `{prefix}:lease:{id}`).
    pub key_prefix: String,
    /// Idle wait between claim attempts when the queue is empty.
    pub poll_interval_ms: u64,
    /// Broker reaper cadence.
    pub reap_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::Embedded,
            key_prefix: "auditq".to_string(),
            poll_interval_ms: 1_000,
            reap_interval_ms: 15_000,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub lease_secs: u64,
    /// Renew once this fraction of the lease has elapsed.
    pub renew_at_fraction: f32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_secs: 60,
            renew_at_fraction: 0.5,
        }
    }
}

impl LeaseConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        let fraction = self.renew_at_fraction.clamp(0.05, 0.95) as f64;
        Duration::from_secs_f64(self.lease_secs as f64 * fraction)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub default_max_attempts: i32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    pub id_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 2,
            id_prefix: "worker".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub max_attempts: i32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub request_timeout_secs: u64,
    pub drain_interval_ms: u64,
    pub batch_size: usize,
    /// Bytes of the endpoint's response body kept on the delivery row.
    pub response_body_limit: usize,
    pub user_agent: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_secs: 30,
            backoff_max_secs: 3_600,
            request_timeout_secs: 10,
            drain_interval_ms: 1_000,
            batch_size: 32,
            response_body_limit: 2_048,
            user_agent: concat!("auditq/", env!("CARGO_PKG_VERSION"))
                .to_string(),
        }
    }
}

impl WebhookConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// How long a claimed delivery stays invisible to other drainers.
    pub fn in_flight_timeout(&self) -> Duration {
        self.request_timeout() * 2 + Duration::from_secs(5)
    }
}
