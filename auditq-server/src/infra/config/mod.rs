pub mod loader;

use std::{path::PathBuf, time::Duration};

use auditq_core::{PipelineConfig, QueueBackendKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use loader::{ConfigLoader, ConfigLoaderOptions, EnvOverrides, FileConfig};

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub executor: ExecutorConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3080,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
}

/// The external audit executor the HTTP pipeline adapter calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 900,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub env_file_loaded: bool,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: AppConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("config file not found at {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("database url is not set (DATABASE_URL or [database].url)")]
    MissingDatabaseUrl,
    #[error("queue.backend = \"redis\" needs REDIS_URL or [redis].url")]
    MissingRedisUrl,
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

impl ConfigLoadError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigLoadError::MissingDatabaseUrl);
        }
        if self.database.max_connections == 0 {
            return Err(ConfigLoadError::invalid(
                "database.max_connections",
                "must be at least 1",
            ));
        }
        if self.pipeline.queue.backend == QueueBackendKind::Redis
            && self.redis.is_none()
        {
            return Err(ConfigLoadError::MissingRedisUrl);
        }

        let fraction = self.pipeline.lease.renew_at_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigLoadError::invalid(
                "lease.renew_at_fraction",
                format!("{fraction} is outside (0, 1)"),
            ));
        }

        let counts: [(&'static str, u64); 6] = [
            ("lease.lease_secs", self.pipeline.lease.lease_secs),
            ("workers.count", self.pipeline.workers.count as u64),
            ("webhooks.batch_size", self.pipeline.webhooks.batch_size as u64),
            (
                "webhooks.request_timeout_secs",
                self.pipeline.webhooks.request_timeout_secs,
            ),
            ("queue.poll_interval_ms", self.pipeline.queue.poll_interval_ms),
            ("pipeline.timeout_secs", self.executor.timeout_secs),
        ];
        if let Some((field, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigLoadError::invalid(field, "must be greater than zero"));
        }

        if self.pipeline.jobs.default_max_attempts < 1 {
            return Err(ConfigLoadError::invalid(
                "jobs.default_max_attempts",
                "must be at least 1",
            ));
        }
        if self.pipeline.webhooks.max_attempts < 1 {
            return Err(ConfigLoadError::invalid(
                "webhooks.max_attempts",
                "must be at least 1",
            ));
        }

        if let Some(endpoint) = &self.executor.endpoint {
            url::Url::parse(endpoint).map_err(|e| {
                ConfigLoadError::invalid("pipeline.endpoint", e.to_string())
            })?;
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
