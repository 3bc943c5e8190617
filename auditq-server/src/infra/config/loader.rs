use std::{
    fs,
    path::{Path, PathBuf},
};

use auditq_core::{PipelineConfig, QueueBackendKind};
use serde::Deserialize;

use super::{
    AppConfig, ConfigLoad, ConfigLoadError, ConfigMetadata, DatabaseConfig,
    ExecutorConfig, RedisConfig, ServerConfig,
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["auditq.toml", "config/auditq.toml"];

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Raw configuration as written in a TOML file.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub redis: Option<FileRedisConfig>,
    #[serde(default, rename = "pipeline")]
    pub executor: ExecutorConfig,
    #[serde(flatten)]
    pub runtime: PipelineConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileDatabaseConfig {
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileRedisConfig {
    pub url: String,
}

/// Values read from the process environment. These win over the file.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub queue_backend: Option<String>,
    pub workers: Option<String>,
    pub pipeline_endpoint: Option<String>,
}

impl EnvOverrides {
    pub fn gather() -> Self {
        fn var(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|value| !value.trim().is_empty())
        }

        Self {
            config_path: var("AUDITQ_CONFIG").map(PathBuf::from),
            database_url: var("DATABASE_URL"),
            redis_url: var("REDIS_URL"),
            host: var("AUDITQ_HOST"),
            port: var("AUDITQ_PORT"),
            queue_backend: var("AUDITQ_QUEUE_BACKEND"),
            workers: var("AUDITQ_WORKERS"),
            pipeline_endpoint: var("AUDITQ_PIPELINE_ENDPOINT"),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// `.env`, then the TOML file, then environment overrides.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        self.load_with_env(EnvOverrides::gather(), env_file_loaded)
    }

    /// Resolve against an explicit environment snapshot.
    pub fn load_with_env(
        &self,
        env: EnvOverrides,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let config = compose(file_config.unwrap_or_default(), env)?;
        config.validate()?;

        Ok(ConfigLoad {
            config,
            metadata: ConfigMetadata {
                env_file_loaded,
                config_path,
            },
        })
    }

    fn load_file_config(
        &self,
        env: &EnvOverrides,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(Path::new)
                .find(|candidate| candidate.exists())
            {
                Some(found) => found.to_path_buf(),
                None => return Ok((None, None)),
            },
        };

        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }
}

pub fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|err| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source: err,
        })?;
    toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source: err,
    })
}

fn compose(
    file: FileConfig,
    env: EnvOverrides,
) -> Result<AppConfig, ConfigLoadError> {
    let defaults = ServerConfig::default();
    let port = match env.port {
        Some(raw) => raw.parse::<u16>().map_err(|e| ConfigLoadError::Invalid {
            field: "AUDITQ_PORT",
            reason: e.to_string(),
        })?,
        None => file.server.port.unwrap_or(defaults.port),
    };
    let server = ServerConfig {
        host: env.host.or(file.server.host).unwrap_or(defaults.host),
        port,
    };

    let database = DatabaseConfig {
        url: env
            .database_url
            .or(file.database.url)
            .ok_or(ConfigLoadError::MissingDatabaseUrl)?,
        max_connections: file
            .database
            .max_connections
            .unwrap_or(DEFAULT_MAX_CONNECTIONS),
    };

    let redis = env
        .redis_url
        .or(file.redis.map(|redis| redis.url))
        .map(|url| RedisConfig { url });

    let mut pipeline = file.runtime;
    if let Some(raw) = env.queue_backend {
        pipeline.queue.backend = match raw.to_ascii_lowercase().as_str() {
            "embedded" => QueueBackendKind::Embedded,
            "redis" => QueueBackendKind::Redis,
            other => {
                return Err(ConfigLoadError::Invalid {
                    field: "AUDITQ_QUEUE_BACKEND",
                    reason: format!("unknown backend '{other}'"),
                });
            }
        };
    }
    if let Some(raw) = env.workers {
        pipeline.workers.count =
            raw.parse().map_err(|e: std::num::ParseIntError| {
                ConfigLoadError::Invalid {
                    field: "AUDITQ_WORKERS",
                    reason: e.to_string(),
                }
            })?;
    }

    let mut executor = file.executor;
    if env.pipeline_endpoint.is_some() {
        executor.endpoint = env.pipeline_endpoint;
    }

    Ok(AppConfig {
        server,
        database,
        redis,
        executor,
        pipeline,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn env_with_db() -> EnvOverrides {
        EnvOverrides {
            database_url: Some("postgres://localhost/auditq".into()),
            ..EnvOverrides::default()
        }
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn file_sections_and_defaults_compose() {
        let file = write_config(
            r#"
            [server]
            port = 9000

            [database]
            url = "postgres://file/auditq"
            max_connections = 4

            [redis]
            url = "redis://cache:6379"

            [queue]
            backend = "redis"

            [lease]
            lease_secs = 120

            [pipeline]
            endpoint = "http://executor:8080/run"
            "#,
        );

        let load = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(EnvOverrides::default(), false)
            .expect("config loads");
        let config = load.config;

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.url, "postgres://file/auditq");
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.pipeline.queue.backend, QueueBackendKind::Redis);
        assert_eq!(config.pipeline.queue.key_prefix, "auditq");
        assert_eq!(config.pipeline.lease.lease_secs, 120);
        assert_eq!(config.pipeline.lease.renew_at_fraction, 0.5);
        assert_eq!(
            config.executor.endpoint.as_deref(),
            Some("http://executor:8080/run")
        );
        assert_eq!(config.executor.timeout_secs, 900);
        assert_eq!(load.metadata.config_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn environment_wins_over_file() {
        let file = write_config(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [database]
            url = "postgres://file/auditq"
            "#,
        );
        let env = EnvOverrides {
            database_url: Some("postgres://env/auditq".into()),
            port: Some("7000".into()),
            workers: Some("6".into()),
            ..EnvOverrides::default()
        };

        let config = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(env, false)
            .expect("config loads")
            .config;
        assert_eq!(config.database.url, "postgres://env/auditq");
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.pipeline.workers.count, 6);
        assert_eq!(config.bind_address(), "127.0.0.1:7000");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = ConfigLoader::new()
            .with_config_path("/definitely/not/here/auditq.toml")
            .load_with_env(env_with_db(), false)
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }

    #[test]
    fn malformed_toml_reports_the_path() {
        let file = write_config("[server\nport = ");
        let err = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(env_with_db(), false)
            .unwrap_err();
        match err {
            ConfigLoadError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn database_url_is_required() {
        let file = write_config("[server]\nport = 3080\n");
        let err = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(EnvOverrides::default(), false)
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingDatabaseUrl));
    }

    #[test]
    fn redis_backend_requires_a_redis_url() {
        let file = write_config("[queue]\nbackend = \"redis\"\n");
        let err = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(env_with_db(), false)
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingRedisUrl));
    }

    #[test]
    fn renew_fraction_and_counts_are_checked() {
        let file = write_config("[lease]\nrenew_at_fraction = 1.0\n");
        let err = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(env_with_db(), false)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::Invalid { field: "lease.renew_at_fraction", .. }
        ));

        let file = write_config("[workers]\ncount = 0\n");
        let err = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(env_with_db(), false)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::Invalid { field: "workers.count", .. }
        ));
    }

    #[test]
    fn unknown_backend_in_env_is_rejected() {
        let file = write_config("");
        let env = EnvOverrides {
            queue_backend: Some("kafka".into()),
            ..env_with_db()
        };
        let err = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(env, false)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::Invalid { field: "AUDITQ_QUEUE_BACKEND", .. }
        ));
    }
}
