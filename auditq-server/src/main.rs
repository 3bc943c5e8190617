//! # auditq
//!
//! Runs the audit job pipeline: HTTP API, workers, webhook drainer and
//! schema migrations. See `auditq --help`.

use std::path::PathBuf;

use anyhow::Context;
use auditq_server::{
    AppState, create_app,
    infra::{
        config::{AppConfig, ConfigLoader, ConfigLoaderOptions},
        startup::{self, PipelineStack, Role},
    },
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "auditq", version)]
#[command(about = "Durable audit job pipeline with leases, progress events and webhooks")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true, env = "AUDITQ_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// HTTP API plus workers and drainer
    Serve,
    /// Workers and drainer without the HTTP API
    Worker,
    /// Webhook drainer only
    Drain,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,auditq=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let load = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config.clone(),
        env_file: cli.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    if load.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &load.metadata.config_path {
        info!(path = %path.display(), "loaded config file");
    }
    let config = load.config;

    match cli.command {
        Command::Migrate => {
            let pool = startup::connect_database(&config).await?;
            startup::run_migrations(&pool).await?;
            Ok(())
        }
        Command::Serve => serve(config).await,
        Command::Worker => run_headless(config, Role::Worker).await,
        Command::Drain => run_headless(config, Role::Drain).await,
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let PipelineStack {
        pool,
        service,
        runtime,
    } = startup::build_stack(&config, Role::Serve).await?;
    startup::run_migrations(&pool).await?;
    runtime.start().await;

    let app = create_app(AppState::new(service));
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "auditq API listening");

    let stop = CancellationToken::new();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(stop.clone().cancelled_owned());
    let signal = tokio::spawn(async move {
        wait_for_signal().await;
        stop.cancel();
    });

    let served = server.await;
    signal.abort();
    runtime.shutdown().await;
    pool.close().await;
    served.context("HTTP server failed")
}

async fn run_headless(config: AppConfig, role: Role) -> anyhow::Result<()> {
    let PipelineStack { pool, runtime, .. } =
        startup::build_stack(&config, role).await?;
    runtime.start().await;
    info!(?role, "auditq running; press Ctrl-C to stop");

    wait_for_signal().await;
    runtime.shutdown().await;
    pool.close().await;
    Ok(())
}

async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
