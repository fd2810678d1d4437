mod cache;
mod config;
mod health;
mod http;
mod metrics;
mod retry;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::{BackendOptions, CacheBackend};
use crate::config::Config;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "bazel-cache-proxy", about = "Bazel HTTP remote cache proxy")]
struct Cli {
    /// Path to an optional YAML configuration file.
    #[arg(short, long, env = "BAZEL_REMOTE_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, env = "BAZEL_REMOTE_CACHE_HOST")]
    host: Option<String>,

    /// Port to listen on.
    #[arg(long, env = "BAZEL_REMOTE_CACHE_PORT")]
    port: Option<u16>,

    /// Prefix for every remote cache key.
    #[arg(long, env = "BAZEL_REMOTE_CACHE_NAMESPACE")]
    namespace: Option<String>,

    /// Local staging directory for blobs in transit.
    #[arg(long, env = "BAZEL_REMOTE_CACHE_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, env = "BAZEL_REMOTE_CACHE_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Flags (and their environment variables) win over the config file.
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(namespace) = self.namespace {
            config.cache.namespace = namespace;
        }
        if let Some(store_dir) = self.store_dir {
            config.cache.store_dir = store_dir;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub backend: CacheBackend,
    pub metrics: MetricsRegistry,
    /// Where PUT bodies are spooled before being handed to the backend.
    pub tmp_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(config: &Config, state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state));

    let listen_addr = config.server.listen_addr();
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let mut config = match cli.config.as_deref() {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    let config_path = cli.config.clone();
    cli.apply(&mut config);
    config::validate_config(&config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = ?config_path, "starting bazel-cache-proxy");

    // ---- Local directories ----
    tokio::fs::create_dir_all(&config.cache.store_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create store dir: {}",
                config.cache.store_dir.display()
            )
        })?;
    tokio::fs::create_dir_all(&config.server.tmp_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create temp dir: {}",
                config.server.tmp_dir.display()
            )
        })?;

    // ---- Remote store ----
    let store = storage::build_store(&config.remote).await?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Cache backend ----
    let opts = BackendOptions::from_config(&config);
    let backend = CacheBackend::new(opts.clone(), store, metrics.clone());
    cache::backend::log_startup(&backend, &opts);

    // ---- App state ----
    let state = AppState {
        backend,
        metrics,
        tmp_dir: config.server.tmp_dir.clone(),
    };

    run_http_server(&config, state).await?;

    tracing::info!("bazel-cache-proxy shut down cleanly");
    Ok(())
}
