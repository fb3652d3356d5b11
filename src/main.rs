//! Entry point: wiring, ingress lifecycle and graceful shutdown

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eth_rpc_proxy::config::Config;
use eth_rpc_proxy::detector::RateLimitDetector;
use eth_rpc_proxy::metrics::Metrics;
use eth_rpc_proxy::pool::WorkerPool;
use eth_rpc_proxy::router::RequestRouter;
use eth_rpc_proxy::server::{app, AppState};
use eth_rpc_proxy::stats::StatsStore;

/// Time allowed for worker queues to empty during shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    info!("Starting eth-rpc-proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;
    config.validate().context("Invalid configuration")?;
    info!(endpoints = config.endpoints.len(), "configuration loaded");

    let metrics = Arc::new(Metrics::new().context("Failed to build metrics registry")?);

    info!(path = %config.database.path, "opening statistics database");
    let store = Arc::new(StatsStore::open(&config.database.path).await?);

    let detector = Arc::new(RateLimitDetector::new(config.rate_limit.clone()));
    let client = reqwest::Client::builder()
        .build()
        .context("Failed to build upstream HTTP client")?;

    let pool = Arc::new(
        WorkerPool::build(
            &config,
            client,
            Arc::clone(&detector),
            Arc::clone(&store),
            Arc::clone(&metrics),
        )
        .await?,
    );
    metrics.available_workers.set(pool.available().len() as i64);
    let probe_task = Arc::clone(&pool).start_health_probes(Arc::clone(&metrics));

    let router = Arc::new(RequestRouter::new(Arc::clone(&pool), Arc::clone(&metrics)));
    let state = AppState {
        router,
        pool: Arc::clone(&pool),
        store: Arc::clone(&store),
        metrics,
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind ingress on {}", addr))?;
    info!(%addr, "ingress listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Ingress server error")?;

    // Ingress has stopped accepting; let in-flight work finish
    probe_task.abort();
    if !pool.drain(DRAIN_TIMEOUT).await {
        warn!(
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "worker queues did not drain in time, dropping remaining work"
        );
    }
    pool.shutdown();
    store.close().await;
    info!("shutdown complete");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "eth_rpc_proxy=debug,info"
    } else {
        "eth_rpc_proxy=info,warn,error"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
