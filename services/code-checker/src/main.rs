//! Redeem Code Checker
//!
//! Single-binary runner that:
//! 1. Loads codes and caller credentials
//! 2. Checks every code concurrently against the validation endpoint
//! 3. Retries transient failures under a circuit breaker
//! 4. Reports progress in logs, an optional results file and an admin API

mod admin;
mod config;
mod error;
mod input;
mod metrics;
mod observers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use check_client::CheckClient;
use orchestrator::{Orchestrator, ProgressAggregator, SessionStatus};
use retry_policy::RetryPolicy;
use token_pool::TokenPool;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::observers::{LogObserver, ResultLog};

/// How long the admin listener gets to drain after the session ends.
const ADMIN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between progress log lines while a session runs.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting redeem-code-checker");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let codes = input::read_codes(&config.input.codes_file)?;

    info!(
        codes = codes.len(),
        tokens = config.input.tokens.len(),
        workers = config.engine.max_workers,
        endpoint = %config.client.endpoint,
        "configuration loaded"
    );

    if config.input.tokens.is_empty() {
        warn!("no credentials configured, every check will report a credential error");
    }

    let pool = Arc::new(TokenPool::new(
        config.input.tokens.iter().map(|t| t.expose().clone()),
    ));
    let client = Arc::new(
        CheckClient::new(&config.client, pool.clone()).context("failed to build check client")?,
    );
    let policy = Arc::new(RetryPolicy::new(config.retry.clone()));
    let engine = Orchestrator::new(client.clone(), policy, config.engine.clone())?;

    let progress = Arc::new(ProgressAggregator::new());
    engine.add_observer(Arc::new(LogObserver));
    engine.add_observer(progress.clone());
    if let Some(path) = &config.input.results_file {
        let log = ResultLog::create(path)?;
        info!(path = %path.display(), "appending results");
        engine.add_observer(Arc::new(log));
    }

    // Admin listener runs for the lifetime of the session
    let admin = match &config.admin {
        Some(admin_config) => {
            let state = AdminState::new(
                engine.clone(),
                pool.clone(),
                client.clone(),
                progress.clone(),
                prometheus_handle,
            );
            let app = build_admin_router(state, admin_config.max_connections);
            let listener = TcpListener::bind(admin_config.listen_addr)
                .await
                .with_context(|| format!("failed to bind to {}", admin_config.listen_addr))?;
            info!(addr = %admin_config.listen_addr, "admin API listening");

            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
            let server_handle = tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
            });
            Some((shutdown_tx, server_handle))
        }
        None => None,
    };

    let reporter = tokio::spawn(report_progress(progress.clone()));

    engine.start(codes).await?;

    let status = tokio::select! {
        status = engine.wait() => status,
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping session");
            if let Err(e) = engine.stop().await {
                warn!(error = %e, "stop request rejected");
            }
            engine.status()
        }
    };

    reporter.abort();
    metrics::record_session(status);

    let stats = engine.stats();
    info!(
        status = %status,
        total = stats.total,
        checked = stats.checked,
        valid = stats.valid,
        used = stats.used,
        invalid = stats.invalid,
        expired = stats.expired,
        errors = stats.error,
        skipped = stats.skipped,
        "session finished"
    );

    if let Some((shutdown_tx, server_handle)) = admin {
        let _ = shutdown_tx.send(());
        match tokio::time::timeout(ADMIN_DRAIN_TIMEOUT, server_handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "admin server error during shutdown"),
            Ok(Err(e)) => error!(error = %e, "admin server task panicked"),
            Err(_) => warn!(
                drain_timeout_secs = ADMIN_DRAIN_TIMEOUT.as_secs(),
                "admin drain timeout exceeded, forcing shutdown"
            ),
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Log a progress line on a fixed interval while the session runs.
async fn report_progress(progress: Arc<ProgressAggregator>) {
    let mut ticker = tokio::time::interval(PROGRESS_LOG_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snap = progress.snapshot();
        if snap.status != SessionStatus::Running {
            continue;
        }
        info!(
            checked = snap.stats.checked,
            total = snap.stats.total,
            percent = format!("{:.1}", snap.progress_percentage),
            rate = format!("{:.2}", snap.codes_per_second),
            elapsed = %snap.elapsed,
            eta = snap.estimated_remaining.as_deref().unwrap_or("-"),
            "progress"
        );
    }
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
}
