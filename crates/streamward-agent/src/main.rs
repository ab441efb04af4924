//! streamward-agent - capture process supervisor daemon
//!
//! Keeps one streamlink|ffmpeg pipeline running per active monitor and
//! serves the control plane over HTTP.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamward_agent::api::{self, ApiState};
use streamward_agent::config::AgentConfig;
use streamward_agent::launcher::PipelineLauncher;
use streamward_agent::monitor::SysinfoProcessTable;
use streamward_agent::storage::Storage;
use streamward_agent::supervisor::{Supervisor, SupervisorSettings};
use streamward_agent::upstream;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::load().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("streamward_agent={}", config.server.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::info!("Starting streamward-agent on {}", host);
    tracing::info!("Platform: {}", std::env::consts::OS);
    tracing::info!("Listen address: {}", config.server.listen_addr);
    tracing::info!("Work root: {}", config.pipeline.work_root.display());

    let storage = Storage::new(config.storage.db_path.as_deref()).context("Failed to initialize storage")?;
    tracing::info!(
        monitors = storage.monitor_count().unwrap_or_default(),
        "Storage initialized"
    );

    let status: Arc<dyn upstream::StatusProvider> = Arc::from(upstream::from_config(&config.upstream));
    let supervisor = Supervisor::new(
        storage,
        Arc::new(SysinfoProcessTable::new()),
        Arc::new(PipelineLauncher::new(config.pipeline.clone())),
        status,
        SupervisorSettings::from_config(&config),
    )
    .context("Failed to build supervisor")?;
    let supervisor = Arc::new(supervisor);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watchdog = tokio::spawn(
        Arc::clone(&supervisor).run_watchdog(config.watchdog.interval(), shutdown_rx.clone()),
    );
    let reconciler = tokio::spawn(
        Arc::clone(&supervisor).run_reconciler(config.reconciler.interval(), shutdown_rx),
    );

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    tracing::info!("Control plane listening on {}", config.server.listen_addr);

    let app = api::router(ApiState::new(Arc::clone(&supervisor)));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shutting down; pipelines keep running");
    let _ = shutdown_tx.send(true);
    for (name, handle) in [("watchdog", watchdog), ("reconciler", reconciler)] {
        if let Err(e) = handle.await {
            tracing::warn!(task = name, error = %e, "Loop ended abnormally");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
