use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

mod api;
mod chain;
mod cli;
mod coordinator;
mod erc20;
mod metrics;
mod monitor;
mod scheduler;

use common::downsample::TimeSeriesDownsampler;
use common::snapshots::SnapshotStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) = common::observability::build_dispatch(
        "collector",
        &config.general.log_level,
        config.general.log_format,
    );
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    tracing::info!(command = ?cmd, "balance collector starting");

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let store = SnapshotStore::new(db);

    let fetcher = Arc::new(chain::ChainClient::new(Duration::from_secs(
        config.monitoring.request_timeout_secs,
    )));
    let monitor = Arc::new(monitor::MonitoringService::new(
        store.clone(),
        fetcher,
        config.network_descriptors(),
        config.wallets.clone(),
    ));
    monitor
        .initialize()
        .await
        .context("failed to initialize monitoring service")?;

    if cmd != cli::Command::Run {
        return cli::run_command(&monitor, &store, cmd, config.monitoring.retention_days).await;
    }

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    if config.monitoring.run_on_startup {
        monitor.trigger_balance_fetch();
    }
    if config.monitoring.auto_start {
        monitor.start_monitoring(&config.monitoring.schedule).await?;
    }

    let state = Arc::new(api::AppState {
        monitor: Arc::clone(&monitor),
        downsampler: TimeSeriesDownsampler::new(store.clone()),
        store,
        default_schedule: config.monitoring.schedule.clone(),
        started_at: chrono::Utc::now(),
    });
    let app = api::router(state).layer(TraceLayer::new_for_http());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %bind_addr, "starting collector HTTP server");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("shutting down");
    monitor.stop_monitoring().await?;
    Ok(())
}
