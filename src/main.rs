// =============================================================================
// Meridian Trade Router — Main Entry Point
// =============================================================================
//
// Hosts the pipeline stages (Ingestion, Cerebro, Execution), the account
// poller, and the ops API as independently spawned tasks around one shared
// store and topic bus. The router starts with live trading OFF and mock
// brokers ON; real order flow must be enabled explicitly per deployment.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod accounts;
mod api;
mod app_state;
mod brokers;
mod bus;
mod cerebro;
mod config;
mod execution;
mod ingestion;
mod journal;
mod margin;
mod positions;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::accounts::AccountPoller;
use crate::app_state::AppState;
use crate::bus::Bus;
use crate::cerebro::CerebroService;
use crate::config::RuntimeConfig;
use crate::execution::ExecutionService;
use crate::ingestion::IngestionService;
use crate::store::Database;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        eprintln!("failed to load {CONFIG_PATH} ({e:#}) — using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    let _journal_guard = journal::init(&config.log_dir).context("failed to initialise logging")?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Trade Router — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // SAFETY: never route to real brokers unless live trading is explicit.
    if !config.live_trading && !config.mock_brokers {
        warn!("live_trading is off — forcing mock brokers");
        config.mock_brokers = true;
    }

    info!(
        environment = %config.environment,
        live_trading = config.live_trading,
        mock_brokers = config.mock_brokers,
        services = ?config.services,
        "configuration resolved"
    );

    // ── 2. Store & bootstrap ─────────────────────────────────────────────
    let db = Arc::new(Database::new(config.topic_capacity));
    let needs_reference_data =
        config.services.cerebro || config.services.execution || config.services.account_poller;
    if needs_reference_data {
        // A trading pipeline without accounts cannot run — fatal start-up.
        db.load_bootstrap(&config.bootstrap_path)
            .with_context(|| format!("bootstrap load failed from '{}'", config.bootstrap_path))?;
    }

    // ── 3. Topic bus & shutdown signal ───────────────────────────────────
    let (bus, receivers) = Bus::new(
        config.topic_capacity,
        Duration::from_secs(config.redelivery_delay_secs),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(AppState::new(config.clone(), db.clone(), bus.clone()));

    let mut handles: Vec<(&'static str, tokio::task::JoinHandle<()>)> = Vec::new();

    // ── 4. Ingestion ─────────────────────────────────────────────────────
    if config.services.ingestion {
        let service = IngestionService::new(
            db.clone(),
            bus.clone(),
            config.environment,
            config.stream_max_retries,
            Duration::from_secs(config.stream_base_delay_secs),
            shutdown_rx.clone(),
        );
        let ingest_state = state.clone();
        handles.push((
            "ingestion",
            tokio::spawn(async move {
                if let Err(e) = service.run().await {
                    error!(error = %e, "ingestion service stopped with error");
                    ingest_state.push_error(format!("ingestion stopped: {e:#}"), None);
                }
            }),
        ));
        info!("ingestion service spawned");
    }

    // ── 5. Cerebro ───────────────────────────────────────────────────────
    if config.services.cerebro {
        let service = CerebroService::new(
            db.clone(),
            bus.clone(),
            &config.margin_preview_url,
            config.mock_brokers,
            config.margin_limit_pct,
            config.precision_cache_ttl_hours,
            config.position_lookup_retries,
            Duration::from_millis(config.position_lookup_delay_ms),
            shutdown_rx.clone(),
        );
        let rx = receivers.standardized_signals;
        handles.push(("cerebro", tokio::spawn(service.run(rx))));
        info!("cerebro service spawned");
    }

    // ── 6. Execution ─────────────────────────────────────────────────────
    if config.services.execution {
        let service = ExecutionService::new(
            db.clone(),
            bus.clone(),
            config.mock_brokers,
            config.dedup_ttl_hours,
            Duration::from_secs(config.account_update_interval_secs),
            shutdown_rx.clone(),
        );
        let orders_rx = receivers.trading_orders;
        let commands_rx = receivers.order_commands;
        handles.push((
            "execution",
            tokio::spawn(service.run(orders_rx, commands_rx)),
        ));
        info!("execution dispatcher spawned");
    }

    // ── 7. Account poller ────────────────────────────────────────────────
    if config.services.account_poller {
        let poller = AccountPoller::new(
            db.clone(),
            bus.clone(),
            config.mock_brokers,
            Duration::from_secs(config.account_poll_interval_secs),
            shutdown_rx.clone(),
        );
        handles.push(("account_poller", tokio::spawn(poller.run())));
        info!(
            interval_secs = config.account_poll_interval_secs,
            "account poller spawned"
        );
    }

    // ── 8. Ops API ───────────────────────────────────────────────────────
    if config.services.api {
        let app = api::rest::router(state.clone());
        let listener = tokio::net::TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("failed to bind ops API on {}", config.bind_addr))?;
        info!(addr = %config.bind_addr, "ops API listening");

        let mut api_shutdown = shutdown_rx.clone();
        handles.push((
            "api",
            tokio::spawn(async move {
                let shutdown = async move {
                    loop {
                        if api_shutdown.changed().await.is_err() || *api_shutdown.borrow() {
                            break;
                        }
                    }
                };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!(error = %e, "ops API server failed");
                }
            }),
        ));
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    for (name, handle) in handles {
        match tokio::time::timeout(Duration::from_secs(10), handle).await {
            Ok(Ok(())) => info!(service = name, "service stopped"),
            Ok(Err(e)) => error!(service = name, error = %e, "service panicked"),
            Err(_) => warn!(service = name, "service did not stop within 10s"),
        }
    }

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Meridian Trade Router shut down complete.");
    Ok(())
}
