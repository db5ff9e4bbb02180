mod supervisor;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use hh_alerts::{AlertConfig, AlertSet};
use hh_bus::{BusHandle, BusStats, CommandDispatcher, OutboundQueue, run_bus};
use hh_codec::CodecRegistry;
use hh_common::clock::{Clock, SystemClock};
use hh_common::config::HubConfig;
use hh_ota::OtaOrchestrator;
use hh_state::StateStore;
use hh_store::{TimeSeriesStore, WriteQueue, WriterStats, run_flusher, run_intake};
use supervisor::{ServicePriority, spawn_supervised};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,homehub=debug".parse().unwrap()),
        )
        .init();

    info!("HomeHub starting...");

    let config = Arc::new(HubConfig::load(None));
    info!(
        "Bus {}:{}, store {}, API port {}",
        config.bus_host, config.bus_port, config.store_path, config.api_port
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let started_at_ms = clock.now_ms();

    // ── Persistence writer ─────────────────────────────────────────────

    let store = Arc::new(TimeSeriesStore::open(&config.store_path)?);
    let writer_stats = WriterStats::new();
    let write_queue = WriteQueue::new(writer_stats.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fanout_shutdown_tx, fanout_shutdown_rx) = watch::channel(false);
    let fanout_clients = Arc::new(AtomicUsize::new(0));

    // ── State store ────────────────────────────────────────────────────

    let state = StateStore::new(clock.clone(), config.offline_timeout_ms());

    tokio::spawn(run_intake(write_queue.clone(), state.subscribe()));
    let flusher = tokio::spawn(run_flusher(
        store.clone(),
        write_queue.clone(),
        clock.clone(),
        config.retention_days,
        shutdown_rx,
    ));

    let (apply_tx, apply_rx) = mpsc::channel(1024);
    tokio::spawn(state.clone().run_apply_loop(apply_rx));
    tokio::spawn(state.clone().run_sweeper());

    // ── Codec registry + bus adapter ───────────────────────────────────

    let codec = Arc::new(CodecRegistry::new());
    let bus_stats = BusStats::new();
    let outbound = OutboundQueue::new(bus_stats.clone());
    let bus = BusHandle::new(codec.clone(), outbound.clone(), bus_stats.clone());

    {
        let config = config.clone();
        let codec = codec.clone();
        let outbound = outbound.clone();
        let bus_stats = bus_stats.clone();
        let apply_tx = apply_tx.clone();
        spawn_supervised("bus-adapter", ServicePriority::Critical, move || {
            let config = config.clone();
            let codec = codec.clone();
            let outbound = outbound.clone();
            let bus_stats = bus_stats.clone();
            let apply_tx = apply_tx.clone();
            async move { run_bus(config, codec, outbound, bus_stats, apply_tx).await }
        });
    }

    // ── Alert evaluator ────────────────────────────────────────────────

    let alerts = AlertSet::new();
    let alert_config = AlertConfig {
        offline_timeout_ms: config.offline_timeout_ms(),
        weather_stall_ms: config.weather_stall_ms(),
        ..AlertConfig::default()
    };
    {
        let alerts = alerts.clone();
        let state = state.clone();
        let store = store.clone();
        let writer_stats = writer_stats.clone();
        let clock = clock.clone();
        spawn_supervised("alert-evaluator", ServicePriority::Background, move || {
            let alerts = alerts.clone();
            let state = state.clone();
            let store = store.clone();
            let writer_stats = writer_stats.clone();
            let clock = clock.clone();
            let alert_config = alert_config.clone();
            async move {
                hh_alerts::run_evaluator(alerts, state, store, writer_stats, clock, alert_config)
                    .await;
                Ok(())
            }
        });
    }

    // ── Command dispatcher + OTA orchestrator ──────────────────────────

    let dispatcher = Arc::new(CommandDispatcher::new(
        bus.clone(),
        state.clone(),
        store.clone(),
    ));
    let ota = OtaOrchestrator::new(
        config.clone(),
        bus.clone(),
        state.clone(),
        store.clone(),
        clock.clone(),
    );
    tokio::spawn(ota.clone().run_attempt_watch());

    // ── Query surface + client fan-out ─────────────────────────────────

    let api_state = hh_api::state::ApiState {
        config: config.clone(),
        state: state.clone(),
        store: store.clone(),
        alerts: alerts.clone(),
        dispatcher,
        ota,
        bus_stats: bus_stats.clone(),
        writer_stats: writer_stats.clone(),
        clock: clock.clone(),
        started_at_ms,
        shutdown: fanout_shutdown_rx,
        active_clients: fanout_clients.clone(),
    };
    let router = hh_api::build_router(api_state);
    let api_port = config.api_port;

    spawn_supervised("api", ServicePriority::Important, move || {
        let router = router.clone();
        async move {
            let addr: SocketAddr = format!("[::]:{}", api_port).parse()?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("API listening on {}", addr);
            axum::serve(listener, router).await?;
            Ok(())
        }
    });

    // ── Ready ──────────────────────────────────────────────────────────

    info!("HomeHub started successfully");
    info!("  Bus: {}:{} (client id {})", config.bus_host, config.bus_port, config.bus_client_id);
    info!("  Store: {}", config.store_path);
    info!("  API + fan-out: port {}", api_port);
    info!("  Offline threshold: {}s", config.offline_timeout_secs);
    info!(
        "  OTA source root: {} (default ref {})",
        config.source_root.display(),
        config.default_ref
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    // Reverse of startup: the fan-out closes client sockets first (up to
    // 2s), then the writer gets up to 5s to flush what it holds.
    let _ = fanout_shutdown_tx.send(true);
    let fanout_deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while fanout_clients.load(Ordering::Relaxed) > 0
        && tokio::time::Instant::now() < fanout_deadline
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let remaining = fanout_clients.load(Ordering::Relaxed);
    if remaining == 0 {
        info!("Fan-out clients closed");
    } else {
        warn!("{remaining} fan-out client(s) did not close within 2s");
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(Duration::from_secs(5), flusher).await {
        Ok(Ok(())) => info!("Persistence writer flushed"),
        Ok(Err(e)) => error!("Persistence writer ended abnormally: {e}"),
        Err(_) => error!("Persistence writer did not drain within 5s"),
    }

    info!("Shutdown complete");
    Ok(())
}
