mod burst_hub;
mod calibration;
mod classifier;
mod config;
mod dispatch;
mod handlers;
mod hit_log;
mod localizer;
mod persistence;
mod pipeline;
mod score;
mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::{mpsc, watch, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use calibration::{new_fit_handle, CalibrationController};
use config::AppConfig;
use dispatch::{Dispatcher, SharedSubscribers};
use handlers::AppState;
use hit_log::HitLogger;
use persistence::{load_fit, SessionStore};
use pipeline::{Pipeline, PipelineCounters};
use session::{Mode, SessionManager};

// ─── Global startup time (for uptime reporting) ──────────────────────────────
static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

// ─── Time Sync Endpoint ───────────────────────────────────────────────────────

async fn time_sync() -> axum::Json<serde_json::Value> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    axum::Json(json!({ "serverTime": now }))
}

// ─── Health Endpoint ──────────────────────────────────────────────────────────
// GET /health → { status, version, uptimeSecs }

async fn health_check() -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
    }))
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let startup_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quiver_backend=info".into()),
        )
        .init();

    let app_config = Arc::new(AppConfig::default());
    app_config
        .rings
        .validate()
        .context("ring table configuration")?;
    info!(
        "🎯 Quiver Backend v{} starting — UDP {}:{}, HTTP :{}",
        env!("CARGO_PKG_VERSION"),
        app_config.udp_host,
        app_config.udp_port,
        app_config.http_port
    );

    // Persisted state
    let (fit, fit_version) = load_fit(&app_config.fit_path).await;
    let fit_handle = new_fit_handle(fit, fit_version);
    let store = Arc::new(RwLock::new(
        SessionStore::load(&app_config.session_store_path).await,
    ));

    // Shared runtime state
    let mode = Arc::new(RwLock::new(Mode::Shooting));
    let sessions = Arc::new(RwLock::new(SessionManager::new(
        app_config.arrows_per_end,
        app_config.max_ends,
    )));
    let calibration = Arc::new(RwLock::new(CalibrationController::default()));
    let rings = Arc::new(RwLock::new(app_config.rings.clone()));
    let subscribers: SharedSubscribers = Arc::new(RwLock::new(Vec::new()));
    let counters = Arc::new(PipelineCounters::default());
    let hit_logger = Arc::new(HitLogger::new(&app_config.hit_log_dir));

    // Burst queue between hub and dispatcher; overflow drops the newest
    let (hit_tx, hit_rx) = mpsc::channel(app_config.queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Burst hub (UDP ingest + pipeline). Bind failure is fatal.
    let socket = burst_hub::bind(&app_config.udp_host, app_config.udp_port).await?;
    let burst_pipeline = Pipeline::new(
        &app_config,
        mode.clone(),
        fit_handle.clone(),
        hit_logger.clone(),
        counters.clone(),
    );
    tokio::spawn(burst_hub::run(
        socket,
        burst_pipeline,
        hit_tx,
        counters.clone(),
        shutdown_rx.clone(),
    ));

    // Dispatcher (scoring, sessions, store, fanout)
    let dispatcher = Dispatcher {
        rx: hit_rx,
        subscribers: subscribers.clone(),
        sessions: sessions.clone(),
        store: store.clone(),
        rings: rings.clone(),
        calibration: calibration.clone(),
        io_timeout: app_config.io_timeout,
        drain_timeout: app_config.drain_timeout,
    };
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    // HTTP control surface + dashboard WebSocket
    let state = AppState {
        config: app_config.clone(),
        mode,
        fit: fit_handle,
        calibration,
        sessions,
        store,
        rings,
        subscribers,
        counters,
        hit_log: hit_logger,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sync", get(time_sync))
        .merge(handlers::router(state))
        .layer(cors);

    let addr = format!("0.0.0.0:{}", app_config.http_port);
    info!("🚀 Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding HTTP listener on {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server")?;

    // Drain the pipeline: dispatcher flushes the queue and the store
    let _ = shutdown_tx.send(true);
    let drain_budget = app_config.drain_timeout + app_config.io_timeout;
    if tokio::time::timeout(drain_budget, dispatcher_handle)
        .await
        .is_err()
    {
        info!("Dispatcher drain exceeded budget, exiting anyway");
    }
    info!("Bye");
    Ok(())
}
