//! # handlers
//!
//! HTTP control surface and the dashboard WebSocket.
//!
//! Routes:
//! - `/api/state`, `/api/reset`, `/api/shots`, `/api/stats`
//! - `/api/config`, `/api/config/rings`
//! - `/api/mode` (GET/POST, shooting|scoring only — calibration is entered
//!   through its own surface)
//! - `/api/calibration/{start,pause,resume,reset,status,confirm,compute,apply}`
//! - `/api/session/{start,end}`, `/api/session`, `/api/sessions`
//! - `/ws` — push subscriber; receives a `state` snapshot on connect, then
//!   `shot` / `cal_pending` frames in acceptance order

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::calibration::{install_fit, CalibrationController, FitHandle, FitSolution};
use crate::config::AppConfig;
use crate::dispatch::{next_subscriber_id, SharedSubscribers, Subscriber};
use crate::hit_log::HitLogger;
use crate::persistence::{save_fit, SessionStore};
use crate::pipeline::{now_unix_secs, PipelineCounters};
use crate::score::RingTable;
use crate::session::{Mode, SessionManager, SharedMode};

// ── Shared state ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub mode: SharedMode,
    pub fit: FitHandle,
    pub calibration: Arc<RwLock<CalibrationController>>,
    pub sessions: Arc<RwLock<SessionManager>>,
    pub store: Arc<RwLock<SessionStore>>,
    pub rings: Arc<RwLock<RingTable>>,
    pub subscribers: SharedSubscribers,
    pub counters: Arc<PipelineCounters>,
    pub hit_log: Arc<HitLogger>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/reset", post(reset_state))
        .route("/api/shots", get(get_shots))
        .route("/api/stats", get(get_stats))
        .route("/api/config", get(get_config))
        .route("/api/config/rings", post(set_rings))
        .route("/api/mode", get(get_mode).post(set_mode))
        .route("/api/calibration/status", get(cal_status))
        .route("/api/calibration/start", post(cal_start))
        .route("/api/calibration/pause", post(cal_pause))
        .route("/api/calibration/resume", post(cal_resume))
        .route("/api/calibration/reset", post(cal_reset))
        .route("/api/calibration/confirm", post(cal_confirm))
        .route("/api/calibration/compute", post(cal_compute))
        .route("/api/calibration/apply", post(cal_apply))
        .route("/api/session", get(session_info))
        .route("/api/session/start", post(session_start))
        .route("/api/session/end", post(session_end))
        .route("/api/sessions", get(session_history))
        .route("/ws", get(ws_endpoint))
        .with_state(state)
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
}

// ── Table / shots ─────────────────────────────────────────────────────────────

async fn get_state(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.sessions.read().await.state().to_payload())
}

async fn reset_state(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut sessions = state.sessions.write().await;
    sessions.reset_table();
    Json(json!({ "ok": true, "table": sessions.state().to_payload() }))
}

async fn get_shots(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "shots": state.sessions.read().await.state().all_shots() }))
}

async fn get_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let subscribers = state.subscribers.read().await.len();
    Json(json!({
        "counters": state.counters.snapshot(),
        "subscribers": subscribers,
    }))
}

// ── Config ────────────────────────────────────────────────────────────────────

async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "RINGS_CM": state.rings.read().await.to_api(),
        "ARROWS_PER_END": state.config.arrows_per_end,
        "MAX_ENDS": state.config.max_ends,
    }))
}

async fn set_rings(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    match RingTable::from_api(&payload) {
        Ok(table) => {
            *state.rings.write().await = table.clone();
            Json(json!({ "ok": true, "RINGS_CM": table.to_api() })).into_response()
        }
        Err(e) => bad_request(e.to_string()),
    }
}

// ── Mode ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ModeIn {
    mode: String,
}

async fn get_mode(State(state): State<AppState>) -> Json<Mode> {
    Json(*state.mode.read().await)
}

async fn set_mode(State(state): State<AppState>, Json(payload): Json<ModeIn>) -> Response {
    let requested = match payload.mode.trim().to_ascii_lowercase().as_str() {
        "shooting" => Mode::Shooting,
        "scoring" => Mode::Scoring,
        other => return bad_request(format!("mode must be 'shooting' or 'scoring', got {other:?}")),
    };

    let before = *state.mode.read().await;
    // Switching away from calibration abandons its pending capture
    if before.is_calibration() {
        state.calibration.write().await.stop();
    }
    *state.mode.write().await = requested;
    info!("Mode {} -> {}", before.as_str(), requested.as_str());
    Json(json!({ "mode": requested.as_str() })).into_response()
}

// ── Calibration control surface ───────────────────────────────────────────────

async fn cal_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let active = state.fit.read().await.clone();
    let cal = state.calibration.read().await;
    Json(cal.status(active.version, active.fit.model_tag()))
}

async fn cal_start(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.calibration.write().await.start();
    *state.mode.write().await = Mode::Calibration { paused: false };
    Json(json!({ "ok": true }))
}

async fn cal_pause(State(state): State<AppState>) -> Response {
    match state.calibration.write().await.pause() {
        Ok(()) => {
            *state.mode.write().await = Mode::Calibration { paused: true };
            Json(json!({ "ok": true })).into_response()
        }
        Err(e) => bad_request(e.to_string()),
    }
}

async fn cal_resume(State(state): State<AppState>) -> Response {
    match state.calibration.write().await.resume() {
        Ok(()) => {
            *state.mode.write().await = Mode::Calibration { paused: false };
            Json(json!({ "ok": true })).into_response()
        }
        Err(e) => bad_request(e.to_string()),
    }
}

async fn cal_reset(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.calibration.write().await.reset();
    Json(json!({ "ok": true, "samples": 0 }))
}

fn solution_json(sol: &FitSolution, version: u64) -> serde_json::Value {
    json!({
        "model": sol.model,
        "version": version,
        "n": sol.n,
        "mean_error_cm": sol.residual_mean_cm,
        "max_error_cm": sol.residual_max_cm,
    })
}

#[derive(Deserialize)]
struct ConfirmIn {
    x_cm: f64,
    y_cm: f64,
}

async fn cal_confirm(State(state): State<AppState>, Json(payload): Json<ConfirmIn>) -> Response {
    let (confirmed, count) = {
        let mut cal = state.calibration.write().await;
        match cal.confirm(payload.x_cm, payload.y_cm) {
            Ok(c) => (c, cal.sample_count()),
            Err(e) => return bad_request(e.to_string()),
        }
    };

    // Re-log the accepted row with the operator's ground truth
    if let Some(mut row) = confirmed.pending.log.clone() {
        row.mode = "calibration";
        row.clicked_x_cm = Some(payload.x_cm);
        row.clicked_y_cm = Some(payload.y_cm);
        state.hit_log.append(&row).await;
    }

    // Auto-fit result goes live immediately; persisting stays with `apply`
    let fit_json = match &confirmed.solution {
        Some(sol) => {
            let version = install_fit(&state.fit, sol.fit.clone()).await;
            info!(
                "Calibration fit v{version} installed ({}, {} samples, mean {:.2} cm)",
                sol.model, sol.n, sol.residual_mean_cm
            );
            Some(solution_json(sol, version))
        }
        None => None,
    };

    Json(json!({ "ok": true, "samples": count, "fit": fit_json })).into_response()
}

async fn cal_compute(State(state): State<AppState>) -> Response {
    let solution = {
        let mut cal = state.calibration.write().await;
        match cal.compute() {
            Ok(s) => s,
            Err(e) => return bad_request(e.to_string()),
        }
    };
    let version = install_fit(&state.fit, solution.fit.clone()).await;
    info!(
        "Calibration fit v{version} computed ({}, {} samples, mean {:.2} cm)",
        solution.model, solution.n, solution.residual_mean_cm
    );
    Json(json!({ "ok": true, "fit": solution_json(&solution, version) })).into_response()
}

/// Persist the active fit and leave calibration. On a disk failure the
/// previous on-disk fit survives and the in-memory fit stays active until
/// restart.
async fn cal_apply(State(state): State<AppState>) -> Response {
    let active = state.fit.read().await.clone();
    match active.fit.model_tag() {
        "linear_sxsy" | "poly2_sxsy" => {}
        other => return bad_request(format!("model {other:?} cannot be applied")),
    }

    if let Err(e) = save_fit(&state.config.fit_path, &active.fit, active.version).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("persist failed: {e}") })),
        )
            .into_response();
    }

    state.calibration.write().await.stop();
    *state.mode.write().await = Mode::Shooting;
    Json(json!({
        "ok": true,
        "model": active.fit.model_tag(),
        "version": active.version,
    }))
    .into_response()
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SessionStartIn {
    arrows_per_end: Option<u32>,
    num_ends: Option<u32>,
}

async fn session_start(
    State(state): State<AppState>,
    Json(payload): Json<SessionStartIn>,
) -> Json<serde_json::Value> {
    let arrows = payload.arrows_per_end.unwrap_or(state.config.arrows_per_end);
    let ends = payload.num_ends.unwrap_or(state.config.max_ends);
    let now = now_unix_secs();

    let session_id = {
        let mut store = state.store.write().await;
        let id = store.next_session_id();
        store.create_session(id, arrows, ends, now);
        let _ = store.save().await;
        id
    };
    state
        .sessions
        .write()
        .await
        .start_session(session_id, arrows, ends, now);
    info!("Started session {session_id}: {arrows} arrows/end × {ends} ends");
    Json(json!({ "ok": true, "session_id": session_id }))
}

async fn session_end(State(state): State<AppState>) -> Response {
    let now = now_unix_secs();
    let ended = {
        let mut sessions = state.sessions.write().await;
        let is_complete = sessions.state().is_complete();
        sessions.end_session(now).map(|id| (id, is_complete))
    };
    match ended {
        Some((session_id, is_complete)) => {
            let mut store = state.store.write().await;
            store.complete_session(session_id, now, is_complete);
            let _ = store.save().await;
            info!("Ended session {session_id} (complete: {is_complete})");
            Json(json!({ "ok": true, "session_id": session_id })).into_response()
        }
        None => bad_request("no active session".into()),
    }
}

async fn session_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.sessions.read().await.session_info())
}

async fn session_history(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store = state.store.read().await;
    let sessions: Vec<serde_json::Value> = store
        .sessions()
        .iter()
        .map(|s| {
            json!({
                "session_id": s.session_id,
                "start_time": s.start_time,
                "end_time": s.end_time,
                "arrows_per_end": s.arrows_per_end,
                "num_ends": s.num_ends,
                "total_score": s.total_score,
                "total_arrows": s.total_arrows,
                "is_complete": s.is_complete,
            })
        })
        .collect();
    Json(json!({ "sessions": sessions }))
}

// ── WebSocket subscribers ─────────────────────────────────────────────────────

async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let id = next_subscriber_id();
    state.subscribers.write().await.push(Subscriber { id, tx });
    info!("Subscriber {id} connected");

    // Current table snapshot goes out before any live frame
    let snapshot = json!({
        "type": "state",
        "table": state.sessions.read().await.state().to_payload(),
    });
    if socket.send(Message::Text(snapshot.to_string())).await.is_err() {
        state.subscribers.write().await.retain(|s| s.id != id);
        return;
    }

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(msg) => {
                        if socket.send(Message::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                    // dispatcher removed us (send failure or shutdown)
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // clients only send keepalives today
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }

    state.subscribers.write().await.retain(|s| s.id != id);
    info!("Subscriber {id} disconnected");
}
