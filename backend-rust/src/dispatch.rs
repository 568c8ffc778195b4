//! # dispatch
//!
//! Fans accepted hits out to the WebSocket subscribers and the session
//! store, in acceptance order.
//!
//! ## Guarantees
//! - Shots reach every healthy subscriber in the order they were accepted
//! - A slow or dead subscriber is removed without disturbing the others
//! - Every shot inside an active session is appended to the store before
//!   the broadcast (at-least-once; a failed snapshot is retried on the
//!   next shot since the store keeps the full archive in memory)
//! - On shutdown the queue is drained within a bounded budget and the
//!   store is flushed

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationController, PendingShot};
use crate::persistence::SessionStore;
use crate::pipeline::{now_unix_secs, HitEvent};
use crate::score::RingTable;
use crate::session::{SessionManager, Shot};

// ── Subscribers ───────────────────────────────────────────────────────────────

/// One dashboard WebSocket client. The ws task owns the receiving half and
/// forwards frames to the socket; a closed receiver shows up here as a send
/// error and gets the subscriber removed.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: u64,
    pub tx: mpsc::Sender<String>,
}

pub type SharedSubscribers = Arc<RwLock<Vec<Subscriber>>>;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_subscriber_id() -> u64 {
    NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Send one frame to every subscriber; failed ones are removed. Snapshot
/// first so the list is never held across an await.
pub async fn broadcast(subscribers: &SharedSubscribers, payload: &str, io_timeout: Duration) {
    let snapshot: Vec<Subscriber> = subscribers.read().await.clone();
    if snapshot.is_empty() {
        return;
    }

    let mut dead: Vec<u64> = Vec::new();
    for sub in &snapshot {
        let sent = timeout(io_timeout, sub.tx.send(payload.to_string())).await;
        match sent {
            Ok(Ok(())) => {}
            _ => dead.push(sub.id),
        }
    }

    if !dead.is_empty() {
        let mut subs = subscribers.write().await;
        subs.retain(|s| !dead.contains(&s.id));
        info!("Removed {} dead subscriber(s), {} remain", dead.len(), subs.len());
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct Dispatcher {
    pub rx: mpsc::Receiver<HitEvent>,
    pub subscribers: SharedSubscribers,
    pub sessions: Arc<RwLock<SessionManager>>,
    pub store: Arc<RwLock<SessionStore>>,
    pub rings: Arc<RwLock<RingTable>>,
    pub calibration: Arc<RwLock<CalibrationController>>,
    pub io_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Dispatcher {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.drain().await;
                    return;
                }
                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.handle(event).await,
                        None => return, // hub gone
                    }
                }
            }
        }
    }

    /// Drain whatever is already queued, then flush the store and close
    /// the subscriber channels.
    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.handle(event).await;
                    if tokio::time::Instant::now() >= deadline {
                        warn!("Shutdown drain budget exhausted, remaining bursts dropped");
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        let store = self.store.read().await;
        match timeout(self.io_timeout, store.save()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Final store flush failed: {e}"),
            Err(_) => warn!("Final store flush timed out"),
        }
        drop(store);

        self.subscribers.write().await.clear();
        info!("Dispatcher drained and closed");
    }

    async fn handle(&mut self, event: HitEvent) {
        if event.mode.is_calibration_active() {
            self.handle_calibration(event).await;
            return;
        }

        // Normal path: score, record, persist, broadcast
        let (score, is_x) = self.rings.read().await.score_from_r(event.r_cm);
        let shot = Shot {
            ts: event.ts,
            x_cm: event.x_cm,
            y_cm: event.y_cm,
            r_cm: event.r_cm,
            score,
            is_x,
        };

        let now = now_unix_secs();
        let (recorded, table) = {
            let mut sessions = self.sessions.write().await;
            let recorded = sessions.record_shot(shot, now);
            (recorded, sessions.state().to_payload())
        };
        debug!(
            "Shot recorded: score={score} is_x={is_x} r={:.2}cm (end {}, arrow {})",
            event.r_cm, recorded.placement.end_number, recorded.placement.shot_number
        );

        if let Some(session_id) = recorded.session_id {
            let mut store = self.store.write().await;
            store.record_shot(session_id, recorded.placement, &shot);
            if recorded.completed {
                store.complete_session(session_id, now, true);
                info!("Session {session_id} complete");
            }
            match timeout(self.io_timeout, store.save()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Session store write failed: {e}"),
                Err(_) => warn!("Session store write timed out"),
            }
        }

        let payload = serde_json::json!({
            "type": "shot",
            "shot": shot.to_api(),
            "table": table,
        });
        broadcast(&self.subscribers, &payload.to_string(), self.io_timeout).await;
    }

    /// Calibration capture: the burst becomes the single pending shot and
    /// dashboards are told to ask the operator where it really landed.
    /// Nothing touches sessions or scoring here.
    async fn handle_calibration(&mut self, event: HitEvent) {
        let pending = PendingShot {
            ts: event.ts,
            sx: event.sx,
            sy: event.sy,
            x_cm: event.x_cm,
            y_cm: event.y_cm,
            r_cm: event.r_cm,
            seq: event.seq,
            node: event.node.clone(),
            log: Some(event.log_row()),
        };

        let accepted = {
            let mut cal = self.calibration.write().await;
            if !cal.offer_pending(pending) {
                debug!("Calibration pending slot occupied, burst ignored");
                return;
            }
            (cal.pending().cloned(), cal.sample_count())
        };

        let payload = serde_json::json!({
            "type": "cal_pending",
            "pending": accepted.0,
            "count": accepted.1,
        });
        broadcast(&self.subscribers, &payload.to_string(), self.io_timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Features;
    use crate::localizer::{EnergyEstimate, FusedEstimate, FusionMethod};
    use crate::pipeline::HitEvent;
    use crate::session::Mode;
    use impact_types::CompassEnergies;

    fn hit_event(mode: Mode, x_cm: f64, y_cm: f64) -> HitEvent {
        let r_cm = x_cm.hypot(y_cm);
        HitEvent {
            ts: 1000.0,
            node: Some("pico-a".into()),
            seq: Some(1),
            mode,
            sx: x_cm / 63.0,
            sy: y_cm / 63.0,
            x_cm,
            y_cm,
            r_cm,
            fit_version: 0,
            features: Features::default(),
            classifier_score: 20,
            compass: CompassEnergies::default(),
            energy: EnergyEstimate {
                sx: x_cm / 63.0,
                sy: y_cm / 63.0,
                confidence: 0.7,
                x_frac: 0.5,
                y_frac: 0.5,
            },
            tdoa: None,
            tdoa_compass: None,
            fused: FusedEstimate {
                sx: x_cm / 63.0,
                sy: y_cm / 63.0,
                method: FusionMethod::EnergyOnly,
            },
        }
    }

    async fn dispatcher() -> (
        Dispatcher,
        mpsc::Sender<HitEvent>,
        mpsc::Receiver<String>,
        Arc<RwLock<SessionManager>>,
        Arc<RwLock<CalibrationController>>,
    ) {
        let (hit_tx, hit_rx) = mpsc::channel(200);
        let subscribers: SharedSubscribers = Arc::new(RwLock::new(Vec::new()));
        let (sub_tx, sub_rx) = mpsc::channel(64);
        subscribers
            .write()
            .await
            .push(Subscriber { id: 1, tx: sub_tx });

        let store_path = std::env::temp_dir()
            .join(format!("quiver-dispatch-{}.json", std::process::id()))
            .to_string_lossy()
            .into_owned();
        let _ = tokio::fs::remove_file(&store_path).await;

        let sessions = Arc::new(RwLock::new(SessionManager::new(3, 10)));
        let calibration = Arc::new(RwLock::new(CalibrationController::default()));
        let d = Dispatcher {
            rx: hit_rx,
            subscribers,
            sessions: sessions.clone(),
            store: Arc::new(RwLock::new(SessionStore::load(&store_path).await)),
            rings: Arc::new(RwLock::new(RingTable::default())),
            calibration: calibration.clone(),
            io_timeout: Duration::from_millis(500),
            drain_timeout: Duration::from_millis(500),
        };
        (d, hit_tx, sub_rx, sessions, calibration)
    }

    #[tokio::test]
    async fn shot_is_scored_recorded_and_broadcast() {
        let (mut d, _tx, mut sub_rx, sessions, _) = dispatcher().await;

        d.handle(hit_event(Mode::Shooting, 0.0, 0.0)).await;
        d.handle(hit_event(Mode::Shooting, 6.0, 0.0)).await; // r=6 → ring 9

        let first: serde_json::Value =
            serde_json::from_str(&sub_rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "shot");
        assert_eq!(first["shot"]["score"], "X");
        assert_eq!(first["table"]["total"], 10);

        let second: serde_json::Value =
            serde_json::from_str(&sub_rx.recv().await.unwrap()).unwrap();
        assert_eq!(second["shot"]["score"], 9);
        // the running table total equals the sum of broadcast scores
        assert_eq!(second["table"]["total"], 19);

        assert_eq!(sessions.read().await.state().total_arrows(), 2);
    }

    #[tokio::test]
    async fn calibration_hit_becomes_pending_not_shot() {
        let (mut d, _tx, mut sub_rx, sessions, calibration) = dispatcher().await;
        calibration.write().await.start();

        d.handle(hit_event(Mode::Calibration { paused: false }, 5.0, -3.0))
            .await;

        let frame: serde_json::Value =
            serde_json::from_str(&sub_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "cal_pending");
        assert_eq!(frame["pending"]["x_cm"], 5.0);
        assert_eq!(frame["count"], 0);
        // calibration bursts never become shots
        assert_eq!(sessions.read().await.state().total_arrows(), 0);
        assert!(calibration.read().await.pending().is_some());
    }

    #[tokio::test]
    async fn session_shots_reach_the_store() {
        let (mut d, _tx, mut sub_rx, sessions, _) = dispatcher().await;
        {
            let mut store = d.store.write().await;
            store.create_session(1, 3, 10, 999.0);
        }
        sessions.write().await.start_session(1, 3, 10, 999.0);

        d.handle(hit_event(Mode::Shooting, 0.0, 6.0)).await; // r=6 → ring 9
        let _ = sub_rx.recv().await;

        let store = d.store.read().await;
        let stored = &store.sessions()[0];
        assert_eq!(stored.total_arrows, 1);
        assert_eq!(stored.total_score, 9);
        assert_eq!(stored.shots[0].end_number, 1);
    }

    #[tokio::test]
    async fn broadcast_removes_dead_subscribers() {
        let subscribers: SharedSubscribers = Arc::new(RwLock::new(Vec::new()));
        let (alive_tx, mut alive_rx) = mpsc::channel(8);
        let (dead_tx, dead_rx) = mpsc::channel(8);
        drop(dead_rx);
        subscribers.write().await.push(Subscriber { id: 1, tx: alive_tx });
        subscribers.write().await.push(Subscriber { id: 2, tx: dead_tx });

        broadcast(&subscribers, "{\"type\":\"shot\"}", Duration::from_millis(200)).await;

        assert_eq!(alive_rx.recv().await.unwrap(), "{\"type\":\"shot\"}");
        let subs = subscribers.read().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, 1);
    }

    #[tokio::test]
    async fn broadcast_preserves_order_per_subscriber() {
        let subscribers: SharedSubscribers = Arc::new(RwLock::new(Vec::new()));
        let (tx, mut rx) = mpsc::channel(8);
        subscribers.write().await.push(Subscriber { id: 1, tx });

        for i in 0..3 {
            broadcast(&subscribers, &format!("msg-{i}"), Duration::from_millis(200)).await;
        }
        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap(), format!("msg-{i}"));
        }
    }
}
