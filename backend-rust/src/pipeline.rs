//! # pipeline
//!
//! Per-burst processing owner. One instance lives inside the UDP hub task
//! and holds everything a burst touches on its way to the dispatcher:
//! classifier (EMA), deduper (cooldown stamp), localizer config, and shared
//! handles for the operating mode and the active calibration fit.
//!
//! From a subscriber's point of view the whole sequence — features,
//! classification, dedup, localization, mapping — happens atomically per
//! burst: either a `HitEvent` reaches the queue or nothing does.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use impact_types::{ChannelMap, CompassEnergies, CompassTdoa, ImpactBurst};
use serde::Serialize;
use tracing::debug;

use crate::calibration::FitHandle;
use crate::classifier::{Classifier, Deduper, Features};
use crate::config::{AppConfig, LocalizerConfig};
use crate::hit_log::{HitLogRow, HitLogger};
use crate::localizer::{fuse, localize_energy, localize_tdoa, EnergyEstimate, FusedEstimate, TdoaEstimate};
use crate::session::{Mode, SharedMode};

pub fn now_unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ── Counters ──────────────────────────────────────────────────────────────────

/// Drop/accept counters across the ingest path. Exposed on /api/stats.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub type_mismatch: AtomicU64,
    pub invalid_shape: AtomicU64,
    pub ghosts: AtomicU64,
    pub mode_drops: AtomicU64,
    pub cooldown_drops: AtomicU64,
    pub accepted: AtomicU64,
    pub queue_overflow: AtomicU64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "received": self.received.load(Ordering::Relaxed),
            "parse_errors": self.parse_errors.load(Ordering::Relaxed),
            "type_mismatch": self.type_mismatch.load(Ordering::Relaxed),
            "invalid_shape": self.invalid_shape.load(Ordering::Relaxed),
            "ghosts": self.ghosts.load(Ordering::Relaxed),
            "mode_drops": self.mode_drops.load(Ordering::Relaxed),
            "cooldown_drops": self.cooldown_drops.load(Ordering::Relaxed),
            "accepted": self.accepted.load(Ordering::Relaxed),
            "queue_overflow": self.queue_overflow.load(Ordering::Relaxed),
        })
    }
}

// ── Hit event ─────────────────────────────────────────────────────────────────

/// A fully localized, accepted burst on its way to scoring and dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct HitEvent {
    pub ts: f64,
    pub node: Option<String>,
    pub seq: Option<u64>,
    /// Operating mode at acceptance
    pub mode: Mode,
    /// Fused normalized estimate
    pub sx: f64,
    pub sy: f64,
    /// Calibrated target-plane coordinate
    pub x_cm: f64,
    pub y_cm: f64,
    pub r_cm: f64,
    pub fit_version: u64,
    pub features: Features,
    pub classifier_score: i32,
    pub compass: CompassEnergies,
    pub energy: EnergyEstimate,
    pub tdoa: Option<TdoaEstimate>,
    pub tdoa_compass: Option<CompassTdoa>,
    pub fused: FusedEstimate,
}

impl HitEvent {
    /// The CSV row for this event (cloned into the calibration pending slot
    /// so a later confirm can re-log with ground truth).
    pub fn log_row(&self) -> HitLogRow {
        HitLogRow {
            seq: self.seq,
            node: self.node.clone(),
            session_id: None,
            mode: self.mode.as_str(),
            x_cm: self.x_cm,
            y_cm: self.y_cm,
            sx: self.sx,
            sy: self.sy,
            clicked_x_cm: None,
            clicked_y_cm: None,
            fusion_method: self.fused.method.to_string(),
            energy_conf: self.energy.confidence,
            tdoa_conf: self.tdoa.map(|t| t.confidence).unwrap_or(0.0),
            sx_energy: self.energy.sx,
            sy_energy: self.energy.sy,
            total_energy: self.features.sum_energy,
            max_peak: self.features.max_peak,
            dom_ratio: self.features.dom_ratio,
            sx_tdoa: self.tdoa.map(|t| t.sx),
            sy_tdoa: self.tdoa.map(|t| t.sy),
            tdoa: self.tdoa_compass,
            energies: self.compass,
            label: "HIT",
            score: self.classifier_score,
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct Pipeline {
    channel_map: ChannelMap,
    localizer: LocalizerConfig,
    classifier: Classifier,
    deduper: Deduper,
    mode: SharedMode,
    fit: FitHandle,
    hit_log: Arc<HitLogger>,
    counters: Arc<PipelineCounters>,
}

impl Pipeline {
    pub fn new(
        config: &AppConfig,
        mode: SharedMode,
        fit: FitHandle,
        hit_log: Arc<HitLogger>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            channel_map: config.channel_map,
            localizer: config.localizer.clone(),
            classifier: Classifier::new(config.classifier.clone()),
            deduper: Deduper::new(config.classifier.cooldown),
            mode,
            fit,
            hit_log: hit_log.clone(),
            counters,
        }
    }

    /// Run one parsed burst through classification, dedup, localization and
    /// mapping. Returns the event to dispatch, or None on any drop.
    pub async fn process(&mut self, burst: &ImpactBurst) -> Option<HitEvent> {
        let energies = burst.channel_energies();
        let peaks = burst.channel_peaks();
        let comp = burst.compass_energies(&self.channel_map);

        let mode = *self.mode.read().await;

        // Classification always runs so the EMA baseline absorbs every
        // burst, even ones the mode gate is about to drop.
        let classification = self
            .classifier
            .classify(&energies, &peaks, mode.is_calibration());

        if !classification.is_hit() {
            self.counters.ghosts.fetch_add(1, Ordering::Relaxed);
            debug!(
                "GHOST sumE={:.1} maxPeak={:.1} dom={:.2} reason={}",
                classification.features.sum_energy,
                classification.features.max_peak,
                classification.features.dom_ratio,
                classification.reason
            );
            return None;
        }

        // Mode gate: scoring keeps the table viewable but takes no bursts,
        // and a paused calibration ignores everything.
        let gate_open = mode.accepts_shots() || mode.is_calibration_active();
        if !gate_open {
            self.counters.mode_drops.fetch_add(1, Ordering::Relaxed);
            debug!("DROP_MODE mode={}", mode.as_str());
            return None;
        }

        // Refractory cooldown (EMA already updated above)
        if let Err(elapsed) = self.deduper.try_accept(Instant::now()) {
            self.counters.cooldown_drops.fetch_add(1, Ordering::Relaxed);
            debug!(
                "DROP_COOLDOWN sumE={:.1} dt={:.3}s reason=cooldown",
                classification.features.sum_energy,
                elapsed.as_secs_f64()
            );
            return None;
        }

        // Localization: energy always, TDOA when a complete map is present
        let energy_est = localize_energy(&comp, classification.features.dom_ratio, &self.localizer);
        let (tdoa_est, tdoa_compass) = if self.localizer.tdoa_enabled {
            match burst.compass_tdoa(&self.channel_map) {
                Some((tdoa, source)) => (
                    Some(localize_tdoa(&tdoa, source, &self.localizer)),
                    Some(tdoa),
                ),
                None => (None, None),
            }
        } else {
            (None, None)
        };
        let fused = fuse(&energy_est, tdoa_est.as_ref(), &self.localizer);

        // Coordinate mapping through the active fit (clone the Arc out of
        // the lock so mapping never holds it)
        let (fit, fit_version) = {
            let active = self.fit.read().await;
            (active.fit.clone(), active.version)
        };
        let (x_cm, y_cm) = fit.map(fused.sx, fused.sy);
        let r_cm = x_cm.hypot(y_cm);

        let event = HitEvent {
            ts: now_unix_secs(),
            node: burst.node.clone(),
            seq: burst.seq,
            mode,
            sx: fused.sx,
            sy: fused.sy,
            x_cm,
            y_cm,
            r_cm,
            fit_version,
            features: classification.features,
            classifier_score: classification.score,
            compass: comp,
            energy: energy_est,
            tdoa: tdoa_est,
            tdoa_compass,
            fused,
        };

        debug!(
            "ACCEPT sx={:+.3} sy={:+.3} x={x_cm:+.2}cm y={y_cm:+.2}cm r={r_cm:.2}cm method={}",
            fused.sx, fused.sy, fused.method
        );

        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        self.hit_log.append(&event.log_row()).await;

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{new_fit_handle, CalibrationFit};
    use approx::assert_relative_eq;
    use tokio::sync::RwLock;

    fn bundle(energy2: [f64; 4], peak: [f64; 4]) -> ImpactBurst {
        let ch: serde_json::Map<String, serde_json::Value> = (0..4)
            .map(|i| {
                (
                    i.to_string(),
                    serde_json::json!({
                        "peak": peak[i],
                        "energy2": energy2[i],
                        "x": 0.0, "y": 0.0, "z": 0.0, "thr": 120.0,
                    }),
                )
            })
            .collect();
        let raw = serde_json::json!({
            "type": "hit_bundle",
            "node": "pico-a",
            "seq": 1,
            "t_ms": 1000,
            "ch": ch,
        });
        ImpactBurst::parse(raw.to_string().as_bytes()).unwrap()
    }

    fn pipeline(mode: Mode) -> Pipeline {
        let config = AppConfig::default();
        let dir = std::env::temp_dir().join(format!("quiver-pipeline-{}", std::process::id()));
        Pipeline::new(
            &config,
            Arc::new(RwLock::new(mode)),
            new_fit_handle(CalibrationFit::Identity, 0),
            Arc::new(HitLogger::new(dir.to_str().unwrap())),
            Arc::new(PipelineCounters::default()),
        )
    }

    #[tokio::test]
    async fn dead_center_burst_maps_to_origin() {
        let mut p = pipeline(Mode::Shooting);
        // all channels equal: sx = sy = 0 under the identity fit
        let evt = p
            .process(&bundle([100_000.0; 4], [500.0, 400.0, 400.0, 400.0]))
            .await
            .expect("accepted");
        assert_eq!((evt.sx, evt.sy), (0.0, 0.0));
        assert_eq!((evt.x_cm, evt.y_cm), (0.0, 0.0));
        assert_eq!(evt.r_cm, 0.0);
        // r = 0 ≤ X radius: scores as an X
        let (score, is_x) = crate::score::RingTable::default().score_from_r(evt.r_cm);
        assert_eq!((score, is_x), (10, true));
    }

    #[tokio::test]
    async fn eastward_burst_maps_through_half_span() {
        let mut p = pipeline(Mode::Shooting);
        // default map: ch3 = E (40k), ch1 = W (10k), N = S = 25k → sx = 0.6
        let evt = p
            .process(&bundle(
                [25_000.0, 10_000.0, 25_000.0, 40_000.0],
                [450.0, 400.0, 450.0, 500.0],
            ))
            .await
            .expect("accepted");
        assert_relative_eq!(evt.sx, 0.6, max_relative = 1e-9);
        assert_eq!(evt.sy, 0.0);
        assert_relative_eq!(evt.x_cm, 37.8, max_relative = 1e-9);
        assert_eq!(evt.fused.method.tag(), "energy_only");
        // 37.8 cm falls between rings 2 (36) and 1 (40)
        let (score, is_x) = crate::score::RingTable::default().score_from_r(evt.r_cm);
        assert_eq!((score, is_x), (1, false));
    }

    #[tokio::test]
    async fn scoring_mode_drops_hits() {
        let mut p = pipeline(Mode::Scoring);
        let out = p
            .process(&bundle([100_000.0; 4], [500.0, 400.0, 400.0, 400.0]))
            .await;
        assert!(out.is_none());
        assert_eq!(p.counters.mode_drops.load(Ordering::Relaxed), 1);
        // the drop still fed the EMA baseline
        assert_eq!(p.classifier.ema(), 400_000.0);
    }

    #[tokio::test]
    async fn cooldown_drops_second_hit() {
        let mut p = pipeline(Mode::Shooting);
        let strong = bundle([100_000.0; 4], [500.0, 400.0, 400.0, 400.0]);
        assert!(p.process(&strong).await.is_some());
        assert!(p.process(&strong).await.is_none(), "inside refractory window");
        assert_eq!(p.counters.cooldown_drops.load(Ordering::Relaxed), 1);
        assert_eq!(p.counters.accepted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn ghost_burst_counts_and_yields_nothing() {
        let mut p = pipeline(Mode::Shooting);
        let out = p.process(&bundle([5.0; 4], [1.0; 4])).await;
        assert!(out.is_none());
        assert_eq!(p.counters.ghosts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn mapped_through_installed_fit() {
        let mut p = pipeline(Mode::Shooting);
        crate::calibration::install_fit(
            &p.fit,
            CalibrationFit::Linear {
                x: [10.0, 0.0, 1.0],
                y: [0.0, 10.0, -1.0],
            },
        )
        .await;
        let evt = p
            .process(&bundle(
                [25_000.0, 10_000.0, 25_000.0, 40_000.0],
                [450.0, 400.0, 450.0, 500.0],
            ))
            .await
            .expect("accepted");
        assert_eq!(evt.fit_version, 1);
        assert_relative_eq!(evt.x_cm, 7.0, max_relative = 1e-9); // 10·0.6 + 1
        assert_relative_eq!(evt.y_cm, -1.0, max_relative = 1e-9);
    }
}
