//! # config
//!
//! Runtime configuration for the backend. Every knob has a hard-coded
//! default matching the tuned field values; most can be overridden through
//! `QUIVER_*` environment variables so deployments never need a rebuild.

use std::time::Duration;

use impact_types::ChannelMap;
use tracing::warn;

use crate::score::RingTable;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Target geometry ───────────────────────────────────────────────────────────

/// Sensor span across the target face, cm (sensors sit 63 cm from center).
pub const TARGET_DIAMETER_CM: f64 = 126.0;
/// Distance from face center to each sensor, cm.
pub const HALF_SPAN_CM: f64 = TARGET_DIAMETER_CM / 2.0;

// ── Classifier ────────────────────────────────────────────────────────────────

/// Hit/ghost gate thresholds and the weighted-score rubric.
/// Tuned for a 38 lb recurve on a straw boss; noise tops out around
/// sumE2 ≈ 400 while real hits run 100k+.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Hard floor on compass-summed energy
    pub min_energy: f64,
    /// Hard floor on the strongest single channel
    pub min_max_energy: f64,
    /// Dominance floor; below this is usually diffuse vibration
    pub min_dom_ratio: f64,
    /// Dominance floor is waived above this energy
    pub dom_gate_energy_ceiling: f64,

    /// too_small gate: sumE2 < this AND peak < impulse_peak AND pOver < impulse_peak_over
    pub too_small_energy: f64,
    /// no_impact gate: none of sumE2 >= this, peak >= impulse_peak, pOver >= impulse_peak_over
    pub impulse_energy: f64,
    pub impulse_peak: f64,
    pub impulse_peak_over: f64,

    /// weak_signal gate: peak < this AND sumE2 < weak_energy
    pub weak_peak: f64,
    pub weak_energy: f64,

    /// Calibration-strict vetoes
    pub cal_min_energy: f64,
    pub cal_req_peak: f64,
    pub cal_req_energy: f64,

    // Rubric tiers
    pub score_energy_tiers: [f64; 3],
    pub score_peak_tiers: [f64; 3],
    pub score_dom_tiers: [f64; 2],
    pub score_peak_over: f64,
    pub score_entropy_max: f64,
    pub score_top2_ratio: f64,
    pub score_delta_tiers: [f64; 2],

    /// HIT threshold in shooting mode
    pub score_thresh_shooting: i32,
    /// HIT threshold while calibrating (stricter)
    pub score_thresh_calibration: i32,
    /// low_energy_override: HIT reverts to GHOST when sumE2 is below
    /// `low_energy_floor` and score is under threshold + `low_energy_margin`
    pub low_energy_floor: f64,
    pub low_energy_margin: i32,

    /// Noise-baseline EMA weight
    pub ema_alpha: f64,
    /// Refractory window between accepted hits
    pub cooldown: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_energy: env_parse("QUIVER_MIN_ENERGY", 25.0),
            min_max_energy: env_parse("QUIVER_MIN_MAX_ENERGY", 12.0),
            min_dom_ratio: env_parse("QUIVER_MIN_DOM_RATIO", 0.35),
            dom_gate_energy_ceiling: 10_000.0,

            too_small_energy: 200.0,
            impulse_energy: 300.0,
            impulse_peak: 300.0,
            impulse_peak_over: 10.0,

            weak_peak: 320.0,
            weak_energy: 2_000.0,

            cal_min_energy: 5_000.0,
            cal_req_peak: 320.0,
            cal_req_energy: 300.0,

            score_energy_tiers: [500.0, 1_000.0, 5_000.0],
            score_peak_tiers: [350.0, 500.0, 700.0],
            score_dom_tiers: [0.45, 0.60],
            score_peak_over: 25.0,
            score_entropy_max: 1.00,
            score_top2_ratio: 0.75,
            score_delta_tiers: [1_000.0, 10_000.0],

            score_thresh_shooting: env_parse("QUIVER_SCORE_THRESH", 10),
            score_thresh_calibration: env_parse("QUIVER_SCORE_THRESH_CAL", 13),
            low_energy_floor: 5_000.0,
            low_energy_margin: 5,

            ema_alpha: 0.05,
            cooldown: Duration::from_millis(env_parse("QUIVER_COOLDOWN_MS", 350)),
        }
    }
}

// ── Localizer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocalizerConfig {
    /// Axis-reliability floor φ: below this fraction of total energy an
    /// axis ratio is √-blended toward zero
    pub axis_floor: f64,
    /// Components under this magnitude snap to zero
    pub deadzone: f64,
    /// Total energy under this yields fixed low confidence
    pub low_total_energy: f64,
    /// Confidence assigned when total energy is under the floor
    pub low_total_confidence: f64,

    /// Enable the TDOA estimator at all
    pub tdoa_enabled: bool,
    /// Wave propagation speed in the target medium, m/s.
    /// Observed ≈12000 µs max spread across the 1.26 m span → ~100 m/s.
    pub wave_speed_mps: f64,
    /// Sensor span in meters (normalization distance for TDOA deltas)
    pub max_span_m: f64,
    /// TDOA confidence multiplier in fusion; energy is the more trusted
    /// channel on this hardware
    pub tdoa_trust_factor: f64,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            axis_floor: 0.10,
            deadzone: 0.03,
            low_total_energy: 50.0,
            low_total_confidence: 0.2,

            tdoa_enabled: env_parse("QUIVER_TDOA_ENABLED", true),
            wave_speed_mps: env_parse("QUIVER_TDOA_WAVE_SPEED", 100.0),
            max_span_m: TARGET_DIAMETER_CM / 100.0,
            tdoa_trust_factor: 0.5,
        }
    }
}

// ── Application ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// UDP bind address for the sensor node
    pub udp_host: String,
    pub udp_port: u16,
    /// HTTP/WS control-surface port
    pub http_port: u16,
    /// Channel → compass mapping (letter i = channel i's direction)
    pub channel_map: ChannelMap,
    pub rings: RingTable,
    pub arrows_per_end: u32,
    pub max_ends: u32,

    pub classifier: ClassifierConfig,
    pub localizer: LocalizerConfig,

    /// Canonical calibration fit file
    pub fit_path: String,
    /// Daily CSV hit logs
    pub hit_log_dir: String,
    /// Session store snapshot
    pub session_store_path: String,

    /// Burst queue between hub and dispatcher
    pub queue_capacity: usize,
    /// Graceful-shutdown queue drain budget
    pub drain_timeout: Duration,
    /// Hard timeout for disk writes and subscriber sends
    pub io_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        let channel_map = match std::env::var("QUIVER_CHANNEL_MAP") {
            Ok(spec) => match ChannelMap::parse(&spec) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Invalid QUIVER_CHANNEL_MAP ({e}), using default NWSE");
                    ChannelMap::default()
                }
            },
            Err(_) => ChannelMap::default(),
        };

        Self {
            udp_host: std::env::var("QUIVER_UDP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            udp_port: env_parse("QUIVER_UDP_PORT", 5005),
            http_port: env_parse("PORT", 8000),
            channel_map,
            rings: RingTable::default(),
            arrows_per_end: env_parse("QUIVER_ARROWS_PER_END", 3),
            max_ends: env_parse("QUIVER_MAX_ENDS", 10),

            classifier: ClassifierConfig::default(),
            localizer: LocalizerConfig::default(),

            fit_path: std::env::var("QUIVER_FIT_PATH")
                .unwrap_or_else(|_| "data/calibration_fit.json".into()),
            hit_log_dir: std::env::var("QUIVER_HIT_LOG_DIR")
                .unwrap_or_else(|_| "data/logs".into()),
            session_store_path: std::env::var("QUIVER_SESSION_STORE")
                .unwrap_or_else(|_| "data/sessions.json".into()),

            queue_capacity: 200,
            drain_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(3),
        }
    }
}
