//! synth.rs — synthesizes per-channel burst features for a chosen impact
//! point, with Gaussian measurement noise so the backend sees something
//! close to real node output.
//!
//! The energy model inverts the backend's localizer: for a commanded
//! normalized (sx, sy), opposite-pair energies are split so the pair ratio
//! reproduces the commanded value, then jitter is applied. TDOA offsets come
//! from straight-line distances to the four sensors at the configured wave
//! speed.

use impact_types::{ChannelMap, CompassDir};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde_json::json;

/// Sensor distance from face center, cm.
const HALF_SPAN_CM: f64 = 63.0;
/// Wave speed through the straw boss, m/s.
const WAVE_SPEED_MPS: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct SynthConfig {
    /// Commanded impact point, cm from center
    pub x_cm: f64,
    pub y_cm: f64,
    /// Total burst energy across channels (energy2 units)
    pub total_energy: f64,
    /// Strongest-channel raw peak
    pub base_peak: f64,
    /// Relative sigma on channel energies
    pub energy_noise: f64,
    /// Sigma on TDOA offsets, µs
    pub tdoa_jitter_us: f64,
    /// Include TDOA maps at all
    pub with_tdoa: bool,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            x_cm: 0.0,
            y_cm: 0.0,
            total_energy: 200_000.0,
            base_peak: 800.0,
            energy_noise: 0.05,
            tdoa_jitter_us: 150.0,
            with_tdoa: true,
        }
    }
}

fn sensor_pos(dir: CompassDir) -> (f64, f64) {
    match dir {
        CompassDir::N => (0.0, HALF_SPAN_CM),
        CompassDir::E => (HALF_SPAN_CM, 0.0),
        CompassDir::S => (0.0, -HALF_SPAN_CM),
        CompassDir::W => (-HALF_SPAN_CM, 0.0),
    }
}

/// Per-compass energies reproducing the commanded (sx, sy) pair ratios.
fn compass_energies<R: Rng>(cfg: &SynthConfig, rng: &mut R) -> [(CompassDir, f64); 4] {
    let sx = (cfg.x_cm / HALF_SPAN_CM).clamp(-1.0, 1.0);
    let sy = (cfg.y_cm / HALF_SPAN_CM).clamp(-1.0, 1.0);

    let x_axis = cfg.total_energy / 2.0;
    let y_axis = cfg.total_energy / 2.0;
    let noise = Normal::new(1.0, cfg.energy_noise).unwrap();
    let mut jitter = |v: f64| (v * noise.sample(rng)).max(0.0);

    [
        (CompassDir::E, jitter(x_axis * (1.0 + sx) / 2.0)),
        (CompassDir::W, jitter(x_axis * (1.0 - sx) / 2.0)),
        (CompassDir::N, jitter(y_axis * (1.0 + sy) / 2.0)),
        (CompassDir::S, jitter(y_axis * (1.0 - sy) / 2.0)),
    ]
}

/// Arrival offsets in µs, earliest channel at zero.
fn compass_tdoa<R: Rng>(cfg: &SynthConfig, rng: &mut R) -> [(CompassDir, i64); 4] {
    let jitter = Normal::new(0.0, cfg.tdoa_jitter_us).unwrap();
    let mut times: Vec<(CompassDir, f64)> = CompassDir::ALL
        .iter()
        .map(|&dir| {
            let (px, py) = sensor_pos(dir);
            let dist_m = ((px - cfg.x_cm).powi(2) + (py - cfg.y_cm).powi(2)).sqrt() / 100.0;
            let us = dist_m / WAVE_SPEED_MPS * 1e6 + jitter.sample(rng);
            (dir, us)
        })
        .collect();

    let min = times
        .iter()
        .map(|(_, t)| *t)
        .fold(f64::MAX, f64::min);
    for (_, t) in &mut times {
        *t -= min;
    }

    [
        (times[0].0, times[0].1.round() as i64),
        (times[1].0, times[1].1.round() as i64),
        (times[2].0, times[2].1.round() as i64),
        (times[3].0, times[3].1.round() as i64),
    ]
}

/// Build one `hit_bundle` datagram body.
pub fn hit_bundle<R: Rng>(
    cfg: &SynthConfig,
    map: &ChannelMap,
    node: &str,
    seq: u64,
    t_ms: u64,
    rng: &mut R,
) -> serde_json::Value {
    let energies = compass_energies(cfg, rng);
    let max_energy = energies
        .iter()
        .map(|(_, e)| *e)
        .fold(0.0f64, f64::max);

    let mut ch = serde_json::Map::new();
    for (dir, energy) in energies {
        let channel = map.channel_of(dir);
        // peak tracks the channel's share of the impact
        let peak = (cfg.base_peak * (energy / max_energy).sqrt()).max(40.0);
        ch.insert(
            channel.to_string(),
            json!({
                "peak": (peak * 10.0).round() / 10.0,
                "energy2": (energy * 10.0).round() / 10.0,
                "samples": 96,
                "x": 0.0, "y": 0.0, "z": 0.0,
                "thr": 120.0,
            }),
        );
    }

    let mut bundle = json!({
        "type": "hit_bundle",
        "node": node,
        "seq": seq,
        "t_ms": t_ms,
        "ch": ch,
    });

    if cfg.with_tdoa {
        let mut tdoa = serde_json::Map::new();
        for (dir, us) in compass_tdoa(cfg, rng) {
            tdoa.insert(map.channel_of(dir).to_string(), json!(us));
        }
        bundle["peak_tdoa_us"] = serde_json::Value::Object(tdoa);
    }

    bundle
}

/// A diffuse low-energy burst the classifier should reject.
pub fn ghost_bundle<R: Rng>(node: &str, seq: u64, t_ms: u64, rng: &mut R) -> serde_json::Value {
    let mut ch = serde_json::Map::new();
    for channel in 0..4 {
        let energy: f64 = rng.gen_range(20.0..90.0);
        let peak: f64 = rng.gen_range(60.0..240.0);
        ch.insert(
            channel.to_string(),
            json!({
                "peak": (peak * 10.0).round() / 10.0,
                "energy2": (energy * 10.0).round() / 10.0,
                "samples": 96,
                "x": 0.0, "y": 0.0, "z": 0.0,
                "thr": 120.0,
            }),
        );
    }
    json!({
        "type": "hit_bundle",
        "node": node,
        "seq": seq,
        "t_ms": t_ms,
        "ch": ch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use impact_types::ImpactBurst;
    use rand::SeedableRng;

    #[test]
    fn bundle_parses_and_reproduces_offset() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let cfg = SynthConfig {
            x_cm: 31.5, // sx = 0.5
            energy_noise: 0.0,
            tdoa_jitter_us: 0.0,
            ..Default::default()
        };
        let map = ChannelMap::default();
        let v = hit_bundle(&cfg, &map, "sim", 1, 100, &mut rng);
        let burst = ImpactBurst::parse(v.to_string().as_bytes()).unwrap();
        let comp = burst.compass_energies(&map);
        let sx = (comp.e - comp.w) / (comp.e + comp.w);
        assert!((sx - 0.5).abs() < 1e-9, "sx = {sx}");
        assert!(burst.compass_tdoa(&map).is_some());
    }

    #[test]
    fn ghost_bundle_is_weak() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let v = ghost_bundle("sim", 1, 100, &mut rng);
        let burst = ImpactBurst::parse(v.to_string().as_bytes()).unwrap();
        let total: f64 = burst.channel_energies().iter().sum();
        assert!(total < 400.0);
    }
}
