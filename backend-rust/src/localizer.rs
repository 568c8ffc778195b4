//! # localizer
//!
//! Converts per-channel burst features into a normalized impact estimate
//! (sx, sy) ∈ [-1, +1]².
//!
//! Two independent estimators feed a confidence-weighted fusion step:
//! - **Energy**: opposite-pair energy ratios with axis-reliability blending
//!   and a small deadzone. Primary estimator on this hardware.
//! - **TDOA**: per-channel arrival offsets converted to distance deltas
//!   through the target's wave speed. Secondary; its confidence is halved
//!   before fusion because timing on the straw boss is noisy.

use std::fmt;

use impact_types::{CompassEnergies, CompassTdoa, TdoaSource};
use serde::Serialize;

use crate::config::LocalizerConfig;

const EPS: f64 = 1e-12;

// ── Energy estimator ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EnergyEstimate {
    pub sx: f64,
    pub sy: f64,
    /// 0..1, from dominance and axis balance
    pub confidence: f64,
    /// Fraction of total energy supporting each axis (diagnostics)
    pub x_frac: f64,
    pub y_frac: f64,
}

/// Blend a ratio toward zero when its axis carries almost no energy.
/// √ blend preserves more signal at intermediate fractions than linear.
fn blend_to_zero(v: f64, frac: f64, floor: f64) -> f64 {
    if frac <= 0.0 {
        return 0.0;
    }
    if frac >= floor {
        return v.clamp(-1.0, 1.0);
    }
    (v * (frac / floor).sqrt()).clamp(-1.0, 1.0)
}

pub fn localize_energy(
    comp: &CompassEnergies,
    dom_ratio: f64,
    cfg: &LocalizerConfig,
) -> EnergyEstimate {
    let (p_n, p_e, p_w, p_s) = (comp.n, comp.e, comp.w, comp.s);
    let total = p_n + p_e + p_w + p_s;

    let sx_raw = (p_e - p_w) / (p_e + p_w + EPS);
    let sy_raw = (p_n - p_s) / (p_n + p_s + EPS);

    let x_axis = p_e + p_w;
    let y_axis = p_n + p_s;
    let x_frac = x_axis / (total + EPS);
    let y_frac = y_axis / (total + EPS);

    let mut sx = blend_to_zero(sx_raw, x_frac, cfg.axis_floor);
    let mut sy = blend_to_zero(sy_raw, y_frac, cfg.axis_floor);

    // Deadzone stabilizes near-center noise
    if sx.abs() < cfg.deadzone {
        sx = 0.0;
    }
    if sy.abs() < cfg.deadzone {
        sy = 0.0;
    }

    let confidence = if total < cfg.low_total_energy {
        cfg.low_total_confidence
    } else {
        let axis_balance = x_axis.min(y_axis) / (x_axis.max(y_axis) + EPS);
        (0.3 + 0.4 * dom_ratio + 0.3 * axis_balance).clamp(0.0, 1.0)
    };

    EnergyEstimate {
        sx,
        sy,
        confidence,
        x_frac,
        y_frac,
    }
}

// ── TDOA estimator ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TdoaEstimate {
    pub sx: f64,
    pub sy: f64,
    /// 0..1, from timing spread quality; capped at 0.7 so TDOA never fully
    /// overrides energy
    pub confidence: f64,
    pub source: TdoaSource,
}

pub fn localize_tdoa(
    tdoa: &CompassTdoa,
    source: TdoaSource,
    cfg: &LocalizerConfig,
) -> TdoaEstimate {
    // A later arrival means the sensor is further from the impact
    let d_n = tdoa.n * 1e-6 * cfg.wave_speed_mps;
    let d_e = tdoa.e * 1e-6 * cfg.wave_speed_mps;
    let d_s = tdoa.s * 1e-6 * cfg.wave_speed_mps;
    let d_w = tdoa.w * 1e-6 * cfg.wave_speed_mps;

    // If East arrives later than West the impact is closer to West
    let sx = (-(d_e - d_w) / cfg.max_span_m).clamp(-1.0, 1.0);
    let sy = (-(d_n - d_s) / cfg.max_span_m).clamp(-1.0, 1.0);

    let times = tdoa.values();
    let max_t = times.iter().cloned().fold(f64::MIN, f64::max);
    let min_t = times.iter().cloned().fold(f64::MAX, f64::min);
    let spread = max_t - min_t;
    let n_at_zero = times.iter().filter(|t| **t == min_t).count();

    let expected = cfg.max_span_m / cfg.wave_speed_mps * 1e6;

    let confidence = if n_at_zero >= 3 {
        // broad wavefront: only one useful timing channel
        0.05
    } else if n_at_zero == 2 {
        0.15
    } else if spread < 100.0 {
        // all sensors nearly simultaneous
        0.1
    } else if spread > expected * 1.5 {
        // physically impossible spread
        0.0
    } else if spread > expected {
        0.15
    } else {
        (0.3 + 0.4 * spread / expected).min(0.7)
    };

    TdoaEstimate {
        sx,
        sy,
        confidence,
        source,
    }
}

// ── Fusion ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum FusionMethod {
    EnergyOnly,
    LowConfAvg,
    AgreeFuse { w_energy: f64, w_tdoa: f64 },
    DisagreeFuse { w_energy: f64, w_tdoa: f64 },
    HighDisagreeEnergy { energy_conf: f64, tdoa_conf: f64 },
}

impl FusionMethod {
    /// Stable tag checked by tests and written to the hit log.
    pub fn tag(&self) -> &'static str {
        match self {
            FusionMethod::EnergyOnly => "energy_only",
            FusionMethod::LowConfAvg => "low_conf_avg",
            FusionMethod::AgreeFuse { .. } => "agree_fuse",
            FusionMethod::DisagreeFuse { .. } => "disagree_fuse",
            FusionMethod::HighDisagreeEnergy { .. } => "high_disagree_energy",
        }
    }
}

impl fmt::Display for FusionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FusionMethod::EnergyOnly | FusionMethod::LowConfAvg => f.write_str(self.tag()),
            FusionMethod::AgreeFuse { w_energy, w_tdoa }
            | FusionMethod::DisagreeFuse { w_energy, w_tdoa } => {
                write!(f, "{}(e={w_energy:.2},t={w_tdoa:.2})", self.tag())
            }
            FusionMethod::HighDisagreeEnergy {
                energy_conf,
                tdoa_conf,
            } => write!(f, "{}(e_conf={energy_conf:.2},t_conf={tdoa_conf:.2})", self.tag()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FusedEstimate {
    pub sx: f64,
    pub sy: f64,
    pub method: FusionMethod,
}

/// Confidence-weighted combination of the two estimates. Energy wins
/// outright when the methods strongly disagree.
pub fn fuse(
    energy: &EnergyEstimate,
    tdoa: Option<&TdoaEstimate>,
    cfg: &LocalizerConfig,
) -> FusedEstimate {
    let t = match tdoa {
        Some(t) => t,
        None => {
            return FusedEstimate {
                sx: energy.sx,
                sy: energy.sy,
                method: FusionMethod::EnergyOnly,
            }
        }
    };

    let tdoa_conf_eff = t.confidence * cfg.tdoa_trust_factor;
    let total_conf = energy.confidence + tdoa_conf_eff;
    if total_conf < 0.1 {
        return FusedEstimate {
            sx: (energy.sx + t.sx) / 2.0,
            sy: (energy.sy + t.sy) / 2.0,
            method: FusionMethod::LowConfAvg,
        };
    }

    let mut w_energy = energy.confidence / total_conf;
    let mut w_tdoa = tdoa_conf_eff / total_conf;

    let disagreement = (energy.sx - t.sx).hypot(energy.sy - t.sy);

    if disagreement < 0.2 {
        FusedEstimate {
            sx: w_energy * energy.sx + w_tdoa * t.sx,
            sy: w_energy * energy.sy + w_tdoa * t.sy,
            method: FusionMethod::AgreeFuse { w_energy, w_tdoa },
        }
    } else if disagreement < 0.5 {
        // moderate disagreement: penalize then renormalize
        let penalty = 1.0 - (disagreement - 0.2) / 0.3 * 0.3;
        w_energy *= penalty;
        w_tdoa *= penalty;
        let total = w_energy + w_tdoa;
        if total > 0.0 {
            w_energy /= total;
            w_tdoa /= total;
        }
        FusedEstimate {
            sx: w_energy * energy.sx + w_tdoa * t.sx,
            sy: w_energy * energy.sy + w_tdoa * t.sy,
            method: FusionMethod::DisagreeFuse { w_energy, w_tdoa },
        }
    } else {
        // TDOA on this hardware is not reliable enough to override energy
        FusedEstimate {
            sx: energy.sx,
            sy: energy.sy,
            method: FusionMethod::HighDisagreeEnergy {
                energy_conf: energy.confidence,
                tdoa_conf: t.confidence,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cfg() -> LocalizerConfig {
        LocalizerConfig::default()
    }

    fn comp(n: f64, e: f64, s: f64, w: f64) -> CompassEnergies {
        CompassEnergies { n, e, s, w }
    }

    #[test]
    fn equal_opposite_energies_center() {
        let est = localize_energy(&comp(1000.0, 1000.0, 1000.0, 1000.0), 0.25, &cfg());
        assert_eq!(est.sx, 0.0);
        assert_eq!(est.sy, 0.0);
    }

    #[test]
    fn eastward_impact_ratio() {
        // E=4000 W=1000 N=S=2500 → sx = 3000/5000, sy = 0
        let est = localize_energy(&comp(2500.0, 4000.0, 2500.0, 1000.0), 0.4, &cfg());
        assert_relative_eq!(est.sx, 0.6, max_relative = 1e-9);
        assert_eq!(est.sy, 0.0);
        // perfectly balanced axes, dom 0.4 → 0.3 + 0.16 + 0.3
        assert_relative_eq!(est.confidence, 0.76, max_relative = 1e-9);
    }

    #[test]
    fn axis_floor_is_passthrough_at_phi() {
        let c = cfg();
        // x_frac exactly at the floor passes through
        assert_eq!(blend_to_zero(0.8, c.axis_floor, c.axis_floor), 0.8);
        // zero fraction silences the axis entirely
        assert_eq!(blend_to_zero(0.8, 0.0, c.axis_floor), 0.0);
        // quarter of the floor scales by √(1/4)
        assert_relative_eq!(
            blend_to_zero(0.8, c.axis_floor / 4.0, c.axis_floor),
            0.4,
            max_relative = 1e-9
        );
    }

    #[test]
    fn starved_axis_blends_toward_zero() {
        // y axis holds ~2.4% of total energy: its wild ratio gets damped
        let est = localize_energy(&comp(120.0, 2500.0, 0.0, 2500.0), 0.49, &cfg());
        assert_eq!(est.sx, 0.0); // E == W
        let expected = 1.0 * (est.y_frac / 0.10f64).sqrt();
        assert_relative_eq!(est.sy, expected, max_relative = 1e-9);
        assert!(est.sy < 0.5);
    }

    #[test]
    fn deadzone_snaps_small_components() {
        // sx_raw = 10/1010 ≈ 0.0099 < 0.03
        let est = localize_energy(&comp(500.0, 510.0, 500.0, 500.0), 0.25, &cfg());
        assert_eq!(est.sx, 0.0);
    }

    #[test]
    fn low_total_energy_confidence_floor() {
        let est = localize_energy(&comp(10.0, 10.0, 10.0, 10.0), 0.25, &cfg());
        assert_eq!(est.confidence, 0.2);
    }

    fn tdoa(n: f64, e: f64, s: f64, w: f64) -> CompassTdoa {
        CompassTdoa { n, e, s, w }
    }

    #[test]
    fn tdoa_west_impact_points_west() {
        // East arrives 6300 µs after West → impact well toward West
        let est = localize_tdoa(&tdoa(3000.0, 6300.0, 3000.0, 0.0), TdoaSource::Peak, &cfg());
        // dE - dW = 0.63 m over a 1.26 m span → sx = -0.5
        assert_relative_eq!(est.sx, -0.5, max_relative = 1e-9);
        assert_relative_eq!(est.sy, 0.0, max_relative = 1e-9);
        // spread 6300 of expected 12600 → 0.3 + 0.4·0.5
        assert_relative_eq!(est.confidence, 0.5, max_relative = 1e-9);
    }

    #[test]
    fn tdoa_confidence_ladder() {
        let c = cfg();
        // three channels at the minimum: broad wavefront
        let est = localize_tdoa(&tdoa(0.0, 0.0, 0.0, 5000.0), TdoaSource::Peak, &c);
        assert_eq!(est.confidence, 0.05);
        // two at the minimum
        let est = localize_tdoa(&tdoa(0.0, 0.0, 3000.0, 5000.0), TdoaSource::Peak, &c);
        assert_eq!(est.confidence, 0.15);
        // all nearly simultaneous
        let est = localize_tdoa(&tdoa(0.0, 20.0, 40.0, 60.0), TdoaSource::Peak, &c);
        assert_eq!(est.confidence, 0.1);
        // physically impossible spread (expected ≈ 12600 µs)
        let est = localize_tdoa(&tdoa(0.0, 9000.0, 20000.0, 4000.0), TdoaSource::Peak, &c);
        assert_eq!(est.confidence, 0.0);
        // slightly over expected
        let est = localize_tdoa(&tdoa(0.0, 9000.0, 13000.0, 4000.0), TdoaSource::Peak, &c);
        assert_eq!(est.confidence, 0.15);
    }

    fn energy_est(sx: f64, sy: f64, confidence: f64) -> EnergyEstimate {
        EnergyEstimate {
            sx,
            sy,
            confidence,
            x_frac: 0.5,
            y_frac: 0.5,
        }
    }

    fn tdoa_est(sx: f64, sy: f64, confidence: f64) -> TdoaEstimate {
        TdoaEstimate {
            sx,
            sy,
            confidence,
            source: TdoaSource::Peak,
        }
    }

    #[test]
    fn fusion_without_tdoa_is_energy_only() {
        let out = fuse(&energy_est(0.3, -0.2, 0.7), None, &cfg());
        assert_eq!(out.method.tag(), "energy_only");
        assert_eq!((out.sx, out.sy), (0.3, -0.2));
    }

    #[test]
    fn fusion_low_confidence_averages() {
        let out = fuse(&energy_est(0.2, 0.0, 0.05), Some(&tdoa_est(0.4, 0.0, 0.05)), &cfg());
        assert_eq!(out.method.tag(), "low_conf_avg");
        assert_relative_eq!(out.sx, 0.3, max_relative = 1e-9);
    }

    #[test]
    fn fusion_agreement_weights_by_confidence() {
        let out = fuse(&energy_est(0.30, 0.0, 0.6), Some(&tdoa_est(0.40, 0.0, 0.6)), &cfg());
        // effective tdoa conf 0.3 → weights 2/3 vs 1/3
        assert_eq!(out.method.tag(), "agree_fuse");
        assert_relative_eq!(out.sx, 0.30 * (2.0 / 3.0) + 0.40 * (1.0 / 3.0), max_relative = 1e-9);
    }

    #[test]
    fn fusion_moderate_disagreement_keeps_weight_ratio() {
        let out = fuse(&energy_est(0.0, 0.0, 0.6), Some(&tdoa_est(0.4, 0.0, 0.6)), &cfg());
        match out.method {
            FusionMethod::DisagreeFuse { w_energy, w_tdoa } => {
                // equal scaling then renormalization preserves the ratio
                assert_relative_eq!(w_energy, 2.0 / 3.0, max_relative = 1e-9);
                assert_relative_eq!(w_tdoa, 1.0 / 3.0, max_relative = 1e-9);
            }
            other => panic!("expected disagree_fuse, got {other:?}"),
        }
    }

    #[test]
    fn fusion_high_disagreement_prefers_energy() {
        // energy (0.4, 0.0) vs tdoa (-0.8, 0.3): disagreement ≈ 1.24
        let out = fuse(&energy_est(0.4, 0.0, 0.7), Some(&tdoa_est(-0.8, 0.3, 0.6)), &cfg());
        assert_eq!(out.method.tag(), "high_disagree_energy");
        assert_eq!((out.sx, out.sy), (0.4, 0.0));
    }
}
