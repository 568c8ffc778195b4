//! # classifier
//!
//! Multi-feature hit/ghost gate. Separates arrow impacts from spurious
//! vibration (bow taps, arrow pulls, footsteps) using energy, peak,
//! dominance, entropy, top-two concentration, peak-over-median impulse and
//! the delta against a slow EMA noise baseline.
//!
//! ## Gate ordering (short-circuit, first rejection wins)
//! 1. hard minimums (energy, max channel, dominance floor)
//! 2. impulse presence (too_small / no_impact)
//! 3. weak-signal veto
//! 4. calibration-strict vetoes
//! 5. weighted rubric vs the mode threshold (10 shooting / 13 calibration)
//! 6. low-energy override on a marginal HIT
//!
//! Every decision carries a reason string whose leading tag is stable;
//! the text after the tag is free-form diagnostics.
//!
//! ## Invariants
//! - EMA is updated for every burst, accepted or not (cooldown drops included)
//! - classification is deterministic given the same EMA history and burst

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ClassifierConfig;

const EPS: f64 = 1e-12;

// ── Features ──────────────────────────────────────────────────────────────────

/// Per-burst summary features derived from the four channel entries.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Features {
    /// Σ of best-available channel energies
    pub sum_energy: f64,
    /// Strongest single channel energy
    pub max_energy: f64,
    /// Strongest raw peak across channels
    pub max_peak: f64,
    /// Median raw peak (upper median of four)
    pub peak_median: f64,
    /// max_peak − peak_median: impulse contrast vs the other sensors
    pub peak_over: f64,
    /// max_energy / sum_energy (0 when sum ≈ 0)
    pub dom_ratio: f64,
    /// (e₁ + e₂) / sum over the two strongest channels
    pub top2_ratio: f64,
    /// Shannon entropy of the normalized energy split (lower = concentrated)
    pub entropy: f64,
    /// sum_energy − EMA before this burst
    pub delta: f64,
    /// EMA after absorbing this burst
    pub ema: f64,
}

impl Features {
    pub fn compute(energies: &[f64; 4], peaks: &[f64; 4], delta: f64, ema: f64) -> Self {
        let sum_energy: f64 = energies.iter().sum();
        let max_energy = energies.iter().cloned().fold(0.0, f64::max);
        let max_peak = peaks.iter().cloned().fold(0.0, f64::max);

        let mut sorted_peaks = *peaks;
        sorted_peaks.sort_by(|a, b| a.total_cmp(b));
        let peak_median = sorted_peaks[sorted_peaks.len() / 2];
        let peak_over = max_peak - peak_median;

        let dom_ratio = if sum_energy > 1e-9 {
            max_energy / sum_energy
        } else {
            0.0
        };

        let entropy = if sum_energy > 1e-9 {
            energies
                .iter()
                .map(|v| v.max(0.0) / sum_energy)
                .map(|p| -p * (p + EPS).ln())
                .sum()
        } else {
            0.0
        };

        let top2_ratio = if sum_energy > 1e-9 {
            let mut es = *energies;
            es.sort_by(|a, b| b.total_cmp(a));
            (es[0] + es[1]) / sum_energy
        } else {
            0.0
        };

        Self {
            sum_energy,
            max_energy,
            max_peak,
            peak_median,
            peak_over,
            dom_ratio,
            top2_ratio,
            entropy,
            delta,
            ema,
        }
    }
}

// ── Classification result ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Label {
    Hit,
    Ghost,
}

#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub label: Label,
    /// Stable leading tag + free-form diagnostics
    pub reason: String,
    /// Rubric score (0 when a hard gate fired first)
    pub score: i32,
    pub features: Features,
}

impl Classification {
    pub fn is_hit(&self) -> bool {
        self.label == Label::Hit
    }
}

// ── Classifier ────────────────────────────────────────────────────────────────

/// Owns the EMA noise baseline; one instance per pipeline, never shared.
#[derive(Debug)]
pub struct Classifier {
    cfg: ClassifierConfig,
    energy_ema: f64,
}

impl Classifier {
    pub fn new(cfg: ClassifierConfig) -> Self {
        Self {
            cfg,
            energy_ema: 0.0,
        }
    }

    pub fn ema(&self) -> f64 {
        self.energy_ema
    }

    /// Classify one burst. `calibration_strict` selects the stricter
    /// calibration profile (gate 4 plus the higher rubric threshold).
    pub fn classify(
        &mut self,
        energies: &[f64; 4],
        peaks: &[f64; 4],
        calibration_strict: bool,
    ) -> Classification {
        let sum_energy: f64 = energies.iter().sum();

        // Baseline first: the EMA absorbs every burst, including ones that
        // are about to be rejected. First observed burst seeds it.
        let ema_prev = if self.energy_ema == 0.0 {
            self.energy_ema = sum_energy;
            sum_energy
        } else {
            self.energy_ema
        };
        let delta = sum_energy - ema_prev;
        self.energy_ema = (1.0 - self.cfg.ema_alpha) * self.energy_ema
            + self.cfg.ema_alpha * sum_energy;

        let f = Features::compute(energies, peaks, delta, self.energy_ema);
        let cfg = &self.cfg;

        let ghost = |reason: String, score: i32| Classification {
            label: Label::Ghost,
            reason,
            score,
            features: f,
        };

        // 1. Hard minimums
        if f.sum_energy < cfg.min_energy {
            return ghost(format!("min_energy(sumE2={:.1}<{:.1})", f.sum_energy, cfg.min_energy), 0);
        }
        if f.max_energy < cfg.min_max_energy {
            return ghost(
                format!("min_max_energy(maxE={:.1}<{:.1})", f.max_energy, cfg.min_max_energy),
                0,
            );
        }
        if f.dom_ratio < cfg.min_dom_ratio && f.sum_energy < cfg.dom_gate_energy_ceiling {
            return ghost(
                format!("dom_floor(dom={:.2}<{:.2})", f.dom_ratio, cfg.min_dom_ratio),
                0,
            );
        }

        // 2. Impulse presence: arrow removal and slow presses must not score
        let has_impact = f.sum_energy >= cfg.impulse_energy
            || f.max_peak >= cfg.impulse_peak
            || f.peak_over >= cfg.impulse_peak_over;
        if f.sum_energy < cfg.too_small_energy
            && f.max_peak < cfg.impulse_peak
            && f.peak_over < cfg.impulse_peak_over
        {
            return ghost(
                format!(
                    "too_small(sumE2={:.0}<{:.0} & peak<{:.0} & pOver<{:.0})",
                    f.sum_energy, cfg.too_small_energy, cfg.impulse_peak, cfg.impulse_peak_over
                ),
                0,
            );
        }
        if !has_impact {
            return ghost(
                format!(
                    "no_impact(sumE2<{:.0} & peak<{:.0} & pOver<{:.0})",
                    cfg.impulse_energy, cfg.impulse_peak, cfg.impulse_peak_over
                ),
                0,
            );
        }

        // 3. Weak-signal veto
        if f.max_peak < cfg.weak_peak && f.sum_energy < cfg.weak_energy {
            return ghost(
                format!(
                    "weak_signal(peak={:.0}<{:.0} & sumE2={:.0}<{:.0})",
                    f.max_peak, cfg.weak_peak, f.sum_energy, cfg.weak_energy
                ),
                0,
            );
        }

        // 4. Calibration-strict vetoes
        if calibration_strict {
            if f.sum_energy < cfg.cal_min_energy {
                return ghost(
                    format!("cal_low_energy(sumE2={:.0}<{:.0})", f.sum_energy, cfg.cal_min_energy),
                    0,
                );
            }
            if !(f.max_peak >= cfg.cal_req_peak || f.sum_energy >= cfg.cal_req_energy) {
                return ghost(
                    format!(
                        "cal_requires(peak>={:.0} OR sumE2>={:.0})",
                        cfg.cal_req_peak, cfg.cal_req_energy
                    ),
                    0,
                );
            }
        }

        // 5. Weighted rubric
        fn tier(cond: bool, pts: i32, tag: String, score: &mut i32, why: &mut Vec<String>) {
            if cond {
                *score += pts;
                why.push(tag);
            }
        }
        let mut score = 0;
        let mut why: Vec<String> = Vec::new();

        let energy_pts = [2, 3, 3];
        for (t, pts) in cfg.score_energy_tiers.iter().zip(energy_pts) {
            tier(
                f.sum_energy >= *t,
                pts,
                format!("sumE2>={t:.0}(+{pts})"),
                &mut score,
                &mut why,
            );
        }
        let peak_pts = [2, 3, 2];
        for (t, pts) in cfg.score_peak_tiers.iter().zip(peak_pts) {
            tier(
                f.max_peak >= *t,
                pts,
                format!("peak>={t:.0}(+{pts})"),
                &mut score,
                &mut why,
            );
        }
        let dom_pts = [2, 3];
        for (t, pts) in cfg.score_dom_tiers.iter().zip(dom_pts) {
            tier(
                f.dom_ratio >= *t,
                pts,
                format!("dom>={t:.2}(+{pts})"),
                &mut score,
                &mut why,
            );
        }
        tier(
            f.peak_over >= cfg.score_peak_over,
            2,
            format!("peakOver>={:.0}(+2)", cfg.score_peak_over),
            &mut score,
            &mut why,
        );
        tier(
            f.entropy <= cfg.score_entropy_max,
            2,
            format!("entropy<={:.2}(+2)", cfg.score_entropy_max),
            &mut score,
            &mut why,
        );
        tier(
            f.top2_ratio >= cfg.score_top2_ratio,
            2,
            format!("top2>={:.2}(+2)", cfg.score_top2_ratio),
            &mut score,
            &mut why,
        );
        let delta_pts = [2, 3];
        for (t, pts) in cfg.score_delta_tiers.iter().zip(delta_pts) {
            tier(
                f.delta >= *t,
                pts,
                format!("delta>={t:.0}(+{pts})"),
                &mut score,
                &mut why,
            );
        }

        let thresh = if calibration_strict {
            cfg.score_thresh_calibration
        } else {
            cfg.score_thresh_shooting
        };

        let mut label = if score >= thresh { Label::Hit } else { Label::Ghost };
        let mut reason = format!("score={score}/{thresh} {}", why.join(","));

        // 6. Low-energy override: a marginal peak-only HIT is still a ghost
        if label == Label::Hit
            && f.sum_energy < cfg.low_energy_floor
            && score < thresh + cfg.low_energy_margin
        {
            label = Label::Ghost;
            reason = format!(
                "low_energy_override(sumE2={:.0}<{:.0},score={score})",
                f.sum_energy, cfg.low_energy_floor
            );
        }

        Classification {
            label,
            reason,
            score,
            features: f,
        }
    }
}

// ── Deduper ───────────────────────────────────────────────────────────────────

/// Refractory window suppressing repeat bursts for one physical impact.
/// Stamped only on accepted hits; mode changes do not reset it.
#[derive(Debug)]
pub struct Deduper {
    cooldown: Duration,
    last_accept: Option<Instant>,
}

impl Deduper {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_accept: None,
        }
    }

    /// Accept and stamp, or reject with the elapsed gap. A hit at exactly
    /// the cooldown boundary is accepted.
    pub fn try_accept(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(last) = self.last_accept {
            let elapsed = now.duration_since(last);
            if elapsed < self.cooldown {
                return Err(elapsed);
            }
        }
        self.last_accept = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;

    fn classifier() -> Classifier {
        Classifier::new(ClassifierConfig::default())
    }

    const STRONG_ENERGIES: [f64; 4] = [100_000.0, 1_000.0, 500.0, 500.0];
    const STRONG_PEAKS: [f64; 4] = [800.0, 100.0, 100.0, 100.0];

    #[test]
    fn strong_impact_is_hit() {
        let mut c = classifier();
        let out = c.classify(&STRONG_ENERGIES, &STRONG_PEAKS, false);
        assert_eq!(out.label, Label::Hit);
        assert!(out.reason.starts_with("score="), "reason: {}", out.reason);
        // energy 2+3+3, peak 2+3+2, dominance 2+3, peakOver 2, entropy 2, top2 2
        assert_eq!(out.score, 26);
    }

    #[test]
    fn sub_floor_energy_is_min_energy_ghost() {
        let mut c = classifier();
        let out = c.classify(&[5.0, 5.0, 5.0, 5.0], &[1.0, 1.0, 1.0, 1.0], false);
        assert_eq!(out.label, Label::Ghost);
        assert!(out.reason.starts_with("min_energy"));
    }

    #[test]
    fn energy_exactly_at_floor_passes_the_gate() {
        // Strict `<` is the threshold: equal clears the hard minimum and
        // falls through to the later gates instead.
        let mut c = classifier();
        let out = c.classify(&[22.0, 1.0, 1.0, 1.0], &[5.0, 1.0, 1.0, 1.0], false);
        assert_eq!(out.features.sum_energy, 25.0);
        assert_eq!(out.label, Label::Ghost);
        assert!(
            out.reason.starts_with("too_small"),
            "expected downstream gate, got {}",
            out.reason
        );
    }

    #[test]
    fn weak_signal_veto() {
        // sum 1500, peak 290, pOver 5: passes impulse gates, fails weak-signal
        let mut c = classifier();
        let out = c.classify(
            &[1_000.0, 200.0, 200.0, 100.0],
            &[290.0, 285.0, 285.0, 285.0],
            false,
        );
        assert_eq!(out.label, Label::Ghost);
        assert!(out.reason.starts_with("weak_signal"), "got {}", out.reason);
    }

    #[test]
    fn calibration_mode_rejects_mid_energy() {
        let mut c = classifier();
        let energies = [3_000.0, 400.0, 300.0, 300.0];
        let peaks = [600.0, 80.0, 80.0, 80.0];
        let shooting = c.classify(&energies, &peaks, false);
        assert_eq!(shooting.label, Label::Hit);
        let mut c = classifier();
        let cal = c.classify(&energies, &peaks, true);
        assert_eq!(cal.label, Label::Ghost);
        assert!(cal.reason.starts_with("cal_low_energy"), "got {}", cal.reason);
    }

    #[test]
    fn low_energy_override_reverts_marginal_hit() {
        let mut c = classifier();
        let out = c.classify(
            &[500.0, 300.0, 100.0, 100.0],
            &[400.0, 380.0, 300.0, 200.0],
            false,
        );
        // rubric clears the threshold (11) but sum 1000 < 5000 with no margin
        assert_eq!(out.score, 11);
        assert_eq!(out.label, Label::Ghost);
        assert!(out.reason.starts_with("low_energy_override"), "got {}", out.reason);
    }

    #[test]
    fn ema_seeds_on_first_burst() {
        let mut c = classifier();
        let out = c.classify(&STRONG_ENERGIES, &STRONG_PEAKS, false);
        // first burst seeds the baseline, so delta is zero however large it is
        assert_eq!(out.features.delta, 0.0);
        assert_eq!(out.features.ema, 102_000.0);
    }

    #[test]
    fn delta_tiers_score_after_quiet_baseline() {
        let mut c = classifier();
        // seed the baseline with a small ghost burst
        let _ = c.classify(&[50.0, 20.0, 20.0, 10.0], &[50.0, 40.0, 40.0, 40.0], false);
        let out = c.classify(&STRONG_ENERGIES, &STRONG_PEAKS, false);
        assert!(out.features.delta >= 10_000.0);
        // both delta tiers on top of the 26 static points
        assert_eq!(out.score, 31);
    }

    #[test]
    fn classifier_is_deterministic() {
        let run = || {
            let mut c = classifier();
            let _ = c.classify(&[60.0, 10.0, 10.0, 10.0], &[80.0, 20.0, 20.0, 20.0], false);
            c.classify(&STRONG_ENERGIES, &STRONG_PEAKS, false)
        };
        let a = run();
        let b = run();
        assert_eq!(a.label, b.label);
        assert_eq!(a.score, b.score);
        assert_eq!(a.reason, b.reason);
    }

    #[test]
    fn cooldown_boundary_is_inclusive() {
        let cooldown = Duration::from_millis(350);
        let mut d = Deduper::new(cooldown);
        let t0 = Instant::now();
        assert!(d.try_accept(t0).is_ok());
        // strictly inside the window: rejected
        assert!(d.try_accept(t0 + Duration::from_millis(200)).is_err());
        // rejection must not restamp the window
        assert!(d.try_accept(t0 + cooldown).is_ok());
    }

    #[test]
    fn cooldown_rejects_then_accepts_after_window() {
        let mut d = Deduper::new(Duration::from_millis(350));
        let t0 = Instant::now();
        assert!(d.try_accept(t0).is_ok());
        let err = d.try_accept(t0 + Duration::from_millis(100));
        assert_eq!(err, Err(Duration::from_millis(100)));
        assert!(d.try_accept(t0 + Duration::from_millis(500)).is_ok());
    }
}
