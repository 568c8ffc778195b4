//! # calibration
//!
//! Maps normalized (sx, sy) features to target-plane centimeters, and fits
//! that mapping from operator-confirmed ground truth.
//!
//! ## Fit models
//! - `Identity` — uncalibrated: (HALF_SPAN·sx, HALF_SPAN·sy)
//! - `linear_sxsy` — 3 coefficients per axis, fit from 3–5 samples
//! - `poly2_sxsy` — 6 coefficients per axis, fit from ≥6 samples
//! - `affine_sxsy` — legacy on-disk shape, read-supported only
//!
//! ## Controller state machine
//!
//! | state  | entry                         | exit                               |
//! |--------|-------------------------------|------------------------------------|
//! | Idle   | initial / operator applies    | `start` → Active                   |
//! | Active | captures one pending at a time| `pause` → Paused, `reset` → Active |
//! | Paused | pending cleared, not refilled | `resume` → Active                  |
//!
//! Confirming a pending shot appends a sample and auto-fits once three
//! samples exist. A computed fit is installed for the live pipeline
//! immediately (version bump); only the explicit `apply` persists it.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::HALF_SPAN_CM;

// ── Fit model ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationFit {
    Identity,
    Linear { x: [f64; 3], y: [f64; 3] },
    Quadratic { x: [f64; 6], y: [f64; 6] },
}

impl CalibrationFit {
    pub fn model_tag(&self) -> &'static str {
        match self {
            CalibrationFit::Identity => "identity",
            CalibrationFit::Linear { .. } => "linear_sxsy",
            CalibrationFit::Quadratic { .. } => "poly2_sxsy",
        }
    }

    /// Map normalized features to target-plane centimeters.
    pub fn map(&self, sx: f64, sy: f64) -> (f64, f64) {
        match self {
            CalibrationFit::Identity => (HALF_SPAN_CM * sx, HALF_SPAN_CM * sy),
            CalibrationFit::Linear { x, y } => {
                let basis = [sx, sy, 1.0];
                (dot(x, &basis), dot(y, &basis))
            }
            CalibrationFit::Quadratic { x, y } => {
                let basis = [sx, sy, sx * sy, sx * sx, sy * sy, 1.0];
                (dot(x, &basis), dot(y, &basis))
            }
        }
    }

    /// Constant (offset) terms, used by the meters-legacy load heuristic.
    pub fn constant_terms(&self) -> Option<(f64, f64)> {
        match self {
            CalibrationFit::Identity => None,
            CalibrationFit::Linear { x, y } => Some((x[2], y[2])),
            CalibrationFit::Quadratic { x, y } => Some((x[5], y[5])),
        }
    }
}

fn dot(coeffs: &[f64], basis: &[f64]) -> f64 {
    coeffs.iter().zip(basis).map(|(c, b)| c * b).sum()
}

// ── Persisted form ────────────────────────────────────────────────────────────

/// On-disk shape of `calibration_fit.json`. `units`/`version` are absent in
/// files written before the cm migration; the loader treats their absence as
/// "suspect legacy".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedFit {
    pub model: String,
    pub params: PersistedParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PersistedParams {
    Vectors {
        #[serde(default)]
        order: Vec<String>,
        x: Vec<f64>,
        y: Vec<f64>,
    },
    /// Legacy: x = a·sx + b·sy + c, y = d·sx + e·sy + f
    Affine {
        a: f64,
        b: f64,
        c: f64,
        d: f64,
        e: f64,
        f: f64,
    },
}

pub const LINEAR_ORDER: [&str; 3] = ["sx", "sy", "1"];
pub const POLY2_ORDER: [&str; 6] = ["sx", "sy", "sx_sy", "sx2", "sy2", "1"];

impl PersistedFit {
    pub fn from_fit(fit: &CalibrationFit, version: u64) -> Option<Self> {
        let params = match fit {
            CalibrationFit::Identity => return None,
            CalibrationFit::Linear { x, y } => PersistedParams::Vectors {
                order: LINEAR_ORDER.iter().map(|s| s.to_string()).collect(),
                x: x.to_vec(),
                y: y.to_vec(),
            },
            CalibrationFit::Quadratic { x, y } => PersistedParams::Vectors {
                order: POLY2_ORDER.iter().map(|s| s.to_string()).collect(),
                x: x.to_vec(),
                y: y.to_vec(),
            },
        };
        Some(Self {
            model: fit.model_tag().to_string(),
            params,
            units: Some("cm".to_string()),
            version,
        })
    }

    /// Decode into the in-memory model. Only the three accepted tags parse;
    /// `affine_sxsy` folds into `Linear` and is never written back.
    pub fn to_fit(&self) -> Result<CalibrationFit, CalibrationError> {
        match (self.model.as_str(), &self.params) {
            ("linear_sxsy", PersistedParams::Vectors { x, y, .. }) => {
                let (x, y) = (vec_to_arr3(x)?, vec_to_arr3(y)?);
                Ok(CalibrationFit::Linear { x, y })
            }
            ("poly2_sxsy", PersistedParams::Vectors { x, y, .. }) => {
                let (x, y) = (vec_to_arr6(x)?, vec_to_arr6(y)?);
                Ok(CalibrationFit::Quadratic { x, y })
            }
            ("affine_sxsy", PersistedParams::Affine { a, b, c, d, e, f }) => {
                Ok(CalibrationFit::Linear {
                    x: [*a, *b, *c],
                    y: [*d, *e, *f],
                })
            }
            (model, _) => Err(CalibrationError::ModelNotAccepted {
                model: model.to_string(),
            }),
        }
    }
}

fn vec_to_arr3(v: &[f64]) -> Result<[f64; 3], CalibrationError> {
    v.try_into()
        .map_err(|_| CalibrationError::BadCoefficients { expected: 3, got: v.len() })
}

fn vec_to_arr6(v: &[f64]) -> Result<[f64; 6], CalibrationError> {
    v.try_into()
        .map_err(|_| CalibrationError::BadCoefficients { expected: 6, got: v.len() })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("need at least 3 samples (have {have})")]
    InsufficientSamples { have: usize },
    #[error("least-squares solve failed: design matrix is rank-deficient")]
    SolverFailure,
    #[error("coefficient vector has wrong length (expected {expected}, got {got})")]
    BadCoefficients { expected: usize, got: usize },
    #[error("no pending shot to confirm")]
    NoPending,
    #[error("calibration is not active")]
    NotActive,
    #[error("model {model:?} is not accepted by the live pipeline")]
    ModelNotAccepted { model: String },
}

// ── Live fit handle ───────────────────────────────────────────────────────────

/// The fit visible to the live pipeline. Swapped as a whole Arc so every
/// reader sees either the old fit or the new one, never a torn state.
#[derive(Debug, Clone)]
pub struct ActiveFit {
    pub fit: Arc<CalibrationFit>,
    /// Monotonically increasing across every successful install
    pub version: u64,
}

pub type FitHandle = Arc<RwLock<ActiveFit>>;

pub fn new_fit_handle(fit: CalibrationFit, version: u64) -> FitHandle {
    Arc::new(RwLock::new(ActiveFit {
        fit: Arc::new(fit),
        version,
    }))
}

/// Install a newly computed fit for all subsequent bursts.
pub async fn install_fit(handle: &FitHandle, fit: CalibrationFit) -> u64 {
    let mut active = handle.write().await;
    active.version += 1;
    active.fit = Arc::new(fit);
    active.version
}

// ── Least-squares solver ──────────────────────────────────────────────────────

/// One operator-confirmed ground-truth pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub sx: f64,
    pub sy: f64,
    pub x_truth_cm: f64,
    pub y_truth_cm: f64,
    pub ts: f64,
}

impl CalibrationSample {
    fn is_valid(&self) -> bool {
        self.sx.is_finite()
            && self.sy.is_finite()
            && self.x_truth_cm.is_finite()
            && self.y_truth_cm.is_finite()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FitSolution {
    #[serde(skip)]
    pub fit: CalibrationFit,
    pub model: &'static str,
    pub n: usize,
    pub residual_mean_cm: f64,
    pub residual_max_cm: f64,
}

/// Ordinary least squares per axis. Quadratic basis from 6 valid samples,
/// linear below that, error under 3.
pub fn solve_fit(samples: &[CalibrationSample]) -> Result<FitSolution, CalibrationError> {
    let valid: Vec<&CalibrationSample> = samples.iter().filter(|s| s.is_valid()).collect();
    let n = valid.len();
    if n < 3 {
        return Err(CalibrationError::InsufficientSamples { have: n });
    }

    let use_poly2 = n >= 6;
    let cols = if use_poly2 { 6 } else { 3 };

    let a = DMatrix::from_fn(n, cols, |r, c| {
        let s = valid[r];
        if use_poly2 {
            [s.sx, s.sy, s.sx * s.sy, s.sx * s.sx, s.sy * s.sy, 1.0][c]
        } else {
            [s.sx, s.sy, 1.0][c]
        }
    });
    let bx = DVector::from_fn(n, |r, _| valid[r].x_truth_cm);
    let by = DVector::from_fn(n, |r, _| valid[r].y_truth_cm);

    let svd = a.clone().svd(true, true);
    if svd.rank(1e-9) < cols {
        return Err(CalibrationError::SolverFailure);
    }
    let px = svd.solve(&bx, 1e-12).map_err(|_| CalibrationError::SolverFailure)?;
    let py = svd.solve(&by, 1e-12).map_err(|_| CalibrationError::SolverFailure)?;

    let x_hat = &a * &px;
    let y_hat = &a * &py;
    let mut sum_err = 0.0;
    let mut max_err: f64 = 0.0;
    for i in 0..n {
        let err = (x_hat[i] - bx[i]).hypot(y_hat[i] - by[i]);
        sum_err += err;
        max_err = max_err.max(err);
    }

    let fit = if use_poly2 {
        CalibrationFit::Quadratic {
            x: vec_to_arr6(px.as_slice())?,
            y: vec_to_arr6(py.as_slice())?,
        }
    } else {
        CalibrationFit::Linear {
            x: vec_to_arr3(px.as_slice())?,
            y: vec_to_arr3(py.as_slice())?,
        }
    };

    Ok(FitSolution {
        model: fit.model_tag(),
        fit,
        n,
        residual_mean_cm: sum_err / n as f64,
        residual_max_cm: max_err,
    })
}

// ── Controller ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalPhase {
    Idle,
    Active,
    Paused,
}

/// The just-captured burst awaiting the operator's ground-truth click.
#[derive(Debug, Clone, Serialize)]
pub struct PendingShot {
    pub ts: f64,
    pub sx: f64,
    pub sy: f64,
    pub x_cm: f64,
    pub y_cm: f64,
    pub r_cm: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// CSV row captured at acceptance, re-logged with ground truth on confirm
    #[serde(skip)]
    pub log: Option<crate::hit_log::HitLogRow>,
}

/// Result of confirming a pending shot.
#[derive(Debug)]
pub struct Confirmed {
    pub sample: CalibrationSample,
    /// Present once three samples exist and the auto-fit succeeded
    pub solution: Option<FitSolution>,
    /// The consumed pending shot (carries the CSV row for ground-truth re-log)
    pub pending: PendingShot,
}

/// Owns calibration samples and the single pending slot. Mode gating lives
/// with the session controller; this struct only enforces its own phases.
#[derive(Debug)]
pub struct CalibrationController {
    phase: CalPhase,
    pending: Option<PendingShot>,
    samples: Vec<CalibrationSample>,
    last_solution: Option<FitSolution>,
}

impl Default for CalibrationController {
    fn default() -> Self {
        Self {
            phase: CalPhase::Idle,
            pending: None,
            samples: Vec::new(),
            last_solution: None,
        }
    }
}

impl CalibrationController {
    pub fn phase(&self) -> CalPhase {
        self.phase
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn pending(&self) -> Option<&PendingShot> {
        self.pending.as_ref()
    }

    pub fn start(&mut self) {
        self.phase = CalPhase::Active;
        self.pending = None;
        info!("Calibration started ({} samples held)", self.samples.len());
    }

    pub fn pause(&mut self) -> Result<(), CalibrationError> {
        if self.phase != CalPhase::Active {
            return Err(CalibrationError::NotActive);
        }
        self.phase = CalPhase::Paused;
        self.pending = None;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), CalibrationError> {
        if self.phase != CalPhase::Paused {
            return Err(CalibrationError::NotActive);
        }
        self.phase = CalPhase::Active;
        Ok(())
    }

    /// Drop all samples and any pending shot; phase is unchanged.
    pub fn reset(&mut self) {
        self.pending = None;
        self.samples.clear();
        self.last_solution = None;
        info!("Calibration samples cleared");
    }

    /// Leave calibration entirely (after apply, or operator abort).
    pub fn stop(&mut self) {
        self.phase = CalPhase::Idle;
        self.pending = None;
    }

    /// Offer a just-classified burst as the pending shot. Only one pending
    /// at a time; extra bursts are ignored until the operator confirms.
    pub fn offer_pending(&mut self, shot: PendingShot) -> bool {
        if self.phase != CalPhase::Active || self.pending.is_some() {
            return false;
        }
        self.pending = Some(shot);
        true
    }

    /// Operator confirms where the pending arrow actually landed. Appends a
    /// sample and auto-fits once three samples exist; a failed auto-fit
    /// keeps the samples and reports no solution.
    pub fn confirm(
        &mut self,
        x_truth_cm: f64,
        y_truth_cm: f64,
    ) -> Result<Confirmed, CalibrationError> {
        if self.phase != CalPhase::Active {
            return Err(CalibrationError::NotActive);
        }
        let pending = self.pending.take().ok_or(CalibrationError::NoPending)?;
        let sample = CalibrationSample {
            sx: pending.sx,
            sy: pending.sy,
            x_truth_cm,
            y_truth_cm,
            ts: pending.ts,
        };
        self.samples.push(sample);
        info!(
            "Calibration sample {} confirmed at ({x_truth_cm:.1}, {y_truth_cm:.1}) cm",
            self.samples.len()
        );

        let solution = if self.samples.len() >= 3 {
            match solve_fit(&self.samples) {
                Ok(sol) => {
                    self.last_solution = Some(sol.clone());
                    Some(sol)
                }
                Err(e) => {
                    info!("Auto-fit after confirm failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Confirmed {
            sample,
            solution,
            pending,
        })
    }

    /// Explicit fit request over the held samples.
    pub fn compute(&mut self) -> Result<FitSolution, CalibrationError> {
        let sol = solve_fit(&self.samples)?;
        self.last_solution = Some(sol.clone());
        Ok(sol)
    }

    pub fn status(&self, active_version: u64, active_model: &str) -> serde_json::Value {
        serde_json::json!({
            "phase": self.phase,
            "samples": self.samples.len(),
            "pending": self.pending,
            "lastFit": self.last_solution.as_ref().map(|s| serde_json::json!({
                "model": s.model,
                "n": s.n,
                "meanErrorCm": s.residual_mean_cm,
                "maxErrorCm": s.residual_max_cm,
            })),
            "active": { "model": active_model, "version": active_version },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(sx: f64, sy: f64, x: f64, y: f64) -> CalibrationSample {
        CalibrationSample {
            sx,
            sy,
            x_truth_cm: x,
            y_truth_cm: y,
            ts: 0.0,
        }
    }

    /// Ground truth model used across the solver tests:
    /// x = 10·sx − 5·sy + 2,  y = 3·sx + 8·sy − 1
    fn truth(sx: f64, sy: f64) -> (f64, f64) {
        (10.0 * sx - 5.0 * sy + 2.0, 3.0 * sx + 8.0 * sy - 1.0)
    }

    #[test]
    fn identity_maps_by_half_span() {
        let (x, y) = CalibrationFit::Identity.map(0.5, -0.2);
        assert_relative_eq!(x, 31.5, max_relative = 1e-12);
        assert_relative_eq!(y, -12.6, max_relative = 1e-9);
    }

    #[test]
    fn quadratic_basis_order() {
        let fit = CalibrationFit::Quadratic {
            x: [0.0, 0.0, 1.0, 0.0, 0.0, 0.0], // picks out sx·sy
            y: [0.0, 0.0, 0.0, 1.0, 0.0, 0.0], // picks out sx²
        };
        let (x, y) = fit.map(0.5, -0.4);
        assert_relative_eq!(x, -0.2, max_relative = 1e-12);
        assert_relative_eq!(y, 0.25, max_relative = 1e-12);
    }

    #[test]
    fn linear_fit_recovers_exact_model() {
        let pts = [(0.1, 0.2), (-0.4, 0.5), (0.7, -0.3), (0.0, 0.9)];
        let samples: Vec<_> = pts
            .iter()
            .map(|&(sx, sy)| {
                let (x, y) = truth(sx, sy);
                sample(sx, sy, x, y)
            })
            .collect();
        let sol = solve_fit(&samples).unwrap();
        assert_eq!(sol.model, "linear_sxsy");
        match &sol.fit {
            CalibrationFit::Linear { x, y } => {
                assert_relative_eq!(x[0], 10.0, epsilon = 1e-8);
                assert_relative_eq!(x[1], -5.0, epsilon = 1e-8);
                assert_relative_eq!(x[2], 2.0, epsilon = 1e-8);
                assert_relative_eq!(y[0], 3.0, epsilon = 1e-8);
                assert_relative_eq!(y[1], 8.0, epsilon = 1e-8);
                assert_relative_eq!(y[2], -1.0, epsilon = 1e-8);
            }
            other => panic!("expected linear fit, got {other:?}"),
        }
        assert!(sol.residual_mean_cm < 1e-8);
    }

    #[test]
    fn nine_samples_use_quadratic_and_recover_model() {
        let mut samples = Vec::new();
        for &sx in &[-0.5, 0.0, 0.5] {
            for &sy in &[-0.5, 0.0, 0.5] {
                let (x, y) = truth(sx, sy);
                samples.push(sample(sx, sy, x, y));
            }
        }
        let sol = solve_fit(&samples).unwrap();
        assert_eq!(sol.model, "poly2_sxsy");
        assert!(sol.residual_mean_cm < 0.01);
        match &sol.fit {
            CalibrationFit::Quadratic { x, y } => {
                // interaction and square terms of the generating model are zero
                assert_relative_eq!(x[0], 10.0, epsilon = 1e-7);
                assert_relative_eq!(x[1], -5.0, epsilon = 1e-7);
                assert_relative_eq!(x[2], 0.0, epsilon = 1e-7);
                assert_relative_eq!(x[3], 0.0, epsilon = 1e-7);
                assert_relative_eq!(x[4], 0.0, epsilon = 1e-7);
                assert_relative_eq!(x[5], 2.0, epsilon = 1e-7);
                assert_relative_eq!(y[1], 8.0, epsilon = 1e-7);
                assert_relative_eq!(y[5], -1.0, epsilon = 1e-7);
            }
            other => panic!("expected quadratic fit, got {other:?}"),
        }
        // the recovered fit reproduces every truth point
        for &(sx, sy) in &[(0.25, -0.25), (0.5, 0.5)] {
            let (tx, ty) = truth(sx, sy);
            let (mx, my) = sol.fit.map(sx, sy);
            assert_relative_eq!(mx, tx, epsilon = 1e-6);
            assert_relative_eq!(my, ty, epsilon = 1e-6);
        }
    }

    #[test]
    fn under_three_samples_errors() {
        let samples = vec![sample(0.1, 0.1, 1.0, 1.0), sample(0.2, 0.2, 2.0, 2.0)];
        assert!(matches!(
            solve_fit(&samples),
            Err(CalibrationError::InsufficientSamples { have: 2 })
        ));
    }

    #[test]
    fn degenerate_samples_fail_solver() {
        // three identical points: rank 1 design matrix
        let samples = vec![sample(0.1, 0.1, 5.0, 5.0); 3];
        assert!(matches!(
            solve_fit(&samples),
            Err(CalibrationError::SolverFailure)
        ));
    }

    #[test]
    fn invalid_samples_are_dropped_before_counting() {
        let mut samples = vec![
            sample(0.1, 0.2, 1.0, 1.0),
            sample(-0.4, 0.5, 2.0, 2.0),
            sample(0.7, -0.3, 3.0, 3.0),
        ];
        samples.push(sample(f64::NAN, 0.0, 0.0, 0.0));
        let sol = solve_fit(&samples).unwrap();
        assert_eq!(sol.n, 3);
    }

    #[test]
    fn persisted_round_trip() {
        let fit = CalibrationFit::Linear {
            x: [10.0, -5.0, 2.0],
            y: [3.0, 8.0, -1.0],
        };
        let persisted = PersistedFit::from_fit(&fit, 4).unwrap();
        let json = serde_json::to_string(&persisted).unwrap();
        let back: PersistedFit = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, 4);
        assert_eq!(back.units.as_deref(), Some("cm"));
        assert_eq!(back.to_fit().unwrap(), fit);
    }

    #[test]
    fn legacy_affine_reads_as_linear() {
        let json = r#"{
            "model": "affine_sxsy",
            "params": {"a": 10.0, "b": -5.0, "c": 2.0, "d": 3.0, "e": 8.0, "f": -1.0}
        }"#;
        let persisted: PersistedFit = serde_json::from_str(json).unwrap();
        assert_eq!(persisted.version, 0);
        let fit = persisted.to_fit().unwrap();
        assert_eq!(
            fit,
            CalibrationFit::Linear {
                x: [10.0, -5.0, 2.0],
                y: [3.0, 8.0, -1.0],
            }
        );
    }

    #[test]
    fn unknown_model_is_rejected() {
        let json = r#"{"model": "spline9", "params": {"order": [], "x": [], "y": []}}"#;
        let persisted: PersistedFit = serde_json::from_str(json).unwrap();
        assert!(matches!(
            persisted.to_fit(),
            Err(CalibrationError::ModelNotAccepted { .. })
        ));
    }

    fn pending(sx: f64, sy: f64) -> PendingShot {
        PendingShot {
            ts: 1.0,
            sx,
            sy,
            x_cm: sx * HALF_SPAN_CM,
            y_cm: sy * HALF_SPAN_CM,
            r_cm: 0.0,
            seq: None,
            node: None,
            log: None,
        }
    }

    #[test]
    fn controller_single_pending_slot() {
        let mut c = CalibrationController::default();
        assert!(!c.offer_pending(pending(0.1, 0.1)), "idle rejects bursts");
        c.start();
        assert!(c.offer_pending(pending(0.1, 0.1)));
        assert!(!c.offer_pending(pending(0.2, 0.2)), "slot already full");
        assert_eq!(c.pending().unwrap().sx, 0.1);
    }

    #[test]
    fn controller_pause_clears_pending() {
        let mut c = CalibrationController::default();
        c.start();
        assert!(c.offer_pending(pending(0.1, 0.1)));
        c.pause().unwrap();
        assert!(c.pending().is_none());
        assert!(!c.offer_pending(pending(0.2, 0.2)), "paused rejects bursts");
        c.resume().unwrap();
        assert!(c.offer_pending(pending(0.2, 0.2)));
    }

    #[test]
    fn controller_confirm_appends_and_autofits_at_three() {
        let mut c = CalibrationController::default();
        c.start();
        let pts = [(0.1, 0.2), (-0.4, 0.5), (0.7, -0.3)];
        for (i, &(sx, sy)) in pts.iter().enumerate() {
            assert!(c.offer_pending(pending(sx, sy)));
            let (x, y) = truth(sx, sy);
            let confirmed = c.confirm(x, y).unwrap();
            if i < 2 {
                assert!(confirmed.solution.is_none());
            } else {
                let sol = confirmed.solution.expect("third confirm auto-fits");
                assert_eq!(sol.model, "linear_sxsy");
            }
        }
        assert_eq!(c.sample_count(), 3);
        assert!(c.pending().is_none());
    }

    #[test]
    fn controller_confirm_without_pending_errors() {
        let mut c = CalibrationController::default();
        c.start();
        assert!(matches!(c.confirm(0.0, 0.0), Err(CalibrationError::NoPending)));
    }

    #[tokio::test]
    async fn install_bumps_version_atomically() {
        let handle = new_fit_handle(CalibrationFit::Identity, 0);
        let v = install_fit(
            &handle,
            CalibrationFit::Linear {
                x: [1.0, 0.0, 0.0],
                y: [0.0, 1.0, 0.0],
            },
        )
        .await;
        assert_eq!(v, 1);
        let active = handle.read().await;
        assert_eq!(active.fit.model_tag(), "linear_sxsy");
    }
}
