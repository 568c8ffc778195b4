//! # persistence
//!
//! Disk state: the canonical calibration fit and the session store snapshot.
//!
//! Both writers go through the same temp-file + rename path so a reader
//! (or a crash mid-write) sees either the old file complete or the new file
//! complete, never a torn one.
//!
//! ## Legacy fit files
//! Fits written before the cm migration carry no `units` tag and were
//! calibrated in meters. A meters fit has constant terms well under 1.0, so
//! an untagged file whose offsets are both < 1.0 is discarded at load with
//! a warning; re-calibration writes a tagged replacement.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::calibration::{CalibrationFit, PersistedFit};
use crate::session::{Shot, ShotPlacement};

// ── Atomic write helper ───────────────────────────────────────────────────────

async fn write_atomic(path: &str, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent).await.ok();
    }
    let tmp = format!("{path}.tmp");
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {tmp}"))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {tmp} over {path}"))?;
    Ok(())
}

// ── Calibration fit ───────────────────────────────────────────────────────────

/// Load the active fit from disk. Missing file → Identity. A corrupt or
/// legacy-units file is discarded (not fatal), also yielding Identity.
pub async fn load_fit(path: &str) -> (CalibrationFit, u64) {
    let data = match fs::read_to_string(path).await {
        Ok(d) => d,
        Err(_) => {
            info!("No calibration fit at {path}, starting uncalibrated");
            return (CalibrationFit::Identity, 0);
        }
    };

    let persisted: PersistedFit = match serde_json::from_str(&data) {
        Ok(p) => p,
        Err(e) => {
            warn!("Corrupt calibration fit at {path} ({e}), discarding");
            let _ = fs::remove_file(path).await;
            return (CalibrationFit::Identity, 0);
        }
    };

    let fit = match persisted.to_fit() {
        Ok(f) => f,
        Err(e) => {
            warn!("Unusable calibration fit at {path} ({e}), discarding");
            let _ = fs::remove_file(path).await;
            return (CalibrationFit::Identity, 0);
        }
    };

    if persisted.units.is_none() {
        if let Some((cx, cy)) = fit.constant_terms() {
            if cx.abs() < 1.0 && cy.abs() < 1.0 {
                warn!(
                    "Meters-legacy fit detected at {path} (offsets {cx:.3}/{cy:.3} < 1 cm), \
                     clearing it — re-calibrate in cm"
                );
                let _ = fs::remove_file(path).await;
                return (CalibrationFit::Identity, 0);
            }
        }
    }

    info!(
        "Loaded calibration fit from {path}: {} v{}",
        fit.model_tag(),
        persisted.version
    );
    (fit, persisted.version)
}

/// Persist the fit atomically. Identity is never written; callers reject it
/// before getting here.
pub async fn save_fit(path: &str, fit: &CalibrationFit, version: u64) -> Result<()> {
    let persisted = PersistedFit::from_fit(fit, version)
        .context("identity fit cannot be persisted")?;
    let json = serde_json::to_vec(&persisted)?;
    write_atomic(path, &json).await?;
    info!("Calibration fit v{version} ({}) written to {path}", fit.model_tag());
    Ok(())
}

// ── Session store ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredShot {
    pub end_number: u32,
    pub shot_number: u32,
    pub ts: f64,
    pub x_cm: f64,
    pub y_cm: f64,
    pub r_cm: f64,
    pub score: u8,
    pub is_x: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub session_id: u64,
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    pub arrows_per_end: u32,
    pub num_ends: u32,
    #[serde(default)]
    pub total_score: u32,
    #[serde(default)]
    pub total_arrows: u32,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub shots: Vec<StoredShot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionArchive {
    sessions: Vec<StoredSession>,
}

/// Durable shot/session history. The dispatcher appends on every accepted
/// shot (at-least-once); HTTP handlers read it for history queries.
#[derive(Debug)]
pub struct SessionStore {
    path: String,
    archive: SessionArchive,
}

impl SessionStore {
    pub async fn load(path: &str) -> Self {
        let archive = match fs::read_to_string(path).await {
            Ok(data) => match serde_json::from_str::<SessionArchive>(&data) {
                Ok(a) => {
                    info!("Loaded session store ({} sessions)", a.sessions.len());
                    a
                }
                Err(e) => {
                    warn!("Corrupt session store at {path} ({e}), starting empty");
                    SessionArchive::default()
                }
            },
            Err(_) => SessionArchive::default(),
        };
        Self {
            path: path.to_string(),
            archive,
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.archive
            .sessions
            .iter()
            .map(|s| s.session_id)
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn create_session(&mut self, session_id: u64, arrows_per_end: u32, num_ends: u32, now: f64) {
        self.archive.sessions.push(StoredSession {
            session_id,
            start_time: now,
            end_time: None,
            arrows_per_end,
            num_ends,
            total_score: 0,
            total_arrows: 0,
            is_complete: false,
            shots: Vec::new(),
        });
    }

    pub fn record_shot(&mut self, session_id: u64, placement: ShotPlacement, shot: &Shot) {
        if let Some(s) = self
            .archive
            .sessions
            .iter_mut()
            .find(|s| s.session_id == session_id)
        {
            s.shots.push(StoredShot {
                end_number: placement.end_number,
                shot_number: placement.shot_number,
                ts: shot.ts,
                x_cm: shot.x_cm,
                y_cm: shot.y_cm,
                r_cm: shot.r_cm,
                score: shot.score,
                is_x: shot.is_x,
            });
            s.total_arrows += 1;
            s.total_score += shot.score as u32;
        }
    }

    pub fn complete_session(&mut self, session_id: u64, now: f64, is_complete: bool) {
        if let Some(s) = self
            .archive
            .sessions
            .iter_mut()
            .find(|s| s.session_id == session_id)
        {
            s.end_time = Some(now);
            s.is_complete = is_complete;
        }
    }

    pub fn sessions(&self) -> &[StoredSession] {
        &self.archive.sessions
    }

    /// Snapshot the archive to disk atomically.
    pub async fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.archive)?;
        write_atomic(&self.path, &json).await
    }
}
