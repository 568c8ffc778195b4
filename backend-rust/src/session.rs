//! # session
//!
//! Operating mode and training-session lifecycle.
//!
//! The mode gates burst acceptance: `shooting` produces shots, `scoring`
//! keeps the table viewable but ignores new bursts, and `calibration`
//! (active sub-state) routes bursts into the calibration pending buffer.
//! Entering calibration leaves any in-flight session untouched.
//!
//! A session is `arrows_per_end × num_ends` arrows; every recorded shot gets
//! an end number and a shot number within the end, and the session completes
//! automatically when the last arrow lands.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

// ── Mode ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Mode {
    Shooting,
    Scoring,
    Calibration { paused: bool },
}

pub type SharedMode = Arc<RwLock<Mode>>;

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Shooting => "shooting",
            Mode::Scoring => "scoring",
            Mode::Calibration { .. } => "calibration",
        }
    }

    /// Bursts become shots only in shooting mode.
    pub fn accepts_shots(&self) -> bool {
        matches!(self, Mode::Shooting)
    }

    /// Bursts feed the calibration pending buffer.
    pub fn is_calibration_active(&self) -> bool {
        matches!(self, Mode::Calibration { paused: false })
    }

    pub fn is_calibration(&self) -> bool {
        matches!(self, Mode::Calibration { .. })
    }
}

// ── Shot ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Shot {
    /// Unix seconds at acceptance
    pub ts: f64,
    pub x_cm: f64,
    pub y_cm: f64,
    pub r_cm: f64,
    pub score: u8,
    pub is_x: bool,
}

impl Shot {
    /// Dashboard shape: X-ring shots report the string "X" instead of 10.
    pub fn score_api(&self) -> serde_json::Value {
        if self.is_x {
            serde_json::Value::String("X".into())
        } else {
            self.score.into()
        }
    }

    pub fn to_api(&self) -> serde_json::Value {
        serde_json::json!({
            "ts": self.ts,
            "x": self.x_cm,
            "y": self.y_cm,
            "r": self.r_cm,
            "score": self.score_api(),
        })
    }
}

/// Where a shot landed in the session grid.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShotPlacement {
    pub end_number: u32,
    pub shot_number: u32,
}

// ── Session state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub ends: Vec<Vec<Shot>>,
    pub session_id: Option<u64>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub arrows_per_end: u32,
    pub num_ends: u32,
}

impl SessionState {
    pub fn new(arrows_per_end: u32, num_ends: u32) -> Self {
        Self {
            ends: Vec::new(),
            session_id: None,
            start_time: None,
            end_time: None,
            arrows_per_end,
            num_ends,
        }
    }

    pub fn total_arrows(&self) -> u32 {
        self.ends.iter().map(|e| e.len() as u32).sum()
    }

    pub fn total_score(&self) -> u32 {
        self.ends
            .iter()
            .flat_map(|e| e.iter())
            .map(|s| s.score as u32)
            .sum()
    }

    pub fn is_complete(&self) -> bool {
        self.total_arrows() >= self.arrows_per_end * self.num_ends
    }

    /// Append a shot, opening a new end when the current one fills. Once
    /// all ends exist, further shots overwrite the last end rather than
    /// growing the table without bound.
    pub fn add_shot(&mut self, shot: Shot) -> ShotPlacement {
        if self.ends.is_empty() {
            self.ends.push(Vec::new());
        }
        let last_full = self
            .ends
            .last()
            .is_some_and(|e| e.len() as u32 >= self.arrows_per_end);
        if last_full {
            if (self.ends.len() as u32) < self.num_ends {
                self.ends.push(Vec::new());
            } else if let Some(last) = self.ends.last_mut() {
                last.clear();
            }
        }
        if let Some(last) = self.ends.last_mut() {
            last.push(shot);
        }

        let total = self.total_arrows();
        ShotPlacement {
            end_number: (total - 1) / self.arrows_per_end + 1,
            shot_number: (total - 1) % self.arrows_per_end + 1,
        }
    }

    pub fn all_shots(&self) -> Vec<serde_json::Value> {
        self.ends
            .iter()
            .flat_map(|e| e.iter())
            .map(Shot::to_api)
            .collect()
    }

    /// The dashboard table projection: per-end rows with running totals and
    /// a score histogram. `total` always equals the sum of recorded scores.
    pub fn to_payload(&self) -> serde_json::Value {
        let mut running_total: u32 = 0;
        let mut ends_payload = Vec::new();
        let mut counts: std::collections::BTreeMap<String, u32> = std::collections::BTreeMap::new();
        counts.insert("X".into(), 0);
        for s in 0..=10u8 {
            counts.insert(s.to_string(), 0);
        }

        for (i, end) in self.ends.iter().enumerate() {
            let mut row_scores = Vec::new();
            let mut end_sum: u32 = 0;
            for shot in end {
                row_scores.push(shot.score_api());
                end_sum += shot.score as u32;
                if shot.is_x {
                    *counts.get_mut("X").unwrap() += 1;
                }
                *counts.entry(shot.score.to_string()).or_insert(0) += 1;
            }
            running_total += end_sum;
            ends_payload.push(serde_json::json!({
                "end": i + 1,
                "arrows": row_scores,
                "score": end_sum,
                "running": running_total,
            }));
        }

        serde_json::json!({
            "ends": ends_payload,
            "counts": counts,
            "total": running_total,
            "total_arrows": self.total_arrows(),
            "arrows_per_end": self.arrows_per_end,
            "num_ends": self.num_ends,
            "session_id": self.session_id,
            "is_complete": self.is_complete(),
        })
    }
}

// ── Session manager ───────────────────────────────────────────────────────────

/// What happened to the session when a shot was recorded.
#[derive(Debug, Clone, Copy)]
pub struct RecordedShot {
    pub session_id: Option<u64>,
    pub placement: ShotPlacement,
    /// Set when this shot completed the session
    pub completed: bool,
}

/// Tracks the live table and the active-session flag. A table exists even
/// without an active session so casual shooting still scores; only shots
/// inside an active session reach the durable store with session identity.
#[derive(Debug)]
pub struct SessionManager {
    state: SessionState,
}

impl SessionManager {
    pub fn new(arrows_per_end: u32, num_ends: u32) -> Self {
        Self {
            state: SessionState::new(arrows_per_end, num_ends),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn has_active_session(&self) -> bool {
        self.state.session_id.is_some() && self.state.end_time.is_none()
    }

    pub fn start_session(
        &mut self,
        session_id: u64,
        arrows_per_end: u32,
        num_ends: u32,
        now: f64,
    ) {
        self.state = SessionState::new(arrows_per_end, num_ends);
        self.state.session_id = Some(session_id);
        self.state.start_time = Some(now);
    }

    /// End the active session (early termination allowed).
    pub fn end_session(&mut self, now: f64) -> Option<u64> {
        if !self.has_active_session() {
            return None;
        }
        self.state.end_time = Some(now);
        self.state.session_id
    }

    pub fn record_shot(&mut self, shot: Shot, now: f64) -> RecordedShot {
        let placement = self.state.add_shot(shot);
        let completed = self.has_active_session() && self.state.is_complete();
        if completed {
            self.state.end_time = Some(now);
        }
        RecordedShot {
            session_id: self.state.session_id,
            placement,
            completed,
        }
    }

    /// Clear the table (dashboard reset button).
    pub fn reset_table(&mut self) {
        self.state.ends.clear();
    }

    pub fn session_info(&self) -> serde_json::Value {
        serde_json::json!({
            "session_id": self.state.session_id,
            "start_time": self.state.start_time,
            "end_time": self.state.end_time,
            "arrows_per_end": self.state.arrows_per_end,
            "num_ends": self.state.num_ends,
            "current_arrows": self.state.total_arrows(),
            "target_arrows": self.state.arrows_per_end * self.state.num_ends,
            "total_score": self.state.total_score(),
            "is_complete": self.state.is_complete(),
            "active": self.has_active_session(),
        })
    }
}
