//! # score
//!
//! Ring-radius table and the (r → score) resolver.
//!
//! The table maps score labels to ring radii in centimeters from face center.
//! Radii must strictly increase from ring 10 down to ring 1, with the X ring
//! no wider than ring 10. A radius exactly on a ring boundary counts as the
//! tighter (higher) score.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Score labels "X" and 10..=1, radii in cm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingTable {
    /// X-ring radius (tie-breaker inside ring 10)
    pub x: f64,
    /// Radii for rings 10, 9, ..., 1 in that order
    pub rings: [f64; 10],
}

#[derive(Debug, Error, PartialEq)]
pub enum RingTableError {
    #[error("ring radii must strictly increase from 10 down to 1 (ring {ring} breaks the order)")]
    NotIncreasing { ring: u8 },
    #[error("X radius {x} exceeds ring-10 radius {ten}")]
    XTooWide { x: f64, ten: f64 },
    #[error("ring radii must be positive")]
    NonPositive,
}

impl Default for RingTable {
    /// WA 122 cm face proportions scaled to this target (cm).
    fn default() -> Self {
        Self {
            x: 2.0,
            rings: [4.0, 8.0, 12.0, 16.0, 20.0, 24.0, 28.0, 32.0, 36.0, 40.0],
        }
    }
}

impl RingTable {
    pub fn validate(&self) -> Result<(), RingTableError> {
        if self.x <= 0.0 || self.rings.iter().any(|r| *r <= 0.0) {
            return Err(RingTableError::NonPositive);
        }
        if self.x > self.rings[0] {
            return Err(RingTableError::XTooWide {
                x: self.x,
                ten: self.rings[0],
            });
        }
        for i in 1..self.rings.len() {
            if self.rings[i] <= self.rings[i - 1] {
                return Err(RingTableError::NotIncreasing {
                    ring: 10 - i as u8,
                });
            }
        }
        Ok(())
    }

    /// Radius for an integer ring score 1..=10.
    pub fn radius_of(&self, score: u8) -> Option<f64> {
        if (1..=10).contains(&score) {
            Some(self.rings[(10 - score) as usize])
        } else {
            None
        }
    }

    /// Resolve a hit radius to (score, is_x). X counts as 10 with the flag
    /// set; outside ring 1 scores 0. Exactly-on-boundary takes the tighter
    /// score, so every comparison is `<=`.
    pub fn score_from_r(&self, r_cm: f64) -> (u8, bool) {
        if r_cm <= self.x {
            return (10, true);
        }
        for (i, radius) in self.rings.iter().enumerate() {
            if r_cm <= *radius {
                return (10 - i as u8, false);
            }
        }
        (0, false)
    }

    /// JSON shape used by the dashboard config API: {"X": 2, "10": 4, ...}.
    pub fn to_api(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("X".into(), self.x.into());
        for (i, radius) in self.rings.iter().enumerate() {
            map.insert((10 - i).to_string(), (*radius).into());
        }
        serde_json::Value::Object(map)
    }

    /// Parse the dashboard config shape; validates before returning.
    pub fn from_api(v: &serde_json::Value) -> Result<Self, RingTableError> {
        let obj = match v.as_object() {
            Some(o) => o,
            None => return Err(RingTableError::NonPositive),
        };
        let mut table = RingTable::default();
        if let Some(x) = obj.get("X").and_then(|v| v.as_f64()) {
            table.x = x;
        }
        for score in 1..=10u8 {
            if let Some(r) = obj.get(&score.to_string()).and_then(|v| v.as_f64()) {
                table.rings[(10 - score) as usize] = r;
            }
        }
        table.validate()?;
        Ok(table)
    }
}
