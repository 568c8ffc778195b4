//! # impact-types
//!
//! Shared burst-wire structures for the Quiver instrumented-target system.
//!
//! These types are used by:
//! - `backend-rust`: receiving and parsing hit bundles from the sensor node
//! - `impact-simulator`: producing synthetic hit bundles for development
//!
//! ## Coordinate Conventions
//!
//! - **Channel frame**: integer channel index 0..=3, as wired on the node
//! - **Compass frame**: logical sensor position N/E/S/W around the target face
//! - **Feature frame**: normalized (sx, sy) in [-1, +1], +x = East, +y = North
//! - **Target frame**: centimeters from face center, +x = right, +y = up
//!
//! ## Invariants
//! - The channel→compass mapping is injective and fixed at startup
//! - All magnitudes and sample counts are non-negative
//! - TDOA offsets are microseconds relative to the earliest channel;
//!   a wire value of -1 means "missing for this channel"

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NUM_CHANNELS: usize = 4;

// ── Compass direction ─────────────────────────────────────────────────────────

/// Logical sensor position around the target face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompassDir {
    N,
    E,
    S,
    W,
}

impl CompassDir {
    pub const ALL: [CompassDir; 4] = [CompassDir::N, CompassDir::E, CompassDir::S, CompassDir::W];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompassDir::N => "N",
            CompassDir::E => "E",
            CompassDir::S => "S",
            CompassDir::W => "W",
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'N' => Some(CompassDir::N),
            'E' => Some(CompassDir::E),
            'S' => Some(CompassDir::S),
            'W' => Some(CompassDir::W),
            _ => None,
        }
    }
}

impl fmt::Display for CompassDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Channel → compass mapping ────────────────────────────────────────────────

/// Injective mapping from channel index to compass position.
/// Fixed at startup; the default matches the node wiring (0=N, 1=W, 2=S, 3=E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    dirs: [CompassDir; NUM_CHANNELS],
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelMapError {
    #[error("channel map spec must be 4 letters from NESW, got {0:?}")]
    BadSpec(String),
    #[error("channel map must use each compass direction exactly once")]
    NotInjective,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            dirs: [CompassDir::N, CompassDir::W, CompassDir::S, CompassDir::E],
        }
    }
}

impl ChannelMap {
    /// Parse a spec like "NWSE": position i gives channel i's compass direction.
    pub fn parse(spec: &str) -> Result<Self, ChannelMapError> {
        let spec = spec.trim();
        let dirs: Vec<CompassDir> = spec.chars().filter_map(CompassDir::from_char).collect();
        if spec.len() != NUM_CHANNELS || dirs.len() != NUM_CHANNELS {
            return Err(ChannelMapError::BadSpec(spec.to_string()));
        }
        let arr = [dirs[0], dirs[1], dirs[2], dirs[3]];
        for d in CompassDir::ALL {
            if !arr.contains(&d) {
                return Err(ChannelMapError::NotInjective);
            }
        }
        Ok(Self { dirs: arr })
    }

    pub fn compass_of(&self, channel: usize) -> Option<CompassDir> {
        self.dirs.get(channel).copied()
    }

    /// Channel index wired to the given compass position.
    pub fn channel_of(&self, dir: CompassDir) -> usize {
        // Injectivity is a construction invariant, so the search always hits.
        self.dirs.iter().position(|d| *d == dir).unwrap_or(0)
    }
}

// ── Per-direction value maps ──────────────────────────────────────────────────

/// Four non-negative reals keyed by compass position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompassEnergies {
    pub n: f64,
    pub e: f64,
    pub s: f64,
    pub w: f64,
}

impl CompassEnergies {
    pub fn get(&self, dir: CompassDir) -> f64 {
        match dir {
            CompassDir::N => self.n,
            CompassDir::E => self.e,
            CompassDir::S => self.s,
            CompassDir::W => self.w,
        }
    }

    pub fn set(&mut self, dir: CompassDir, v: f64) {
        match dir {
            CompassDir::N => self.n = v,
            CompassDir::E => self.e = v,
            CompassDir::S => self.s = v,
            CompassDir::W => self.w = v,
        }
    }

    pub fn total(&self) -> f64 {
        self.n + self.e + self.s + self.w
    }
}

/// Per-compass arrival offsets in microseconds (earliest channel = 0).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompassTdoa {
    pub n: f64,
    pub e: f64,
    pub s: f64,
    pub w: f64,
}

impl CompassTdoa {
    pub fn values(&self) -> [f64; 4] {
        [self.n, self.e, self.s, self.w]
    }
}

/// Which wire field a TDOA map came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TdoaSource {
    /// `peak_tdoa_us` — sub-sample interpolated peak times (preferred)
    Peak,
    /// `tdoa_us` — threshold-interrupt arrival times (fallback)
    Interrupt,
}

// ── Wire format ───────────────────────────────────────────────────────────────

/// One channel's entry inside a `hit_bundle` datagram.
/// Field order on the wire is free; every field except `peak` may be absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSample {
    /// Raw peak magnitude over the burst window
    #[serde(default)]
    pub peak: f64,
    /// Sum of above-baseline magnitude
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
    /// Sum of squared above-baseline magnitude (preferred energy source)
    #[serde(default, rename = "energy2", skip_serializing_if = "Option::is_none")]
    pub energy_sq: Option<f64>,
    /// Samples contributing to the energy sums
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<u32>,
    /// Accelerometer triple at the peak sample
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
    /// Snapshot trigger threshold on the node
    #[serde(default)]
    pub thr: f64,
    /// Interrupt latency on the node, microseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_us: Option<i64>,
}

impl ChannelSample {
    /// Acceptance ordering of the channel-energy source: energy2, energy, peak.
    pub fn best_energy(&self) -> f64 {
        self.energy_sq.or(self.energy).unwrap_or(self.peak)
    }
}

/// One UDP datagram summarizing one candidate impact event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactBurst {
    /// Wire discriminator; must be "hit_bundle"
    #[serde(rename = "type")]
    pub kind: String,
    /// Sensor node identifier
    #[serde(default)]
    pub node: Option<String>,
    /// Monotonically increasing per-node sequence number
    #[serde(default)]
    pub seq: Option<u64>,
    /// Board-local timestamp, milliseconds
    #[serde(default)]
    pub t_ms: Option<u64>,
    /// Per-channel summary features, keys "0".."3"
    #[serde(default)]
    pub ch: HashMap<String, ChannelSample>,
    /// Interrupt-based arrival offsets, µs vs earliest; -1 = missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdoa_us: Option<HashMap<String, i64>>,
    /// Interpolated peak arrival offsets, µs vs earliest; -1 = missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_tdoa_us: Option<HashMap<String, i64>>,
    /// Captured samples per channel (debug)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<HashMap<String, u32>>,
}

/// Why a datagram was dropped before classification.
#[derive(Debug, Error)]
pub enum BurstParseError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("wrong type field {0:?} (expected \"hit_bundle\")")]
    TypeMismatch(String),
    #[error("channel map keys out of range or missing (got {got} of {NUM_CHANNELS})")]
    MissingChannels { got: usize },
    #[error("negative magnitude on channel {channel}")]
    NegativeMagnitude { channel: String },
}

impl ImpactBurst {
    /// Parse and validate one datagram. Strict about `type`, permissive about
    /// field order and missing optional fields.
    pub fn parse(data: &[u8]) -> Result<Self, BurstParseError> {
        let burst: ImpactBurst = serde_json::from_slice(data)?;
        if burst.kind != "hit_bundle" {
            return Err(BurstParseError::TypeMismatch(burst.kind));
        }
        let mut got = 0;
        for i in 0..NUM_CHANNELS {
            if burst.ch.contains_key(&i.to_string()) {
                got += 1;
            }
        }
        if got != NUM_CHANNELS {
            return Err(BurstParseError::MissingChannels { got });
        }
        for (key, sample) in &burst.ch {
            let neg = sample.peak < 0.0
                || sample.energy.is_some_and(|v| v < 0.0)
                || sample.energy_sq.is_some_and(|v| v < 0.0);
            if neg {
                return Err(BurstParseError::NegativeMagnitude {
                    channel: key.clone(),
                });
            }
        }
        Ok(burst)
    }

    fn channel(&self, i: usize) -> Option<&ChannelSample> {
        self.ch.get(&i.to_string())
    }

    /// Per-channel best-available energies in channel order.
    pub fn channel_energies(&self) -> [f64; NUM_CHANNELS] {
        let mut out = [0.0; NUM_CHANNELS];
        for (i, slot) in out.iter_mut().enumerate() {
            if let Some(s) = self.channel(i) {
                *slot = s.best_energy();
            }
        }
        out
    }

    /// Per-channel raw peaks in channel order.
    pub fn channel_peaks(&self) -> [f64; NUM_CHANNELS] {
        let mut out = [0.0; NUM_CHANNELS];
        for (i, slot) in out.iter_mut().enumerate() {
            if let Some(s) = self.channel(i) {
                *slot = s.peak;
            }
        }
        out
    }

    /// Best-available energies mapped into the compass frame.
    pub fn compass_energies(&self, map: &ChannelMap) -> CompassEnergies {
        let mut out = CompassEnergies::default();
        for (i, e) in self.channel_energies().iter().enumerate() {
            if let Some(dir) = map.compass_of(i) {
                out.set(dir, *e);
            }
        }
        out
    }

    /// The preferred TDOA map for localization: interpolated peak times when
    /// present, interrupt times otherwise. Entries of -1 are dropped. Returns
    /// None unless all four channels carry a usable offset.
    pub fn compass_tdoa(&self, map: &ChannelMap) -> Option<(CompassTdoa, TdoaSource)> {
        let (raw, source) = match (&self.peak_tdoa_us, &self.tdoa_us) {
            (Some(m), _) if !m.is_empty() => (m, TdoaSource::Peak),
            (_, Some(m)) if !m.is_empty() => (m, TdoaSource::Interrupt),
            _ => return None,
        };

        let mut out = CompassTdoa::default();
        let mut present = 0;
        for (key, us) in raw {
            if *us < 0 {
                continue; // -1 marks a channel that never armed
            }
            let idx: usize = key.parse().ok()?;
            let dir = map.compass_of(idx)?;
            match dir {
                CompassDir::N => out.n = *us as f64,
                CompassDir::E => out.e = *us as f64,
                CompassDir::S => out.s = *us as f64,
                CompassDir::W => out.w = *us as f64,
            }
            present += 1;
        }
        if present < NUM_CHANNELS {
            return None;
        }
        Some((out, source))
    }
}
