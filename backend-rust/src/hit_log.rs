//! # hit_log
//!
//! Daily CSV log of accepted hits, one file per date. Every accepted burst
//! is appended at acceptance; a calibration confirmation re-logs the same
//! shot with the operator's ground-truth coordinates filled in.
//!
//! The header row is a stable analysis contract; downstream notebooks key
//! on these column names.

use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use impact_types::{CompassEnergies, CompassTdoa};

pub const CSV_HEADERS: [&str; 32] = [
    "date",
    "time",
    "seq",
    "node",
    "session_id",
    "mode(shooting|calibration)",
    "estimated_x_cm",
    "estimated_y_cm",
    "fused_sx(-1to1)",
    "fused_sy(-1to1)",
    "clicked_x_cm(cal_only)",
    "clicked_y_cm(cal_only)",
    "fusion_method",
    "energy_confidence(0to1)",
    "tdoa_confidence(0to1)",
    "energy_sx(-1to1)",
    "energy_sy(-1to1)",
    "total_energy(sumE2)",
    "max_peak(raw_accel)",
    "dominant_ratio(0to1)",
    "tdoa_sx(-1to1)",
    "tdoa_sy(-1to1)",
    "tdoa_N_microsec(vs_first)",
    "tdoa_W_microsec(vs_first)",
    "tdoa_S_microsec(vs_first)",
    "tdoa_E_microsec(vs_first)",
    "energy_N(sumE2)",
    "energy_W(sumE2)",
    "energy_S(sumE2)",
    "energy_E(sumE2)",
    "label(hit|reject)",
    "classifier_score",
];

/// One CSV row. Built by the pipeline at acceptance and cloned into the
/// calibration pending slot so a confirmation can re-log with ground truth.
#[derive(Debug, Clone, Serialize)]
pub struct HitLogRow {
    pub seq: Option<u64>,
    pub node: Option<String>,
    pub session_id: Option<u64>,
    pub mode: &'static str,
    pub x_cm: f64,
    pub y_cm: f64,
    pub sx: f64,
    pub sy: f64,
    pub clicked_x_cm: Option<f64>,
    pub clicked_y_cm: Option<f64>,
    pub fusion_method: String,
    pub energy_conf: f64,
    pub tdoa_conf: f64,
    pub sx_energy: f64,
    pub sy_energy: f64,
    pub total_energy: f64,
    pub max_peak: f64,
    pub dom_ratio: f64,
    pub sx_tdoa: Option<f64>,
    pub sy_tdoa: Option<f64>,
    pub tdoa: Option<CompassTdoa>,
    pub energies: CompassEnergies,
    pub label: &'static str,
    pub score: i32,
}

impl HitLogRow {
    fn to_csv(&self, date: &str, time: &str) -> String {
        let opt = |v: Option<f64>, digits: usize| {
            v.map(|v| format!("{v:.digits$}")).unwrap_or_default()
        };
        let tdoa = self.tdoa.unwrap_or_default();
        let cols: Vec<String> = vec![
            date.to_string(),
            time.to_string(),
            self.seq.map(|s| s.to_string()).unwrap_or_default(),
            self.node.clone().unwrap_or_default(),
            self.session_id.map(|s| s.to_string()).unwrap_or_default(),
            self.mode.to_string(),
            format!("{:.1}", self.x_cm),
            format!("{:.1}", self.y_cm),
            format!("{:.3}", self.sx),
            format!("{:.3}", self.sy),
            opt(self.clicked_x_cm, 1),
            opt(self.clicked_y_cm, 1),
            self.fusion_method.clone(),
            format!("{:.3}", self.energy_conf),
            format!("{:.3}", self.tdoa_conf),
            format!("{:.3}", self.sx_energy),
            format!("{:.3}", self.sy_energy),
            format!("{:.1}", self.total_energy),
            format!("{:.1}", self.max_peak),
            format!("{:.4}", self.dom_ratio),
            opt(self.sx_tdoa, 3),
            opt(self.sy_tdoa, 3),
            format!("{:.1}", tdoa.n),
            format!("{:.1}", tdoa.w),
            format!("{:.1}", tdoa.s),
            format!("{:.1}", tdoa.e),
            format!("{:.1}", self.energies.n),
            format!("{:.1}", self.energies.w),
            format!("{:.1}", self.energies.s),
            format!("{:.1}", self.energies.e),
            self.label.to_string(),
            self.score.to_string(),
        ];
        cols.iter()
            .map(|c| csv_escape(c))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Quote a field when it carries a comma or quote (fusion_method does).
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Append-only daily hit logger. Write failures are warned and swallowed;
/// logging must never stall the burst path.
#[derive(Debug)]
pub struct HitLogger {
    dir: PathBuf,
}

impl HitLogger {
    pub fn new(dir: &str) -> Self {
        Self {
            dir: PathBuf::from(dir),
        }
    }

    pub fn file_for_date(&self, date: &str) -> PathBuf {
        self.dir.join(format!("arrow_hits_{date}.csv"))
    }

    pub async fn append(&self, row: &HitLogRow) {
        let now = Local::now();
        let date = now.format("%Y-%m-%d").to_string();
        let time = now.format("%H:%M:%S%.3f").to_string();
        let path = self.file_for_date(&date);
        if let Err(e) = self.append_inner(&path, &row.to_csv(&date, &time)).await {
            warn!("Hit log: write to {} failed: {e}", path.display());
        }
    }

    async fn append_inner(&self, path: &Path, line: &str) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let need_header = match fs::metadata(path).await {
            Ok(m) => m.len() == 0,
            Err(_) => true,
        };
        let mut f = OpenOptions::new().create(true).append(true).open(path).await?;
        if need_header {
            f.write_all(CSV_HEADERS.join(",").as_bytes()).await?;
            f.write_all(b"\n").await?;
        }
        f.write_all(line.as_bytes()).await?;
        f.write_all(b"\n").await?;
        Ok(())
    }
}
