//! main.rs — synthetic burst generator entry point
//!
//! Fires hit bundles at the backend's sensor UDP port, either a fixed
//! impact point or a random scatter, with optional ghost bursts mixed in to
//! exercise the classifier. Stands in for the target node during bench
//! development.

mod synth;
mod udp_tx;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use impact_types::ChannelMap;
use rand::Rng;
use tokio::time::interval;
use tracing::info;

use synth::SynthConfig;
use udp_tx::UdpTransmitter;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "impact-sim", about = "Quiver synthetic burst generator")]
struct Args {
    /// Backend sensor UDP address
    #[arg(long, default_value = "127.0.0.1:5005")]
    target: String,
    /// Impact x, cm from center (omit for random scatter)
    #[arg(long)]
    x_cm: Option<f64>,
    /// Impact y, cm from center (omit for random scatter)
    #[arg(long)]
    y_cm: Option<f64>,
    /// Bursts per minute
    #[arg(long, default_value = "12.0")]
    rate: f64,
    /// Stop after this many bursts (0 = run forever)
    #[arg(long, default_value = "0")]
    count: u64,
    /// Fraction of bursts sent as diffuse ghosts
    #[arg(long, default_value = "0.2")]
    ghost_ratio: f64,
    /// Omit the peak_tdoa_us map (energy-only localization)
    #[arg(long)]
    no_tdoa: bool,
    /// Node identifier reported in bundles
    #[arg(long, default_value = "sim-node")]
    node: String,
    /// Channel map spec (letter i = channel i's compass direction)
    #[arg(long, default_value = "NWSE")]
    channel_map: String,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "impact_simulator=info".into()),
        )
        .init();

    let args = Args::parse();
    let map = ChannelMap::parse(&args.channel_map)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("parsing --channel-map")?;
    let tx = UdpTransmitter::new(&args.target).context("binding send socket")?;

    let period = Duration::from_secs_f64(60.0 / args.rate.max(0.1));
    info!(
        "🏹 impact-sim → {} every {:.1}s ({} mode)",
        args.target,
        period.as_secs_f64(),
        if args.x_cm.is_some() { "fixed-point" } else { "scatter" },
    );

    let mut ticker = interval(period);
    let mut rng = rand::thread_rng();
    let mut seq: u64 = 0;

    loop {
        ticker.tick().await;
        seq += 1;

        let bundle = if rng.gen_bool(args.ghost_ratio.clamp(0.0, 1.0)) {
            info!("seq {seq}: ghost burst");
            synth::ghost_bundle(&args.node, seq, now_ms(), &mut rng)
        } else {
            // fixed point, or a scatter biased toward the middle rings
            let (x_cm, y_cm) = match (args.x_cm, args.y_cm) {
                (Some(x), Some(y)) => (x, y),
                _ => (rng.gen_range(-30.0..30.0), rng.gen_range(-30.0..30.0)),
            };
            let cfg = SynthConfig {
                x_cm,
                y_cm,
                with_tdoa: !args.no_tdoa,
                ..Default::default()
            };
            info!("seq {seq}: impact at ({x_cm:.1}, {y_cm:.1}) cm");
            synth::hit_bundle(&cfg, &map, &args.node, seq, now_ms(), &mut rng)
        };

        tx.send_bundle(&bundle);

        if args.count > 0 && seq >= args.count {
            info!("Sent {seq} bursts, done");
            return Ok(());
        }
    }
}
