//! # burst_hub
//!
//! Sensor ingest — receives hit-bundle datagrams from the target node via
//! UDP, parses them into typed bursts, runs the pipeline, and feeds accepted
//! events into the bounded dispatcher queue.
//!
//! ## Architecture
//! Runs as its own Tokio task alongside the dispatcher and the HTTP layer.
//! It owns the `Pipeline` (classifier EMA, cooldown stamp) outright; the
//! only cross-task traffic is the single `try_send` per accepted hit.
//!
//! ## Invariants
//! - A malformed datagram never crashes the loop: drop, count, continue
//! - A full queue drops the newest burst, never blocks the socket
//! - Bind failure is a startup error and propagates; everything after
//!   startup is recoverable

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use impact_types::{BurstParseError, ImpactBurst};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::pipeline::{HitEvent, Pipeline, PipelineCounters};

/// Bind the ingest socket. Failing here is fatal at startup.
pub async fn bind(host: &str, port: u16) -> Result<UdpSocket> {
    let addr = format!("{host}:{port}");
    let socket = UdpSocket::bind(&addr)
        .await
        .with_context(|| format!("binding sensor UDP socket on {addr}"))?;
    info!("📡 Burst hub listening on UDP {addr}");
    Ok(socket)
}

/// Main ingest loop. Exits only on shutdown signal.
pub async fn run(
    socket: UdpSocket,
    mut pipeline: Pipeline,
    tx: mpsc::Sender<HitEvent>,
    counters: Arc<PipelineCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Burst hub shutting down");
                return;
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, src) = match recv {
                    Ok(r) => r,
                    Err(e) => {
                        // transient socket errors never kill the loop
                        warn!("Burst hub: UDP recv error: {e}");
                        continue;
                    }
                };
                counters.received.fetch_add(1, Ordering::Relaxed);

                let burst = match ImpactBurst::parse(&buf[..len]) {
                    Ok(b) => b,
                    Err(e) => {
                        let counter = match &e {
                            BurstParseError::Json(_) => &counters.parse_errors,
                            BurstParseError::TypeMismatch(_) => &counters.type_mismatch,
                            BurstParseError::MissingChannels { .. }
                            | BurstParseError::NegativeMagnitude { .. } => {
                                &counters.invalid_shape
                            }
                        };
                        counter.fetch_add(1, Ordering::Relaxed);
                        debug!("Dropped datagram from {src}: {e}");
                        continue;
                    }
                };

                if let Some(event) = pipeline.process(&burst).await {
                    match tx.try_send(event) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            counters.queue_overflow.fetch_add(1, Ordering::Relaxed);
                            warn!("Dispatcher queue full, dropping newest burst");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            info!("Dispatcher gone, burst hub exiting");
                            return;
                        }
                    }
                }
            }
        }
    }
}
