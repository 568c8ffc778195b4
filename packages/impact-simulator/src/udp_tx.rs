//! udp_tx.rs — UDP transmitter for synthetic hit bundles.
//!
//! Sends one datagram per burst to the backend's sensor port, exactly the
//! way the node firmware does. Send errors are logged but never crash the
//! simulator.

use std::net::UdpSocket;

use tracing::{debug, warn};

pub struct UdpTransmitter {
    socket: UdpSocket,
    target: String,
}

impl UdpTransmitter {
    pub fn new(target: &str) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket,
            target: target.to_string(),
        })
    }

    pub fn send_bundle(&self, bundle: &serde_json::Value) {
        let payload = bundle.to_string();
        match self.socket.send_to(payload.as_bytes(), &self.target) {
            Ok(n) => debug!("Sent {n} bytes to {}", self.target),
            Err(e) => warn!("UDP send to {} failed: {e}", self.target),
        }
    }
}
