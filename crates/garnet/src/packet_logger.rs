//! Line-oriented wire logging. Attach a [`PacketLogger`] to see every
//! datagram the peer sends and receives, one line each, through the `log`
//! facade (target `garnet::wire`).

use crate::plugin::Plugin;
use log::info;
use std::net::SocketAddr;

/// First byte of a connected datagram tells the direction of decode.
fn describe(data: &[u8]) -> String {
    match data.first() {
        None => "empty".to_string(),
        Some(&b) if b & 0x80 != 0 => {
            let kind = if b & 0x40 != 0 {
                "ack"
            } else if b & 0x20 != 0 {
                "nak"
            } else {
                "data"
            };
            format!("{} ({} bytes)", kind, data.len())
        }
        Some(&b) => format!("offline id {:#04x} ({} bytes)", b, data.len()),
    }
}

#[derive(Debug, Default)]
pub struct PacketLogger {
    sent: u64,
    received: u64,
}

impl PacketLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Plugin for PacketLogger {
    fn name(&self) -> &'static str {
        "packet-logger"
    }

    fn on_raw_send(&mut self, to: SocketAddr, data: &[u8]) {
        self.sent += 1;
        info!(target: "garnet::wire", "snd #{} {} {}", self.sent, to, describe(data));
    }

    fn on_raw_receive(&mut self, from: SocketAddr, data: &[u8]) {
        self.received += 1;
        info!(target: "garnet::wire", "rcv #{} {} {}", self.received, from, describe(data));
    }

    fn on_malformed_datagram(&mut self, from: SocketAddr) {
        info!(target: "garnet::wire", "bad {} (unparseable datagram)", from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_classifies_headers() {
        assert_eq!(describe(&[]), "empty");
        assert!(describe(&[0x84, 0, 0]).starts_with("data"));
        assert!(describe(&[0xc0, 0, 0]).starts_with("ack"));
        assert!(describe(&[0xa0, 0, 0]).starts_with("nak"));
        assert!(describe(&[0x12, 0, 0]).starts_with("offline id 0x12"));
    }
}
