//! Control messages that travel as frames inside data datagrams once a
//! connection exists: the connected handshake tail, and the ping exchange
//! that feeds RTT and clock-differential tracking.

use crate::guid::Guid;
use crate::message_id::MessageId;
use crate::protocol::wire_message::wire_message;
use crate::protocol::{read_address, write_address};
use garnet_binary::{BinaryError, BitReader, BitWriter, Result};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedPing {
    pub time_ms: u32,
}

impl ConnectedPing {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u32_le(self.time_ms);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            time_ms: reader.read_u32_le()?,
        })
    }
}
wire_message!(ConnectedPing, MessageId::ConnectedPing);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedPong {
    /// Echo of the ping's timestamp.
    pub ping_time_ms: u32,
    /// The responder's clock when the pong left.
    pub pong_time_ms: u32,
}

impl ConnectedPong {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u32_le(self.ping_time_ms);
        writer.write_u32_le(self.pong_time_ms);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            ping_time_ms: reader.read_u32_le()?,
            pong_time_ms: reader.read_u32_le()?,
        })
    }
}
wire_message!(ConnectedPong, MessageId::ConnectedPong);

/// First reliable message a client sends once the offline handshake
/// finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub guid: Guid,
    pub time_ms: u32,
}

impl ConnectionRequest {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u64_be(self.guid.0);
        writer.write_u32_le(self.time_ms);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            guid: Guid(reader.read_u64_be()?),
            time_ms: reader.read_u32_le()?,
        })
    }
}
wire_message!(ConnectionRequest, MessageId::ConnectionRequest);

/// The server's acceptance. Tells the client its own external address,
/// which slot it landed in, and both timestamps for the initial RTT and
/// clock-differential sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequestAccepted {
    pub client_address: SocketAddr,
    pub system_index: u16,
    pub request_time_ms: u32,
    pub reply_time_ms: u32,
}

impl ConnectionRequestAccepted {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        write_address(writer, &self.client_address);
        writer.write_u16_be(self.system_index);
        writer.write_u32_le(self.request_time_ms);
        writer.write_u32_le(self.reply_time_ms);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            client_address: read_address(reader)?,
            system_index: reader.read_u16_be()?,
            request_time_ms: reader.read_u32_le()?,
            reply_time_ms: reader.read_u32_le()?,
        })
    }
}
wire_message!(
    ConnectionRequestAccepted,
    MessageId::ConnectionRequestAccepted
);

/// Maximum number of internal addresses a client may announce. The NAT
/// punchthrough facilitator forwards these to the other side of an
/// attempt.
pub const MAX_INTERNAL_ADDRESSES: usize = 8;

/// The client's confirmation that the connection is live, carrying the
/// server address it connected to and its locally bound addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncomingConnection {
    pub server_address: SocketAddr,
    pub internal_addresses: Vec<SocketAddr>,
    pub request_time_ms: u32,
    pub reply_time_ms: u32,
}

impl NewIncomingConnection {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        write_address(writer, &self.server_address);
        let count: u8 = self
            .internal_addresses
            .len()
            .min(MAX_INTERNAL_ADDRESSES)
            .try_into()
            .unwrap_or(MAX_INTERNAL_ADDRESSES as u8);
        writer.write_u8(count);
        for addr in self.internal_addresses.iter().take(count as usize) {
            write_address(writer, addr);
        }
        writer.write_u32_le(self.request_time_ms);
        writer.write_u32_le(self.reply_time_ms);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        let server_address = read_address(reader)?;
        let count = reader.read_u8()? as usize;
        if count > MAX_INTERNAL_ADDRESSES {
            return Err(BinaryError::InvalidData(format!(
                "{count} internal addresses announced"
            )));
        }
        let mut internal_addresses = Vec::with_capacity(count);
        for _ in 0..count {
            internal_addresses.push(read_address(reader)?);
        }
        Ok(Self {
            server_address,
            internal_addresses,
            request_time_ms: reader.read_u32_le()?,
            reply_time_ms: reader.read_u32_le()?,
        })
    }
}
wire_message!(NewIncomingConnection, MessageId::NewIncomingConnection);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_message::WireMessage;

    #[test]
    fn ping_pong_round_trip() {
        let ping = ConnectedPing { time_ms: 42 };
        assert_eq!(ConnectedPing::deserialize(ping.serialize()).unwrap(), ping);

        let pong = ConnectedPong {
            ping_time_ms: 42,
            pong_time_ms: 99,
        };
        assert_eq!(ConnectedPong::deserialize(pong.serialize()).unwrap(), pong);
    }

    #[test]
    fn connection_request_round_trip() {
        let req = ConnectionRequest {
            guid: Guid(0x1122),
            time_ms: 7,
        };
        assert_eq!(
            ConnectionRequest::deserialize(req.serialize()).unwrap(),
            req
        );
    }

    #[test]
    fn acceptance_and_confirmation_round_trip() {
        let accepted = ConnectionRequestAccepted {
            client_address: "203.0.113.9:54321".parse().unwrap(),
            system_index: 3,
            request_time_ms: 100,
            reply_time_ms: 150,
        };
        assert_eq!(
            ConnectionRequestAccepted::deserialize(accepted.serialize()).unwrap(),
            accepted
        );

        let nic = NewIncomingConnection {
            server_address: "203.0.113.1:7777".parse().unwrap(),
            internal_addresses: vec![
                "192.168.1.4:54321".parse().unwrap(),
                "[::1]:54321".parse().unwrap(),
            ],
            request_time_ms: 150,
            reply_time_ms: 180,
        };
        assert_eq!(
            NewIncomingConnection::deserialize(nic.serialize()).unwrap(),
            nic
        );
    }

    #[test]
    fn oversized_internal_address_count_is_rejected() {
        let mut w = BitWriter::new();
        w.write_u8(MessageId::NewIncomingConnection.into());
        write_address(&mut w, &"1.2.3.4:5".parse().unwrap());
        w.write_u8(200);
        assert!(NewIncomingConnection::deserialize(w.into_bytes()).is_err());
    }
}
