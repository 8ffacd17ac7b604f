//! Offline (unconnected) messages: the four-message connection handshake,
//! server browsing pings, and the out-of-band envelope plugins use to talk
//! to systems they are not connected to.
//!
//! Every offline message carries [`OFFLINE_MAGIC`] so stray datagrams are
//! cheaply rejected.

use crate::guid::Guid;
use crate::message_id::MessageId;
use crate::protocol::wire_message::wire_message;
use crate::protocol::{OFFLINE_MAGIC, read_address, write_address};
use bytes::Bytes;
use garnet_binary::{BinaryError, BitReader, BitWriter, Result};

fn write_magic(writer: &mut BitWriter) {
    writer.write_bytes(&OFFLINE_MAGIC);
}

fn read_magic(reader: &mut BitReader) -> Result<()> {
    let bytes = reader.read_bytes(OFFLINE_MAGIC.len())?;
    if bytes[..] != OFFLINE_MAGIC {
        return Err(BinaryError::InvalidData("bad offline magic".into()));
    }
    Ok(())
}

/// Server browsing probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPing {
    pub time_ms: u64,
    pub guid: Guid,
}

impl UnconnectedPing {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u64_be(self.time_ms);
        write_magic(writer);
        writer.write_u64_be(self.guid.0);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        let time_ms = reader.read_u64_be()?;
        read_magic(reader)?;
        let guid = Guid(reader.read_u64_be()?);
        Ok(Self { time_ms, guid })
    }
}
wire_message!(UnconnectedPing, MessageId::UnconnectedPing);

/// Reply to [`UnconnectedPing`], carrying the application's advertisement
/// blob (server name, player counts, whatever the game wants browsers to
/// see).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPong {
    pub time_ms: u64,
    pub guid: Guid,
    pub advertisement: Bytes,
}

impl UnconnectedPong {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u64_be(self.time_ms);
        writer.write_u64_be(self.guid.0);
        write_magic(writer);
        let len: u16 = self
            .advertisement
            .len()
            .try_into()
            .map_err(|_| BinaryError::InvalidData("advertisement too large".into()))?;
        writer.write_u16_be(len);
        writer.write_bytes(&self.advertisement);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        let time_ms = reader.read_u64_be()?;
        let guid = Guid(reader.read_u64_be()?);
        read_magic(reader)?;
        let len = reader.read_u16_be()? as usize;
        let advertisement = reader.read_bytes(len)?;
        Ok(Self {
            time_ms,
            guid,
            advertisement,
        })
    }
}
wire_message!(UnconnectedPong, MessageId::UnconnectedPong);

/// First handshake message. The body is padded with zeros so the whole
/// datagram probes whether a candidate MTU survives the path; the largest
/// surviving probe wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequest1 {
    pub protocol_version: u8,
    /// Zero padding after the fixed fields, sized so the datagram matches
    /// the candidate MTU minus IP+UDP overhead.
    pub padding_len: u16,
}

impl OpenConnectionRequest1 {
    /// Fixed bytes before the padding: id + magic + version.
    pub const BASE_LEN: usize = 1 + OFFLINE_MAGIC.len() + 1;

    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        write_magic(writer);
        writer.write_u8(self.protocol_version);
        writer.write_bytes(&vec![0u8; self.padding_len as usize]);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        read_magic(reader)?;
        let protocol_version = reader.read_u8()?;
        let padding_len = reader.remaining_bytes() as u16;
        Ok(Self {
            protocol_version,
            padding_len,
        })
    }

    /// The MTU this probe represents, as seen by whoever received it.
    pub fn probed_mtu(&self) -> u16 {
        Self::BASE_LEN as u16 + self.padding_len + crate::protocol::UDP_HEADER_OVERHEAD
    }
}
wire_message!(OpenConnectionRequest1, MessageId::OpenConnectionRequest1);

/// Confirms the largest MTU probe that arrived intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReply1 {
    pub guid: Guid,
    pub mtu: u16,
}

impl OpenConnectionReply1 {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        write_magic(writer);
        writer.write_u64_be(self.guid.0);
        writer.write_u16_be(self.mtu);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        read_magic(reader)?;
        let guid = Guid(reader.read_u64_be()?);
        let mtu = reader.read_u16_be()?;
        Ok(Self { guid, mtu })
    }
}
wire_message!(OpenConnectionReply1, MessageId::OpenConnectionReply1);

/// Second handshake request: the client commits to an MTU and presents its
/// GUID and the server address it believes it is talking to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequest2 {
    pub server_address: std::net::SocketAddr,
    pub mtu: u16,
    pub guid: Guid,
}

impl OpenConnectionRequest2 {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        write_magic(writer);
        write_address(writer, &self.server_address);
        writer.write_u16_be(self.mtu);
        writer.write_u64_be(self.guid.0);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        read_magic(reader)?;
        let server_address = read_address(reader)?;
        let mtu = reader.read_u16_be()?;
        let guid = Guid(reader.read_u64_be()?);
        Ok(Self {
            server_address,
            mtu,
            guid,
        })
    }
}
wire_message!(OpenConnectionRequest2, MessageId::OpenConnectionRequest2);

/// Accepts the connection envelope: the server's GUID, the client's
/// external address as the server sees it, and the agreed MTU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReply2 {
    pub guid: Guid,
    pub client_address: std::net::SocketAddr,
    pub mtu: u16,
}

impl OpenConnectionReply2 {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        write_magic(writer);
        writer.write_u64_be(self.guid.0);
        write_address(writer, &self.client_address);
        writer.write_u16_be(self.mtu);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        read_magic(reader)?;
        let guid = Guid(reader.read_u64_be()?);
        let client_address = read_address(reader)?;
        let mtu = reader.read_u16_be()?;
        Ok(Self {
            guid,
            client_address,
            mtu,
        })
    }
}
wire_message!(OpenConnectionReply2, MessageId::OpenConnectionReply2);

macro_rules! guid_only_message {
    ($(#[$doc:meta])* $ty:ident, $id:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $ty {
            pub guid: Guid,
        }

        impl $ty {
            pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
                write_magic(writer);
                writer.write_u64_be(self.guid.0);
                Ok(())
            }

            pub fn decode(reader: &mut BitReader) -> Result<Self> {
                read_magic(reader)?;
                let guid = Guid(reader.read_u64_be()?);
                Ok(Self { guid })
            }
        }
        wire_message!($ty, $id);
    };
}

guid_only_message!(
    /// The server refuses because the sender's address is banned.
    ConnectionBanned,
    MessageId::ConnectionBanned
);
guid_only_message!(
    /// The server has no free incoming connection slots.
    NoFreeIncomingConnections,
    MessageId::NoFreeIncomingConnections
);
guid_only_message!(
    /// A handshake arrived for a system that is already connected.
    AlreadyConnected,
    MessageId::AlreadyConnected
);

/// Refusal carrying the version the server actually speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncompatibleProtocolVersion {
    pub server_protocol: u8,
    pub guid: Guid,
}

impl IncompatibleProtocolVersion {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u8(self.server_protocol);
        write_magic(writer);
        writer.write_u64_be(self.guid.0);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        let server_protocol = reader.read_u8()?;
        read_magic(reader)?;
        let guid = Guid(reader.read_u64_be()?);
        Ok(Self {
            server_protocol,
            guid,
        })
    }
}
wire_message!(
    IncompatibleProtocolVersion,
    MessageId::IncompatibleProtocolVersion
);

/// Envelope for plugin traffic to systems we are not connected to; the
/// punchthrough establish pings travel in these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfBandInternal {
    pub guid: Guid,
    pub payload: Bytes,
}

impl OutOfBandInternal {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        write_magic(writer);
        writer.write_u64_be(self.guid.0);
        writer.write_bytes(&self.payload);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        read_magic(reader)?;
        let guid = Guid(reader.read_u64_be()?);
        let payload = reader.read_bytes(reader.remaining_bytes())?;
        Ok(Self { guid, payload })
    }
}
wire_message!(OutOfBandInternal, MessageId::OutOfBandInternal);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_message::WireMessage;
    use std::net::SocketAddr;

    #[test]
    fn ping_pong_round_trip() {
        let ping = UnconnectedPing {
            time_ms: 123_456_789,
            guid: Guid(0xdead_beef),
        };
        assert_eq!(
            UnconnectedPing::deserialize(ping.serialize()).unwrap(),
            ping
        );

        let pong = UnconnectedPong {
            time_ms: 123_456_789,
            guid: Guid(0xdead_beef),
            advertisement: Bytes::from_static(b"garnet;demo;0/8"),
        };
        assert_eq!(
            UnconnectedPong::deserialize(pong.serialize()).unwrap(),
            pong
        );
    }

    #[test]
    fn request1_padding_probes_the_mtu() {
        let req = OpenConnectionRequest1 {
            protocol_version: crate::protocol::PROTOCOL_VERSION,
            padding_len: 1000,
        };
        let bytes = req.serialize();
        assert_eq!(bytes.len(), OpenConnectionRequest1::BASE_LEN + 1000);
        let decoded = OpenConnectionRequest1::deserialize(bytes).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(
            decoded.probed_mtu(),
            (OpenConnectionRequest1::BASE_LEN + 1000) as u16
                + crate::protocol::UDP_HEADER_OVERHEAD
        );
    }

    #[test]
    fn handshake_round_trips() {
        let addr: SocketAddr = "10.0.0.1:7777".parse().unwrap();
        let r1 = OpenConnectionReply1 {
            guid: Guid(5),
            mtu: 1400,
        };
        assert_eq!(
            OpenConnectionReply1::deserialize(r1.serialize()).unwrap(),
            r1
        );

        let q2 = OpenConnectionRequest2 {
            server_address: addr,
            mtu: 1400,
            guid: Guid(6),
        };
        assert_eq!(
            OpenConnectionRequest2::deserialize(q2.serialize()).unwrap(),
            q2
        );

        let r2 = OpenConnectionReply2 {
            guid: Guid(5),
            client_address: "192.168.0.9:123".parse().unwrap(),
            mtu: 1400,
        };
        assert_eq!(
            OpenConnectionReply2::deserialize(r2.serialize()).unwrap(),
            r2
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let ping = UnconnectedPing {
            time_ms: 1,
            guid: Guid(2),
        };
        let mut bytes = ping.serialize().to_vec();
        bytes[10] ^= 0xff; // inside the magic
        assert!(UnconnectedPing::deserialize(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn out_of_band_envelope_round_trips() {
        let oob = OutOfBandInternal {
            guid: Guid(9),
            payload: Bytes::from_static(&[0x28, 1, 2, 3]),
        };
        assert_eq!(
            OutOfBandInternal::deserialize(oob.serialize()).unwrap(),
            oob
        );
    }
}
