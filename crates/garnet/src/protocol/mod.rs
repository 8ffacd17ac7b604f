//! Wire formats: datagram and message headers, range-compressed ack sets,
//! offline handshake messages, and the shared field helpers they use.

use garnet_binary::{BinaryError, BitReader, BitWriter, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

pub mod connected;
pub mod datagram;
pub mod frame;
pub mod offline;
pub mod range_list;
pub mod reliability_kind;
pub mod sequence;
pub mod wire_message;

pub use datagram::Datagram;
pub use frame::{Frame, SplitHeader};
pub use range_list::RangeList;
pub use reliability_kind::{Priority, Reliability};

/// Bumped on incompatible wire changes; checked during the offline
/// handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Marker distinguishing offline garnet traffic from stray datagrams that
/// happen to land on the port.
pub const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xfe, 0xab, 0x51, 0x47, 0x52, 0x4e, 0x54, 0x9c, 0x63, 0x1d, 0x37, 0x28, 0xe0, 0x75,
    0xb1,
];

/// Largest datagram the transport will ever emit, before IP+UDP overhead.
pub const MAX_MTU: u16 = 1492;
/// Smallest MTU any link must carry; handshake probes never go below it.
pub const MIN_MTU: u16 = 576;
/// IPv4 + UDP header bytes, subtracted when converting a link MTU into a
/// datagram payload budget.
pub const UDP_HEADER_OVERHEAD: u16 = 28;

/// Writes a socket address with a leading version tag.
pub fn write_address(writer: &mut BitWriter, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            writer.write_u8(4);
            writer.write_bytes(&v4.ip().octets());
            writer.write_u16_be(v4.port());
        }
        SocketAddr::V6(v6) => {
            writer.write_u8(6);
            writer.write_u16_be(v6.port());
            writer.write_u32_be(v6.flowinfo());
            writer.write_bytes(&v6.ip().octets());
            writer.write_u32_be(v6.scope_id());
        }
    }
}

/// Reads a socket address written by [`write_address`].
pub fn read_address(reader: &mut BitReader) -> Result<SocketAddr> {
    let version = reader.read_u8()?;
    match version {
        4 => {
            let bytes = reader.read_bytes(4)?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&bytes);
            let port = reader.read_u16_be()?;
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(octets),
                port,
            )))
        }
        6 => {
            let port = reader.read_u16_be()?;
            let flowinfo = reader.read_u32_be()?;
            let bytes = reader.read_bytes(16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes);
            let scope_id = reader.read_u32_be()?;
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            )))
        }
        other => Err(BinaryError::InvalidData(format!(
            "unknown address version: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn address_v4_round_trip() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)), 19132);
        let mut w = BitWriter::new();
        write_address(&mut w, &addr);
        assert_eq!(w.as_slice(), &[4, 192, 168, 1, 100, 0x4a, 0xbc]);

        let mut r = BitReader::new(w.into_bytes());
        assert_eq!(read_address(&mut r).unwrap(), addr);
    }

    #[test]
    fn address_v6_round_trip() {
        let ip = Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 0x42);
        let addr = SocketAddr::V6(SocketAddrV6::new(ip, 19133, 7, 3));
        let mut w = BitWriter::new();
        write_address(&mut w, &addr);
        let mut r = BitReader::new(w.into_bytes());
        assert_eq!(read_address(&mut r).unwrap(), addr);
    }

    #[test]
    fn unknown_address_version_is_rejected() {
        let mut r = BitReader::new(bytes::Bytes::from_static(&[9, 0, 0]));
        assert!(read_address(&mut r).is_err());
    }
}
