//! NAT traversal: the punchthrough coordination protocol (client and
//! facilitator roles) and the four-socket NAT type detection probe
//! protocol, plus the wire messages both sides exchange.

pub mod detect_client;
pub mod detect_server;
pub mod punch_client;
pub mod punch_server;

use crate::guid::Guid;
use crate::message_id::MessageId;
use crate::protocol::wire_message::wire_message;
use crate::protocol::{read_address, write_address};
use garnet_binary::{BinaryError, BitReader, BitWriter, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::SocketAddr;

/// Classification produced by NAT type detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum NatType {
    /// No NAT: datagrams to a never-used port arrive.
    Open = 0,
    /// Accepts from any source once the client sent anything anywhere.
    FullCone = 1,
    /// Accepts from any port of an address the client has sent to.
    AddressRestricted = 2,
    /// Accepts only from address+port pairs the client has sent to.
    PortRestricted = 3,
    /// Every outbound flow gets a fresh external port.
    Symmetric = 4,
    Unknown = 5,
    InProgress = 6,
}

impl NatType {
    /// Whether punchthrough to a port-restricted peer is expected to work.
    pub fn supports_punchthrough(&self) -> bool {
        matches!(
            self,
            NatType::Open | NatType::FullCone | NatType::AddressRestricted | NatType::PortRestricted
        )
    }
}

// ---------------------------------------------------------------------
// Punchthrough messages (travel over the facilitator connection unless
// noted otherwise)
// ---------------------------------------------------------------------

/// Client asks the facilitator to open a path to `target_guid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchthroughRequest {
    pub target_guid: Guid,
}

impl PunchthroughRequest {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u64_be(self.target_guid.0);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            target_guid: Guid(reader.read_u64_be()?),
        })
    }
}
wire_message!(PunchthroughRequest, MessageId::NatPunchthroughRequest);

/// Facilitator asks for the client's freshest external port (`port` zero);
/// the client echoes it back filled in, biased by its port stride when
/// known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetMostRecentPort {
    pub session_id: u16,
    pub port: u16,
}

impl GetMostRecentPort {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u16_be(self.session_id);
        writer.write_u16_be(self.port);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            session_id: reader.read_u16_be()?,
            port: reader.read_u16_be()?,
        })
    }
}
wire_message!(GetMostRecentPort, MessageId::NatGetMostRecentPort);

/// Facilitator's go signal: both clients start their ping sequences when
/// the facilitator's clock reads `time_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAtTime {
    pub session_id: u16,
    /// Rendezvous instant on the facilitator's wire clock.
    pub time_ms: u32,
    pub target_guid: Guid,
    pub target_public: SocketAddr,
    pub target_internal: Vec<SocketAddr>,
    pub we_are_sender: bool,
}

impl ConnectAtTime {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u16_be(self.session_id);
        writer.write_u32_le(self.time_ms);
        writer.write_u64_be(self.target_guid.0);
        write_address(writer, &self.target_public);
        let count: u8 = self
            .target_internal
            .len()
            .try_into()
            .map_err(|_| BinaryError::InvalidData("too many internal addresses".into()))?;
        writer.write_u8(count);
        for addr in &self.target_internal {
            write_address(writer, addr);
        }
        writer.write_u8(self.we_are_sender as u8);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        let session_id = reader.read_u16_be()?;
        let time_ms = reader.read_u32_le()?;
        let target_guid = Guid(reader.read_u64_be()?);
        let target_public = read_address(reader)?;
        let count = reader.read_u8()? as usize;
        if count > crate::protocol::connected::MAX_INTERNAL_ADDRESSES {
            return Err(BinaryError::InvalidData(format!(
                "{count} internal addresses"
            )));
        }
        let mut target_internal = Vec::with_capacity(count);
        for _ in 0..count {
            target_internal.push(read_address(reader)?);
        }
        let we_are_sender = reader.read_u8()? != 0;
        Ok(Self {
            session_id,
            time_ms,
            target_guid,
            target_public,
            target_internal,
            we_are_sender,
        })
    }
}
wire_message!(ConnectAtTime, MessageId::NatConnectAtTime);

/// Client signals it can take on the next queued punchthrough attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientReady;

impl ClientReady {
    pub fn encode(&self, _writer: &mut BitWriter) -> Result<()> {
        Ok(())
    }

    pub fn decode(_reader: &mut BitReader) -> Result<Self> {
        Ok(Self)
    }
}
wire_message!(ClientReady, MessageId::NatClientReady);

macro_rules! guid_notification {
    ($(#[$doc:meta])* $ty:ident, $id:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $ty {
            pub guid: Guid,
        }

        impl $ty {
            pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
                writer.write_u64_be(self.guid.0);
                Ok(())
            }

            pub fn decode(reader: &mut BitReader) -> Result<Self> {
                Ok(Self {
                    guid: Guid(reader.read_u64_be()?),
                })
            }
        }
        wire_message!($ty, $id);
    };
}

guid_notification!(
    /// The requested target GUID is not connected to the facilitator.
    TargetNotConnected,
    MessageId::NatTargetNotConnected
);
guid_notification!(
    /// The target never answered the most-recent-port query.
    TargetUnresponsive,
    MessageId::NatTargetUnresponsive
);
guid_notification!(
    /// The target dropped off the facilitator mid-attempt.
    ConnectionToTargetLost,
    MessageId::NatConnectionToTargetLost
);
guid_notification!(
    /// An attempt against this target is already running.
    AlreadyInProgress,
    MessageId::NatAlreadyInProgress
);

/// Local result packet pushed on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchthroughSucceeded {
    pub guid: Guid,
    pub we_are_sender: bool,
}

impl PunchthroughSucceeded {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u64_be(self.guid.0);
        writer.write_u8(self.we_are_sender as u8);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            guid: Guid(reader.read_u64_be()?),
            we_are_sender: reader.read_u8()? != 0,
        })
    }
}
wire_message!(PunchthroughSucceeded, MessageId::NatPunchthroughSucceeded);

guid_notification!(
    /// Local result packet pushed when every attempt strategy is spent.
    PunchthroughFailed,
    MessageId::NatPunchthroughFailed
);

/// Out-of-band ping fired at a predicted address; one arriving proves an
/// inbound path exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstablishUnidirectional {
    pub session_id: u16,
}

impl EstablishUnidirectional {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u16_be(self.session_id);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            session_id: reader.read_u16_be()?,
        })
    }
}
wire_message!(
    EstablishUnidirectional,
    MessageId::NatEstablishUnidirectional
);

/// Out-of-band confirmation: the sender has seen traffic from us, so the
/// path works in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstablishBidirectional {
    pub session_id: u16,
}

impl EstablishBidirectional {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u16_be(self.session_id);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            session_id: reader.read_u16_be()?,
        })
    }
}
wire_message!(EstablishBidirectional, MessageId::NatEstablishBidirectional);

// ---------------------------------------------------------------------
// Port stride discovery
// ---------------------------------------------------------------------

/// Client asks the facilitator for its bound addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestBoundAddresses;

impl RequestBoundAddresses {
    pub fn encode(&self, _writer: &mut BitWriter) -> Result<()> {
        Ok(())
    }

    pub fn decode(_reader: &mut BitReader) -> Result<Self> {
        Ok(Self)
    }
}
wire_message!(RequestBoundAddresses, MessageId::NatRequestBoundAddresses);

/// Facilitator's bound addresses: the main peer socket and the alternate
/// probe socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespondBoundAddresses {
    pub primary: SocketAddr,
    pub alternate: SocketAddr,
}

impl RespondBoundAddresses {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        write_address(writer, &self.primary);
        write_address(writer, &self.alternate);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            primary: read_address(reader)?,
            alternate: read_address(reader)?,
        })
    }
}
wire_message!(RespondBoundAddresses, MessageId::NatRespondBoundAddresses);

/// Raw datagram from the client's main socket to the facilitator's
/// alternate socket; the NAT allocates a fresh external port for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortProbe {
    pub guid: Guid,
}

impl PortProbe {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u64_be(self.guid.0);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            guid: Guid(reader.read_u64_be()?),
        })
    }
}
wire_message!(PortProbe, MessageId::NatPortProbe);

/// Facilitator's answer over the connection: the external port of the
/// client's main flow and the one its probe just got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortProbeReply {
    pub first_port: u16,
    pub second_port: u16,
}

impl PortProbeReply {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u16_be(self.first_port);
        writer.write_u16_be(self.second_port);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            first_port: reader.read_u16_be()?,
            second_port: reader.read_u16_be()?,
        })
    }
}
wire_message!(PortProbeReply, MessageId::NatPortProbeReply);

// ---------------------------------------------------------------------
// NAT type detection messages
// ---------------------------------------------------------------------

/// Client kicks off detection, announcing the port of its second socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionRequest {
    pub c2_port: u16,
}

impl DetectionRequest {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u16_be(self.c2_port);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            c2_port: reader.read_u16_be()?,
        })
    }
}
wire_message!(DetectionRequest, MessageId::NatTypeDetectionRequest);

/// Probe step identifiers; also the body of the client's echo.
pub const DETECT_STEP_OPEN: u8 = 0;
pub const DETECT_STEP_FULL_CONE: u8 = 1;
pub const DETECT_STEP_ADDRESS_RESTRICTED: u8 = 2;
pub const DETECT_STEP_PORT_CHECK: u8 = 3;

/// Travels three ways: raw probe from a server socket to the client
/// (steps 0..=2), connected echo back from the client, and, for the port
/// check, a raw datagram from the client's main socket to the server's
/// fourth socket carrying the client's GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionTest {
    pub step: u8,
    /// Set on the port-check datagram so the server can match the flow to
    /// the requesting client.
    pub guid: Guid,
}

impl DetectionTest {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u8(self.step);
        writer.write_u64_be(self.guid.0);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            step: reader.read_u8()?,
            guid: Guid(reader.read_u64_be()?),
        })
    }
}
wire_message!(DetectionTest, MessageId::NatTypeDetectionTest);

/// Server directs the client to fire the port-check datagram at `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionSendToTarget {
    pub target: SocketAddr,
}

impl DetectionSendToTarget {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        write_address(writer, &self.target);
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            target: read_address(reader)?,
        })
    }
}
// Shares the request id; direction disambiguates (server to client only).
wire_message!(DetectionSendToTarget, MessageId::NatTypeDetectionRequest);

/// Final classification, sent over the connection and surfaced locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionResult {
    pub nat_type: NatType,
}

impl DetectionResult {
    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_u8(self.nat_type.into());
        Ok(())
    }

    pub fn decode(reader: &mut BitReader) -> Result<Self> {
        let raw = reader.read_u8()?;
        let nat_type = NatType::try_from(raw)
            .map_err(|_| BinaryError::InvalidData(format!("nat type {raw}")))?;
        Ok(Self { nat_type })
    }
}
wire_message!(DetectionResult, MessageId::NatTypeDetectionResult);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_message::WireMessage;

    #[test]
    fn punchthrough_messages_round_trip() {
        let request = PunchthroughRequest {
            target_guid: Guid(7),
        };
        assert_eq!(
            PunchthroughRequest::deserialize(request.serialize()).unwrap(),
            request
        );

        let port = GetMostRecentPort {
            session_id: 3,
            port: 40111,
        };
        assert_eq!(
            GetMostRecentPort::deserialize(port.serialize()).unwrap(),
            port
        );

        let go = ConnectAtTime {
            session_id: 3,
            time_ms: 123_456,
            target_guid: Guid(9),
            target_public: "203.0.113.7:40111".parse().unwrap(),
            target_internal: vec!["192.168.1.2:40111".parse().unwrap()],
            we_are_sender: true,
        };
        assert_eq!(ConnectAtTime::deserialize(go.serialize()).unwrap(), go);

        let establish = EstablishBidirectional { session_id: 3 };
        assert_eq!(
            EstablishBidirectional::deserialize(establish.serialize()).unwrap(),
            establish
        );
    }

    #[test]
    fn stride_messages_round_trip() {
        let respond = RespondBoundAddresses {
            primary: "203.0.113.1:6000".parse().unwrap(),
            alternate: "203.0.113.1:6001".parse().unwrap(),
        };
        assert_eq!(
            RespondBoundAddresses::deserialize(respond.serialize()).unwrap(),
            respond
        );

        let reply = PortProbeReply {
            first_port: 50_000,
            second_port: 50_002,
        };
        assert_eq!(
            PortProbeReply::deserialize(reply.serialize()).unwrap(),
            reply
        );
    }

    #[test]
    fn detection_messages_round_trip() {
        let request = DetectionRequest { c2_port: 777 };
        assert_eq!(
            DetectionRequest::deserialize(request.serialize()).unwrap(),
            request
        );

        let test = DetectionTest {
            step: DETECT_STEP_PORT_CHECK,
            guid: Guid(5),
        };
        assert_eq!(DetectionTest::deserialize(test.serialize()).unwrap(), test);

        let result = DetectionResult {
            nat_type: NatType::PortRestricted,
        };
        assert_eq!(
            DetectionResult::deserialize(result.serialize()).unwrap(),
            result
        );
    }

    #[test]
    fn punchthrough_support_matrix() {
        assert!(NatType::Open.supports_punchthrough());
        assert!(NatType::PortRestricted.supports_punchthrough());
        assert!(!NatType::Symmetric.supports_punchthrough());
        assert!(!NatType::Unknown.supports_punchthrough());
    }
}
