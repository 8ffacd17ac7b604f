use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Wire message identifiers. The first byte of every offline datagram and
/// of every framed message payload is one of these; application traffic
/// starts at [`MessageId::UserPacket`].
///
/// Offline identifiers stay below 0x80 so the high bit of a datagram's
/// first byte cleanly separates offline messages from connected datagrams
/// (whose headers always lead with the valid bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageId {
    // Connected control traffic.
    ConnectedPing = 0x00,
    ConnectedPong = 0x01,
    ConnectionRequest = 0x02,
    ConnectionRequestAccepted = 0x03,
    NewIncomingConnection = 0x04,
    DisconnectionNotification = 0x05,
    ConnectionLost = 0x06,
    ConnectionAttemptFailed = 0x07,
    AlreadyConnected = 0x08,
    Timestamp = 0x09,
    DownloadProgress = 0x0a,
    SndReceiptAcked = 0x0b,
    SndReceiptLoss = 0x0c,

    // Offline (unconnected) traffic.
    UnconnectedPing = 0x10,
    UnconnectedPong = 0x11,
    OpenConnectionRequest1 = 0x12,
    OpenConnectionReply1 = 0x13,
    OpenConnectionRequest2 = 0x14,
    OpenConnectionReply2 = 0x15,
    IncompatibleProtocolVersion = 0x16,
    ConnectionBanned = 0x17,
    InvalidPassword = 0x18,
    NoFreeIncomingConnections = 0x19,
    OutOfBandInternal = 0x1a,

    // NAT punchthrough.
    NatPunchthroughRequest = 0x20,
    NatGetMostRecentPort = 0x21,
    NatConnectAtTime = 0x22,
    NatClientReady = 0x23,
    NatTargetNotConnected = 0x24,
    NatTargetUnresponsive = 0x25,
    NatConnectionToTargetLost = 0x26,
    NatAlreadyInProgress = 0x27,
    NatEstablishUnidirectional = 0x28,
    NatEstablishBidirectional = 0x29,
    NatPunchthroughSucceeded = 0x2a,
    NatPunchthroughFailed = 0x2b,
    NatRequestBoundAddresses = 0x2c,
    NatRespondBoundAddresses = 0x2d,
    NatPortProbe = 0x2e,
    NatPortProbeReply = 0x2f,

    // NAT type detection.
    NatTypeDetectionRequest = 0x30,
    NatTypeDetectionTest = 0x31,
    NatTypeDetectionResult = 0x32,

    /// First identifier available to applications.
    UserPacket = 0x40,
}

impl MessageId {
    /// Reads the identifier from the first byte of a payload.
    pub fn of(data: &[u8]) -> Option<MessageId> {
        data.first().and_then(|&b| MessageId::try_from(b).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_ids_leave_the_high_bit_clear() {
        for raw in 0x00u8..=0x7f {
            if let Ok(id) = MessageId::try_from(raw) {
                assert_eq!(u8::from(id) & 0x80, 0, "{id:?}");
            }
        }
    }

    #[test]
    fn of_reads_first_byte() {
        assert_eq!(
            MessageId::of(&[0x02, 0xff]),
            Some(MessageId::ConnectionRequest)
        );
        assert_eq!(MessageId::of(&[]), None);
        assert_eq!(MessageId::of(&[0xfe]), None);
    }
}
