use num_enum::{IntoPrimitive, TryFromPrimitive};

/// How a message may be delivered. The `*WithAckReceipt` variants behave
/// like their base class on the wire; the receipt is sender-side
/// bookkeeping that surfaces [`crate::MessageId::SndReceiptAcked`] or
/// [`crate::MessageId::SndReceiptLoss`] locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Reliability {
    #[default]
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableWithAckReceipt = 5,
    ReliableWithAckReceipt = 6,
    ReliableOrderedWithAckReceipt = 7,
}

impl Reliability {
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::try_from(value).ok()
    }

    /// Whether a reliable message number is assigned and the message is
    /// retransmitted until acknowledged.
    #[inline]
    pub const fn is_reliable(&self) -> bool {
        matches!(
            self,
            Reliability::Reliable
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
                | Reliability::ReliableWithAckReceipt
                | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    #[inline]
    pub const fn is_ordered(&self) -> bool {
        matches!(
            self,
            Reliability::ReliableOrdered | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    #[inline]
    pub const fn is_sequenced(&self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced | Reliability::ReliableSequenced
        )
    }

    #[inline]
    pub const fn is_ordered_or_sequenced(&self) -> bool {
        self.is_ordered() || self.is_sequenced()
    }

    #[inline]
    pub const fn has_ack_receipt(&self) -> bool {
        matches!(
            self,
            Reliability::UnreliableWithAckReceipt
                | Reliability::ReliableWithAckReceipt
                | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    /// The class written into the 3-bit wire field. Receipts never travel.
    #[inline]
    pub const fn wire_class(&self) -> Reliability {
        match self {
            Reliability::UnreliableWithAckReceipt => Reliability::Unreliable,
            Reliability::ReliableWithAckReceipt => Reliability::Reliable,
            Reliability::ReliableOrderedWithAckReceipt => Reliability::ReliableOrdered,
            other => *other,
        }
    }
}

/// Drain order of the outgoing message heap. Lower values drain first,
/// and the weight formula services `Immediate` far more often than `Low`
/// without ever starving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Priority {
    Immediate = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

/// Number of distinct priority levels.
pub const PRIORITY_COUNT: usize = 4;

/// Independent ordering/sequencing streams per connection.
pub const ORDERING_CHANNEL_COUNT: usize = 32;

impl Priority {
    /// Clamps an arbitrary byte into a valid priority.
    #[inline]
    pub fn clamped(value: u8) -> Priority {
        Priority::try_from(value.min(Priority::Low as u8)).unwrap_or(Priority::Low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matrix() {
        use Reliability::*;
        for r in [
            Unreliable,
            UnreliableSequenced,
            Reliable,
            ReliableOrdered,
            ReliableSequenced,
            UnreliableWithAckReceipt,
            ReliableWithAckReceipt,
            ReliableOrderedWithAckReceipt,
        ] {
            assert_eq!(r.is_reliable(), r.wire_class().is_reliable());
            assert!(!r.wire_class().has_ack_receipt());
        }
        assert!(ReliableSequenced.is_sequenced() && ReliableSequenced.is_reliable());
        assert!(UnreliableSequenced.is_sequenced() && !UnreliableSequenced.is_reliable());
        assert!(ReliableOrdered.is_ordered());
        assert!(UnreliableWithAckReceipt.has_ack_receipt());
    }

    #[test]
    fn priority_clamps_out_of_range_values() {
        assert_eq!(Priority::clamped(0), Priority::Immediate);
        assert_eq!(Priority::clamped(3), Priority::Low);
        assert_eq!(Priority::clamped(200), Priority::Low);
    }
}
