//! The per-message header inside a data datagram.

use crate::protocol::reliability_kind::Reliability;
use bytes::Bytes;
use garnet_binary::{BinaryError, BitReader, BitWriter, Result};

/// Fragment bookkeeping carried by every part of a split message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitHeader {
    /// Total number of fragments.
    pub count: u32,
    /// Shared by all fragments of one message.
    pub id: u16,
    /// Zero-based position of this fragment.
    pub index: u32,
}

impl SplitHeader {
    fn encode(&self, writer: &mut BitWriter) {
        writer.write_u32_be(self.count);
        writer.write_u16_be(self.id);
        writer.write_u32_be(self.index);
    }

    fn decode(reader: &mut BitReader) -> Result<Self> {
        let count = reader.read_u32_be()?;
        let id = reader.read_u16_be()?;
        let index = reader.read_u32_be()?;
        Ok(Self { count, id, index })
    }
}

/// One message as it travels inside a data datagram: a 3-bit reliability
/// class, a split flag, the indices the class requires, and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Wire class; receipt variants never appear here.
    pub reliability: Reliability,
    /// Present for reliable classes.
    pub reliable_index: Option<u32>,
    /// Present for sequenced classes.
    pub sequencing_index: Option<u32>,
    /// Present for sequenced and ordered classes.
    pub ordering_index: Option<u32>,
    pub ordering_channel: u8,
    pub split: Option<SplitHeader>,
    pub body: Bytes,
}

impl Frame {
    /// Header bytes for a frame of the given shape.
    pub fn header_len(reliability: Reliability, has_split: bool) -> usize {
        let mut len = 1 + 2; // flags byte + bit length
        if reliability.is_reliable() {
            len += 3;
        }
        if reliability.is_sequenced() {
            len += 3;
        }
        if reliability.is_ordered_or_sequenced() {
            len += 3 + 1;
        }
        if has_split {
            len += 4 + 2 + 4;
        }
        len
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        Self::header_len(self.reliability, self.split.is_some()) + self.body.len()
    }

    pub fn encode(&self, writer: &mut BitWriter) -> Result<()> {
        let wire = self.reliability.wire_class();
        writer.write_bits(wire as u32, 3);
        writer.write_bit(self.split.is_some());
        writer.align();

        let bit_length = self.body.len().checked_mul(8).and_then(|bits| {
            if bits == 0 || bits > u16::MAX as usize {
                None
            } else {
                Some(bits as u16)
            }
        });
        let bit_length = bit_length.ok_or_else(|| {
            BinaryError::InvalidData(format!("frame body of {} bytes unencodable", self.body.len()))
        })?;
        writer.write_u16_le(bit_length);

        if wire.is_reliable() {
            let index = self
                .reliable_index
                .ok_or_else(|| BinaryError::InvalidData("reliable frame without index".into()))?;
            writer.write_u24_le(index);
        }
        writer.align();
        if wire.is_sequenced() {
            let index = self
                .sequencing_index
                .ok_or_else(|| BinaryError::InvalidData("sequenced frame without index".into()))?;
            writer.write_u24_le(index);
        }
        if wire.is_ordered_or_sequenced() {
            let index = self
                .ordering_index
                .ok_or_else(|| BinaryError::InvalidData("ordered frame without index".into()))?;
            writer.write_u24_le(index);
            writer.write_u8(self.ordering_channel);
        }
        if let Some(split) = &self.split {
            split.encode(writer);
        }
        writer.write_bytes(&self.body);
        Ok(())
    }

    /// Decodes one frame. A zero data length terminates parsing (that is
    /// how packet-pair padding at the tail of a datagram is skipped), so
    /// the result is `Ok(None)` rather than an error.
    pub fn decode(reader: &mut BitReader) -> Result<Option<Frame>> {
        let class = reader.read_bits(3)? as u8;
        let has_split = reader.read_bit()?;
        reader.align();

        let reliability = Reliability::from_u8(class)
            .filter(|r| !r.has_ack_receipt())
            .ok_or_else(|| BinaryError::InvalidData(format!("invalid wire reliability {class}")))?;

        let bit_length = reader.read_u16_le()? as usize;
        if bit_length == 0 {
            return Ok(None);
        }
        let byte_length = bit_length.div_ceil(8);

        let reliable_index = if reliability.is_reliable() {
            Some(reader.read_u24_le()?)
        } else {
            None
        };
        reader.align();
        let sequencing_index = if reliability.is_sequenced() {
            Some(reader.read_u24_le()?)
        } else {
            None
        };
        let (ordering_index, ordering_channel) = if reliability.is_ordered_or_sequenced() {
            (Some(reader.read_u24_le()?), reader.read_u8()?)
        } else {
            (None, 0)
        };
        let split = if has_split {
            Some(SplitHeader::decode(reader)?)
        } else {
            None
        };
        let body = reader.read_bytes(byte_length)?;

        Ok(Some(Frame {
            reliability,
            reliable_index,
            sequencing_index,
            ordering_index,
            ordering_channel,
            split,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: &Frame) -> Frame {
        let mut w = BitWriter::new();
        frame.encode(&mut w).unwrap();
        assert_eq!(w.byte_len(), frame.encoded_len());
        let mut r = BitReader::new(w.into_bytes());
        Frame::decode(&mut r).unwrap().expect("frame expected")
    }

    #[test]
    fn reliable_ordered_frame_byte_image() {
        let frame = Frame {
            reliability: Reliability::ReliableOrdered,
            reliable_index: Some(10),
            sequencing_index: None,
            ordering_index: Some(5),
            ordering_channel: 0,
            split: None,
            body: Bytes::from_static(&[0xfe, 0x01, 0x02, 0x03]),
        };
        let mut w = BitWriter::new();
        frame.encode(&mut w).unwrap();
        let expected = [
            0x60, // reliability 3 in the top 3 bits, no split
            0x20, 0x00, // 32 bits, little endian
            0x0a, 0x00, 0x00, // reliable index 10
            0x05, 0x00, 0x00, // ordering index 5
            0x00, // channel 0
            0xfe, 0x01, 0x02, 0x03,
        ];
        assert_eq!(w.as_slice(), &expected);
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn split_reliable_frame_round_trips() {
        let frame = Frame {
            reliability: Reliability::Reliable,
            reliable_index: Some(20),
            sequencing_index: None,
            ordering_index: None,
            ordering_channel: 0,
            split: Some(SplitHeader {
                count: 2,
                id: 1234,
                index: 1,
            }),
            body: Bytes::from_static(&[0xaa, 0xbb, 0xcc]),
        };
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn sequenced_frame_round_trips() {
        let frame = Frame {
            reliability: Reliability::UnreliableSequenced,
            reliable_index: None,
            sequencing_index: Some(77),
            ordering_index: Some(3),
            ordering_channel: 7,
            split: None,
            body: Bytes::from_static(b"state"),
        };
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn receipt_variants_travel_as_their_base_class() {
        let frame = Frame {
            reliability: Reliability::ReliableOrderedWithAckReceipt,
            reliable_index: Some(1),
            sequencing_index: None,
            ordering_index: Some(0),
            ordering_channel: 0,
            split: None,
            body: Bytes::from_static(&[1]),
        };
        let decoded = round_trip(&frame);
        assert_eq!(decoded.reliability, Reliability::ReliableOrdered);
    }

    #[test]
    fn zero_length_terminates_parsing() {
        let mut w = BitWriter::new();
        w.write_bytes(&[0x00, 0x00, 0x00]); // unreliable, zero bit length
        let mut r = BitReader::new(w.into_bytes());
        assert!(Frame::decode(&mut r).unwrap().is_none());
    }

    #[test]
    fn truncated_body_is_an_error() {
        let frame = Frame {
            reliability: Reliability::Unreliable,
            reliable_index: None,
            sequencing_index: None,
            ordering_index: None,
            ordering_channel: 0,
            split: None,
            body: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };
        let mut w = BitWriter::new();
        frame.encode(&mut w).unwrap();
        let bytes = w.into_bytes();
        let mut r = BitReader::new(bytes.slice(..bytes.len() - 2));
        assert!(Frame::decode(&mut r).is_err());
    }

    #[test]
    fn header_len_matches_every_shape() {
        assert_eq!(Frame::header_len(Reliability::Unreliable, false), 3);
        assert_eq!(Frame::header_len(Reliability::Reliable, false), 6);
        assert_eq!(Frame::header_len(Reliability::ReliableOrdered, false), 10);
        assert_eq!(Frame::header_len(Reliability::ReliableSequenced, false), 13);
        assert_eq!(Frame::header_len(Reliability::Reliable, true), 16);
    }
}
