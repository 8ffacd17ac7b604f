//! The on-wire datagram: either an ACK, a NAK, or a numbered carrier of
//! one or more frames.

use crate::protocol::frame::Frame;
use crate::protocol::range_list::RangeList;
use bytes::Bytes;
use garnet_binary::{BinaryError, BitReader, BitWriter, Result};

/// Header of a data datagram. Exactly [`DataHeader::LEN`] bytes once the
/// leading flag bits are padded to the byte boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Second datagram of a packet pair, padded to its predecessor's size;
    /// the receiver's arrival-time delta estimates bottleneck bandwidth.
    pub is_packet_pair: bool,
    /// The sender had more queued data when this datagram went out.
    pub is_continuous_send: bool,
    /// The sender wants an arrival-rate sample on the next ACK.
    pub needs_b_and_as: bool,
    /// Low 32 bits of the sender's monotonic clock in milliseconds.
    pub source_time_ms: u32,
    /// 24-bit wrapping datagram sequence number.
    pub number: u32,
}

impl DataHeader {
    /// Flags byte + 4-byte timestamp + 3-byte number.
    pub const LEN: usize = 8;

    pub fn encode(&self, writer: &mut BitWriter) {
        writer.write_bit(true); // valid
        writer.write_bit(false); // not an ack
        writer.write_bit(false); // not a nak
        writer.write_bit(self.is_packet_pair);
        writer.write_bit(self.is_continuous_send);
        writer.write_bit(self.needs_b_and_as);
        writer.align();
        writer.write_u32_le(self.source_time_ms);
        writer.write_u24_le(self.number);
    }
}

/// A parsed datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Ack {
        source_time_ms: u32,
        /// The remote's arrival-rate estimate in bytes per second, present
        /// when the acked datagram requested it.
        arrival_rate: Option<f32>,
        ranges: RangeList,
    },
    Nak {
        ranges: RangeList,
    },
    Data {
        header: DataHeader,
        frames: Vec<Frame>,
    },
}

/// Writes an ACK datagram, draining as many pending ranges as fit within
/// `max_bytes`. Returns the number of ranges written.
pub fn encode_ack(
    writer: &mut BitWriter,
    source_time_ms: u32,
    arrival_rate: Option<f32>,
    ranges: &mut RangeList,
    max_bytes: usize,
) -> usize {
    writer.write_bit(true); // valid
    writer.write_bit(true); // ack
    writer.write_bit(arrival_rate.is_some());
    writer.align();
    writer.write_u32_le(source_time_ms);
    let mut header_len = 1 + 4;
    if let Some(rate) = arrival_rate {
        writer.write_f32_le(rate);
        header_len += 4;
    }
    ranges.serialize_and_drain(writer, max_bytes.saturating_sub(header_len))
}

/// Writes a NAK datagram, draining as many pending ranges as fit within
/// `max_bytes`. Returns the number of ranges written.
pub fn encode_nak(writer: &mut BitWriter, ranges: &mut RangeList, max_bytes: usize) -> usize {
    writer.write_bit(true); // valid
    writer.write_bit(false); // not an ack
    writer.write_bit(true); // nak
    ranges.serialize_and_drain(writer, max_bytes.saturating_sub(1))
}

impl Datagram {
    pub fn decode(data: Bytes) -> Result<Datagram> {
        let mut reader = BitReader::new(data);
        if !reader.read_bit()? {
            return Err(BinaryError::InvalidData("valid bit not set".into()));
        }
        if reader.read_bit()? {
            // ACK branch.
            let has_b_and_as = reader.read_bit()?;
            reader.align();
            let source_time_ms = reader.read_u32_le()?;
            let arrival_rate = if has_b_and_as {
                Some(reader.read_f32_le()?)
            } else {
                None
            };
            let ranges = RangeList::deserialize(&mut reader)?;
            return Ok(Datagram::Ack {
                source_time_ms,
                arrival_rate,
                ranges,
            });
        }
        if reader.read_bit()? {
            // NAK branch; the range list follows the flag bits unaligned.
            let ranges = RangeList::deserialize(&mut reader)?;
            return Ok(Datagram::Nak { ranges });
        }

        let is_packet_pair = reader.read_bit()?;
        let is_continuous_send = reader.read_bit()?;
        let needs_b_and_as = reader.read_bit()?;
        reader.align();
        let source_time_ms = reader.read_u32_le()?;
        let number = reader.read_u24_le()?;
        let header = DataHeader {
            is_packet_pair,
            is_continuous_send,
            needs_b_and_as,
            source_time_ms,
            number,
        };

        let mut frames = Vec::new();
        while reader.remaining_bytes() >= 3 {
            match Frame::decode(&mut reader)? {
                Some(frame) => frames.push(frame),
                None => break, // padding
            }
        }
        Ok(Datagram::Data { header, frames })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::reliability_kind::Reliability;

    fn sample_frame() -> Frame {
        Frame {
            reliability: Reliability::Reliable,
            reliable_index: Some(42),
            sequencing_index: None,
            ordering_index: None,
            ordering_channel: 0,
            split: None,
            body: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn data_header_byte_image() {
        let header = DataHeader {
            is_packet_pair: false,
            is_continuous_send: true,
            needs_b_and_as: false,
            source_time_ms: 0x0102_0304,
            number: 7,
        };
        let mut w = BitWriter::new();
        header.encode(&mut w);
        // valid=1 ack=0 nak=0 pair=0 continuous=1 needs=0 -> 1000_0100
        assert_eq!(
            w.as_slice(),
            &[0x84, 0x04, 0x03, 0x02, 0x01, 0x07, 0x00, 0x00]
        );
        assert_eq!(w.byte_len(), DataHeader::LEN);
    }

    #[test]
    fn data_datagram_round_trips_every_flag_combination() {
        for bits in 0u8..8 {
            let header = DataHeader {
                is_packet_pair: bits & 1 != 0,
                is_continuous_send: bits & 2 != 0,
                needs_b_and_as: bits & 4 != 0,
                source_time_ms: 123_456,
                number: 0x00ab_cdef & 0x00ff_ffff,
            };
            let frame = sample_frame();
            let mut w = BitWriter::new();
            header.encode(&mut w);
            frame.encode(&mut w).unwrap();

            match Datagram::decode(w.into_bytes()).unwrap() {
                Datagram::Data {
                    header: decoded,
                    frames,
                } => {
                    assert_eq!(decoded, header);
                    assert_eq!(frames, vec![frame]);
                }
                other => panic!("expected data datagram, got {other:?}"),
            }
        }
    }

    #[test]
    fn trailing_padding_is_skipped() {
        let header = DataHeader {
            is_packet_pair: true,
            is_continuous_send: false,
            needs_b_and_as: false,
            source_time_ms: 1,
            number: 2,
        };
        let mut w = BitWriter::new();
        header.encode(&mut w);
        sample_frame().encode(&mut w).unwrap();
        w.write_bytes(&[0u8; 40]); // packet-pair padding

        match Datagram::decode(w.into_bytes()).unwrap() {
            Datagram::Data { frames, .. } => assert_eq!(frames.len(), 1),
            other => panic!("expected data datagram, got {other:?}"),
        }
    }

    #[test]
    fn ack_round_trips_with_and_without_rate_sample() {
        for rate in [None, Some(125_000.0f32)] {
            let mut pending = RangeList::new();
            for seq in [3u32, 4, 5, 9] {
                pending.insert(seq);
            }
            let expected = pending.clone();

            let mut w = BitWriter::new();
            let written = encode_ack(&mut w, 777, rate, &mut pending, 1400);
            assert_eq!(written, 2);
            assert!(pending.is_empty());

            match Datagram::decode(w.into_bytes()).unwrap() {
                Datagram::Ack {
                    source_time_ms,
                    arrival_rate,
                    ranges,
                } => {
                    assert_eq!(source_time_ms, 777);
                    assert_eq!(arrival_rate, rate);
                    assert_eq!(ranges, expected);
                }
                other => panic!("expected ack, got {other:?}"),
            }
        }
    }

    #[test]
    fn nak_round_trips() {
        let mut pending = RangeList::new();
        pending.insert(11);
        pending.insert(12);
        let expected = pending.clone();

        let mut w = BitWriter::new();
        encode_nak(&mut w, &mut pending, 1400);
        match Datagram::decode(w.into_bytes()).unwrap() {
            Datagram::Nak { ranges } => assert_eq!(ranges, expected),
            other => panic!("expected nak, got {other:?}"),
        }
    }

    #[test]
    fn missing_valid_bit_is_rejected() {
        assert!(Datagram::decode(Bytes::from_static(&[0x00, 0x01, 0x02])).is_err());
    }
}
