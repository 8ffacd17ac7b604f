//! Fragmentation and reassembly of messages larger than one datagram.
//!
//! The sender keeps a single owned buffer and hands each fragment a
//! `Bytes` view into it, so splitting a 3 MB message costs no copies.
//! The receiver buffers parts per split id until every part arrived;
//! buffers are kept until completion or connection teardown.

use crate::protocol::frame::{Frame, SplitHeader};
use crate::protocol::reliability_kind::Reliability;
use bytes::{Bytes, BytesMut};
use log::warn;
use std::collections::HashMap;
use std::time::Instant;

/// Hard cap on fragments per message (16384 · ~1.3 KB ≈ 20 MB).
pub const MAX_SPLIT_PARTS: u32 = 16_384;
/// Concurrent reassembly channels per connection.
pub const MAX_SPLIT_CHANNELS: usize = 64;

/// Cuts `data` into fragments of at most `max_chunk` bytes, all sharing
/// `split_id`. Each fragment body is a view into the original buffer.
pub fn split_payload(data: &Bytes, max_chunk: usize, split_id: u16) -> Vec<(SplitHeader, Bytes)> {
    debug_assert!(max_chunk > 0);
    let count = data.len().div_ceil(max_chunk) as u32;
    let mut parts = Vec::with_capacity(count as usize);
    for index in 0..count {
        let start = index as usize * max_chunk;
        let end = (start + max_chunk).min(data.len());
        parts.push((
            SplitHeader {
                count,
                id: split_id,
                index,
            },
            data.slice(start..end),
        ));
    }
    parts
}

/// A fully reassembled split message, carrying the ordering metadata of
/// its fragments so it can pass through the ordering gate as one message.
#[derive(Debug)]
pub struct CompletedSplit {
    pub reliability: Reliability,
    pub sequencing_index: Option<u32>,
    pub ordering_index: Option<u32>,
    pub ordering_channel: u8,
    pub data: Bytes,
}

/// Outcome of inserting one fragment.
#[derive(Debug)]
pub enum SplitInsert {
    /// More parts outstanding, nothing to report.
    Incomplete,
    /// More parts outstanding; surface a download-progress notification.
    Progress {
        received: u32,
        total: u32,
        first_part: Bytes,
    },
    /// All parts arrived.
    Complete(CompletedSplit),
    /// The fragment was invalid or over a limit and was dropped.
    Rejected,
}

struct SplitChannel {
    parts: Vec<Option<Bytes>>,
    received: u32,
    bytes: usize,
    reliability: Reliability,
    sequencing_index: Option<u32>,
    ordering_index: Option<u32>,
    ordering_channel: u8,
    #[allow(dead_code)]
    first_arrival: Instant,
}

pub struct SplitAssembler {
    channels: HashMap<u16, SplitChannel>,
    /// Emit a progress notification every this many received parts;
    /// zero disables them.
    progress_interval: u32,
}

impl SplitAssembler {
    pub fn new(progress_interval: u32) -> Self {
        Self {
            channels: HashMap::new(),
            progress_interval,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn insert(&mut self, frame: &Frame, now: Instant) -> SplitInsert {
        let header = match frame.split {
            Some(header) => header,
            None => return SplitInsert::Rejected,
        };
        if header.count == 0 || header.count > MAX_SPLIT_PARTS || header.index >= header.count {
            warn!(
                "dropping split fragment with bad header {}/{} id {}",
                header.index, header.count, header.id
            );
            return SplitInsert::Rejected;
        }

        let channel = match self.channels.get_mut(&header.id) {
            Some(channel) => {
                if channel.parts.len() != header.count as usize {
                    warn!(
                        "split id {} changed count {} -> {}, dropping channel",
                        header.id,
                        channel.parts.len(),
                        header.count
                    );
                    self.channels.remove(&header.id);
                    return SplitInsert::Rejected;
                }
                channel
            }
            None => {
                if self.channels.len() >= MAX_SPLIT_CHANNELS {
                    warn!(
                        "{} concurrent split channels, dropping new id {}",
                        self.channels.len(),
                        header.id
                    );
                    return SplitInsert::Rejected;
                }
                self.channels.entry(header.id).or_insert(SplitChannel {
                    parts: vec![None; header.count as usize],
                    received: 0,
                    bytes: 0,
                    reliability: frame.reliability,
                    sequencing_index: frame.sequencing_index,
                    ordering_index: frame.ordering_index,
                    ordering_channel: frame.ordering_channel,
                    first_arrival: now,
                })
            }
        };

        let received = {
            let slot = &mut channel.parts[header.index as usize];
            if slot.is_some() {
                return SplitInsert::Incomplete; // duplicate part
            }
            *slot = Some(frame.body.clone());
            channel.received += 1;
            channel.bytes += frame.body.len();
            channel.received
        };

        if received == header.count {
            let channel = self.channels.remove(&header.id).unwrap();
            let mut data = BytesMut::with_capacity(channel.bytes);
            for part in channel.parts {
                data.extend_from_slice(&part.unwrap());
            }
            return SplitInsert::Complete(CompletedSplit {
                reliability: channel.reliability,
                sequencing_index: channel.sequencing_index,
                ordering_index: channel.ordering_index,
                ordering_channel: channel.ordering_channel,
                data: data.freeze(),
            });
        }

        if self.progress_interval > 0 && received % self.progress_interval == 0 {
            if let Some(channel) = self.channels.get(&header.id) {
                if let Some(first_part) = channel.parts[0].clone() {
                    return SplitInsert::Progress {
                        received,
                        total: header.count,
                        first_part,
                    };
                }
            }
        }
        SplitInsert::Incomplete
    }

    /// Connection teardown frees every pending channel.
    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(header: SplitHeader, body: &[u8]) -> Frame {
        Frame {
            reliability: Reliability::Reliable,
            reliable_index: Some(0),
            sequencing_index: None,
            ordering_index: None,
            ordering_channel: 0,
            split: Some(header),
            body: Bytes::copy_from_slice(body),
        }
    }

    #[test]
    fn split_views_share_the_source_buffer() {
        let data = Bytes::from((0u8..=99).collect::<Vec<u8>>());
        let parts = split_payload(&data, 30, 7);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].1.len(), 30);
        assert_eq!(parts[3].1.len(), 10);
        for (i, (header, _)) in parts.iter().enumerate() {
            assert_eq!(header.index, i as u32);
            assert_eq!(header.count, 4);
            assert_eq!(header.id, 7);
        }
        // Views, not copies.
        assert_eq!(parts[1].1.as_ptr(), unsafe { data.as_ptr().add(30) });
    }

    #[test]
    fn reassembly_reproduces_the_original_bytes() {
        let original: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let data = Bytes::from(original.clone());
        let parts = split_payload(&data, 300, 1);

        let mut assembler = SplitAssembler::new(0);
        let now = Instant::now();
        // Deliver out of order.
        for &i in &[2usize, 0, 3, 1] {
            let frame = fragment(parts[i].0, &parts[i].1);
            match assembler.insert(&frame, now) {
                SplitInsert::Complete(done) => {
                    assert_eq!(i, 1, "completes on the last part");
                    assert_eq!(&done.data[..], &original[..]);
                    return;
                }
                SplitInsert::Incomplete => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        panic!("never completed");
    }

    #[test]
    fn progress_is_reported_at_the_configured_interval() {
        let data = Bytes::from(vec![9u8; 500]);
        let parts = split_payload(&data, 100, 2);
        let mut assembler = SplitAssembler::new(1);
        let now = Instant::now();

        let mut progress_seen = 0;
        for (header, body) in &parts[..4] {
            match assembler.insert(&fragment(*header, body), now) {
                SplitInsert::Progress {
                    received,
                    total,
                    first_part,
                } => {
                    progress_seen += 1;
                    assert_eq!(total, 5);
                    assert!(received < total);
                    assert_eq!(first_part.len(), 100);
                }
                SplitInsert::Incomplete => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(progress_seen >= 1);
        match assembler.insert(&fragment(parts[4].0, &parts[4].1), now) {
            SplitInsert::Complete(done) => assert_eq!(done.data.len(), 500),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(assembler.channel_count(), 0);
    }

    #[test]
    fn duplicate_parts_are_ignored() {
        let data = Bytes::from(vec![1u8; 200]);
        let parts = split_payload(&data, 100, 3);
        let mut assembler = SplitAssembler::new(0);
        let now = Instant::now();
        assert!(matches!(
            assembler.insert(&fragment(parts[0].0, &parts[0].1), now),
            SplitInsert::Incomplete
        ));
        assert!(matches!(
            assembler.insert(&fragment(parts[0].0, &parts[0].1), now),
            SplitInsert::Incomplete
        ));
        assert!(matches!(
            assembler.insert(&fragment(parts[1].0, &parts[1].1), now),
            SplitInsert::Complete(_)
        ));
    }

    #[test]
    fn invalid_headers_are_rejected() {
        let mut assembler = SplitAssembler::new(0);
        let now = Instant::now();
        let bad_index = SplitHeader {
            count: 2,
            id: 1,
            index: 2,
        };
        assert!(matches!(
            assembler.insert(&fragment(bad_index, b"x"), now),
            SplitInsert::Rejected
        ));
        let zero_count = SplitHeader {
            count: 0,
            id: 1,
            index: 0,
        };
        assert!(matches!(
            assembler.insert(&fragment(zero_count, b"x"), now),
            SplitInsert::Rejected
        ));
    }

    #[test]
    fn channel_limit_is_enforced() {
        let mut assembler = SplitAssembler::new(0);
        let now = Instant::now();
        for id in 0..MAX_SPLIT_CHANNELS as u16 {
            let header = SplitHeader {
                count: 2,
                id,
                index: 0,
            };
            assert!(matches!(
                assembler.insert(&fragment(header, b"a"), now),
                SplitInsert::Incomplete
            ));
        }
        let overflow = SplitHeader {
            count: 2,
            id: MAX_SPLIT_CHANNELS as u16,
            index: 0,
        };
        assert!(matches!(
            assembler.insert(&fragment(overflow, b"a"), now),
            SplitInsert::Rejected
        ));
    }
}
