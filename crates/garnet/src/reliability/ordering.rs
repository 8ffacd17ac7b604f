//! Receiver-side ordering and sequencing channels.
//!
//! Each of the 32 channels gates delivery independently. Ordered messages
//! are delivered in strictly increasing ordering-index order with no gaps;
//! early arrivals wait in a per-channel min-heap. Sequenced messages are
//! delivered only while newest-so-far within the current ordering slot and
//! are otherwise dropped.

use crate::protocol::sequence;
use bytes::Bytes;
use log::warn;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

/// Early arrivals buffered per channel before the connection is killed by
/// other bounds; a safety valve, not the primary backpressure.
const MAX_HELD: usize = 1024;

struct Held {
    weight: u64,
    sequenced: bool,
    ordering_index: u32,
    sequencing_index: u32,
    data: Bytes,
}

impl Held {
    fn weight(ordering_index: u32, sequencing_index: u32) -> u64 {
        ((ordering_index as u64) << 20) + sequencing_index as u64
    }
}

impl PartialEq for Held {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight
    }
}
impl Eq for Held {}
impl PartialOrd for Held {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Held {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: the std max-heap then pops the smallest weight first.
        other.weight.cmp(&self.weight)
    }
}

pub struct OrderingChannel {
    /// Next ordering index to deliver.
    read_index: u32,
    /// Highest sequencing index delivered within the current slot.
    highest_sequenced: Option<u32>,
    held: BinaryHeap<Held>,
}

impl Default for OrderingChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderingChannel {
    pub fn new() -> Self {
        Self {
            read_index: 0,
            highest_sequenced: None,
            held: BinaryHeap::new(),
        }
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Handles an arriving ordered message, appending everything now
    /// deliverable to `out`.
    pub fn on_ordered(&mut self, ordering_index: u32, data: Bytes, out: &mut Vec<Bytes>) {
        if ordering_index == self.read_index {
            out.push(data);
            self.advance();
            self.drain(out);
        } else if sequence::greater(ordering_index, self.read_index) {
            self.hold(false, ordering_index, 0, data);
        }
        // Else: an old slot; the reliable dedup already saw this message
        // once, drop it.
    }

    /// Handles an arriving sequenced message.
    pub fn on_sequenced(
        &mut self,
        ordering_index: u32,
        sequencing_index: u32,
        data: Bytes,
        out: &mut Vec<Bytes>,
    ) {
        if ordering_index == self.read_index {
            if self.newest(sequencing_index) {
                self.highest_sequenced = Some(sequencing_index);
                out.push(data);
            }
        } else if sequence::greater(ordering_index, self.read_index) {
            self.hold(true, ordering_index, sequencing_index, data);
        }
    }

    fn newest(&self, sequencing_index: u32) -> bool {
        match self.highest_sequenced {
            Some(highest) => sequence::greater(sequencing_index, highest),
            None => true,
        }
    }

    fn advance(&mut self) {
        self.read_index = sequence::add(self.read_index, 1);
        self.highest_sequenced = None;
    }

    fn hold(&mut self, sequenced: bool, ordering_index: u32, sequencing_index: u32, data: Bytes) {
        if self.held.len() >= MAX_HELD {
            warn!(
                "ordering channel held {} messages, dropping index {}",
                self.held.len(),
                ordering_index
            );
            return;
        }
        self.held.push(Held {
            weight: Held::weight(ordering_index, sequencing_index),
            sequenced,
            ordering_index,
            sequencing_index,
            data,
        });
    }

    fn drain(&mut self, out: &mut Vec<Bytes>) {
        while let Some(top) = self.held.peek() {
            if top.ordering_index == self.read_index {
                let held = self.held.pop().unwrap();
                if held.sequenced {
                    if self.newest(held.sequencing_index) {
                        self.highest_sequenced = Some(held.sequencing_index);
                        out.push(held.data);
                    }
                } else {
                    out.push(held.data);
                    self.advance();
                }
            } else if sequence::less(top.ordering_index, self.read_index) {
                // Superseded while waiting.
                self.held.pop();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: u8) -> Bytes {
        Bytes::copy_from_slice(&[tag])
    }

    fn tags(out: &[Bytes]) -> Vec<u8> {
        out.iter().map(|b| b[0]).collect()
    }

    #[test]
    fn ordered_messages_deliver_in_index_order() {
        let mut ch = OrderingChannel::new();
        let mut out = Vec::new();
        ch.on_ordered(1, payload(1), &mut out);
        ch.on_ordered(2, payload(2), &mut out);
        assert!(out.is_empty());
        ch.on_ordered(0, payload(0), &mut out);
        assert_eq!(tags(&out), vec![0, 1, 2]);
    }

    #[test]
    fn duplicate_or_old_ordered_messages_are_dropped() {
        let mut ch = OrderingChannel::new();
        let mut out = Vec::new();
        ch.on_ordered(0, payload(0), &mut out);
        ch.on_ordered(0, payload(9), &mut out);
        assert_eq!(tags(&out), vec![0]);
    }

    #[test]
    fn sequenced_messages_only_move_forward() {
        let mut ch = OrderingChannel::new();
        let mut out = Vec::new();
        ch.on_sequenced(0, 5, payload(5), &mut out);
        ch.on_sequenced(0, 3, payload(3), &mut out); // stale
        ch.on_sequenced(0, 9, payload(9), &mut out);
        assert_eq!(tags(&out), vec![5, 9]);
    }

    #[test]
    fn an_ordered_delivery_resets_the_sequenced_horizon() {
        let mut ch = OrderingChannel::new();
        let mut out = Vec::new();
        ch.on_sequenced(0, 9, payload(9), &mut out);
        ch.on_ordered(0, payload(0), &mut out);
        // New slot: sequencing restarts.
        ch.on_sequenced(1, 1, payload(1), &mut out);
        assert_eq!(tags(&out), vec![9, 0, 1]);
    }

    #[test]
    fn sequenced_from_a_future_slot_waits_and_may_be_superseded() {
        let mut ch = OrderingChannel::new();
        let mut out = Vec::new();
        // Slot 1 is not open yet.
        ch.on_sequenced(1, 4, payload(4), &mut out);
        assert!(out.is_empty());
        // Opening slot 1 via the ordered message at slot 0 delivers the
        // ordered message first; the buffered sequenced message for slot 1
        // then comes out of the heap.
        ch.on_ordered(0, payload(0), &mut out);
        assert_eq!(tags(&out), vec![0, 4]);
    }

    #[test]
    fn buffered_sequenced_behind_a_buffered_ordered_is_superseded() {
        let mut ch = OrderingChannel::new();
        let mut out = Vec::new();
        // Both arrive early for slot 1; the ordered message sorts first
        // (lower weight), advances the slot, and the sequenced message is
        // then stale and dropped.
        ch.on_ordered(1, payload(1), &mut out);
        ch.on_sequenced(1, 7, payload(7), &mut out);
        assert!(out.is_empty());
        ch.on_ordered(0, payload(0), &mut out);
        assert_eq!(tags(&out), vec![0, 1]);
    }

    #[test]
    fn read_index_wraps() {
        let mut ch = OrderingChannel::new();
        ch.read_index = sequence::MASK;
        let mut out = Vec::new();
        ch.on_ordered(0, payload(1), &mut out); // early by one
        ch.on_ordered(sequence::MASK, payload(0), &mut out);
        assert_eq!(tags(&out), vec![0, 1]);
    }
}
