//! Sender-side bookkeeping for reliable messages in flight.
//!
//! The resend list is a doubly linked list over a slot arena, ordered by
//! next retransmission time: the update pass walks the head while entries
//! are due and reinserts them at the tail. The resend ring indexes slots by
//! `reliable_index mod RESEND_RING_LEN`; a collision means 512 reliable
//! messages are already unacknowledged, which stops fresh reliable sends
//! for the tick (backpressure). The datagram history maps each sent
//! datagram number to the message numbers and receipt serials that rode in
//! it, which is what ACK and NAK processing resolve against.

use crate::reliability::outgoing::OutgoingMessage;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// In-flight reliable messages per connection; also the modulus of the
/// resend ring.
pub const RESEND_RING_LEN: usize = 512;
/// Sent datagrams remembered for ack resolution.
pub const DATAGRAM_HISTORY_LEN: usize = 512;

#[derive(Debug)]
pub struct ResendEntry {
    pub msg: OutgoingMessage,
    pub reliable_index: u32,
    pub next_action_time: Instant,
    pub times_sent: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct ResendList {
    arena: Vec<Option<ResendEntry>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    ring: Vec<Option<usize>>,
    len: usize,
    /// When the list last transitioned from empty to non-empty; drives the
    /// ack-timeout death check.
    nonempty_since: Option<Instant>,
}

impl ResendList {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            ring: vec![None; RESEND_RING_LEN],
            len: 0,
            nonempty_since: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn nonempty_since(&self) -> Option<Instant> {
        self.nonempty_since
    }

    #[inline]
    fn ring_slot(reliable_index: u32) -> usize {
        reliable_index as usize % RESEND_RING_LEN
    }

    /// Whether a fresh reliable message with this index may be sent.
    pub fn is_slot_free(&self, reliable_index: u32) -> bool {
        self.ring[Self::ring_slot(reliable_index)].is_none()
    }

    /// Inserts a just-sent message at the tail. The caller must have
    /// checked [`Self::is_slot_free`].
    pub fn insert(&mut self, msg: OutgoingMessage, next_action_time: Instant, now: Instant) {
        let reliable_index = msg.reliable_index.unwrap_or(0);
        debug_assert!(self.is_slot_free(reliable_index));
        let entry = ResendEntry {
            msg,
            reliable_index,
            next_action_time,
            times_sent: 1,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = Some(entry);
                slot
            }
            None => {
                self.arena.push(Some(entry));
                self.arena.len() - 1
            }
        };
        self.ring[Self::ring_slot(reliable_index)] = Some(slot);
        self.link_tail(slot);
        if self.len == 0 {
            self.nonempty_since = Some(now);
        }
        self.len += 1;
    }

    fn link_tail(&mut self, slot: usize) {
        if let Some(tail) = self.tail {
            self.arena[tail].as_mut().unwrap().next = Some(slot);
            self.arena[slot].as_mut().unwrap().prev = Some(tail);
        } else {
            self.head = Some(slot);
        }
        self.tail = Some(slot);
    }

    fn link_head(&mut self, slot: usize) {
        if let Some(head) = self.head {
            self.arena[head].as_mut().unwrap().prev = Some(slot);
            self.arena[slot].as_mut().unwrap().next = Some(head);
        } else {
            self.tail = Some(slot);
        }
        self.head = Some(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let entry = self.arena[slot].as_ref().unwrap();
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.arena[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.arena[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
        let entry = self.arena[slot].as_mut().unwrap();
        entry.prev = None;
        entry.next = None;
    }

    /// Unlinks and returns the head slot if its retransmission is due.
    /// The entry stays in the arena; update it via [`Self::entry_mut`] and
    /// put it back with [`Self::reinsert_tail`].
    pub fn pop_due(&mut self, now: Instant) -> Option<usize> {
        let head = self.head?;
        if self.arena[head].as_ref().unwrap().next_action_time > now {
            return None;
        }
        self.unlink(head);
        Some(head)
    }

    pub fn entry_mut(&mut self, slot: usize) -> &mut ResendEntry {
        self.arena[slot].as_mut().unwrap()
    }

    pub fn entry(&self, slot: usize) -> &ResendEntry {
        self.arena[slot].as_ref().unwrap()
    }

    /// Reattaches a slot previously taken with [`Self::pop_due`].
    pub fn reinsert_tail(&mut self, slot: usize) {
        self.link_tail(slot);
    }

    /// Removes an acknowledged message. Returns `None` for duplicate acks.
    pub fn remove(&mut self, reliable_index: u32) -> Option<OutgoingMessage> {
        let ring_slot = Self::ring_slot(reliable_index);
        let slot = self.ring[ring_slot]?;
        if self.arena[slot].as_ref().unwrap().reliable_index != reliable_index {
            return None;
        }
        self.unlink(slot);
        self.ring[ring_slot] = None;
        let entry = self.arena[slot].take().unwrap();
        self.free.push(slot);
        self.len -= 1;
        if self.len == 0 {
            self.nonempty_since = None;
        }
        Some(entry.msg)
    }

    /// NAK handling: make the message due immediately and move it to the
    /// head so the next retransmission pass recovers it first.
    pub fn make_due(&mut self, reliable_index: u32, now: Instant) -> bool {
        let slot = match self.ring[Self::ring_slot(reliable_index)] {
            Some(slot) if self.arena[slot].as_ref().unwrap().reliable_index == reliable_index => {
                slot
            }
            _ => return false,
        };
        self.unlink(slot);
        self.arena[slot].as_mut().unwrap().next_action_time = now;
        self.link_head(slot);
        true
    }
}

/// What rode in one sent datagram.
#[derive(Debug)]
pub struct DatagramNode {
    /// Reliable message numbers carried.
    pub message_numbers: Vec<u32>,
    /// Receipt serials of unreliable-with-receipt messages carried.
    pub receipt_serials: Vec<u32>,
    pub sent_at: Instant,
    pub bytes: usize,
}

impl DatagramNode {
    pub fn new(sent_at: Instant) -> Self {
        Self {
            message_numbers: Vec::new(),
            receipt_serials: Vec::new(),
            sent_at,
            bytes: 0,
        }
    }
}

/// Bounded map of recently sent datagram numbers to their contents.
pub struct DatagramHistory {
    nodes: HashMap<u32, DatagramNode>,
    order: VecDeque<u32>,
}

impl DatagramHistory {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn record(&mut self, number: u32, node: DatagramNode) {
        self.nodes.insert(number, node);
        self.order.push_back(number);
        while self.order.len() > DATAGRAM_HISTORY_LEN {
            if let Some(old) = self.order.pop_front() {
                self.nodes.remove(&old);
            }
        }
    }

    /// Resolves an acked datagram. The node is removed, which is what
    /// makes duplicate acks idempotent.
    pub fn take(&mut self, number: u32) -> Option<DatagramNode> {
        self.nodes.remove(&number)
    }

    /// Resolves a NAKed datagram without consuming it; the real ack may
    /// still arrive.
    pub fn peek(&self, number: u32) -> Option<&DatagramNode> {
        self.nodes.get(&number)
    }

    /// Forgets the receipt serials of a datagram whose receipts already
    /// resolved, so a late ack cannot surface them a second time.
    pub fn clear_receipts(&mut self, number: u32) {
        if let Some(node) = self.nodes.get_mut(&number) {
            node.receipt_serials.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::reliability_kind::{Priority, Reliability};
    use bytes::Bytes;
    use std::time::Duration;

    fn msg(reliable_index: u32) -> OutgoingMessage {
        OutgoingMessage {
            data: Bytes::from_static(&[0xaa]),
            reliability: Reliability::Reliable,
            priority: Priority::Medium,
            ordering_channel: 0,
            reliable_index: Some(reliable_index),
            sequencing_index: None,
            ordering_index: None,
            split: None,
            receipt_serial: None,
            submitted_at: Instant::now(),
        }
    }

    #[test]
    fn pop_due_walks_the_head_in_time_order() {
        let mut list = ResendList::new();
        let now = Instant::now();
        list.insert(msg(0), now, now);
        list.insert(msg(1), now + Duration::from_secs(60), now);

        let slot = list.pop_due(now).expect("first entry is due");
        assert_eq!(list.entry(slot).reliable_index, 0);
        list.entry_mut(slot).next_action_time = now + Duration::from_secs(1);
        list.reinsert_tail(slot);

        // Head is now the index-1 entry, which is not due.
        assert!(list.pop_due(now).is_none());
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut list = ResendList::new();
        let now = Instant::now();
        list.insert(msg(7), now, now);
        assert!(list.remove(7).is_some());
        assert!(list.remove(7).is_none());
        assert!(list.is_empty());
        assert!(list.nonempty_since().is_none());
    }

    #[test]
    fn ring_slot_collision_reports_busy() {
        let mut list = ResendList::new();
        let now = Instant::now();
        list.insert(msg(3), now, now);
        assert!(!list.is_slot_free(3));
        assert!(!list.is_slot_free(3 + RESEND_RING_LEN as u32));
        assert!(list.is_slot_free(4));
        list.remove(3);
        assert!(list.is_slot_free(3 + RESEND_RING_LEN as u32));
    }

    #[test]
    fn make_due_moves_to_head() {
        let mut list = ResendList::new();
        let now = Instant::now();
        let later = now + Duration::from_secs(9);
        list.insert(msg(0), later, now);
        list.insert(msg(1), later, now);
        assert!(list.pop_due(now).is_none());

        assert!(list.make_due(1, now));
        let slot = list.pop_due(now).expect("naked entry became due");
        assert_eq!(list.entry(slot).reliable_index, 1);
        assert!(!list.make_due(42, now));
    }

    #[test]
    fn arena_slots_are_reused() {
        let mut list = ResendList::new();
        let now = Instant::now();
        for i in 0..16 {
            list.insert(msg(i), now, now);
        }
        for i in 0..16 {
            assert!(list.remove(i).is_some());
        }
        for i in 16..32 {
            list.insert(msg(i), now, now);
        }
        assert_eq!(list.len(), 16);
        // No growth beyond the first 16 allocations.
        assert_eq!(list.arena.len(), 16);
    }

    #[test]
    fn history_caps_its_size_and_acks_are_idempotent() {
        let mut history = DatagramHistory::new();
        let now = Instant::now();
        for n in 0..(DATAGRAM_HISTORY_LEN as u32 + 10) {
            let mut node = DatagramNode::new(now);
            node.message_numbers.push(n);
            history.record(n, node);
        }
        assert!(history.peek(0).is_none(), "oldest entries pruned");
        let newest = DATAGRAM_HISTORY_LEN as u32 + 9;
        assert!(history.peek(newest).is_some());
        assert!(history.take(newest).is_some());
        assert!(history.take(newest).is_none());
    }
}
