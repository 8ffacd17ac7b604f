//! The outgoing message queue: a min-weight heap that drains high
//! priorities first without ever starving low ones, plus the auxiliary
//! index that lets stale unreliable messages be culled cheaply.

use crate::protocol::frame::{Frame, SplitHeader};
use crate::protocol::reliability_kind::{PRIORITY_COUNT, Priority, Reliability};
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// A message between submission and its last wire placement.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub reliability: Reliability,
    pub priority: Priority,
    pub ordering_channel: u8,
    /// Assigned when the message first goes on the wire, reliable classes
    /// only.
    pub reliable_index: Option<u32>,
    pub sequencing_index: Option<u32>,
    pub ordering_index: Option<u32>,
    pub split: Option<SplitHeader>,
    /// User token echoed back through the receipt packets.
    pub receipt_serial: Option<u32>,
    pub submitted_at: Instant,
}

impl OutgoingMessage {
    /// Encoded size of this message's frame.
    pub fn frame_len(&self) -> usize {
        Frame::header_len(self.reliability.wire_class(), self.split.is_some()) + self.data.len()
    }

    pub fn to_frame(&self) -> Frame {
        Frame {
            reliability: self.reliability,
            reliable_index: self.reliable_index,
            sequencing_index: self.sequencing_index,
            ordering_index: self.ordering_index,
            ordering_channel: self.ordering_channel,
            split: self.split,
            body: self.data.clone(),
        }
    }
}

/// Weight added to a priority's counter every time it dequeues. Smaller
/// bumps mean more frequent service; the formula biases heavily toward
/// high priorities while guaranteeing every level keeps draining.
const fn weight_bump(priority: usize) -> u64 {
    (1u64 << priority) * (priority as u64 + 1) + priority as u64
}

struct HeapEntry {
    weight: u64,
    submit_id: u64,
    msg: OutgoingMessage,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight && self.submit_id == other.submit_id
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the std max-heap pops the smallest weight; ties go to
        // the earliest submission (FIFO within a priority).
        (other.weight, other.submit_id).cmp(&(self.weight, self.submit_id))
    }
}

/// A message handed out by [`SendQueue::pop`]. Holding the original weight
/// lets the caller requeue it in place when backpressure stops the send.
pub struct PoppedMessage {
    weight: u64,
    submit_id: u64,
    pub msg: OutgoingMessage,
}

pub struct SendQueue {
    heap: BinaryHeap<HeapEntry>,
    next_weights: [u64; PRIORITY_COUNT],
    next_submit_id: u64,
    /// Submission order of unreliable messages: (submitted, id, receipt
    /// serial, frame length). Only maintained when a cull timeout is
    /// configured.
    unreliable_index: VecDeque<(Instant, u64, Option<u32>, usize)>,
    track_unreliable: bool,
    /// Ids culled from the index; the heap drops them lazily on pop.
    culled: HashSet<u64>,
    /// Ids of unreliable messages that left the queue normally.
    sent_unreliable: HashSet<u64>,
    queued_bytes: usize,
}

impl SendQueue {
    pub fn new(track_unreliable: bool) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_weights: Self::initial_weights(),
            next_submit_id: 0,
            unreliable_index: VecDeque::new(),
            track_unreliable,
            culled: HashSet::new(),
            sent_unreliable: HashSet::new(),
            queued_bytes: 0,
        }
    }

    fn initial_weights() -> [u64; PRIORITY_COUNT] {
        [weight_bump(0), weight_bump(1), weight_bump(2), weight_bump(3)]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.heap.len() - self.culled.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn push(&mut self, msg: OutgoingMessage) {
        let priority = msg.priority as usize;
        let weight = self.next_weights[priority];
        let submit_id = self.next_submit_id;
        self.next_submit_id += 1;

        if self.track_unreliable && !msg.reliability.is_reliable() {
            self.unreliable_index.push_back((
                msg.submitted_at,
                submit_id,
                msg.receipt_serial,
                msg.frame_len(),
            ));
        }
        self.queued_bytes += msg.frame_len();
        self.heap.push(HeapEntry {
            weight,
            submit_id,
            msg,
        });
    }

    /// Pops the lowest-weight live message and bumps its priority's next
    /// weight.
    pub fn pop(&mut self) -> Option<PoppedMessage> {
        loop {
            let entry = self.heap.pop()?;
            if self.culled.remove(&entry.submit_id) {
                continue;
            }
            let priority = entry.msg.priority as usize;
            self.next_weights[priority] += weight_bump(priority);
            if self.heap.is_empty() {
                self.next_weights = Self::initial_weights();
            }
            self.queued_bytes -= entry.msg.frame_len();
            if self.track_unreliable && !entry.msg.reliability.is_reliable() {
                self.sent_unreliable.insert(entry.submit_id);
            }
            return Some(PoppedMessage {
                weight: entry.weight,
                submit_id: entry.submit_id,
                msg: entry.msg,
            });
        }
    }

    /// Puts a popped message back at its original position.
    pub fn requeue(&mut self, popped: PoppedMessage) {
        self.queued_bytes += popped.msg.frame_len();
        if self.track_unreliable && !popped.msg.reliability.is_reliable() {
            self.sent_unreliable.remove(&popped.submit_id);
        }
        self.heap.push(HeapEntry {
            weight: popped.weight,
            submit_id: popped.submit_id,
            msg: popped.msg,
        });
    }

    /// Drops unreliable messages older than `timeout`, returning the
    /// receipt serials of any receipt-bearing casualties. Cost is linear in
    /// the number culled.
    pub fn cull_unreliable(&mut self, now: Instant, timeout: Duration) -> Vec<u32> {
        let mut lost = Vec::new();
        while let Some(&(submitted, id, serial, len)) = self.unreliable_index.front() {
            if now.duration_since(submitted) < timeout {
                break;
            }
            self.unreliable_index.pop_front();
            if self.sent_unreliable.remove(&id) {
                continue; // already left the queue
            }
            self.culled.insert(id);
            self.queued_bytes -= len;
            if let Some(serial) = serial {
                lost.push(serial);
            }
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(priority: Priority, reliability: Reliability, tag: u8) -> OutgoingMessage {
        OutgoingMessage {
            data: Bytes::copy_from_slice(&[tag]),
            reliability,
            priority,
            ordering_channel: 0,
            reliable_index: None,
            sequencing_index: None,
            ordering_index: None,
            split: None,
            receipt_serial: None,
            submitted_at: Instant::now(),
        }
    }

    fn tag_of(popped: &PoppedMessage) -> u8 {
        popped.msg.data[0]
    }

    #[test]
    fn fifo_within_a_priority() {
        let mut q = SendQueue::new(false);
        for tag in 0..5 {
            q.push(msg(Priority::Medium, Reliability::Reliable, tag));
        }
        for tag in 0..5 {
            assert_eq!(tag_of(&q.pop().unwrap()), tag);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn high_priority_drains_more_often_but_low_is_not_starved() {
        let mut q = SendQueue::new(false);
        // Interleave submissions so weights, not submission order, decide.
        for tag in 0..40 {
            let p = if tag % 2 == 0 {
                Priority::High
            } else {
                Priority::Low
            };
            q.push(msg(p, Reliability::Reliable, tag));
        }
        let mut first_ten = Vec::new();
        for _ in 0..10 {
            let popped = q.pop().unwrap();
            first_ten.push(popped.msg.priority);
        }
        let high = first_ten.iter().filter(|p| **p == Priority::High).count();
        assert!(high >= 7, "high priority should dominate, got {high}/10");

        // Drain fully; every low message must eventually come out.
        let mut low_seen = 10 - high;
        while let Some(p) = q.pop() {
            if p.msg.priority == Priority::Low {
                low_seen += 1;
            }
        }
        assert_eq!(low_seen, 20);
    }

    #[test]
    fn requeue_preserves_position() {
        let mut q = SendQueue::new(false);
        q.push(msg(Priority::Medium, Reliability::Reliable, 1));
        q.push(msg(Priority::Medium, Reliability::Reliable, 2));
        let first = q.pop().unwrap();
        assert_eq!(tag_of(&first), 1);
        q.requeue(first);
        assert_eq!(tag_of(&q.pop().unwrap()), 1);
        assert_eq!(tag_of(&q.pop().unwrap()), 2);
    }

    #[test]
    fn cull_drops_only_stale_unreliable_messages() {
        let mut q = SendQueue::new(true);
        let old = Instant::now() - Duration::from_secs(5);
        let mut stale = msg(Priority::Medium, Reliability::Unreliable, 1);
        stale.submitted_at = old;
        stale.receipt_serial = Some(77);
        q.push(stale);
        q.push(msg(Priority::Medium, Reliability::Reliable, 2));
        q.push(msg(Priority::Medium, Reliability::Unreliable, 3));

        let lost = q.cull_unreliable(Instant::now(), Duration::from_secs(1));
        assert_eq!(lost, vec![77]);
        assert_eq!(q.len(), 2);
        assert_eq!(tag_of(&q.pop().unwrap()), 2);
        assert_eq!(tag_of(&q.pop().unwrap()), 3);
        assert!(q.pop().is_none());
    }

    #[test]
    fn cull_ignores_messages_that_already_went_out() {
        let mut q = SendQueue::new(true);
        let mut m = msg(Priority::Medium, Reliability::UnreliableWithAckReceipt, 1);
        m.submitted_at = Instant::now() - Duration::from_secs(5);
        m.receipt_serial = Some(9);
        q.push(m);
        let _ = q.pop().unwrap(); // went out normally
        let lost = q.cull_unreliable(Instant::now(), Duration::from_secs(1));
        assert!(lost.is_empty());
    }

    #[test]
    fn queued_bytes_tracks_push_pop_and_cull() {
        let mut q = SendQueue::new(true);
        assert_eq!(q.queued_bytes(), 0);
        q.push(msg(Priority::Medium, Reliability::Reliable, 1));
        let after_push = q.queued_bytes();
        assert!(after_push > 0);
        let p = q.pop().unwrap();
        assert_eq!(q.queued_bytes(), 0);
        q.requeue(p);
        assert_eq!(q.queued_bytes(), after_push);
    }
}
