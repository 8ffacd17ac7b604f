//! The per-remote-system reliability engine.
//!
//! One [`ReliabilityLayer`] exists per connection. It is synchronous and
//! single-threaded: the peer's update task drives [`ReliabilityLayer::update`]
//! every tick and feeds arriving datagrams into
//! [`ReliabilityLayer::handle_datagram`]. Everything it emits, whether
//! user messages, download progress or ack receipts, comes out of
//! [`ReliabilityLayer::receive`] as id-prefixed payloads.

mod ordering;
mod outgoing;
mod resend;
mod split;

pub use outgoing::OutgoingMessage;
pub use resend::RESEND_RING_LEN;

use crate::congestion::CongestionControl;
use crate::message_id::MessageId;
use crate::protocol::datagram::{self, DataHeader, Datagram};
use crate::protocol::frame::Frame;
use crate::protocol::range_list::RangeList;
use crate::protocol::reliability_kind::{ORDERING_CHANNEL_COUNT, Priority, Reliability};
use crate::protocol::sequence;
use bytes::Bytes;
use garnet_binary::BitWriter;
use log::{debug, trace, warn};
use ordering::OrderingChannel;
use outgoing::SendQueue;
use resend::{DatagramHistory, DatagramNode, ResendList};
use split::{SplitAssembler, SplitInsert};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Receive holes tolerated before the connection is declared garbage.
const MAX_HOLE_QUEUE: usize = 4096;
/// A packet pair is emitted after this many data datagrams.
const PACKET_PAIR_INTERVAL: u32 = 16;
/// How long an unreliable-with-receipt send waits for its datagram's ack
/// before a loss receipt is surfaced.
const UNRELIABLE_RECEIPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a connection died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadReason {
    /// A reliable message went unacknowledged past the timeout.
    AckTimeout,
    /// The receive hole queue grew past its bound.
    HoleQueueOverflow,
}

/// Tuning knobs for one connection's engine.
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// Unacked-reliable-traffic lifetime before the connection dies.
    pub timeout: Duration,
    /// Queued unreliable messages older than this are silently culled.
    pub unreliable_timeout: Option<Duration>,
    /// Emit a download-progress packet every this many split parts; zero
    /// disables them.
    pub split_progress_interval: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            unreliable_timeout: None,
            split_progress_interval: 0,
        }
    }
}

/// Snapshot of a connection's counters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatistics {
    pub messages_sent: u64,
    pub user_bytes_sent: u64,
    pub messages_resent: u64,
    pub bytes_resent: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub messages_received: u64,
    pub user_bytes_received: u64,
    pub duplicate_messages_received: u64,
    pub malformed_datagrams_received: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub naks_sent: u64,
    pub naks_received: u64,
    pub bytes_in_flight: usize,
    pub messages_in_resend_list: usize,
    pub messages_in_send_queue: usize,
}

/// One payload surfaced by the engine. `generated_locally` marks packets
/// the engine fabricated (receipts, download progress) rather than
/// received.
#[derive(Debug, Clone)]
pub struct ReceiveEvent {
    pub data: Bytes,
    pub generated_locally: bool,
}

/// Accumulates frames for the data datagram currently being filled.
struct DatagramBuilder {
    frames: Vec<Frame>,
    payload_bytes: usize,
    message_numbers: Vec<u32>,
    receipt_serials: Vec<u32>,
}

impl DatagramBuilder {
    fn new() -> Self {
        Self {
            frames: Vec::new(),
            payload_bytes: 0,
            message_numbers: Vec::new(),
            receipt_serials: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

pub struct ReliabilityLayer {
    congestion: Box<dyn CongestionControl>,
    config: ReliabilityConfig,
    clock_epoch: Instant,

    // Send side.
    send_queue: SendQueue,
    resend: ResendList,
    history: DatagramHistory,
    next_reliable_index: u32,
    next_datagram_number: u32,
    next_split_id: u16,
    send_ordering_index: [u32; ORDERING_CHANNEL_COUNT],
    send_sequencing_index: [u32; ORDERING_CHANNEL_COUNT],
    bytes_in_flight: usize,
    datagrams_since_packet_pair: u32,
    bandwidth_exceeded: bool,
    last_update: Instant,

    // Receipts.
    reliable_receipt_parts: HashMap<u32, u32>,
    unreliable_receipt_expiry: VecDeque<(u32, u32, Instant)>,
    acked_receipt_datagrams: HashSet<u32>,

    // Receive side.
    received_base_index: u32,
    hole_queue: VecDeque<bool>,
    ordering: Vec<OrderingChannel>,
    splits: SplitAssembler,
    acks_pending: RangeList,
    naks_pending: RangeList,
    remote_wants_rate: bool,
    /// Source timestamp of the newest data datagram, echoed in ACKs so
    /// the remote reads RTT off its own clock.
    last_data_source_time_ms: u32,
    time_last_datagram_arrived: Instant,

    output: VecDeque<ReceiveEvent>,
    dead: Option<DeadReason>,
    stats: ConnectionStatistics,
}

impl ReliabilityLayer {
    pub fn new(
        congestion: Box<dyn CongestionControl>,
        config: ReliabilityConfig,
        clock_epoch: Instant,
        now: Instant,
    ) -> Self {
        let track_unreliable = config.unreliable_timeout.is_some();
        let split_progress_interval = config.split_progress_interval;
        Self {
            congestion,
            config,
            clock_epoch,
            send_queue: SendQueue::new(track_unreliable),
            resend: ResendList::new(),
            history: DatagramHistory::new(),
            next_reliable_index: 0,
            next_datagram_number: 0,
            next_split_id: 0,
            send_ordering_index: [0; ORDERING_CHANNEL_COUNT],
            send_sequencing_index: [0; ORDERING_CHANNEL_COUNT],
            bytes_in_flight: 0,
            datagrams_since_packet_pair: 0,
            bandwidth_exceeded: false,
            last_update: now,
            reliable_receipt_parts: HashMap::new(),
            unreliable_receipt_expiry: VecDeque::new(),
            acked_receipt_datagrams: HashSet::new(),
            received_base_index: 0,
            hole_queue: VecDeque::new(),
            ordering: (0..ORDERING_CHANNEL_COUNT)
                .map(|_| OrderingChannel::new())
                .collect(),
            splits: SplitAssembler::new(split_progress_interval),
            acks_pending: RangeList::new(),
            naks_pending: RangeList::new(),
            remote_wants_rate: false,
            last_data_source_time_ms: 0,
            time_last_datagram_arrived: now,
            output: VecDeque::new(),
            dead: None,
            stats: ConnectionStatistics::default(),
        }
    }

    /// Low 32 bits of this connection's monotonic clock in milliseconds.
    pub fn wire_time_ms(&self, now: Instant) -> u32 {
        now.duration_since(self.clock_epoch).as_millis() as u32
    }

    pub fn is_dead(&self) -> Option<DeadReason> {
        self.dead
    }

    pub fn time_last_datagram_arrived(&self) -> Instant {
        self.time_last_datagram_arrived
    }

    pub fn mtu(&self) -> u16 {
        self.congestion.mtu()
    }

    /// Whether unsent or unacked data remains.
    pub fn has_outgoing(&self) -> bool {
        !self.send_queue.is_empty() || !self.resend.is_empty()
    }

    pub fn statistics(&self) -> ConnectionStatistics {
        let mut stats = self.stats.clone();
        stats.bytes_in_flight = self.bytes_in_flight;
        stats.messages_in_resend_list = self.resend.len();
        stats.messages_in_send_queue = self.send_queue.len();
        stats
    }

    /// Pops the next delivered payload or locally generated status packet.
    pub fn receive(&mut self) -> Option<ReceiveEvent> {
        self.output.pop_front()
    }

    /// Largest single-frame body for the given class.
    fn max_body(&self, reliability: Reliability, split: bool) -> usize {
        self.congestion.mtu() as usize
            - DataHeader::LEN
            - Frame::header_len(reliability.wire_class(), split)
    }

    /// Queues a message. Returns `false` when the payload is empty or the
    /// datagram payload budget cannot even fit one split fragment.
    pub fn send(
        &mut self,
        data: Bytes,
        priority: Priority,
        reliability: Reliability,
        ordering_channel: u8,
        receipt_serial: Option<u32>,
        now: Instant,
    ) -> bool {
        if data.is_empty() || self.dead.is_some() {
            return false;
        }
        let channel = (ordering_channel as usize).min(ORDERING_CHANNEL_COUNT - 1);
        let receipt_serial = if reliability.has_ack_receipt() {
            receipt_serial
        } else {
            None
        };

        // A split unreliable message would be unreconstructable after one
        // lost fragment, so oversized sends are upgraded.
        let mut reliability = reliability;
        let needs_split = data.len() > self.max_body(reliability, false);
        if needs_split {
            reliability = match reliability {
                Reliability::Unreliable => Reliability::Reliable,
                Reliability::UnreliableSequenced => Reliability::ReliableSequenced,
                Reliability::UnreliableWithAckReceipt => Reliability::ReliableWithAckReceipt,
                other => other,
            };
        }

        let (sequencing_index, ordering_index) = if reliability.is_ordered() {
            let index = self.send_ordering_index[channel];
            self.send_ordering_index[channel] = sequence::add(index, 1);
            self.send_sequencing_index[channel] = 0;
            (None, Some(index))
        } else if reliability.is_sequenced() {
            let index = self.send_sequencing_index[channel];
            self.send_sequencing_index[channel] = sequence::add(index, 1);
            (Some(index), Some(self.send_ordering_index[channel]))
        } else {
            (None, None)
        };

        let base = OutgoingMessage {
            data: Bytes::new(),
            reliability,
            priority,
            ordering_channel: channel as u8,
            reliable_index: None,
            sequencing_index,
            ordering_index,
            split: None,
            receipt_serial,
            submitted_at: now,
        };

        if needs_split {
            let chunk = self.max_body(reliability, true);
            if chunk == 0 {
                return false;
            }
            let split_id = self.next_split_id;
            self.next_split_id = self.next_split_id.wrapping_add(1);
            let parts = split::split_payload(&data, chunk, split_id);
            if let Some(serial) = receipt_serial {
                self.reliable_receipt_parts
                    .insert(serial, parts.len() as u32);
            }
            trace!(
                "splitting {} bytes into {} parts (id {})",
                data.len(),
                parts.len(),
                split_id
            );
            for (header, body) in parts {
                let mut msg = base.clone();
                msg.data = body;
                msg.split = Some(header);
                self.send_queue.push(msg);
            }
        } else {
            if let (Some(serial), true) = (receipt_serial, reliability.is_reliable()) {
                self.reliable_receipt_parts.insert(serial, 1);
            }
            let mut msg = base;
            msg.data = data;
            self.send_queue.push(msg);
        }
        true
    }

    fn push_receipt(&mut self, id: MessageId, serial: u32) {
        let mut writer = BitWriter::with_capacity(5);
        writer.write_u8(id.into());
        writer.write_u32_le(serial);
        self.output.push_back(ReceiveEvent {
            data: writer.into_bytes(),
            generated_locally: true,
        });
    }

    fn push_download_progress(&mut self, received: u32, total: u32, first_part: &Bytes) {
        let mut writer = BitWriter::with_capacity(13 + first_part.len());
        writer.write_u8(MessageId::DownloadProgress.into());
        writer.write_u32_le(received);
        writer.write_u32_le(total);
        writer.write_u32_le(first_part.len() as u32);
        writer.write_bytes(first_part);
        self.output.push_back(ReceiveEvent {
            data: writer.into_bytes(),
            generated_locally: true,
        });
    }

    fn die(&mut self, reason: DeadReason) {
        if self.dead.is_some() {
            return;
        }
        warn!("connection dead: {:?}", reason);
        self.dead = Some(reason);
        // Every outstanding receipt resolves as a loss, exactly once.
        let serials: Vec<u32> = self.reliable_receipt_parts.keys().copied().collect();
        for serial in serials {
            self.push_receipt(MessageId::SndReceiptLoss, serial);
        }
        self.reliable_receipt_parts.clear();
        while let Some((number, serial, _)) = self.unreliable_receipt_expiry.pop_front() {
            if !self.acked_receipt_datagrams.contains(&number) {
                self.push_receipt(MessageId::SndReceiptLoss, serial);
            }
        }
        self.acked_receipt_datagrams.clear();
        self.splits.clear();
    }

    /// Encodes and stages the builder's datagram, recording history and
    /// packet-pair state. `previous_len` is the encoded length of the
    /// datagram flushed just before this one within the same tick.
    fn flush_datagram(
        &mut self,
        builder: &mut DatagramBuilder,
        out: &mut Vec<Bytes>,
        now: Instant,
        continuous: bool,
        previous_len: Option<usize>,
    ) -> Option<usize> {
        if builder.is_empty() {
            return previous_len;
        }
        let number = self.next_datagram_number;
        self.next_datagram_number = sequence::add(number, 1);

        let is_packet_pair =
            previous_len.is_some() && self.datagrams_since_packet_pair >= PACKET_PAIR_INTERVAL;
        if is_packet_pair {
            self.datagrams_since_packet_pair = 0;
        }

        let header = DataHeader {
            is_packet_pair,
            is_continuous_send: continuous,
            needs_b_and_as: true,
            source_time_ms: self.wire_time_ms(now),
            number,
        };
        let mut writer = BitWriter::with_capacity(self.congestion.mtu() as usize);
        header.encode(&mut writer);
        for frame in &builder.frames {
            frame
                .encode(&mut writer)
                .expect("frames are validated before queueing");
        }
        if is_packet_pair {
            // Pad to the predecessor's size so the receiver can compare
            // arrival spacing of two equal-sized datagrams.
            if let Some(prev) = previous_len {
                let len = writer.byte_len();
                if len < prev {
                    writer.write_bytes(&vec![0u8; prev - len]);
                }
            }
        }
        let encoded = writer.into_bytes();
        let len = encoded.len();

        let mut node = DatagramNode::new(now);
        node.message_numbers = std::mem::take(&mut builder.message_numbers);
        node.bytes = len;
        let serials = std::mem::take(&mut builder.receipt_serials);
        for &serial in &serials {
            self.unreliable_receipt_expiry
                .push_back((number, serial, now + UNRELIABLE_RECEIPT_TIMEOUT));
        }
        node.receipt_serials = serials;
        self.history.record(number, node);

        self.congestion.on_send_bytes(now, len);
        self.stats.datagrams_sent += 1;
        self.datagrams_since_packet_pair += 1;
        builder.frames.clear();
        builder.payload_bytes = 0;
        out.push(encoded);
        Some(len)
    }

    /// Runs one tick: retransmissions, fresh sends, packet pairing, ACK and
    /// NAK emission, receipt expiry and death checks. Encoded datagrams
    /// ready for the wire are appended to `out`.
    pub fn update(&mut self, now: Instant, out: &mut Vec<Bytes>) {
        if self.dead.is_some() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_update);
        self.last_update = now;

        if let Some(timeout) = self.config.unreliable_timeout {
            for serial in self.send_queue.cull_unreliable(now, timeout) {
                self.push_receipt(MessageId::SndReceiptLoss, serial);
            }
        }
        self.expire_unreliable_receipts(now);

        let continuous = self.has_outgoing();
        let retrans_budget =
            self.congestion
                .retransmission_bandwidth(now, elapsed, self.bytes_in_flight, continuous);
        let trans_budget =
            self.congestion
                .transmission_bandwidth(now, elapsed, self.bytes_in_flight, continuous);
        let payload_budget = self.congestion.mtu() as usize - DataHeader::LEN;

        let mut builder = DatagramBuilder::new();
        let mut previous_len: Option<usize> = None;

        // Retransmission pass: walk due entries off the list head.
        let mut retrans_bytes = 0usize;
        while retrans_bytes < retrans_budget {
            let slot = match self.resend.pop_due(now) {
                Some(slot) => slot,
                None => break,
            };
            let (frame, frame_len, times_sent) = {
                let entry = self.resend.entry_mut(slot);
                entry.times_sent += 1;
                (entry.msg.to_frame(), entry.msg.frame_len(), entry.times_sent)
            };
            let rto = self.congestion.rto_for_retransmission(times_sent);
            {
                let entry = self.resend.entry_mut(slot);
                entry.next_action_time = now + rto;
            }
            self.resend.reinsert_tail(slot);

            if builder.payload_bytes + frame_len > payload_budget {
                previous_len = self.flush_datagram(&mut builder, out, now, continuous, previous_len);
            }
            trace!(
                "retransmitting message {} (attempt {})",
                frame.reliable_index.unwrap_or(0),
                times_sent
            );
            builder
                .message_numbers
                .push(frame.reliable_index.unwrap_or(0));
            builder.payload_bytes += frame_len;
            builder.frames.push(frame);
            retrans_bytes += frame_len;
            self.stats.messages_resent += 1;
            self.stats.bytes_resent += frame_len as u64;
            self.congestion.on_resend(now);
        }

        // Fresh send pass.
        let mut fresh_bytes = 0usize;
        self.bandwidth_exceeded = false;
        loop {
            if fresh_bytes >= trans_budget {
                self.bandwidth_exceeded = !self.send_queue.is_empty();
                break;
            }
            let popped = match self.send_queue.pop() {
                Some(popped) => popped,
                None => break,
            };
            let is_reliable = popped.msg.reliability.is_reliable();
            if is_reliable && !self.resend.is_slot_free(self.next_reliable_index) {
                // Ring slot still occupied by an unacked message: stop
                // accepting reliable sends this tick.
                self.send_queue.requeue(popped);
                break;
            }
            let mut msg = popped.msg;
            let frame_len = msg.frame_len();
            if is_reliable {
                msg.reliable_index = Some(self.next_reliable_index);
                self.next_reliable_index = sequence::add(self.next_reliable_index, 1);
            }
            if builder.payload_bytes + frame_len > payload_budget {
                previous_len = self.flush_datagram(&mut builder, out, now, continuous, previous_len);
            }
            builder.payload_bytes += frame_len;
            builder.frames.push(msg.to_frame());
            fresh_bytes += frame_len;
            self.stats.messages_sent += 1;
            self.stats.user_bytes_sent += msg.data.len() as u64;

            if is_reliable {
                let index = msg.reliable_index.unwrap_or(0);
                builder.message_numbers.push(index);
                self.bytes_in_flight += frame_len;
                let rto = self.congestion.rto_for_retransmission(1);
                self.resend.insert(msg, now + rto, now);
            } else if let Some(serial) = msg.receipt_serial {
                builder.receipt_serials.push(serial);
            }
        }
        self.flush_datagram(&mut builder, out, now, continuous, previous_len);

        // NAKs go out immediately; ACKs wait for the controller's tick.
        while !self.naks_pending.is_empty() {
            let mut writer = BitWriter::with_capacity(64);
            let written = datagram::encode_nak(
                &mut writer,
                &mut self.naks_pending,
                self.congestion.mtu() as usize,
            );
            if written == 0 {
                break;
            }
            self.stats.naks_sent += written as u64;
            out.push(writer.into_bytes());
        }
        if !self.acks_pending.is_empty() && self.congestion.should_send_acks(now, elapsed) {
            let rate = if self.remote_wants_rate {
                self.congestion.arrival_rate()
            } else {
                None
            };
            while !self.acks_pending.is_empty() {
                let mut writer = BitWriter::with_capacity(64);
                let written = datagram::encode_ack(
                    &mut writer,
                    self.last_data_source_time_ms,
                    rate,
                    &mut self.acks_pending,
                    self.congestion.mtu() as usize,
                );
                if written == 0 {
                    break;
                }
                self.stats.acks_sent += written as u64;
                out.push(writer.into_bytes());
            }
        }

        // Death check: reliable data stuck past the timeout.
        if let Some(since) = self.resend.nonempty_since() {
            if now.saturating_duration_since(since) > self.config.timeout {
                self.die(DeadReason::AckTimeout);
            }
        }
    }

    fn expire_unreliable_receipts(&mut self, now: Instant) {
        while let Some(&(number, _, expiry)) = self.unreliable_receipt_expiry.front() {
            if expiry > now {
                break;
            }
            let acked = self.acked_receipt_datagrams.remove(&number);
            if !acked {
                // A late ack must not produce a second receipt.
                self.history.clear_receipts(number);
            }
            // Consume every consecutive entry for this datagram.
            while let Some(&(n, serial, _)) = self.unreliable_receipt_expiry.front() {
                if n != number {
                    break;
                }
                self.unreliable_receipt_expiry.pop_front();
                if !acked {
                    self.push_receipt(MessageId::SndReceiptLoss, serial);
                }
            }
        }
    }

    /// Feeds one arriving datagram into the engine. Returns `false` when
    /// the datagram failed to parse.
    pub fn handle_datagram(&mut self, data: Bytes, now: Instant) -> bool {
        if self.dead.is_some() {
            return true;
        }
        let len = data.len();
        let parsed = match Datagram::decode(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.malformed_datagrams_received += 1;
                debug!("malformed datagram ({} bytes): {}", len, e);
                return false;
            }
        };
        self.time_last_datagram_arrived = now;
        self.stats.datagrams_received += 1;

        match parsed {
            Datagram::Ack {
                source_time_ms,
                arrival_rate,
                ranges,
            } => self.handle_ack(source_time_ms, arrival_rate, ranges, now),
            Datagram::Nak { ranges } => self.handle_nak(ranges, now),
            Datagram::Data { header, frames } => self.handle_data(header, frames, len, now),
        }
        true
    }

    fn handle_ack(
        &mut self,
        source_time_ms: u32,
        arrival_rate: Option<f32>,
        ranges: RangeList,
        now: Instant,
    ) {
        let mut bytes_acked = 0usize;
        let mut last_number = 0u32;
        for number in ranges.iter_values() {
            last_number = number;
            self.stats.acks_received += 1;
            let node = match self.history.take(number) {
                Some(node) => node,
                None => continue, // duplicate or ancient ack
            };
            bytes_acked += node.bytes;
            for reliable_index in node.message_numbers {
                if let Some(msg) = self.resend.remove(reliable_index) {
                    self.bytes_in_flight = self.bytes_in_flight.saturating_sub(msg.frame_len());
                    if let Some(serial) = msg.receipt_serial {
                        self.resolve_reliable_receipt(serial);
                    }
                }
            }
            if !node.receipt_serials.is_empty() {
                self.acked_receipt_datagrams.insert(number);
                for serial in node.receipt_serials {
                    self.push_receipt(MessageId::SndReceiptAcked, serial);
                }
            }
        }

        let rtt_ms = self.wire_time_ms(now).wrapping_sub(source_time_ms);
        // A wildly wrapped value means clocks crossed a 2^32 ms boundary
        // mid-flight; skip the sample rather than poison the RTO.
        if rtt_ms < 60_000 {
            self.congestion.on_ack(
                now,
                Duration::from_millis(rtt_ms as u64),
                arrival_rate,
                bytes_acked,
                self.bandwidth_exceeded,
                last_number,
            );
        }
    }

    fn resolve_reliable_receipt(&mut self, serial: u32) {
        let done = match self.reliable_receipt_parts.get_mut(&serial) {
            Some(parts) => {
                *parts = parts.saturating_sub(1);
                *parts == 0
            }
            None => false,
        };
        if done {
            self.reliable_receipt_parts.remove(&serial);
            self.push_receipt(MessageId::SndReceiptAcked, serial);
        }
    }

    fn handle_nak(&mut self, ranges: RangeList, now: Instant) {
        for number in ranges.iter_values() {
            self.stats.naks_received += 1;
            self.congestion.on_nak(now, number);
            let message_numbers: Vec<u32> = match self.history.peek(number) {
                Some(node) => node.message_numbers.clone(),
                None => continue,
            };
            for reliable_index in message_numbers {
                self.resend.make_due(reliable_index, now);
            }
        }
    }

    fn handle_data(&mut self, header: DataHeader, frames: Vec<Frame>, len: usize, now: Instant) {
        let skipped =
            self.congestion
                .on_got_packet(header.number, header.is_continuous_send, now, len);
        for offset in 1..=skipped {
            self.naks_pending
                .insert(sequence::diff(header.number, offset));
        }
        self.naks_pending.remove(header.number);
        self.acks_pending.insert(header.number);
        self.remote_wants_rate = header.needs_b_and_as;
        self.last_data_source_time_ms = header.source_time_ms;

        for frame in frames {
            self.process_frame(frame, now);
            if self.dead.is_some() {
                return;
            }
        }
    }

    fn process_frame(&mut self, frame: Frame, now: Instant) {
        if let Some(reliable_index) = frame.reliable_index {
            if !self.check_reliable_hole(reliable_index) {
                return;
            }
        }

        let (reliability, sequencing_index, ordering_index, channel, body) =
            if frame.split.is_some() {
                match self.splits.insert(&frame, now) {
                    SplitInsert::Incomplete | SplitInsert::Rejected => return,
                    SplitInsert::Progress {
                        received,
                        total,
                        first_part,
                    } => {
                        self.push_download_progress(received, total, &first_part);
                        return;
                    }
                    SplitInsert::Complete(done) => (
                        done.reliability,
                        done.sequencing_index,
                        done.ordering_index,
                        done.ordering_channel,
                        done.data,
                    ),
                }
            } else {
                (
                    frame.reliability,
                    frame.sequencing_index,
                    frame.ordering_index,
                    frame.ordering_channel,
                    frame.body,
                )
            };

        let channel = (channel as usize).min(ORDERING_CHANNEL_COUNT - 1);
        let mut delivered = Vec::with_capacity(1);
        if reliability.is_sequenced() {
            self.ordering[channel].on_sequenced(
                ordering_index.unwrap_or(0),
                sequencing_index.unwrap_or(0),
                body,
                &mut delivered,
            );
        } else if reliability.is_ordered() {
            self.ordering[channel].on_ordered(ordering_index.unwrap_or(0), body, &mut delivered);
        } else {
            delivered.push(body);
        }
        for data in delivered {
            self.stats.messages_received += 1;
            self.stats.user_bytes_received += data.len() as u64;
            self.output.push_back(ReceiveEvent {
                data,
                generated_locally: false,
            });
        }
    }

    /// Reliable deduplication against the hole queue. Returns `true` when
    /// the message is fresh and should be processed.
    fn check_reliable_hole(&mut self, reliable_index: u32) -> bool {
        let hole = sequence::diff(reliable_index, self.received_base_index);
        if hole >= sequence::HALF {
            // Behind the base index: already delivered once.
            self.stats.duplicate_messages_received += 1;
            return false;
        }
        let hole = hole as usize;
        if hole == 0 {
            if self.hole_queue.is_empty() {
                self.received_base_index = sequence::add(self.received_base_index, 1);
            } else {
                self.hole_queue[0] = false;
                self.slide_hole_queue();
            }
            return true;
        }
        if hole < self.hole_queue.len() {
            if !self.hole_queue[hole] {
                self.stats.duplicate_messages_received += 1;
                return false;
            }
            self.hole_queue[hole] = false;
            self.slide_hole_queue();
            return true;
        }
        if hole > MAX_HOLE_QUEUE {
            self.die(DeadReason::HoleQueueOverflow);
            return false;
        }
        while self.hole_queue.len() < hole {
            self.hole_queue.push_back(true);
        }
        self.hole_queue.push_back(false);
        // The front is a real hole by construction, nothing slides yet.
        debug_assert!(self.hole_queue.front() == Some(&true) || self.hole_queue.len() == 1);
        self.slide_hole_queue();
        true
    }

    fn slide_hole_queue(&mut self) {
        while let Some(&false) = self.hole_queue.front() {
            self.hole_queue.pop_front();
            self.received_base_index = sequence::add(self.received_base_index, 1);
        }
    }
}

#[cfg(test)]
mod tests;
