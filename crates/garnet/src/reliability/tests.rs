use super::*;
use crate::congestion::SlidingWindow;

fn layer_with(config: ReliabilityConfig, epoch: Instant) -> ReliabilityLayer {
    ReliabilityLayer::new(Box::new(SlidingWindow::new(1400)), config, epoch, epoch)
}

fn payload(tag: u32) -> Bytes {
    Bytes::copy_from_slice(&tag.to_le_bytes())
}

fn receipt_serial(event: &ReceiveEvent) -> u32 {
    u32::from_le_bytes(event.data[1..5].try_into().unwrap())
}

/// Two engines joined by a deterministic lossy channel.
struct Pump {
    a: ReliabilityLayer,
    b: ReliabilityLayer,
    now: Instant,
    rng: u64,
}

impl Pump {
    fn new(config: ReliabilityConfig) -> Self {
        let epoch = Instant::now();
        Self {
            a: layer_with(config.clone(), epoch),
            b: layer_with(config, epoch),
            now: epoch,
            rng: 0x9e37_79b9_7f4a_7c15,
        }
    }

    fn chance(&mut self) -> f64 {
        self.rng = self
            .rng
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.rng >> 33) as f64 / (1u64 << 31) as f64
    }

    /// Advances 10 ms and pumps both directions once, dropping each
    /// datagram with probability `loss`.
    fn step(&mut self, loss: f64) {
        self.now += Duration::from_millis(10);
        let mut wire = Vec::new();
        self.a.update(self.now, &mut wire);
        for datagram in wire.drain(..) {
            if self.chance() >= loss {
                self.b.handle_datagram(datagram, self.now);
            }
        }
        self.b.update(self.now, &mut wire);
        for datagram in wire {
            if self.chance() >= loss {
                self.a.handle_datagram(datagram, self.now);
            }
        }
    }
}

#[test]
fn round_trip_of_a_single_reliable_message() {
    let mut pump = Pump::new(ReliabilityConfig::default());
    assert!(pump.a.send(
        payload(42),
        Priority::Medium,
        Reliability::Reliable,
        0,
        None,
        pump.now
    ));
    pump.step(0.0);
    let event = pump.b.receive().expect("message delivered");
    assert!(!event.generated_locally);
    assert_eq!(event.data, payload(42));
    assert!(pump.b.receive().is_none());
}

#[test]
fn reliable_ordered_delivery_survives_heavy_loss() {
    let config = ReliabilityConfig {
        timeout: Duration::from_secs(120),
        ..ReliabilityConfig::default()
    };
    let mut pump = Pump::new(config);
    const COUNT: u32 = 500;
    for i in 0..COUNT {
        assert!(pump.a.send(
            payload(i),
            Priority::Medium,
            Reliability::ReliableOrdered,
            7,
            None,
            pump.now
        ));
    }

    let mut received = Vec::new();
    for _ in 0..4000 {
        pump.step(0.30);
        while let Some(event) = pump.b.receive() {
            received.push(u32::from_le_bytes(event.data[..4].try_into().unwrap()));
        }
        if received.len() as u32 == COUNT {
            break;
        }
    }
    assert!(pump.a.is_dead().is_none());
    assert!(pump.b.is_dead().is_none());
    assert_eq!(received.len() as u32, COUNT, "every message exactly once");
    let expected: Vec<u32> = (0..COUNT).collect();
    assert_eq!(received, expected, "in submission order with no gaps");
}

#[test]
fn sequenced_messages_drop_anything_stale() {
    let epoch = Instant::now();
    let mut a = layer_with(ReliabilityConfig::default(), epoch);
    let mut b = layer_with(ReliabilityConfig::default(), epoch);

    // One datagram per tick so each message travels alone.
    let mut datagrams = Vec::new();
    let mut now = epoch;
    for i in 0..5u32 {
        now += Duration::from_millis(10);
        assert!(a.send(
            payload(i),
            Priority::Medium,
            Reliability::UnreliableSequenced,
            3,
            None,
            now
        ));
        let mut wire = Vec::new();
        a.update(now, &mut wire);
        assert_eq!(wire.len(), 1);
        datagrams.push(wire.pop().unwrap());
    }

    // Deliver newest first; everything older must be discarded.
    for datagram in datagrams.into_iter().rev() {
        b.handle_datagram(datagram, now);
    }
    let event = b.receive().expect("newest sequenced message delivered");
    assert_eq!(event.data, payload(4));
    assert!(b.receive().is_none());
}

#[test]
fn reliable_receipt_is_acked_exactly_once_even_for_duplicate_acks() {
    let epoch = Instant::now();
    let mut a = layer_with(ReliabilityConfig::default(), epoch);
    let mut b = layer_with(ReliabilityConfig::default(), epoch);

    let t1 = epoch + Duration::from_millis(10);
    assert!(a.send(
        payload(1),
        Priority::Medium,
        Reliability::ReliableWithAckReceipt,
        0,
        Some(555),
        t1
    ));
    let mut wire = Vec::new();
    a.update(t1, &mut wire);
    assert_eq!(wire.len(), 1);
    b.handle_datagram(wire.pop().unwrap(), t1);

    let t2 = t1 + Duration::from_millis(10);
    let mut acks = Vec::new();
    b.update(t2, &mut acks);
    assert!(!acks.is_empty());
    let ack = acks.remove(0);
    a.handle_datagram(ack.clone(), t2);
    a.handle_datagram(ack, t2); // duplicate

    let mut receipts = Vec::new();
    while let Some(event) = a.receive() {
        assert!(event.generated_locally);
        assert_eq!(MessageId::of(&event.data), Some(MessageId::SndReceiptAcked));
        receipts.push(receipt_serial(&event));
    }
    assert_eq!(receipts, vec![555]);
}

#[test]
fn unreliable_receipts_become_losses_when_everything_drops() {
    let mut pump = Pump::new(ReliabilityConfig {
        timeout: Duration::from_secs(120),
        ..ReliabilityConfig::default()
    });
    const COUNT: u32 = 20;
    for serial in 1..=COUNT {
        assert!(pump.a.send(
            payload(serial),
            Priority::Medium,
            Reliability::UnreliableWithAckReceipt,
            0,
            Some(serial),
            pump.now
        ));
    }
    for _ in 0..200 {
        pump.step(1.0); // total loss
    }

    let mut lost = Vec::new();
    while let Some(event) = pump.a.receive() {
        assert_eq!(MessageId::of(&event.data), Some(MessageId::SndReceiptLoss));
        lost.push(receipt_serial(&event));
    }
    lost.sort_unstable();
    assert_eq!(lost, (1..=COUNT).collect::<Vec<u32>>());
}

#[test]
fn split_messages_reassemble_and_report_progress() {
    let config = ReliabilityConfig {
        timeout: Duration::from_secs(120),
        split_progress_interval: 1,
        ..ReliabilityConfig::default()
    };
    let mut pump = Pump::new(config);
    let original: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    assert!(pump.a.send(
        Bytes::from(original.clone()),
        Priority::High,
        Reliability::ReliableOrdered,
        0,
        None,
        pump.now
    ));

    let mut progress_packets = 0;
    let mut final_message: Option<Bytes> = None;
    for _ in 0..1000 {
        pump.step(0.0);
        while let Some(event) = pump.b.receive() {
            match MessageId::of(&event.data) {
                Some(MessageId::DownloadProgress) => {
                    assert!(event.generated_locally);
                    progress_packets += 1;
                }
                _ => {
                    assert!(!event.generated_locally);
                    final_message = Some(event.data);
                }
            }
        }
        if final_message.is_some() {
            break;
        }
    }
    assert!(progress_packets >= 1, "progress surfaced before completion");
    let final_message = final_message.expect("reassembled message");
    assert_eq!(&final_message[..], &original[..]);
    assert!(pump.b.receive().is_none(), "exactly one final message");
}

#[test]
fn ack_timeout_kills_the_connection_and_resolves_receipts_as_lost() {
    let mut pump = Pump::new(ReliabilityConfig::default());
    assert!(pump.a.send(
        payload(9),
        Priority::Medium,
        Reliability::ReliableWithAckReceipt,
        0,
        Some(77),
        pump.now
    ));
    // Default timeout is 10 s; pump 11 simulated seconds of total loss.
    for _ in 0..1100 {
        pump.step(1.0);
        if pump.a.is_dead().is_some() {
            break;
        }
    }
    assert_eq!(pump.a.is_dead(), Some(DeadReason::AckTimeout));

    let mut saw_loss = false;
    while let Some(event) = pump.a.receive() {
        if MessageId::of(&event.data) == Some(MessageId::SndReceiptLoss)
            && receipt_serial(&event) == 77
        {
            saw_loss = true;
        }
    }
    assert!(saw_loss);
}

#[test]
fn duplicate_reliable_messages_are_dropped() {
    let epoch = Instant::now();
    let mut b = layer_with(ReliabilityConfig::default(), epoch);

    let frame = Frame {
        reliability: Reliability::Reliable,
        reliable_index: Some(0),
        sequencing_index: None,
        ordering_index: None,
        ordering_channel: 0,
        split: None,
        body: payload(1),
    };
    // Same message riding two datagram numbers, as a retransmission would.
    for number in 0..2u32 {
        let mut writer = BitWriter::new();
        DataHeader {
            is_packet_pair: false,
            is_continuous_send: false,
            needs_b_and_as: false,
            source_time_ms: 0,
            number,
        }
        .encode(&mut writer);
        frame.encode(&mut writer).unwrap();
        assert!(b.handle_datagram(writer.into_bytes(), epoch));
    }

    assert!(b.receive().is_some());
    assert!(b.receive().is_none());
    assert_eq!(b.statistics().duplicate_messages_received, 1);
}

#[test]
fn malformed_datagrams_are_counted_and_rejected() {
    let epoch = Instant::now();
    let mut b = layer_with(ReliabilityConfig::default(), epoch);
    assert!(!b.handle_datagram(Bytes::from_static(&[0x00, 0xff]), epoch));
    assert_eq!(b.statistics().malformed_datagrams_received, 1);
    assert!(b.receive().is_none());
}

/// Congestion stub with unbounded budgets, for exercising backpressure in
/// isolation.
struct FatPipe {
    mtu: u16,
}

impl CongestionControl for FatPipe {
    fn on_send_bytes(&mut self, _: Instant, _: usize) {}
    fn on_got_packet(&mut self, _: u32, _: bool, _: Instant, _: usize) -> u32 {
        0
    }
    fn on_ack(&mut self, _: Instant, _: Duration, _: Option<f32>, _: usize, _: bool, _: u32) {}
    fn on_nak(&mut self, _: Instant, _: u32) {}
    fn transmission_bandwidth(&mut self, _: Instant, _: Duration, _: usize, _: bool) -> usize {
        usize::MAX / 2
    }
    fn retransmission_bandwidth(&mut self, _: Instant, _: Duration, _: usize, _: bool) -> usize {
        usize::MAX / 2
    }
    fn rto_for_retransmission(&self, _: u32) -> Duration {
        Duration::from_secs(1)
    }
    fn should_send_acks(&mut self, _: Instant, _: Duration) -> bool {
        true
    }
    fn mtu(&self) -> u16 {
        self.mtu
    }
    fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }
    fn arrival_rate(&self) -> Option<f32> {
        None
    }
}

#[test]
fn resend_ring_collision_stops_fresh_reliable_sends() {
    let epoch = Instant::now();
    let mut a = ReliabilityLayer::new(
        Box::new(FatPipe { mtu: 1400 }),
        ReliabilityConfig::default(),
        epoch,
        epoch,
    );
    const SUBMITTED: usize = RESEND_RING_LEN + 88;
    for i in 0..SUBMITTED {
        assert!(a.send(
            payload(i as u32),
            Priority::Medium,
            Reliability::Reliable,
            0,
            None,
            epoch
        ));
    }
    let mut wire = Vec::new();
    a.update(epoch + Duration::from_millis(10), &mut wire);

    let stats = a.statistics();
    assert_eq!(stats.messages_in_resend_list, RESEND_RING_LEN);
    assert_eq!(stats.messages_in_send_queue, SUBMITTED - RESEND_RING_LEN);
    assert!(!wire.is_empty());
}

#[test]
fn packet_pairs_are_flagged_and_padded() {
    let epoch = Instant::now();
    let mut a = ReliabilityLayer::new(
        Box::new(FatPipe { mtu: 200 }),
        ReliabilityConfig::default(),
        epoch,
        epoch,
    );
    // Enough small messages to force well over PACKET_PAIR_INTERVAL
    // datagrams out in one tick.
    for i in 0..400u32 {
        assert!(a.send(
            Bytes::from(vec![i as u8; 100]),
            Priority::Medium,
            Reliability::Unreliable,
            0,
            None,
            epoch
        ));
    }
    let mut wire = Vec::new();
    a.update(epoch + Duration::from_millis(10), &mut wire);
    assert!(wire.len() > PACKET_PAIR_INTERVAL as usize);

    let mut pairs = 0;
    for (i, raw) in wire.iter().enumerate() {
        if let Datagram::Data { header, .. } = Datagram::decode(raw.clone()).unwrap() {
            if header.is_packet_pair {
                pairs += 1;
                assert!(i > 0);
                assert_eq!(raw.len(), wire[i - 1].len(), "padded to predecessor");
            }
        }
    }
    assert!(pairs >= 1);
}
