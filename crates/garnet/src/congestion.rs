//! Congestion control plug-point. The reliability layer only talks to the
//! [`CongestionControl`] trait; [`SlidingWindow`] is the default
//! slow-start / congestion-avoidance implementation.

use crate::protocol::sequence;
use std::time::{Duration, Instant};

/// Decisions the reliability layer delegates every tick: how many bytes may
/// go out, when ACKs are worth a datagram, and how long to wait before
/// retransmitting.
pub trait CongestionControl: Send {
    /// Called for every datagram put on the wire.
    fn on_send_bytes(&mut self, now: Instant, bytes: usize);

    /// Called for every arriving data datagram. Returns how many datagram
    /// numbers were skipped; the caller turns those into NAKs.
    fn on_got_packet(
        &mut self,
        number: u32,
        is_continuous_send: bool,
        now: Instant,
        bytes: usize,
    ) -> u32;

    /// Called once per processed ACK datagram with the freshest RTT sample.
    fn on_ack(
        &mut self,
        now: Instant,
        rtt: Duration,
        arrival_rate: Option<f32>,
        bytes_acked: usize,
        bandwidth_exceeded: bool,
        number: u32,
    );

    /// Called for every NAKed datagram number.
    fn on_nak(&mut self, now: Instant, number: u32);

    /// Called when the retransmission pass actually resends something.
    fn on_resend(&mut self, _now: Instant) {}

    /// Fresh-send byte budget for this tick.
    fn transmission_bandwidth(
        &mut self,
        now: Instant,
        elapsed: Duration,
        bytes_in_flight: usize,
        continuous_send: bool,
    ) -> usize;

    /// Retransmission byte budget for this tick.
    fn retransmission_bandwidth(
        &mut self,
        now: Instant,
        elapsed: Duration,
        bytes_in_flight: usize,
        continuous_send: bool,
    ) -> usize;

    /// Retransmission timeout for a message already sent `times_sent`
    /// times.
    fn rto_for_retransmission(&self, times_sent: u32) -> Duration;

    /// Whether pending ACKs should be flushed this tick. Returning `true`
    /// arms the next ACK delay.
    fn should_send_acks(&mut self, now: Instant, elapsed: Duration) -> bool;

    fn mtu(&self) -> u16;
    fn set_mtu(&mut self, mtu: u16);

    /// Receiver-side estimate of the incoming byte rate, shipped in ACKs
    /// when the remote asks for it.
    fn arrival_rate(&self) -> Option<f32>;
}

const RTT_ALPHA: f64 = 0.125;
const RTT_BETA: f64 = 0.25;
const MIN_RTO: Duration = Duration::from_millis(100);
const MAX_RTO: Duration = Duration::from_secs(5);
const INITIAL_RTO: Duration = Duration::from_millis(500);
/// Datagrams in the initial congestion window.
const INITIAL_CWND_DATAGRAMS: usize = 2;
/// Delay between ACK flushes; batches acks without stalling the sender's
/// RTT estimate.
const ACK_DELAY: Duration = Duration::from_millis(10);
/// Length of one arrival-rate measurement window.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Byte-based sliding congestion window with Jacobson/Karels RTO
/// estimation: exponential growth to `ssthresh`, additive growth past it,
/// multiplicative decrease on loss.
pub struct SlidingWindow {
    mtu: u16,
    cwnd: f64,
    ssthresh: f64,
    srtt: Option<Duration>,
    rtt_var: Option<Duration>,
    rto: Duration,
    last_cut: Option<Instant>,
    next_incoming_number: u32,
    last_ack_flush: Option<Instant>,
    rate_window_start: Option<Instant>,
    rate_window_bytes: usize,
    arrival_rate: Option<f32>,
}

impl SlidingWindow {
    pub fn new(mtu: u16) -> Self {
        let initial_cwnd = (INITIAL_CWND_DATAGRAMS * mtu as usize) as f64;
        Self {
            mtu,
            cwnd: initial_cwnd,
            ssthresh: f64::MAX,
            srtt: None,
            rtt_var: None,
            rto: INITIAL_RTO,
            last_cut: None,
            next_incoming_number: 0,
            last_ack_flush: None,
            rate_window_start: None,
            rate_window_bytes: 0,
            arrival_rate: None,
        }
    }

    fn min_cwnd(&self) -> f64 {
        (2 * self.mtu as usize) as f64
    }

    fn update_rto(&mut self, rtt: Duration) {
        match (self.srtt, self.rtt_var) {
            (Some(srtt), Some(rtt_var)) => {
                let rtt_f = rtt.as_secs_f64();
                let srtt_f = srtt.as_secs_f64();
                let var = (1.0 - RTT_BETA) * rtt_var.as_secs_f64() + RTT_BETA * (srtt_f - rtt_f).abs();
                let smoothed = (1.0 - RTT_ALPHA) * srtt_f + RTT_ALPHA * rtt_f;
                self.srtt = Some(Duration::from_secs_f64(smoothed));
                self.rtt_var = Some(Duration::from_secs_f64(var));
            }
            _ => {
                self.srtt = Some(rtt);
                self.rtt_var = Some(rtt / 2);
            }
        }
        let candidate = self.srtt.unwrap_or(INITIAL_RTO) + self.rtt_var.unwrap_or_default() * 4;
        self.rto = candidate.clamp(MIN_RTO, MAX_RTO);
    }

    /// At most one multiplicative decrease per RTT, so a burst of NAKs for
    /// one loss event does not collapse the window.
    fn cut_window(&mut self, now: Instant) {
        let guard = self.srtt.unwrap_or(INITIAL_RTO);
        if let Some(last) = self.last_cut {
            if now.duration_since(last) < guard {
                return;
            }
        }
        self.last_cut = Some(now);
        self.ssthresh = (self.cwnd / 2.0).max(self.min_cwnd());
        self.cwnd = self.ssthresh;
    }

    fn track_arrival(&mut self, now: Instant, bytes: usize) {
        match self.rate_window_start {
            Some(start) => {
                self.rate_window_bytes += bytes;
                let elapsed = now.duration_since(start);
                if elapsed >= RATE_WINDOW {
                    self.arrival_rate =
                        Some((self.rate_window_bytes as f64 / elapsed.as_secs_f64()) as f32);
                    self.rate_window_start = Some(now);
                    self.rate_window_bytes = 0;
                }
            }
            None => {
                self.rate_window_start = Some(now);
                self.rate_window_bytes = bytes;
            }
        }
    }
}

impl CongestionControl for SlidingWindow {
    fn on_send_bytes(&mut self, _now: Instant, _bytes: usize) {}

    fn on_got_packet(
        &mut self,
        number: u32,
        _is_continuous_send: bool,
        now: Instant,
        bytes: usize,
    ) -> u32 {
        self.track_arrival(now, bytes);
        if number == self.next_incoming_number {
            self.next_incoming_number = sequence::add(number, 1);
            0
        } else if sequence::greater(number, self.next_incoming_number) {
            let skipped = sequence::diff(number, self.next_incoming_number);
            self.next_incoming_number = sequence::add(number, 1);
            skipped
        } else {
            // Late arrival of something already NAKed; no new gap.
            0
        }
    }

    fn on_ack(
        &mut self,
        _now: Instant,
        rtt: Duration,
        _arrival_rate: Option<f32>,
        bytes_acked: usize,
        bandwidth_exceeded: bool,
        _number: u32,
    ) {
        self.update_rto(rtt);
        if bytes_acked == 0 {
            return;
        }
        if self.cwnd < self.ssthresh {
            // Slow start: one acked byte grows the window by one byte.
            self.cwnd += bytes_acked as f64;
        } else if bandwidth_exceeded {
            // Congestion avoidance: about one MTU per window's worth of
            // acks, and only while the sender is actually window-limited.
            self.cwnd += self.mtu as f64 * (bytes_acked as f64 / self.cwnd);
        }
    }

    fn on_nak(&mut self, now: Instant, _number: u32) {
        self.cut_window(now);
    }

    fn on_resend(&mut self, now: Instant) {
        self.cut_window(now);
    }

    fn transmission_bandwidth(
        &mut self,
        _now: Instant,
        _elapsed: Duration,
        bytes_in_flight: usize,
        _continuous_send: bool,
    ) -> usize {
        (self.cwnd as usize).saturating_sub(bytes_in_flight)
    }

    fn retransmission_bandwidth(
        &mut self,
        _now: Instant,
        _elapsed: Duration,
        bytes_in_flight: usize,
        _continuous_send: bool,
    ) -> usize {
        // Never stall recovery entirely: at least one datagram per tick.
        (self.cwnd as usize)
            .saturating_sub(bytes_in_flight)
            .max(self.mtu as usize)
    }

    fn rto_for_retransmission(&self, times_sent: u32) -> Duration {
        let backoff = 1u32 << times_sent.saturating_sub(1).min(5);
        (self.rto * backoff).clamp(MIN_RTO, MAX_RTO)
    }

    fn should_send_acks(&mut self, now: Instant, _elapsed: Duration) -> bool {
        let due = match self.last_ack_flush {
            Some(last) => now.duration_since(last) >= ACK_DELAY,
            None => true,
        };
        if due {
            self.last_ack_flush = Some(now);
        }
        due
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    fn arrival_rate(&self) -> Option<f32> {
        self.arrival_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn gap_detection_reports_skipped_numbers() {
        let mut cc = SlidingWindow::new(1400);
        let t = now();
        assert_eq!(cc.on_got_packet(0, false, t, 100), 0);
        assert_eq!(cc.on_got_packet(1, false, t, 100), 0);
        // 2 and 3 lost.
        assert_eq!(cc.on_got_packet(4, false, t, 100), 2);
        // Late arrival of a NAKed datagram is not a new gap.
        assert_eq!(cc.on_got_packet(2, false, t, 100), 0);
        assert_eq!(cc.on_got_packet(5, false, t, 100), 0);
    }

    #[test]
    fn gap_detection_wraps() {
        let mut cc = SlidingWindow::new(1400);
        cc.next_incoming_number = sequence::MASK;
        let t = now();
        assert_eq!(cc.on_got_packet(sequence::MASK, false, t, 10), 0);
        assert_eq!(cc.on_got_packet(1, false, t, 10), 1); // 0 skipped
    }

    #[test]
    fn slow_start_grows_with_acked_bytes() {
        let mut cc = SlidingWindow::new(1400);
        let before = cc.cwnd;
        cc.on_ack(now(), Duration::from_millis(50), None, 2800, true, 0);
        assert!(cc.cwnd >= before + 2800.0 - f64::EPSILON);
    }

    #[test]
    fn nak_halves_the_window_once_per_rtt() {
        let mut cc = SlidingWindow::new(1400);
        cc.cwnd = 100_000.0;
        cc.ssthresh = 100_000.0;
        let t = now();
        cc.on_nak(t, 1);
        let after_first = cc.cwnd;
        assert!(after_first <= 50_000.0 + f64::EPSILON);
        // A second NAK within the same RTT does not cut again.
        cc.on_nak(t, 2);
        assert_eq!(cc.cwnd, after_first);
    }

    #[test]
    fn window_never_drops_below_two_datagrams() {
        let mut cc = SlidingWindow::new(1400);
        let mut t = now();
        for i in 0..64 {
            t += Duration::from_secs(10);
            cc.on_nak(t, i);
        }
        assert!(cc.cwnd >= 2.0 * 1400.0);
        assert!(cc.transmission_bandwidth(t, Duration::ZERO, 0, false) >= 2 * 1400);
    }

    #[test]
    fn rto_backs_off_with_resend_count() {
        let cc = SlidingWindow::new(1400);
        let mut last = Duration::ZERO;
        for times in 1..8 {
            let rto = cc.rto_for_retransmission(times);
            assert!(rto >= last);
            assert!(rto <= MAX_RTO);
            last = rto;
        }
    }

    #[test]
    fn ack_flush_is_rate_limited() {
        let mut cc = SlidingWindow::new(1400);
        let t = now();
        assert!(cc.should_send_acks(t, Duration::ZERO));
        assert!(!cc.should_send_acks(t + Duration::from_millis(1), Duration::ZERO));
        assert!(cc.should_send_acks(t + ACK_DELAY + Duration::from_millis(1), Duration::ZERO));
    }

    #[test]
    fn transmission_budget_subtracts_bytes_in_flight() {
        let mut cc = SlidingWindow::new(1400);
        let full = cc.transmission_bandwidth(now(), Duration::ZERO, 0, true);
        assert_eq!(full, 2 * 1400);
        assert_eq!(cc.transmission_bandwidth(now(), Duration::ZERO, 1400, true), 1400);
        assert_eq!(cc.transmission_bandwidth(now(), Duration::ZERO, 9999, true), 0);
    }
}
