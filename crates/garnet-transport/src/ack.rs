//! Receiver-side acknowledgement support: the journal of sent ACKs (for
//! ACKACK round trips), the RTT filter, the clock-drift tracer, and the
//! arrival-rate windows feeding the ACK statistics.

use crate::seq::SeqNo;

/// How many outstanding ACKs the journal remembers.
const ACK_WINDOW_SIZE: usize = 1024;

/// One sent-but-not-yet-confirmed ACK.
#[derive(Debug, Clone, Copy)]
struct AckRecord {
    ack_no: u32,
    seq: SeqNo,
    sent_time_us: u64,
}

/// Journal of emitted ACKs. When the matching ACKACK arrives, the round
/// trip yields an RTT sample and the acknowledged sequence.
#[derive(Debug, Default)]
pub struct AckWindow {
    records: Vec<AckRecord>,
}

impl AckWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, ack_no: u32, seq: SeqNo, now_us: u64) {
        if self.records.len() >= ACK_WINDOW_SIZE {
            self.records.remove(0);
        }
        self.records.push(AckRecord {
            ack_no,
            seq,
            sent_time_us: now_us,
        });
    }

    /// Matches an ACKACK against the journal. Returns the RTT sample and
    /// the sequence the original ACK covered; older journal entries are
    /// discarded, a stale or unknown journal number yields `None`.
    pub fn acknowledge(&mut self, ack_no: u32, now_us: u64) -> Option<(u64, SeqNo)> {
        let idx = self.records.iter().position(|r| r.ack_no == ack_no)?;
        let record = self.records[idx];
        self.records.drain(..=idx);
        Some((now_us.saturating_sub(record.sent_time_us), record.seq))
    }
}

/// Smoothed RTT estimation fed by ACKACK round trips:
/// `rtt <- 7/8 rtt + 1/8 sample`, `var <- 3/4 var + 1/4 |rtt - sample|`.
#[derive(Debug, Clone, Copy)]
pub struct RttFilter {
    rtt_us: u64,
    rtt_var_us: u64,
}

impl RttFilter {
    /// Starts from a conservative 100 ms estimate.
    pub fn new() -> Self {
        Self {
            rtt_us: 100_000,
            rtt_var_us: 50_000,
        }
    }

    pub fn update(&mut self, sample_us: u64) {
        let diff = self.rtt_us.abs_diff(sample_us);
        self.rtt_var_us = (3 * self.rtt_var_us + diff) / 4;
        self.rtt_us = (7 * self.rtt_us + sample_us) / 8;
    }

    pub fn rtt_us(&self) -> u64 {
        self.rtt_us
    }

    pub fn rtt_var_us(&self) -> u64 {
        self.rtt_var_us
    }

    /// Deadline spread used by the NAK re-report timer.
    pub fn nak_interval_us(&self, floor_us: u64) -> u64 {
        (self.rtt_us + 4 * self.rtt_var_us).max(floor_us)
    }
}

impl Default for RttFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Running mean of the skew between the local receive clock and the
/// peer's delivery timeline, sampled on every ACKACK. Once enough samples
/// are in, a mean at or beyond the threshold emits a one-step base
/// adjustment in the direction of the drift.
#[derive(Debug)]
pub struct DriftTracer {
    sum_us: i64,
    count: u32,
    max_samples: u32,
    max_value_us: i64,
}

impl DriftTracer {
    pub const DEFAULT_MAX_SAMPLES: u32 = 1000;
    pub const DEFAULT_MAX_VALUE_US: i64 = 5000;

    pub fn new() -> Self {
        Self::with_limits(Self::DEFAULT_MAX_SAMPLES, Self::DEFAULT_MAX_VALUE_US)
    }

    pub fn with_limits(max_samples: u32, max_value_us: i64) -> Self {
        Self {
            sum_us: 0,
            count: 0,
            max_samples,
            max_value_us,
        }
    }

    /// Feeds one `local_recv_time - peer_tsbpd_time` sample. Returns the
    /// base adjustment to apply, if this sample completed a window whose
    /// mean reached the threshold.
    pub fn sample(&mut self, drift_us: i64) -> Option<i64> {
        self.sum_us += drift_us;
        self.count += 1;
        if self.count < self.max_samples {
            return None;
        }
        let mean = self.sum_us / self.count as i64;
        self.sum_us = 0;
        self.count = 0;
        if mean.abs() >= self.max_value_us {
            Some(self.max_value_us * mean.signum())
        } else {
            None
        }
    }
}

impl Default for DriftTracer {
    fn default() -> Self {
        Self::new()
    }
}

/// Arrival-interval window with a median filter, after the classic
/// packet-pair estimator: intervals wildly off the median (8x either way)
/// are ignored, and the mean of the rest becomes the rate.
#[derive(Debug)]
struct MedianWindow {
    intervals_us: Vec<u64>,
    next: usize,
}

impl MedianWindow {
    fn new(size: usize) -> Self {
        Self {
            intervals_us: vec![0; size],
            next: 0,
        }
    }

    fn push(&mut self, interval_us: u64) {
        self.intervals_us[self.next] = interval_us;
        self.next = (self.next + 1) % self.intervals_us.len();
    }

    /// Events per second, or 0 when fewer than half the samples agree.
    fn rate_per_sec(&self) -> u64 {
        let mut sorted: Vec<u64> = self.intervals_us.clone();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        if median == 0 {
            return 0;
        }
        let (mut sum, mut count) = (0u64, 0u64);
        for &v in &self.intervals_us {
            if v > median / 8 && v < median * 8 && v > 0 {
                sum += v;
                count += 1;
            }
        }
        if count > (self.intervals_us.len() / 2) as u64 && sum > 0 {
            count * 1_000_000 / sum
        } else {
            0
        }
    }
}

/// Packet arrival bookkeeping: delivery rate from consecutive arrivals,
/// link capacity from packet-pair probes (every 16th sequence).
#[derive(Debug)]
pub struct PktTimeWindow {
    arrival: MedianWindow,
    probe: MedianWindow,
    bytes: MedianWindow,
    last_arrival_us: u64,
    probe_first_us: u64,
}

impl PktTimeWindow {
    pub fn new() -> Self {
        Self {
            arrival: MedianWindow::new(16),
            probe: MedianWindow::new(64),
            bytes: MedianWindow::new(16),
            last_arrival_us: 0,
            probe_first_us: 0,
        }
    }

    pub fn on_arrival(&mut self, now_us: u64, payload_len: usize) {
        if self.last_arrival_us != 0 {
            let interval = now_us - self.last_arrival_us;
            self.arrival.push(interval);
            if interval > 0 {
                // Interval per byte, scaled so the median filter works on
                // comparable magnitudes.
                self.bytes
                    .push(interval * 1000 / (payload_len.max(1) as u64));
            }
        }
        self.last_arrival_us = now_us;
    }

    /// First packet of a probe pair (sequence divisible by 16).
    pub fn on_probe1(&mut self, now_us: u64) {
        self.probe_first_us = now_us;
    }

    /// Second packet of a probe pair; the spacing estimates capacity.
    pub fn on_probe2(&mut self, now_us: u64) {
        if self.probe_first_us != 0 && now_us > self.probe_first_us {
            self.probe.push(now_us - self.probe_first_us);
        }
        self.probe_first_us = 0;
    }

    /// Packets per second actually being received.
    pub fn recv_rate_pktps(&self) -> u64 {
        self.arrival.rate_per_sec()
    }

    /// Estimated link capacity in packets per second.
    pub fn bandwidth_pktps(&self) -> u64 {
        self.probe.rate_per_sec()
    }

    /// Receive rate in bytes per second.
    pub fn recv_rate_bps(&self) -> u64 {
        self.bytes.rate_per_sec() * 1000
    }
}

impl Default for PktTimeWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Dynamic tolerance for reordered (not lost) packets: every reordered
/// arrival that still made it in time grows the tolerance by one, long
/// runs of in-order delivery shrink it back.
#[derive(Debug)]
pub struct ReorderTolerance {
    value: u32,
    max: u32,
    consec_ordered: u32,
}

/// In-order deliveries required before the tolerance decays by one.
const TOLERANCE_DECAY_RUN: u32 = 50;

impl ReorderTolerance {
    pub fn new(max: u32) -> Self {
        Self {
            value: 0,
            max,
            consec_ordered: 0,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// A packet arrived late but before its loss report deadline.
    pub fn on_reordered(&mut self) {
        self.consec_ordered = 0;
        if self.value < self.max {
            self.value += 1;
        }
    }

    /// A packet arrived in sequence (or was a retransmission).
    pub fn on_ordered(&mut self) {
        if self.value == 0 {
            return;
        }
        self.consec_ordered += 1;
        if self.consec_ordered >= TOLERANCE_DECAY_RUN {
            self.consec_ordered = 0;
            self.value -= 1;
        }
    }
}
