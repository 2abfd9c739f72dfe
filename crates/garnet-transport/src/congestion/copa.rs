//! Delay-based congestion control (Copa style).
//!
//! The controller tracks the minimum RTT over a long window and a
//! "standing" RTT over half a smoothed RTT; their difference is the
//! queuing delay. A target rate `mss / (delta * queuing_delay)` is
//! compared with the current rate `cwnd / standing_rtt`: below target the
//! window grows, above it shrinks. A velocity term doubles each RTT the
//! direction stays the same and snaps back to 1 on a flip, so the search
//! accelerates on long ramps but settles quickly.

use super::{AckEvent, CcView, CongestionCtrl, RexmitMethod, TimerStage};
use crate::options::Options;
use crate::packet::SeqRange;

/// Long window for the minimum-RTT filter.
const MIN_RTT_WINDOW_US: u64 = 10_000_000;
/// RTT periods in the same direction before velocity starts doubling.
const VELOCITY_RAMP_DELAY: u64 = 3;
const MAX_VELOCITY: f64 = 10_000.0;

/// Windowed minimum filter over timestamped samples.
#[derive(Debug)]
struct MinFilter {
    window_us: u64,
    samples: Vec<(u64, u64)>, // (time, value)
}

impl MinFilter {
    fn new(window_us: u64) -> Self {
        Self {
            window_us,
            samples: Vec::new(),
        }
    }

    fn set_window(&mut self, window_us: u64) {
        self.window_us = window_us.max(1);
    }

    fn update(&mut self, value: u64, now_us: u64) {
        let horizon = now_us.saturating_sub(self.window_us);
        self.samples.retain(|(t, _)| *t >= horizon);
        self.samples.push((now_us, value));
    }

    fn best(&self) -> u64 {
        self.samples.iter().map(|(_, v)| *v).min().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    None,
    Up,
    Down,
}

pub struct CopaCc {
    slow_start: bool,
    cwnd_bytes: f64,
    min_cwnd_bytes: f64,
    max_cwnd_bytes: f64,
    mss: f64,
    /// Copa's delta: how strongly queuing delay is priced in.
    latency_factor: f64,

    min_rtt: MinFilter,
    standing_rtt: MinFilter,

    velocity: f64,
    direction: Direction,
    times_direction_same: u64,
    last_record_time_us: u64,
    last_recorded_cwnd: f64,
    last_double_time_us: Option<u64>,

    pkt_send_period_us: f64,
}

impl CopaCc {
    pub fn new(opts: &Options) -> Self {
        let mss = opts.max_payload_size() as f64;
        Self {
            slow_start: true,
            cwnd_bytes: 10.0 * mss,
            min_cwnd_bytes: 4.0 * mss,
            max_cwnd_bytes: opts.flow_window as f64 * mss,
            mss,
            latency_factor: opts.latency_factor,
            min_rtt: MinFilter::new(MIN_RTT_WINDOW_US),
            standing_rtt: MinFilter::new(MIN_RTT_WINDOW_US),
            velocity: 1.0,
            direction: Direction::None,
            times_direction_same: 0,
            last_record_time_us: 0,
            last_recorded_cwnd: 10.0 * mss,
            last_double_time_us: None,
            pkt_send_period_us: 1.0,
        }
    }

    fn change_direction(&mut self, new_direction: Direction, now_us: u64) {
        if self.direction == new_direction {
            return;
        }
        log::debug!("copa: direction change to {:?}", new_direction);
        self.direction = new_direction;
        self.velocity = 1.0;
        self.times_direction_same = 0;
        self.last_record_time_us = now_us;
        self.last_recorded_cwnd = self.cwnd_bytes;
    }

    /// Once per smoothed RTT, compare the window against the last record:
    /// a steady direction doubles the velocity (after a short ramp
    /// delay), a flip resets it.
    fn check_and_update_direction(&mut self, now_us: u64, srtt_us: u64) {
        if self.last_record_time_us == 0 {
            self.last_record_time_us = now_us;
            self.last_recorded_cwnd = self.cwnd_bytes;
            return;
        }
        if now_us.saturating_sub(self.last_record_time_us) < srtt_us {
            return;
        }
        let new_direction = if self.cwnd_bytes > self.last_recorded_cwnd {
            Direction::Up
        } else {
            Direction::Down
        };
        if new_direction == self.direction {
            self.times_direction_same += 1;
            if self.times_direction_same >= VELOCITY_RAMP_DELAY {
                self.velocity = (self.velocity * 2.0).min(MAX_VELOCITY);
            }
        } else {
            self.direction = new_direction;
            self.velocity = 1.0;
            self.times_direction_same = 0;
        }
        self.last_record_time_us = now_us;
        self.last_recorded_cwnd = self.cwnd_bytes;
    }

    fn clamp_cwnd(&mut self) {
        self.cwnd_bytes = self.cwnd_bytes.clamp(self.min_cwnd_bytes, self.max_cwnd_bytes);
    }

    fn recompute_period(&mut self, standing_rtt_us: u64) {
        if standing_rtt_us == 0 {
            return;
        }
        let cwnd_pkts = (self.cwnd_bytes / self.mss).max(1.0);
        self.pkt_send_period_us = standing_rtt_us as f64 / cwnd_pkts;
    }
}

impl CongestionCtrl for CopaCc {
    fn on_ack(&mut self, view: &CcView, ev: &AckEvent) {
        let now = view.now_us;
        self.min_rtt.update(view.last_rtt_us, now);
        self.standing_rtt.set_window((view.rtt_us / 2).max(1));
        self.standing_rtt.update(view.last_rtt_us, now);

        let rtt_min = self.min_rtt.best();
        let rtt_standing = self.standing_rtt.best();
        if rtt_standing == 0 {
            log::error!("copa: standing RTT filter empty on ACK");
            return;
        }
        let queuing_delay_us = view.last_rtt_us.saturating_sub(rtt_min);

        let increase_cwnd = if queuing_delay_us == 0 {
            // No measurable queue yet; the target rate is unbounded.
            true
        } else {
            let target_rate =
                self.mss * 1_000_000.0 / (self.latency_factor * queuing_delay_us as f64);
            let current_rate = self.cwnd_bytes * 1_000_000.0 / rtt_standing as f64;
            target_rate >= current_rate
        };

        if !(increase_cwnd && self.slow_start) {
            self.check_and_update_direction(now, view.rtt_us);
        }

        let acked_bytes = (ev.acked_pkts as f64) * self.mss;
        if increase_cwnd {
            if self.slow_start {
                // Double once per RTT until the target rate is crossed.
                match self.last_double_time_us {
                    None => self.last_double_time_us = Some(now),
                    Some(last) if now.saturating_sub(last) > view.rtt_us => {
                        self.cwnd_bytes *= 2.0;
                        self.last_double_time_us = Some(now);
                    }
                    Some(_) => {}
                }
            } else {
                if self.direction != Direction::Up && self.velocity > 1.0 {
                    // A stale high velocity pointed the other way.
                    self.change_direction(Direction::Up, now);
                }
                let addition = acked_bytes * self.mss * self.velocity
                    / (self.latency_factor * self.cwnd_bytes);
                self.cwnd_bytes += addition;
            }
        } else {
            if self.direction != Direction::Down && self.velocity > 1.0 {
                self.change_direction(Direction::Down, now);
            }
            self.slow_start = false;
            let reduction =
                acked_bytes * self.mss * self.velocity / (self.latency_factor * self.cwnd_bytes);
            self.cwnd_bytes -= reduction.min(self.cwnd_bytes - self.min_cwnd_bytes);
        }
        self.clamp_cwnd();
        self.recompute_period(rtt_standing);
    }

    fn on_loss(&mut self, _view: &CcView, ranges: &[SeqRange]) {
        if ranges.is_empty() {
            return;
        }
        // Copa reacts to delay, not loss; still, a genuine loss burst
        // means the queue overflowed somewhere.
        self.slow_start = false;
        self.cwnd_bytes = (self.cwnd_bytes / 2.0).max(self.min_cwnd_bytes);
        self.velocity = 1.0;
        self.direction = Direction::Down;
        self.times_direction_same = 0;
    }

    fn on_timer(&mut self, _view: &CcView, _stage: TimerStage) {}

    fn rexmit_method(&self) -> RexmitMethod {
        RexmitMethod::Late
    }

    fn cwnd(&self) -> f64 {
        self.cwnd_bytes / self.mss
    }

    fn pkt_send_period_us(&self) -> f64 {
        self.pkt_send_period_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::SeqNo;

    fn view(now_us: u64, last_rtt_us: u64) -> CcView {
        CcView {
            now_us,
            rtt_us: 40_000,
            last_rtt_us,
            mss: 1456,
            snd_curr_seq: SeqNo::new(0),
            snd_loss_len: 0,
            delivery_rate_pktps: 0,
            bandwidth_pktps: 0,
            flow_window: 8192,
        }
    }

    fn ack(pkts: usize) -> AckEvent {
        AckEvent {
            ack_seq: SeqNo::new(0),
            acked_pkts: pkts,
            acked_bytes: pkts * 1456,
        }
    }

    fn controller() -> CopaCc {
        CopaCc::new(&Options::file())
    }

    #[test]
    fn slow_start_doubles_once_per_rtt() {
        let mut cc = controller();
        let start = cc.cwnd();
        // Flat RTT: no queuing delay, so the window keeps doubling.
        cc.on_ack(&view(1_000, 40_000), &ack(10));
        assert_eq!(cc.cwnd(), start); // first ack only arms the timer
        cc.on_ack(&view(42_000, 40_000), &ack(10));
        assert_eq!(cc.cwnd(), start * 2.0);
        cc.on_ack(&view(50_000, 40_000), &ack(10)); // same RTT period
        assert_eq!(cc.cwnd(), start * 2.0);
        cc.on_ack(&view(95_000, 40_000), &ack(10));
        assert_eq!(cc.cwnd(), start * 4.0);
    }

    #[test]
    fn queuing_delay_above_target_shrinks_the_window() {
        let mut cc = controller();
        // Establish a 40 ms floor.
        cc.on_ack(&view(1_000, 40_000), &ack(10));
        // Large standing queue: 140 ms RTT, 100 ms of queuing delay.
        // target = 1456e6 / (0.5 * 100_000) = 29_120 B/s;
        // current = cwnd(14560) * 1e6 / standing >> target.
        let before = cc.cwnd();
        cc.on_ack(&view(2_000, 140_000), &ack(10));
        assert!(cc.cwnd() < before);
        assert!(!cc.slow_start);
    }

    #[test]
    fn window_never_falls_below_the_floor() {
        let mut cc = controller();
        cc.on_ack(&view(1_000, 40_000), &ack(10));
        for i in 0..100 {
            cc.on_ack(&view(2_000 + i * 1000, 500_000), &ack(10));
        }
        assert!(cc.cwnd() >= 4.0);
    }

    #[test]
    fn loss_halves_the_window() {
        let mut cc = controller();
        let before = cc.cwnd_bytes;
        cc.on_loss(&view(1_000, 40_000), &[SeqRange::single(SeqNo::new(9))]);
        assert_eq!(cc.cwnd_bytes, before / 2.0);
        assert!(!cc.slow_start);
        assert_eq!(cc.velocity, 1.0);
    }

    #[test]
    fn period_tracks_window_and_standing_rtt() {
        let mut cc = controller();
        cc.on_ack(&view(1_000, 40_000), &ack(10));
        // 10 packets over 40 ms -> 4 ms per packet.
        let period = cc.pkt_send_period_us();
        assert!((period - 4000.0).abs() < 10.0, "period = {}", period);
    }
}
