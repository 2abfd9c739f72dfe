//! AIMD-style congestion control for bulk transfer.
//!
//! Slow-start grows the window by the acked packet count until it hits
//! the flow window, then the controller switches to rate mode: every
//! control interval the send period shrinks toward the estimated
//! bandwidth, and each fresh loss epoch stretches it by 3%. A randomized
//! decrement counter desynchronizes competing flows, and decreases are
//! capped at five per congestion epoch.

use super::{AckEvent, CcView, CongestionCtrl, RexmitMethod, TimerStage};
use crate::options::Options;
use crate::packet::SeqRange;
use crate::seq::SeqNo;
use rand::Rng;

/// Rate-control interval, microseconds.
const RC_INTERVAL_US: u64 = 10_000;

pub struct FileCc {
    last_rc_time_us: u64,
    slow_start: bool,
    last_ack: SeqNo,
    loss_since_update: bool,
    /// Highest sequence sent when the last decrease fired.
    last_dec_seq: SeqNo,
    last_dec_period: f64,
    nak_count: u32,
    dec_random: u32,
    avg_nak_num: u32,
    dec_count: u32,

    cwnd: f64,
    max_cwnd: f64,
    pkt_send_period_us: f64,
    /// Bandwidth ceiling in bytes per second; 0 = unlimited.
    max_rate_bps: i64,
}

impl FileCc {
    pub fn new(opts: &Options) -> Self {
        Self {
            last_rc_time_us: 0,
            slow_start: true,
            last_ack: SeqNo::new(0),
            loss_since_update: false,
            last_dec_seq: SeqNo::new(0).prev(),
            last_dec_period: 1.0,
            nak_count: 0,
            dec_random: 1,
            avg_nak_num: 0,
            dec_count: 0,
            cwnd: 16.0,
            max_cwnd: opts.flow_window as f64,
            pkt_send_period_us: 1.0,
            max_rate_bps: if opts.maxbw_bps > 0 { opts.maxbw_bps } else { 0 },
        }
    }

    /// Initializes the ACK baseline once the connection is up.
    pub fn set_initial_ack(&mut self, snd_seq: SeqNo) {
        self.last_ack = snd_seq;
        self.last_dec_seq = snd_seq.prev();
    }

    fn leave_slow_start(&mut self, view: &CcView) {
        self.slow_start = false;
        if view.delivery_rate_pktps > 0 {
            self.pkt_send_period_us = 1_000_000.0 / view.delivery_rate_pktps as f64;
        } else {
            self.pkt_send_period_us = self.cwnd / (view.rtt_us as f64 + RC_INTERVAL_US as f64);
        }
    }

    fn enforce_max_rate(&mut self, view: &CcView) {
        if self.max_rate_bps > 0 {
            let min_period = 1_000_000.0 / (self.max_rate_bps as f64 / view.mss as f64);
            if self.pkt_send_period_us < min_period {
                self.pkt_send_period_us = min_period;
            }
        }
    }
}

impl CongestionCtrl for FileCc {
    fn init(&mut self, isn: SeqNo) {
        self.set_initial_ack(isn);
    }

    fn on_ack(&mut self, view: &CcView, ev: &AckEvent) {
        if view.now_us.saturating_sub(self.last_rc_time_us) < RC_INTERVAL_US {
            return;
        }
        self.last_rc_time_us = view.now_us;

        if self.slow_start {
            self.cwnd += self.last_ack.len_to(ev.ack_seq) as f64 - 1.0;
            self.last_ack = ev.ack_seq;
            if self.cwnd > self.max_cwnd {
                log::debug!(
                    "file cc: slow start ended, cwnd={:.1}/{:.1}",
                    self.cwnd,
                    self.max_cwnd
                );
                self.leave_slow_start(view);
            }
        } else {
            // Speed mode: keep the window matched to the delivery rate.
            self.cwnd = view.delivery_rate_pktps as f64 / 1_000_000.0
                * (view.rtt_us as f64 + RC_INTERVAL_US as f64)
                + 16.0;
        }

        if !self.slow_start {
            if self.loss_since_update {
                self.loss_since_update = false;
            } else {
                // Probe upward: target a rate step an order of magnitude
                // below the spare bandwidth, never less than one byte per
                // packet-time.
                let loss_bw = if self.last_dec_period > 0.0 {
                    2.0 * (1_000_000.0 / self.last_dec_period)
                } else {
                    f64::MAX
                };
                let bw_pktps = loss_bw.min(view.bandwidth_pktps as f64);
                let spare = bw_pktps - 1_000_000.0 / self.pkt_send_period_us;
                let mss = view.mss as f64;
                let inc = if spare <= 0.0 {
                    1.0 / mss
                } else {
                    (10f64.powf((spare * mss * 8.0).log10().ceil()) * 0.0000015 / mss)
                        .max(1.0 / mss)
                };
                self.pkt_send_period_us = (self.pkt_send_period_us * RC_INTERVAL_US as f64)
                    / (self.pkt_send_period_us * inc + RC_INTERVAL_US as f64);
            }
        }
        self.enforce_max_rate(view);
    }

    fn on_loss(&mut self, view: &CcView, ranges: &[SeqRange]) {
        let Some(first) = ranges.first() else {
            log::error!("file cc: loss event with an empty list");
            return;
        };

        if self.slow_start {
            // First loss ends slow start immediately.
            self.leave_slow_start(view);
        }

        self.loss_since_update = true;
        let loss_begin = first.from;

        if loss_begin.after(self.last_dec_seq) {
            // A new congestion epoch: slow down 3% and re-roll the
            // randomized decrement threshold.
            self.last_dec_period = self.pkt_send_period_us;
            self.pkt_send_period_us = (self.pkt_send_period_us * 1.03).ceil();

            self.avg_nak_num =
                (self.avg_nak_num as f64 * 0.97 + self.nak_count as f64 * 0.03).ceil() as u32;
            self.nak_count = 1;
            self.dec_count = 1;
            self.last_dec_seq = view.snd_curr_seq;

            self.dec_random = rand::rng().random_range(1..=self.avg_nak_num.max(1));
        } else {
            self.nak_count += 1;
            if self.dec_count < 5 && self.nak_count % self.dec_random.max(1) == 0 {
                // Within the epoch: at most five decreases total.
                self.dec_count += 1;
                self.pkt_send_period_us = (self.pkt_send_period_us * 1.03).ceil();
                self.last_dec_seq = view.snd_curr_seq;
            }
        }
        self.enforce_max_rate(view);
    }

    fn on_timer(&mut self, view: &CcView, stage: TimerStage) {
        if stage == TimerStage::Init {
            return;
        }
        if self.slow_start {
            log::debug!("file cc: timer check ends slow start");
            self.leave_slow_start(view);
            self.enforce_max_rate(view);
        }
    }

    fn update_bandwidth(&mut self, maxbw_bps: i64, _input_bw_bps: i64) {
        if maxbw_bps != 0 {
            self.max_rate_bps = maxbw_bps.max(0);
        }
    }

    fn needs_quick_ack(&self, payload_len: usize, max_payload: usize) -> bool {
        // A short packet usually ends a message; ask for immediate
        // feedback instead of waiting out the ACK timer.
        payload_len < max_payload
    }

    fn rexmit_method(&self) -> RexmitMethod {
        RexmitMethod::Late
    }

    fn cwnd(&self) -> f64 {
        self.cwnd
    }

    fn pkt_send_period_us(&self) -> f64 {
        self.pkt_send_period_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(now_us: u64) -> CcView {
        CcView {
            now_us,
            rtt_us: 50_000,
            last_rtt_us: 50_000,
            mss: 1456,
            snd_curr_seq: SeqNo::new(10_000),
            snd_loss_len: 0,
            delivery_rate_pktps: 2000,
            bandwidth_pktps: 5000,
            flow_window: 8192,
        }
    }

    fn controller() -> FileCc {
        let mut opts = Options::file();
        opts.flow_window = 8192;
        let mut cc = FileCc::new(&opts);
        cc.set_initial_ack(SeqNo::new(1000));
        cc
    }

    #[test]
    fn starts_in_slow_start() {
        let cc = controller();
        assert!(cc.slow_start);
        assert_eq!(cc.cwnd() as u32, 16);
        assert_eq!(cc.rexmit_method(), RexmitMethod::Late);
    }

    #[test]
    fn slow_start_grows_with_acked_packets() {
        let mut cc = controller();
        cc.on_ack(
            &view(RC_INTERVAL_US),
            &AckEvent {
                ack_seq: SeqNo::new(1100),
                acked_pkts: 100,
                acked_bytes: 145_600,
            },
        );
        assert!(cc.slow_start);
        assert_eq!(cc.cwnd() as u32, 116);
    }

    #[test]
    fn rate_updates_respect_the_control_interval() {
        let mut cc = controller();
        let before = cc.cwnd();
        // Too soon after the previous update: ignored.
        cc.last_rc_time_us = 5_000;
        cc.on_ack(
            &view(9_000),
            &AckEvent {
                ack_seq: SeqNo::new(1100),
                acked_pkts: 100,
                acked_bytes: 145_600,
            },
        );
        assert_eq!(cc.cwnd(), before);
    }

    #[test]
    fn loss_ends_slow_start_and_slows_down() {
        let mut cc = controller();
        cc.on_loss(&view(20_000), &[SeqRange::single(SeqNo::new(1050))]);
        assert!(!cc.slow_start);
        // Delivery rate known: period seeded from it (1e6/2000 = 500us),
        // then stretched 3%.
        assert!(cc.pkt_send_period_us() >= 500.0);
        assert!(cc.loss_since_update);
    }

    #[test]
    fn repeat_loss_in_same_epoch_is_rate_limited() {
        let mut cc = controller();
        cc.on_loss(&view(20_000), &[SeqRange::single(SeqNo::new(1050))]);
        let after_first = cc.pkt_send_period_us();
        assert_eq!(cc.dec_count, 1);

        // Losses before last_dec_seq stay in the same epoch; with
        // dec_random = 1 every report decreases until the cap of 5.
        cc.dec_random = 1;
        for _ in 0..10 {
            cc.on_loss(&view(21_000), &[SeqRange::single(SeqNo::new(1060))]);
        }
        assert_eq!(cc.dec_count, 5);
        let after_epoch = cc.pkt_send_period_us();
        assert!(after_epoch > after_first);
        // 4 more 3% steps at most: bounded well below 1.2x.
        assert!(after_epoch < after_first * 1.2 + 5.0);
    }

    #[test]
    fn new_epoch_reseeds_the_decrement_lottery() {
        let mut cc = controller();
        cc.on_loss(&view(20_000), &[SeqRange::single(SeqNo::new(1050))]);
        // Sequence after last_dec_seq (10_000): a fresh epoch.
        cc.on_loss(&view(30_000), &[SeqRange::single(SeqNo::new(10_500))]);
        assert_eq!(cc.dec_count, 1);
        assert_eq!(cc.nak_count, 1);
        assert!(cc.dec_random >= 1);
    }

    #[test]
    fn maxbw_caps_the_rate() {
        let mut opts = Options::file();
        opts.maxbw_bps = 1_456_000; // 1000 pkt/s -> min period 1000us
        let mut cc = FileCc::new(&opts);
        cc.set_initial_ack(SeqNo::new(1000));
        cc.on_loss(&view(20_000), &[SeqRange::single(SeqNo::new(1050))]);
        assert!(cc.pkt_send_period_us() >= 1000.0);
    }

    #[test]
    fn timer_check_exits_slow_start() {
        let mut cc = controller();
        cc.on_timer(&view(15_000), TimerStage::Init);
        assert!(cc.slow_start);
        cc.on_timer(&view(15_000), TimerStage::Rexmit);
        assert!(!cc.slow_start);
    }

    #[test]
    fn quick_ack_for_short_packets() {
        let cc = controller();
        assert!(cc.needs_quick_ack(100, 1456));
        assert!(!cc.needs_quick_ack(1456, 1456));
    }
}
