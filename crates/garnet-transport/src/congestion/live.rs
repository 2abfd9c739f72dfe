//! Congestion control for live streams.
//!
//! A live source produces at its own pace; the controller only spaces
//! packets to the configured bandwidth ceiling and never throttles below
//! the input rate. The window is pinned to the flow window so flow
//! control alone limits the flight size.

use super::{AckEvent, CcView, CongestionCtrl, RexmitMethod, TimerStage};
use crate::options::Options;
use crate::packet::SeqRange;

/// Extra headroom over the measured input rate when only `input-bw` is
/// configured.
const INPUT_BW_OVERHEAD: f64 = 0.25;

pub struct LiveCc {
    pkt_send_period_us: f64,
    cwnd: f64,
    /// Smoothed payload size of acknowledged packets.
    avg_pkt_size: f64,
    maxbw_bps: i64,
    input_bw_bps: i64,
}

impl LiveCc {
    pub fn new(opts: &Options) -> Self {
        let mut cc = Self {
            pkt_send_period_us: 1.0,
            cwnd: opts.flow_window as f64,
            avg_pkt_size: opts.max_payload_size() as f64,
            maxbw_bps: opts.maxbw_bps,
            input_bw_bps: opts.input_bw_bps,
        };
        cc.recompute_period();
        cc
    }

    fn effective_bw(&self) -> i64 {
        if self.maxbw_bps > 0 {
            self.maxbw_bps
        } else if self.input_bw_bps > 0 {
            (self.input_bw_bps as f64 * (1.0 + INPUT_BW_OVERHEAD)) as i64
        } else {
            0
        }
    }

    fn recompute_period(&mut self) {
        let bw = self.effective_bw();
        self.pkt_send_period_us = if bw > 0 {
            self.avg_pkt_size * 1_000_000.0 / bw as f64
        } else {
            // Unrestricted: pace only enough to avoid a pure burst loop.
            1.0
        };
    }
}

impl CongestionCtrl for LiveCc {
    fn on_ack(&mut self, _view: &CcView, ev: &AckEvent) {
        if ev.acked_pkts > 0 {
            let sample = ev.acked_bytes as f64 / ev.acked_pkts as f64;
            self.avg_pkt_size = self.avg_pkt_size * 0.875 + sample * 0.125;
            self.recompute_period();
        }
    }

    fn on_loss(&mut self, _view: &CcView, _ranges: &[SeqRange]) {
        // Loss does not slow a live source; recovery relies on
        // retransmission within the latency budget.
    }

    fn on_timer(&mut self, _view: &CcView, _stage: TimerStage) {}

    fn update_bandwidth(&mut self, maxbw_bps: i64, input_bw_bps: i64) {
        if maxbw_bps != 0 {
            self.maxbw_bps = maxbw_bps;
        }
        if input_bw_bps != 0 {
            self.input_bw_bps = input_bw_bps;
        }
        self.recompute_period();
    }

    fn rexmit_method(&self) -> RexmitMethod {
        RexmitMethod::Fast
    }

    fn cwnd(&self) -> f64 {
        self.cwnd
    }

    fn pkt_send_period_us(&self) -> f64 {
        self.pkt_send_period_us
    }
}
