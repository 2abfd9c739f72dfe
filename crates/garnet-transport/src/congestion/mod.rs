//! Pluggable congestion control.
//!
//! The connection owns one controller and feeds it events directly:
//! acknowledgements, loss reports, and the periodic timer check. The
//! controller's only outputs are the inter-packet send period and the
//! congestion window, which the transmit loop reads before every send.

use crate::options::{CongestionKind, Options};
use crate::packet::SeqRange;
use crate::seq::SeqNo;

pub mod copa;
pub mod file;
pub mod live;

/// Stage of the periodic timer check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStage {
    /// Synchronization pass at the start of the check; no action.
    Init,
    /// The fast-retransmit pass.
    FastRexmit,
    /// The late-retransmit pass (timeout based).
    Rexmit,
}

/// When the sender may retransmit a missing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RexmitMethod {
    /// Retransmit as soon as the loss is known.
    Fast,
    /// Retransmit only on NAK or timeout.
    Late,
}

/// Snapshot of the connection state a controller may consult. Built by
/// the connection for every event delivery.
#[derive(Debug, Clone, Copy)]
pub struct CcView {
    pub now_us: u64,
    /// Smoothed RTT.
    pub rtt_us: u64,
    /// Most recent raw RTT sample.
    pub last_rtt_us: u64,
    /// Payload bytes per full packet.
    pub mss: usize,
    /// Highest sequence sent so far.
    pub snd_curr_seq: SeqNo,
    /// Standing entries in the sender loss list.
    pub snd_loss_len: usize,
    /// Peer-reported receiving rate, packets per second (0 = unknown).
    pub delivery_rate_pktps: u64,
    /// Peer-estimated link capacity, packets per second (0 = unknown).
    pub bandwidth_pktps: u64,
    pub flow_window: usize,
}

/// Data accompanying an ACK event.
#[derive(Debug, Clone, Copy)]
pub struct AckEvent {
    pub ack_seq: SeqNo,
    pub acked_pkts: usize,
    pub acked_bytes: usize,
}

pub trait CongestionCtrl: Send {
    /// Called once when the connection settles, with the first sequence
    /// the sender will use.
    fn init(&mut self, _isn: SeqNo) {}

    fn on_ack(&mut self, view: &CcView, ev: &AckEvent);

    fn on_loss(&mut self, view: &CcView, ranges: &[SeqRange]);

    fn on_timer(&mut self, view: &CcView, stage: TimerStage);

    fn update_bandwidth(&mut self, _maxbw_bps: i64, _input_bw_bps: i64) {}

    /// Whether this data packet should be acknowledged without waiting
    /// for the periodic ACK timer.
    fn needs_quick_ack(&self, _payload_len: usize, _max_payload: usize) -> bool {
        false
    }

    fn rexmit_method(&self) -> RexmitMethod;

    /// Congestion window, in packets.
    fn cwnd(&self) -> f64;

    /// Inter-packet send period, in microseconds.
    fn pkt_send_period_us(&self) -> f64;
}

/// Builds the controller selected by the options.
pub fn make_controller(opts: &Options) -> Box<dyn CongestionCtrl> {
    match opts.congestion {
        CongestionKind::Live => Box::new(live::LiveCc::new(opts)),
        CongestionKind::File | CongestionKind::FileV2 => Box::new(file::FileCc::new(opts)),
        CongestionKind::Copa => Box::new(copa::CopaCc::new(opts)),
    }
}
