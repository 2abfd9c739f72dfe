//! Circular receive ring.
//!
//! ```text
//! |<--------------------- size --------------------------->|
//! |      |<--- acked pkts -->|<---- max_pos ---->|         |
//! +---+--+---+---+---+---+---+---+---+---+---+---+---+
//! | _ | _ | x | x | x | _ | x | x | x | x | _ | x | _ ...
//! +---+--+---+---+---+---+---+---+---+---+---+---+---+
//!          |                 |                |
//!          |                 |                \_ last received
//!          |                 \_ last_ack_pos (exclusive ack point)
//!          \_ start_pos: first packet to read
//! ```
//!
//! The slot at offset `k` from `last_ack_pos` always holds sequence
//! `last_ack_seq + k`. `[start_pos, last_ack_pos)` is acknowledged data
//! awaiting readout; `[last_ack_pos, last_ack_pos + max_pos)` holds
//! arrived-but-unacknowledged packets interleaved with gaps.
//!
//! With TsbPd enabled, readout is additionally gated on each packet's
//! delivery time `time_base + timestamp + delay + drift`, the 32-bit
//! peer timestamp wrap is folded into the 64-bit time base, and the
//! too-late drop discards a leading gap once the first packet behind it
//! is already due for delivery.

use crate::seq::{MsgNo, PacketBoundary, SeqNo};
use bytes::Bytes;

/// 30 seconds, in microseconds: the window on each side of the timestamp
/// wrap point during which wrap detection is active.
const TS_WRAP_PERIOD: u32 = 30 * 1_000_000;

/// Outcome of inserting a packet into the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Ok,
    /// The slot for this sequence is already occupied.
    Duplicate,
    /// The sequence precedes the acknowledged point.
    BeforeAck,
    /// The sequence does not fit into the ring.
    Overflow,
}

/// One stored packet.
#[derive(Debug, Clone)]
pub struct RcvUnit {
    pub msg_no: MsgNo,
    pub boundary: PacketBoundary,
    pub in_order: bool,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Description of the first packet present in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub seq: SeqNo,
    pub acknowledged: bool,
    /// Missing packets precede this one.
    pub seq_gap: bool,
    /// Zero unless TsbPd is enabled.
    pub tsbpd_time_us: u64,
}

#[derive(Debug, Clone, Copy)]
struct Tsbpd {
    delay_us: u64,
    /// 64-bit local base; accumulates wrap carryovers and drift steps.
    time_base_us: u64,
    wrap_check: bool,
    drift_us: i64,
}

#[derive(Debug)]
pub struct RecvBuffer {
    units: Vec<Option<RcvUnit>>,
    size: usize,

    /// Sequence expected at `last_ack_pos`; the first unacknowledged one.
    last_ack_seq: SeqNo,
    start_pos: usize,
    last_ack_pos: usize,
    /// First position that cannot be read (message incomplete or unacked).
    first_unreadable_pos: usize,
    /// Span of slots in use past `last_ack_pos`.
    max_pos: usize,

    num_out_of_order: usize,
    first_readable_ooo: Option<usize>,

    tsbpd: Option<Tsbpd>,
    tl_drop: bool,

    bytes: usize,
    acked_bytes: usize,
}

impl RecvBuffer {
    pub fn new(init_seq: SeqNo, size: usize) -> Self {
        assert!(size > 1);
        Self {
            units: (0..size).map(|_| None).collect(),
            size,
            last_ack_seq: init_seq,
            start_pos: 0,
            last_ack_pos: 0,
            first_unreadable_pos: 0,
            max_pos: 0,
            num_out_of_order: 0,
            first_readable_ooo: None,
            tsbpd: None,
            tl_drop: false,
            bytes: 0,
            acked_bytes: 0,
        }
    }

    /// Enables timestamp-based delivery. `time_base_us` is the local time
    /// corresponding to the peer's timestamp zero (sampled at handshake:
    /// `now - hs_timestamp`).
    pub fn set_tsbpd(&mut self, time_base_us: u64, delay_us: u64, tl_drop: bool) {
        self.tsbpd = Some(Tsbpd {
            delay_us,
            time_base_us,
            wrap_check: false,
            drift_us: 0,
        });
        self.tl_drop = tl_drop;
    }

    pub fn is_tsbpd(&self) -> bool {
        self.tsbpd.is_some()
    }

    /// Applies a drift correction step from the drift tracer.
    pub fn adjust_drift(&mut self, step_us: i64) {
        if let Some(tsbpd) = &mut self.tsbpd {
            tsbpd.drift_us += step_us;
        }
    }

    fn inc_pos(&self, pos: usize) -> usize {
        (pos + 1) % self.size
    }

    fn dec_pos(&self, pos: usize) -> usize {
        (pos + self.size - 1) % self.size
    }

    /// Readable span in packets (acknowledged and pending readout).
    pub fn data_size(&self) -> usize {
        (self.size + self.last_ack_pos - self.start_pos) % self.size
    }

    /// Free slots, keeping one to distinguish full from empty.
    pub fn avail_size(&self) -> usize {
        self.size - self.data_size() - 1
    }

    pub fn next_expected(&self) -> SeqNo {
        self.last_ack_seq
    }

    /// First missing sequence: how far the acknowledgement point may
    /// advance over contiguously received packets.
    pub fn next_ackable(&self) -> SeqNo {
        let mut run = 0usize;
        let mut i = self.last_ack_pos;
        while run < self.max_pos && self.units[i].is_some() {
            run += 1;
            i = self.inc_pos(i);
        }
        self.last_ack_seq.add(run as i32)
    }

    /// Skew sample for the drift tracer: how far ahead of the peer's
    /// timeline (base + timestamp) the local arrival time sits. `None`
    /// without TsbPd.
    pub fn drift_sample(&self, timestamp: u32, now_us: u64) -> Option<i64> {
        let tsbpd = self.tsbpd.as_ref()?;
        let carryover = if tsbpd.wrap_check && timestamp < TS_WRAP_PERIOD {
            u32::MAX as u64 + 1
        } else {
            0
        };
        let peer_time = tsbpd.time_base_us + carryover + timestamp as u64;
        Some(now_us as i64 - peer_time as i64)
    }

    pub fn insert(&mut self, seq: SeqNo, unit: RcvUnit) -> InsertResult {
        let offset = self.last_ack_seq.offset_to(seq);
        if offset < 0 {
            return InsertResult::BeforeAck;
        }
        let offset = offset as usize;
        if offset >= self.size - self.data_size() {
            return InsertResult::Overflow;
        }
        let pos = (self.last_ack_pos + offset) % self.size;
        if self.units[pos].is_some() {
            return InsertResult::Duplicate;
        }
        if offset >= self.max_pos {
            self.max_pos = offset + 1;
        }
        self.bytes += unit.payload.len();
        let track_ooo = !self.is_tsbpd() && !unit.in_order;
        self.units[pos] = Some(unit);
        if track_ooo {
            self.num_out_of_order += 1;
            self.on_insert_out_of_order(pos);
        }
        InsertResult::Ok
    }

    /// Whether the acknowledgement point can advance: the slot right at
    /// the ack position must be filled.
    pub fn can_ack(&self) -> bool {
        self.max_pos > 0 && self.units[self.last_ack_pos].is_some()
    }

    /// Moves the acknowledged point up to (excluding) `next_expected`.
    /// Returns newly acknowledged packets and bytes.
    pub fn ack(&mut self, next_expected: SeqNo) -> (usize, usize) {
        let len = self.last_ack_seq.offset_to(next_expected);
        if len <= 0 {
            return (0, 0);
        }
        let len = len as usize;

        let mut pkts = 0;
        let mut bytes = 0;
        let end = (self.last_ack_pos + len) % self.size;
        let mut i = self.last_ack_pos;
        while i != end {
            if let Some(unit) = &self.units[i] {
                pkts += 1;
                bytes += unit.payload.len();
            }
            i = self.inc_pos(i);
        }
        self.acked_bytes += bytes;

        self.last_ack_pos = end;
        self.max_pos = self.max_pos.saturating_sub(len);
        self.last_ack_seq = next_expected;

        self.update_readable_pos();
        (pkts, bytes)
    }

    /// Forcibly advances over a run of missing packets up to (excluding)
    /// `next_expected`; used when the sender asked to skip them or the
    /// too-late drop fired. Occupied slots on the way are discarded.
    pub fn drop_missing(&mut self, next_expected: SeqNo) -> usize {
        let len = self.last_ack_seq.offset_to(next_expected);
        if len <= 0 {
            return 0;
        }
        let mut dropped = 0;
        for _ in 0..len {
            if let Some(unit) = self.units[self.start_pos].take() {
                self.bytes -= unit.payload.len();
                if !self.is_tsbpd() && !unit.in_order {
                    self.num_out_of_order = self.num_out_of_order.saturating_sub(1);
                }
                dropped += 1;
            }
            self.start_pos = self.inc_pos(self.start_pos);
        }
        self.max_pos = self.max_pos.saturating_sub(len as usize);
        self.last_ack_pos = self.start_pos;
        self.first_unreadable_pos = self.start_pos;
        self.last_ack_seq = next_expected;
        self.first_readable_ooo = None;
        self.update_first_readable_ooo();
        if self.can_ack() {
            self.update_readable_pos();
        }
        dropped
    }

    /// Handles a sender drop request for `[first, last]`: anything before
    /// the acknowledged point is already history; the remainder is walked
    /// over as missing.
    pub fn drop_message(&mut self, first: SeqNo, last: SeqNo) -> usize {
        if !last.after_or_eq(self.last_ack_seq) {
            return 0;
        }
        // Only a leading run can be skipped; packets beyond readable data
        // stay and the gap closes when the span is reached.
        if self.start_pos != self.last_ack_pos {
            return 0;
        }
        let from = if first.after(self.last_ack_seq) {
            first
        } else {
            self.last_ack_seq
        };
        if from != self.last_ack_seq {
            return 0;
        }
        self.drop_missing(last.next())
    }

    /// Readability: in file mode, a complete acknowledged message (or a
    /// complete out-of-order one); with TsbPd also gated on the delivery
    /// time of the first packet.
    pub fn can_read(&self, now_us: u64) -> bool {
        let have_acked = self.has_readable_acked();
        if self.tsbpd.is_none() {
            if have_acked {
                return true;
            }
            return self.num_out_of_order > 0 && self.first_readable_ooo.is_some();
        }
        if !have_acked {
            return false;
        }
        match self.first_packet_info() {
            Some(info) => info.tsbpd_time_us <= now_us,
            None => false,
        }
    }

    fn has_readable_acked(&self) -> bool {
        self.first_unreadable_pos != self.start_pos
    }

    /// Number of acknowledged packets ready for readout.
    pub fn count_readable(&self) -> usize {
        (self.size + self.first_unreadable_pos - self.start_pos) % self.size
    }

    /// Info on the first packet present in the ring, readable or not.
    pub fn first_packet_info(&self) -> Option<PacketInfo> {
        let end_pos = (self.last_ack_pos + self.max_pos) % self.size;
        let mut acknowledged = true;
        let mut i = self.start_pos;
        loop {
            if i == self.last_ack_pos {
                acknowledged = false;
            }
            if let Some(unit) = &self.units[i] {
                let offset = (self.size + i - self.last_ack_pos) % self.size;
                let seq = if acknowledged {
                    let back = (self.size + self.last_ack_pos - i) % self.size;
                    self.last_ack_seq.add(-(back as i32))
                } else {
                    self.last_ack_seq.add(offset as i32)
                };
                return Some(PacketInfo {
                    seq,
                    acknowledged,
                    seq_gap: i != self.start_pos,
                    tsbpd_time_us: self.packet_tsbpd_time(unit.timestamp),
                });
            }
            if i == end_pos {
                return None;
            }
            i = self.inc_pos(i);
        }
    }

    /// Reads one complete message into `dst`. Returns the number of bytes
    /// written, or 0 when nothing is readable (checked via `can_read`).
    pub fn read_message(&mut self, dst: &mut [u8]) -> usize {
        let from_start = self.has_readable_acked();
        let read_pos = if from_start {
            self.start_pos
        } else {
            match self.first_readable_ooo {
                Some(pos) => pos,
                None => return 0,
            }
        };

        let mut written = 0;
        let mut i = read_pos;
        loop {
            let Some(unit) = self.units[i].take() else {
                log::error!("receive ring: hole inside a readable message");
                break;
            };
            let n = unit.payload.len().min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&unit.payload[..n]);
            written += n;
            self.bytes -= unit.payload.len();

            if self.tsbpd.is_some() {
                self.update_time_base(unit.timestamp);
            }
            if !self.is_tsbpd() && !unit.in_order {
                self.num_out_of_order = self.num_out_of_order.saturating_sub(1);
            }

            let last = unit.boundary.ends_message();
            i = self.inc_pos(i);
            if last {
                break;
            }
        }

        if from_start {
            self.start_pos = i;
            self.acked_bytes = self.acked_bytes.saturating_sub(written);
        } else {
            self.first_readable_ooo = None;
        }
        self.update_first_readable_ooo();
        written
    }

    /// Too-late drop: with no readable data and a missing packet right at
    /// the ack point, once the first packet behind the gap is due for
    /// delivery the gap is discarded and the point advanced to it.
    pub fn update_state(&mut self, now_us: u64) {
        if !self.tl_drop {
            return;
        }
        if self.start_pos != self.last_ack_pos {
            return;
        }
        if self.max_pos == 0 {
            return;
        }
        if self.units[self.last_ack_pos].is_some() {
            return;
        }

        let end_pos = (self.last_ack_pos + self.max_pos) % self.size;
        let mut i = self.last_ack_pos;
        while i != end_pos && self.units[i].is_none() {
            i = self.inc_pos(i);
        }
        let Some(unit) = &self.units[i] else {
            return;
        };
        if self.packet_tsbpd_time(unit.timestamp) > now_us {
            return;
        }

        let gap = (self.size + i - self.last_ack_pos) % self.size;
        let skip_to = self.last_ack_seq.add(gap as i32);
        log::debug!(
            "too-late drop: skipping {} missing packets up to {}",
            gap,
            skip_to
        );
        self.drop_missing(skip_to);
    }

    // --- TsbPd time handling -------------------------------------------

    /// Delivery time of a packet carrying `timestamp`, including a wrap
    /// carryover while the wrap-check window is open.
    pub fn packet_tsbpd_time(&self, timestamp: u32) -> u64 {
        let Some(tsbpd) = &self.tsbpd else {
            return 0;
        };
        let carryover = if tsbpd.wrap_check && timestamp < TS_WRAP_PERIOD {
            u32::MAX as u64 + 1
        } else {
            0
        };
        let base = tsbpd.time_base_us + carryover + timestamp as u64 + tsbpd.delay_us;
        (base as i64).saturating_add(tsbpd.drift_us) as u64
    }

    /// Tracks the peer timestamp as packets are delivered and commits the
    /// 2^32 µs carryover once the wrap point is safely passed.
    fn update_time_base(&mut self, timestamp: u32) {
        let Some(tsbpd) = &mut self.tsbpd else {
            return;
        };
        if tsbpd.wrap_check {
            if (TS_WRAP_PERIOD..=TS_WRAP_PERIOD * 2).contains(&timestamp) {
                // Past the second window: the wrap is committed.
                tsbpd.wrap_check = false;
                tsbpd.time_base_us += u32::MAX as u64 + 1;
            }
            return;
        }
        if timestamp > u32::MAX - TS_WRAP_PERIOD {
            tsbpd.wrap_check = true;
        }
    }

    // --- out-of-order message delivery (file message mode) -------------

    fn on_insert_out_of_order(&mut self, insert_pos: usize) {
        if self.first_readable_ooo.is_some() {
            return;
        }
        let unit = self.units[insert_pos].as_ref().unwrap();
        let boundary = unit.boundary;
        let msg_no = unit.msg_no;

        let has_last =
            boundary.ends_message() || self.scan_message_right(insert_pos, msg_no).is_some();
        if !has_last {
            return;
        }
        let first_pos = if boundary.starts_message() {
            Some(insert_pos)
        } else {
            self.scan_message_left(insert_pos, msg_no)
        };
        if let Some(pos) = first_pos {
            self.first_readable_ooo = Some(pos);
        }
    }

    fn update_first_readable_ooo(&mut self) {
        if self.has_readable_acked()
            || self.num_out_of_order == 0
            || self.first_readable_ooo.is_some()
        {
            return;
        }
        if self.max_pos == 0 {
            return;
        }
        let last_pos = (self.last_ack_pos + self.max_pos - 1) % self.size;
        let mut remain = self.num_out_of_order;
        let mut pos_first: Option<usize> = None;
        let mut msg_no: Option<MsgNo> = None;

        let mut pos = self.start_pos;
        while remain > 0 {
            let Some(unit) = &self.units[pos] else {
                pos_first = None;
                msg_no = None;
                if pos == last_pos {
                    break;
                }
                pos = self.inc_pos(pos);
                continue;
            };
            if unit.in_order {
                pos_first = None;
                msg_no = None;
                if pos == last_pos {
                    break;
                }
                pos = self.inc_pos(pos);
                continue;
            }
            remain -= 1;

            if unit.boundary.starts_message() {
                pos_first = Some(pos);
                msg_no = Some(unit.msg_no);
            }
            if msg_no != Some(unit.msg_no) {
                pos_first = None;
                msg_no = None;
            } else if unit.boundary.ends_message() {
                self.first_readable_ooo = pos_first;
                return;
            }
            if pos == last_pos {
                break;
            }
            pos = self.inc_pos(pos);
        }
    }

    fn scan_message_right(&self, start: usize, msg_no: MsgNo) -> Option<usize> {
        if self.max_pos == 0 {
            return None;
        }
        let last_pos = (self.last_ack_pos + self.max_pos - 1) % self.size;
        if start == last_pos {
            return None;
        }
        let mut pos = start;
        loop {
            pos = self.inc_pos(pos);
            let unit = self.units[pos].as_ref()?;
            if unit.msg_no != msg_no {
                return None;
            }
            if unit.boundary.ends_message() {
                return Some(pos);
            }
            if pos == last_pos {
                return None;
            }
        }
    }

    fn scan_message_left(&self, start: usize, msg_no: MsgNo) -> Option<usize> {
        if start == self.start_pos {
            return None;
        }
        let mut pos = start;
        loop {
            pos = self.dec_pos(pos);
            let unit = self.units[pos].as_ref()?;
            if unit.msg_no != msg_no {
                return None;
            }
            if unit.boundary.starts_message() {
                return Some(pos);
            }
            if pos == self.start_pos {
                return None;
            }
        }
    }

    /// Advances the first-unreadable cursor over complete messages inside
    /// the acknowledged span.
    fn update_readable_pos(&mut self) {
        if self.units[self.first_unreadable_pos].is_none() {
            return;
        }
        loop {
            let Some(unit) = &self.units[self.first_unreadable_pos] else {
                break;
            };
            if !unit.boundary.starts_message() {
                break;
            }
            let before = self.first_unreadable_pos;
            let mut i = self.first_unreadable_pos;
            while i != self.last_ack_pos {
                let Some(u) = &self.units[i] else {
                    break;
                };
                if u.boundary.ends_message() {
                    self.first_unreadable_pos = self.inc_pos(i);
                    break;
                }
                i = self.inc_pos(i);
            }
            if self.first_unreadable_pos == before {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: usize = 1456;

    fn unit(boundary: PacketBoundary, msg: u32, bytes: usize) -> RcvUnit {
        RcvUnit {
            msg_no: MsgNo::new(msg),
            boundary,
            in_order: true,
            timestamp: 0,
            payload: Bytes::from(vec![0xAB; bytes]),
        }
    }

    fn ooo_unit(boundary: PacketBoundary, msg: u32, ts: u32) -> RcvUnit {
        RcvUnit {
            msg_no: MsgNo::new(msg),
            boundary,
            in_order: false,
            timestamp: ts,
            payload: Bytes::from(vec![0xCD; PAYLOAD]),
        }
    }

    #[test]
    fn one_message_file_transfer() {
        let init = SeqNo::new(1000);
        let mut buf = RecvBuffer::new(init, 16);
        let boundaries = [
            PacketBoundary::First,
            PacketBoundary::Middle,
            PacketBoundary::Middle,
            PacketBoundary::Last,
        ];
        for (i, b) in boundaries.iter().enumerate() {
            assert_eq!(
                buf.insert(init.add(i as i32), unit(*b, 1, PAYLOAD)),
                InsertResult::Ok
            );
            // Message incomplete (and unacknowledged): not readable.
            if i < 3 {
                buf.ack(init.add(i as i32 + 1));
                assert!(!buf.can_read(0));
            }
        }
        buf.ack(SeqNo::new(1004));
        assert!(buf.can_read(0));

        let mut out = vec![0u8; 4 * PAYLOAD + 100];
        let n = buf.read_message(&mut out);
        assert_eq!(n, 4 * PAYLOAD); // 5824 bytes
        assert!(!buf.can_read(0));
        assert_eq!(buf.data_size(), 0);
        assert_eq!(buf.avail_size(), 15);
    }

    #[test]
    fn insert_result_taxonomy() {
        let init = SeqNo::new(1000);
        let mut buf = RecvBuffer::new(init, 16);
        assert_eq!(
            buf.insert(init, unit(PacketBoundary::Solo, 1, 8)),
            InsertResult::Ok
        );
        assert_eq!(
            buf.insert(init, unit(PacketBoundary::Solo, 1, 8)),
            InsertResult::Duplicate
        );
        assert_eq!(
            buf.insert(init.add(-1), unit(PacketBoundary::Solo, 1, 8)),
            InsertResult::BeforeAck
        );
        assert_eq!(
            buf.insert(init.add(16), unit(PacketBoundary::Solo, 1, 8)),
            InsertResult::Overflow
        );
        // Nothing was mutated by the rejected inserts.
        assert_eq!(buf.max_pos, 1);
    }

    #[test]
    fn out_of_order_solo_messages_read_before_ack() {
        let init = SeqNo::new(1000);
        let mut buf = RecvBuffer::new(init, 16);
        for i in 4..8 {
            assert_eq!(
                buf.insert(init.add(i), ooo_unit(PacketBoundary::Solo, i as u32, 0)),
                InsertResult::Ok
            );
        }
        // No ACK yet, but the messages are out-of-order deliverable.
        assert!(buf.can_read(0));
        let mut out = vec![0u8; PAYLOAD];
        for _ in 0..4 {
            assert_eq!(buf.read_message(&mut out), PAYLOAD);
        }
        assert!(!buf.can_read(0));
        // The acknowledged point can still advance over the leading gap
        // once those packets arrive.
        assert_eq!(
            buf.insert(init, unit(PacketBoundary::Solo, 20, 8)),
            InsertResult::Ok
        );
        buf.ack(init.add(1));
        assert!(buf.can_read(0));
    }

    #[test]
    fn tsbpd_gates_readout() {
        let init = SeqNo::new(1234);
        let mut buf = RecvBuffer::new(init, 16);
        buf.set_tsbpd(100_000, 200_000, true);

        let mut u = unit(PacketBoundary::Solo, 1, PAYLOAD);
        u.timestamp = 200;
        assert_eq!(buf.insert(init, u), InsertResult::Ok);
        buf.ack(SeqNo::new(1235));

        assert!(!buf.can_read(300_199));
        assert!(buf.can_read(300_200));
        assert!(buf.can_read(300_201));
    }

    #[test]
    fn too_late_drop_across_gap() {
        let init = SeqNo::new(1234);
        let mut buf = RecvBuffer::new(init, 16);
        buf.set_tsbpd(100_000, 200_000, true);

        let mut u = unit(PacketBoundary::Solo, 1, PAYLOAD);
        u.timestamp = 200;
        // 1234 is missing; 1235 arrives.
        assert_eq!(buf.insert(init.add(1), u), InsertResult::Ok);

        let info = buf.first_packet_info().unwrap();
        assert_eq!(info.seq, SeqNo::new(1235));
        assert!(info.seq_gap);
        assert!(!info.acknowledged);
        assert_eq!(info.tsbpd_time_us, 300_200);

        assert!(!buf.can_ack());
        assert!(!buf.can_read(300_201));

        // Not yet due: nothing dropped.
        buf.update_state(300_199);
        assert!(!buf.can_ack());

        buf.update_state(300_201);
        assert!(buf.can_ack());
        assert_eq!(buf.next_expected(), SeqNo::new(1235));

        buf.ack(SeqNo::new(1236));
        assert!(buf.can_read(300_201));
        let mut out = vec![0u8; PAYLOAD];
        assert_eq!(buf.read_message(&mut out), PAYLOAD);
    }

    #[test]
    fn timestamp_wrap_keeps_delivery_monotone() {
        let init = SeqNo::new(1);
        let mut buf = RecvBuffer::new(init, 16);
        buf.set_tsbpd(1_000_000, 10_000, false);

        // A packet in the last 30 s window opens the wrap check.
        let pre_wrap_ts = u32::MAX - 1000;
        let mut u = unit(PacketBoundary::Solo, 1, 100);
        u.timestamp = pre_wrap_ts;
        assert_eq!(buf.insert(init, u), InsertResult::Ok);
        buf.ack(init.add(1));
        let t_pre = buf.packet_tsbpd_time(pre_wrap_ts);
        let mut out = vec![0u8; 100];
        buf.read_message(&mut out);

        // A wrapped timestamp now gets the 2^32 carryover.
        let post_wrap_ts = 500;
        let t_post = buf.packet_tsbpd_time(post_wrap_ts);
        assert!(t_post > t_pre);
        assert_eq!(
            t_post,
            1_000_000 + (u32::MAX as u64 + 1) + post_wrap_ts as u64 + 10_000
        );

        // Delivering a packet past the second window commits the base.
        let mut u2 = unit(PacketBoundary::Solo, 2, 100);
        u2.timestamp = TS_WRAP_PERIOD + 5;
        assert_eq!(buf.insert(init.add(1), u2), InsertResult::Ok);
        buf.ack(init.add(2));
        buf.read_message(&mut out);
        let t_committed = buf.packet_tsbpd_time(TS_WRAP_PERIOD * 2 + 7);
        assert_eq!(
            t_committed,
            1_000_000 + (u32::MAX as u64 + 1) + (TS_WRAP_PERIOD * 2 + 7) as u64 + 10_000
        );
    }

    #[test]
    fn drop_message_skips_leading_gap() {
        let init = SeqNo::new(100);
        let mut buf = RecvBuffer::new(init, 16);
        // 100..=102 never arrive; 103 does.
        buf.insert(init.add(3), unit(PacketBoundary::Solo, 4, 10));
        assert!(!buf.can_ack());
        let dropped = buf.drop_message(SeqNo::new(100), SeqNo::new(102));
        assert_eq!(dropped, 0); // all three were missing, none stored
        assert_eq!(buf.next_expected(), SeqNo::new(103));
        assert!(buf.can_ack());
    }

    #[test]
    fn sequence_wrap_reassembly() {
        let init = SeqNo::new(crate::seq::MAX_SEQ - 1);
        let mut buf = RecvBuffer::new(init, 16);
        let seqs = [init, init.add(1), init.add(2), init.add(3)];
        assert_eq!(seqs[2], SeqNo::new(0));
        let boundaries = [
            PacketBoundary::First,
            PacketBoundary::Middle,
            PacketBoundary::Middle,
            PacketBoundary::Last,
        ];
        for (seq, b) in seqs.iter().zip(boundaries) {
            assert_eq!(buf.insert(*seq, unit(b, 9, 10)), InsertResult::Ok);
        }
        buf.ack(init.add(4));
        assert!(buf.can_read(0));
        let mut out = vec![0u8; 64];
        assert_eq!(buf.read_message(&mut out), 40);
    }
}
