//! Ordered store of outgoing payloads.
//!
//! Entries are appended in strictly increasing sequence order and evicted
//! strictly from the head as acknowledgements arrive. Retransmission
//! fetches entries by sequence number; in live mode a head message whose
//! delivery deadline has passed is dropped and reported so the peer can
//! be told to skip it.

use crate::error::{Result, TransportError};
use crate::packet::SeqRange;
use crate::seq::{MsgNo, PacketBoundary, SeqNo};
use bytes::Bytes;
use std::collections::VecDeque;

/// A packet is no longer eligible for retransmission after this many
/// attempts; the link is considered dead long before.
pub const MAX_REXMIT: u32 = 64;

/// Extra slack added to the TsbPd deadline before the sender gives up on
/// a message (two handshake-retry intervals).
pub const DROP_SLACK_US: u64 = 20_000;

#[derive(Debug)]
struct SndEntry {
    seq: SeqNo,
    msg_no: MsgNo,
    boundary: PacketBoundary,
    in_order: bool,
    payload: Bytes,
    origin_time_us: u64,
    sent: bool,
    rexmit_count: u32,
}

/// Everything the transmit loop needs to put one stored packet on the wire.
#[derive(Debug, Clone)]
pub struct SendItem {
    pub seq: SeqNo,
    pub msg_no: MsgNo,
    pub boundary: PacketBoundary,
    pub in_order: bool,
    pub payload: Bytes,
    pub origin_time_us: u64,
    pub retransmitted: bool,
}

#[derive(Debug)]
pub struct SendBuffer {
    entries: VecDeque<SndEntry>,
    capacity: usize,
    max_payload: usize,
    next_seq: SeqNo,
    next_msg_no: MsgNo,
    /// Index of the first entry that has never been transmitted.
    first_unsent: usize,
    bytes: usize,
}

impl SendBuffer {
    pub fn new(isn: SeqNo, capacity_pkts: usize, max_payload: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity_pkts.min(1024)),
            capacity: capacity_pkts,
            max_payload,
            next_seq: isn,
            next_msg_no: MsgNo::FIRST,
            first_unsent: 0,
            bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Packets that can still be appended before the buffer refuses.
    pub fn free_pkts(&self) -> usize {
        self.capacity - self.entries.len()
    }

    pub fn has_unsent(&self) -> bool {
        self.first_unsent < self.entries.len()
    }

    /// Sequence that will be assigned to the next added packet.
    pub fn next_seq(&self) -> SeqNo {
        self.next_seq
    }

    /// Splits `data` into MSS-sized packets forming one message and
    /// appends them. Returns the sequence span assigned to the message.
    pub fn add_message(&mut self, data: &[u8], in_order: bool, now_us: u64) -> Result<SeqRange> {
        if data.is_empty() {
            return Err(TransportError::Internal("empty message".into()));
        }
        let limit = self.capacity * self.max_payload;
        if data.len() > limit {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                limit,
            });
        }
        let pkts = data.len().div_ceil(self.max_payload);
        if pkts > self.free_pkts() {
            return Err(TransportError::BufferFull);
        }

        let msg_no = self.next_msg_no;
        self.next_msg_no = self.next_msg_no.next();

        let first = self.next_seq;
        let payload = Bytes::copy_from_slice(data);
        for (i, chunk) in payload.chunks(self.max_payload).enumerate() {
            let boundary = match (i == 0, i == pkts - 1) {
                (true, true) => PacketBoundary::Solo,
                (true, false) => PacketBoundary::First,
                (false, true) => PacketBoundary::Last,
                (false, false) => PacketBoundary::Middle,
            };
            let offset = i * self.max_payload;
            self.entries.push_back(SndEntry {
                seq: self.next_seq,
                msg_no,
                boundary,
                in_order,
                payload: payload.slice(offset..offset + chunk.len()),
                origin_time_us: now_us,
                sent: false,
                rexmit_count: 0,
            });
            self.bytes += chunk.len();
            self.next_seq = self.next_seq.next();
        }
        Ok(SeqRange {
            from: first,
            to: self.next_seq.prev(),
        })
    }

    /// Takes the next never-sent packet for original transmission.
    pub fn next_new_packet(&mut self) -> Option<SendItem> {
        let entry = self.entries.get_mut(self.first_unsent)?;
        entry.sent = true;
        let item = SendItem {
            seq: entry.seq,
            msg_no: entry.msg_no,
            boundary: entry.boundary,
            in_order: entry.in_order,
            payload: entry.payload.clone(),
            origin_time_us: entry.origin_time_us,
            retransmitted: false,
        };
        self.first_unsent += 1;
        Some(item)
    }

    /// Fetches a previously sent packet for retransmission. Returns
    /// `None` when the sequence was already evicted or the packet has
    /// exhausted its retransmission budget.
    pub fn rexmit_packet(&mut self, seq: SeqNo) -> Option<SendItem> {
        let front = self.entries.front()?.seq;
        let offset = front.offset_to(seq);
        if offset < 0 {
            return None;
        }
        let entry = self.entries.get_mut(offset as usize)?;
        if !entry.sent || entry.rexmit_count >= MAX_REXMIT {
            return None;
        }
        entry.rexmit_count += 1;
        Some(SendItem {
            seq: entry.seq,
            msg_no: entry.msg_no,
            boundary: entry.boundary,
            in_order: entry.in_order,
            payload: entry.payload.clone(),
            origin_time_us: entry.origin_time_us,
            retransmitted: true,
        })
    }

    /// Evicts every packet before `next_expected` (the ACK'd point).
    /// Returns the number of packets and bytes released.
    pub fn ack_up_to(&mut self, next_expected: SeqNo) -> (usize, usize) {
        let mut pkts = 0;
        let mut bytes = 0;
        while let Some(front) = self.entries.front() {
            if !front.seq.after_or_eq(next_expected) {
                let entry = self.entries.pop_front().unwrap();
                pkts += 1;
                bytes += entry.payload.len();
                self.first_unsent = self.first_unsent.saturating_sub(1);
            } else {
                break;
            }
        }
        self.bytes -= bytes;
        (pkts, bytes)
    }

    /// Live mode: if the head message has outlived its delivery deadline
    /// (`origin + tsbpd_delay + slack`), removes the whole message and
    /// returns its span so a drop request can be emitted.
    pub fn drop_expired(&mut self, now_us: u64, tsbpd_delay_us: u64) -> Option<(MsgNo, SeqRange)> {
        let head = self.entries.front()?;
        if head.origin_time_us + tsbpd_delay_us + DROP_SLACK_US > now_us {
            return None;
        }
        let msg_no = head.msg_no;
        let first = head.seq;
        let mut last = head.seq;
        let mut dropped_bytes = 0;
        while let Some(front) = self.entries.front() {
            if front.msg_no != msg_no {
                break;
            }
            last = front.seq;
            dropped_bytes += front.payload.len();
            self.entries.pop_front();
            self.first_unsent = self.first_unsent.saturating_sub(1);
        }
        self.bytes -= dropped_bytes;
        Some((msg_no, SeqRange { from: first, to: last }))
    }
}
