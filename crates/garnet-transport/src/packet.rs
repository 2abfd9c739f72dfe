//! Wire codec for data and control datagrams.
//!
//! Every datagram starts with a 16-byte header. The top bit of the first
//! 32-bit word distinguishes data (0) from control (1). All fields are
//! big-endian.
//!
//! ```text
//! Data:    [0|seq:31] [pb:2|o:1|kk:2|r:1|msgno:26] [timestamp] [dst-id] payload
//! Control: [1|type:15|subtype:16] [type-specific]  [timestamp] [dst-id] body
//! ```

use crate::seq::{MsgNo, PacketBoundary, SeqNo};
use bytes::Bytes;
use garnet_binary::{BinaryError, BinaryReader, BinaryWriter};

/// Fixed header length of every datagram.
pub const HEADER_SIZE: usize = 16;

/// Which session key encrypted the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyFlag {
    None = 0,
    Even = 1,
    Odd = 2,
    /// Reserved for control traffic; never set on outgoing data.
    Control = 3,
}

impl KeyFlag {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => KeyFlag::None,
            1 => KeyFlag::Even,
            2 => KeyFlag::Odd,
            _ => KeyFlag::Control,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// A payload-carrying datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub seq: SeqNo,
    pub boundary: PacketBoundary,
    pub in_order: bool,
    pub key_flag: KeyFlag,
    pub retransmitted: bool,
    pub msg_no: MsgNo,
    /// Microseconds since the sender's socket-start instant; wraps.
    pub timestamp: u32,
    pub dst_socket_id: u32,
    pub payload: Bytes,
}

impl DataPacket {
    pub fn encode(&self, w: &mut BinaryWriter) {
        w.write_u32(self.seq.value());
        let flags = (self.boundary.bits() as u32) << 30
            | (self.in_order as u32) << 29
            | (self.key_flag.bits() as u32) << 27
            | (self.retransmitted as u32) << 26
            | self.msg_no.value();
        w.write_u32(flags);
        w.write_u32(self.timestamp);
        w.write_u32(self.dst_socket_id);
        w.write_bytes(&self.payload);
    }

    pub fn decode(r: &mut BinaryReader) -> Result<Self, BinaryError> {
        let first = r.read_u32()?;
        if first & 0x8000_0000 != 0 {
            return Err(BinaryError::InvalidData(
                "control bit set on a data packet".into(),
            ));
        }
        let flags = r.read_u32()?;
        let timestamp = r.read_u32()?;
        let dst_socket_id = r.read_u32()?;
        let payload = r.read_remaining();
        Ok(Self {
            seq: SeqNo::new(first),
            boundary: PacketBoundary::from_bits((flags >> 30) as u8),
            in_order: flags & (1 << 29) != 0,
            key_flag: KeyFlag::from_bits((flags >> 27) as u8),
            retransmitted: flags & (1 << 26) != 0,
            msg_no: MsgNo::new(flags),
            timestamp,
            dst_socket_id,
            payload,
        })
    }
}

/// Control datagram type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlType {
    Handshake = 0,
    KeepAlive = 1,
    Ack = 2,
    Nak = 3,
    CongestionWarning = 4,
    Shutdown = 5,
    AckAck = 6,
    DropReq = 7,
    PeerError = 8,
    UserDefined = 0x7FFF,
}

impl ControlType {
    pub fn from_code(code: u16) -> Result<Self, BinaryError> {
        Ok(match code {
            0 => ControlType::Handshake,
            1 => ControlType::KeepAlive,
            2 => ControlType::Ack,
            3 => ControlType::Nak,
            4 => ControlType::CongestionWarning,
            5 => ControlType::Shutdown,
            6 => ControlType::AckAck,
            7 => ControlType::DropReq,
            8 => ControlType::PeerError,
            0x7FFF => ControlType::UserDefined,
            other => {
                return Err(BinaryError::InvalidData(format!(
                    "unknown control type {:#06x}",
                    other
                )));
            }
        })
    }
}

/// Extended-command codes carried in the subtype field and in handshake
/// extension blocks.
pub mod ext_cmd {
    pub const HS_REQ: u16 = 1;
    pub const HS_RSP: u16 = 2;
    pub const KM_REQ: u16 = 3;
    pub const KM_RSP: u16 = 4;
}

/// A control datagram; the body stays as raw bytes here and is decoded by
/// the interested module (handshake, key material, ACK engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub ctrl_type: ControlType,
    pub subtype: u16,
    /// Meaning depends on the type: ACK journal number for ACK/ACKACK,
    /// message number for DROPREQ, zero otherwise.
    pub type_field: u32,
    pub timestamp: u32,
    pub dst_socket_id: u32,
    pub body: Bytes,
}

impl ControlPacket {
    pub fn new(ctrl_type: ControlType, dst_socket_id: u32, timestamp: u32) -> Self {
        Self {
            ctrl_type,
            subtype: 0,
            type_field: 0,
            timestamp,
            dst_socket_id,
            body: Bytes::new(),
        }
    }

    pub fn encode(&self, w: &mut BinaryWriter) {
        let first = 0x8000_0000 | (self.ctrl_type as u32) << 16 | self.subtype as u32;
        w.write_u32(first);
        w.write_u32(self.type_field);
        w.write_u32(self.timestamp);
        w.write_u32(self.dst_socket_id);
        w.write_bytes(&self.body);
    }

    pub fn decode(r: &mut BinaryReader) -> Result<Self, BinaryError> {
        let first = r.read_u32()?;
        if first & 0x8000_0000 == 0 {
            return Err(BinaryError::InvalidData(
                "data bit set on a control packet".into(),
            ));
        }
        let ctrl_type = ControlType::from_code(((first >> 16) & 0x7FFF) as u16)?;
        let subtype = (first & 0xFFFF) as u16;
        let type_field = r.read_u32()?;
        let timestamp = r.read_u32()?;
        let dst_socket_id = r.read_u32()?;
        let body = r.read_remaining();
        Ok(Self {
            ctrl_type,
            subtype,
            type_field,
            timestamp,
            dst_socket_id,
            body,
        })
    }
}

/// Any decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Control(ControlPacket),
}

impl Packet {
    pub fn decode(raw: Bytes) -> Result<Self, BinaryError> {
        if raw.len() < HEADER_SIZE {
            return Err(BinaryError::UnexpectedEof {
                needed: HEADER_SIZE,
                remaining: raw.len(),
            });
        }
        let mut r = BinaryReader::new(raw);
        if is_control(r.clone()) {
            Ok(Packet::Control(ControlPacket::decode(&mut r)?))
        } else {
            Ok(Packet::Data(DataPacket::decode(&mut r)?))
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = BinaryWriter::with_capacity(HEADER_SIZE + self.payload_len());
        match self {
            Packet::Data(p) => p.encode(&mut w),
            Packet::Control(p) => p.encode(&mut w),
        }
        w.freeze()
    }

    pub fn dst_socket_id(&self) -> u32 {
        match self {
            Packet::Data(p) => p.dst_socket_id,
            Packet::Control(p) => p.dst_socket_id,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Packet::Data(p) => p.payload.len(),
            Packet::Control(p) => p.body.len(),
        }
    }
}

fn is_control(mut r: BinaryReader) -> bool {
    matches!(r.read_u32(), Ok(v) if v & 0x8000_0000 != 0)
}

/// Reads the destination socket id from a raw datagram without decoding
/// it; the receive dispatcher routes on this field.
pub fn peek_dst_socket_id(raw: &[u8]) -> Option<u32> {
    if raw.len() < HEADER_SIZE {
        return None;
    }
    Some(u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]))
}

/// Inclusive range of missing sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    pub from: SeqNo,
    pub to: SeqNo,
}

impl SeqRange {
    pub fn single(seq: SeqNo) -> Self {
        Self { from: seq, to: seq }
    }

    pub fn len(&self) -> i32 {
        self.from.len_to(self.to)
    }

    pub fn is_single(&self) -> bool {
        self.from == self.to
    }
}

/// Statistics block of a full ACK. A light ACK omits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckStats {
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub avail_buf_pkts: u32,
    pub recv_rate_pktps: u32,
    pub link_capacity_pktps: u32,
    pub recv_rate_bps: u32,
}

/// Decoded ACK body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBody {
    /// The next expected sequence; everything before it is acknowledged.
    pub next_seq: SeqNo,
    pub stats: Option<AckStats>,
}

impl AckBody {
    pub fn encode(&self) -> Bytes {
        let mut w = BinaryWriter::with_capacity(28);
        w.write_u32(self.next_seq.value());
        if let Some(s) = &self.stats {
            w.write_u32(s.rtt_us);
            w.write_u32(s.rtt_var_us);
            w.write_u32(s.avail_buf_pkts);
            w.write_u32(s.recv_rate_pktps);
            w.write_u32(s.link_capacity_pktps);
            w.write_u32(s.recv_rate_bps);
        }
        w.freeze()
    }

    pub fn decode(body: &Bytes) -> Result<Self, BinaryError> {
        let mut r = BinaryReader::new(body.clone());
        let next_seq = SeqNo::new(r.read_u32()?);
        let stats = if r.remaining() >= 24 {
            Some(AckStats {
                rtt_us: r.read_u32()?,
                rtt_var_us: r.read_u32()?,
                avail_buf_pkts: r.read_u32()?,
                recv_rate_pktps: r.read_u32()?,
                link_capacity_pktps: r.read_u32()?,
                recv_rate_bps: r.read_u32()?,
            })
        } else {
            None
        };
        Ok(Self { next_seq, stats })
    }
}

const NAK_RANGE_BIT: u32 = 0x8000_0000;

/// Encodes a loss list into the compressed NAK format: a lone sequence is
/// one word, a range is the opening sequence with the top bit set
/// followed by the closing sequence.
pub fn encode_loss_list(ranges: &[SeqRange]) -> Bytes {
    let mut w = BinaryWriter::with_capacity(ranges.len() * 8);
    for range in ranges {
        if range.is_single() {
            w.write_u32(range.from.value());
        } else {
            w.write_u32(range.from.value() | NAK_RANGE_BIT);
            w.write_u32(range.to.value());
        }
    }
    w.freeze()
}

pub fn decode_loss_list(body: &Bytes) -> Result<Vec<SeqRange>, BinaryError> {
    let mut r = BinaryReader::new(body.clone());
    let mut ranges = Vec::new();
    while r.has_remaining() {
        let first = r.read_u32()?;
        if first & NAK_RANGE_BIT != 0 {
            let from = SeqNo::new(first);
            let to = SeqNo::new(r.read_u32()?);
            if !to.after_or_eq(from) {
                return Err(BinaryError::InvalidData(format!(
                    "loss range ends before it starts: {}..{}",
                    from, to
                )));
            }
            ranges.push(SeqRange { from, to });
        } else {
            ranges.push(SeqRange::single(SeqNo::new(first)));
        }
    }
    Ok(ranges)
}

/// Body of a DROPREQ: the sender asks the receiver to give up on the
/// sequence span of an expired message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropReqBody {
    pub first_seq: SeqNo,
    pub last_seq: SeqNo,
}

impl DropReqBody {
    pub fn encode(&self) -> Bytes {
        let mut w = BinaryWriter::with_capacity(8);
        w.write_u32(self.first_seq.value());
        w.write_u32(self.last_seq.value());
        w.freeze()
    }

    pub fn decode(body: &Bytes) -> Result<Self, BinaryError> {
        let mut r = BinaryReader::new(body.clone());
        Ok(Self {
            first_seq: SeqNo::new(r.read_u32()?),
            last_seq: SeqNo::new(r.read_u32()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> DataPacket {
        DataPacket {
            seq: SeqNo::new(1234),
            boundary: PacketBoundary::Solo,
            in_order: true,
            key_flag: KeyFlag::None,
            retransmitted: false,
            msg_no: MsgNo::new(5),
            timestamp: 42_000,
            dst_socket_id: 0xCAFE_BABE,
            payload: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn data_round_trip() {
        let pkt = sample_data();
        let encoded = Packet::Data(pkt.clone()).encode();
        let decoded = Packet::decode(encoded).unwrap();
        assert_eq!(decoded, Packet::Data(pkt));
    }

    #[test]
    fn data_header_layout_is_exact() {
        let encoded = Packet::Data(sample_data()).encode();
        // seq 1234
        assert_eq!(&encoded[0..4], &[0x00, 0x00, 0x04, 0xD2]);
        // solo(3)<<30 | order<<29 | msgno 5 = 0xE0000005
        assert_eq!(&encoded[4..8], &[0xE0, 0x00, 0x00, 0x05]);
        // timestamp 42000 = 0xA410
        assert_eq!(&encoded[8..12], &[0x00, 0x00, 0xA4, 0x10]);
        assert_eq!(&encoded[12..16], &[0xCA, 0xFE, 0xBA, 0xBE]);
        assert_eq!(&encoded[16..], b"hello");
    }

    #[test]
    fn retransmit_and_key_bits() {
        let mut pkt = sample_data();
        pkt.retransmitted = true;
        pkt.key_flag = KeyFlag::Odd;
        pkt.boundary = PacketBoundary::Middle;
        pkt.in_order = false;
        let encoded = Packet::Data(pkt.clone()).encode();
        // odd(2)<<27 | rexmit<<26 | msgno 5
        assert_eq!(&encoded[4..8], &[0x14, 0x00, 0x00, 0x05]);
        let decoded = Packet::decode(encoded).unwrap();
        assert_eq!(decoded, Packet::Data(pkt));
    }

    #[test]
    fn control_round_trip() {
        let mut pkt = ControlPacket::new(ControlType::Ack, 7, 100);
        pkt.type_field = 3; // ack journal number
        pkt.body = AckBody {
            next_seq: SeqNo::new(5000),
            stats: Some(AckStats {
                rtt_us: 100_000,
                rtt_var_us: 50_000,
                avail_buf_pkts: 8192,
                recv_rate_pktps: 1000,
                link_capacity_pktps: 2000,
                recv_rate_bps: 1_456_000,
            }),
        }
        .encode();

        let encoded = Packet::Control(pkt.clone()).encode();
        assert_eq!(&encoded[0..4], &[0x80, 0x02, 0x00, 0x00]);
        let decoded = Packet::decode(encoded).unwrap();
        assert_eq!(decoded, Packet::Control(pkt.clone()));

        let Packet::Control(ctrl) = decoded else {
            unreachable!()
        };
        let ack = AckBody::decode(&ctrl.body).unwrap();
        assert_eq!(ack.next_seq, SeqNo::new(5000));
        assert_eq!(ack.stats.unwrap().rtt_us, 100_000);
    }

    #[test]
    fn light_ack_has_no_stats() {
        let body = AckBody {
            next_seq: SeqNo::new(77),
            stats: None,
        }
        .encode();
        assert_eq!(body.len(), 4);
        let decoded = AckBody::decode(&body).unwrap();
        assert_eq!(decoded.next_seq, SeqNo::new(77));
        assert!(decoded.stats.is_none());
    }

    #[test]
    fn loss_list_compression() {
        let ranges = vec![
            SeqRange::single(SeqNo::new(10)),
            SeqRange {
                from: SeqNo::new(15),
                to: SeqNo::new(19),
            },
            SeqRange::single(SeqNo::new(30)),
        ];
        let body = encode_loss_list(&ranges);
        assert_eq!(body.len(), 4 + 8 + 4);
        assert_eq!(&body[0..4], &[0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(&body[4..8], &[0x80, 0x00, 0x00, 0x0F]);
        let decoded = decode_loss_list(&body).unwrap();
        assert_eq!(decoded, ranges);
    }

    #[test]
    fn loss_list_rejects_inverted_range() {
        let mut w = garnet_binary::BinaryWriter::new();
        w.write_u32(100 | NAK_RANGE_BIT);
        w.write_u32(50);
        assert!(decode_loss_list(&w.freeze()).is_err());
    }

    #[test]
    fn drop_req_round_trip() {
        let body = DropReqBody {
            first_seq: SeqNo::new(100),
            last_seq: SeqNo::new(103),
        };
        assert_eq!(DropReqBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn peek_routes_on_dst_id() {
        let encoded = Packet::Data(sample_data()).encode();
        assert_eq!(peek_dst_socket_id(&encoded), Some(0xCAFE_BABE));
        assert_eq!(peek_dst_socket_id(&encoded[..12]), None);
    }

    #[test]
    fn unknown_control_type_is_an_error() {
        let mut w = garnet_binary::BinaryWriter::new();
        w.write_u32(0x8000_0000 | (0x1234 << 16));
        w.write_u32(0);
        w.write_u32(0);
        w.write_u32(0);
        assert!(Packet::decode(w.freeze()).is_err());
    }

    #[test]
    fn short_datagram_is_rejected() {
        assert!(Packet::decode(Bytes::from_static(&[0u8; 15])).is_err());
    }
}
