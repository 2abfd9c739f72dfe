//! Connection establishment: the handshake body codec, extension TLVs,
//! the anti-spoof cookie, and the rendezvous tie-break.
//!
//! A caller first sends an induction request and gets back a cookie
//! derived from its address and a minute-granularity salt; only a
//! conclusion request echoing a valid cookie makes the listener commit
//! state. Version-5 conclusions append extension blocks: the negotiated
//! latency and capability flags, key material, and the stream id.

use crate::error::RejectReason;
use crate::seq::SeqNo;
use bytes::Bytes;
use garnet_binary::{BinaryError, BinaryReader, BinaryWriter};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const HS_VERSION_LEGACY: u32 = 4;
pub const HS_VERSION: u32 = 5;
/// Induction magic, echoed in the extension field.
pub const HS_MAGIC: u16 = 0x4A17;

/// Handshake request type carried in the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsReqType {
    Induction,
    Conclusion,
    /// Rendezvous: both sides calling.
    Waveahand,
    /// Rendezvous: parameters agreed.
    Agreement,
    /// Refusal, with the reason.
    Reject(RejectReason),
}

impl HsReqType {
    pub fn encode(self) -> i32 {
        match self {
            HsReqType::Induction => 1,
            HsReqType::Conclusion => 0,
            HsReqType::Waveahand => -1,
            HsReqType::Agreement => -2,
            HsReqType::Reject(reason) => -(reason.code() as i32),
        }
    }

    pub fn decode(value: i32) -> Result<Self, BinaryError> {
        Ok(match value {
            1 => HsReqType::Induction,
            0 => HsReqType::Conclusion,
            -1 => HsReqType::Waveahand,
            -2 => HsReqType::Agreement,
            v if v <= -1000 => HsReqType::Reject(RejectReason::from_code((-v) as u32)),
            v => {
                return Err(BinaryError::InvalidData(format!(
                    "unknown handshake request type {}",
                    v
                )));
            }
        })
    }
}

/// Extension block type codes.
pub mod ext_type {
    pub const HS_REQ: u16 = 1;
    pub const HS_RSP: u16 = 2;
    pub const KM_REQ: u16 = 3;
    pub const KM_RSP: u16 = 4;
    pub const STREAM_ID: u16 = 5;
    pub const CONGESTION: u16 = 6;
    pub const FILTER: u16 = 7;
    pub const GROUP: u16 = 8;
}

/// Capability flags inside the HSREQ/HSRSP block.
pub mod hs_flags {
    pub const TSBPD_SND: u32 = 0x0001;
    pub const TSBPD_RCV: u32 = 0x0002;
    pub const CRYPT: u32 = 0x0004;
    pub const TL_PKT_DROP: u32 = 0x0008;
    pub const NAK_REPORT: u32 = 0x0010;
    pub const REXMIT_FLAG: u32 = 0x0020;
    pub const STREAM: u32 = 0x0040;
}

/// The HSREQ/HSRSP extension: protocol version, capability flags and the
/// TsbPd latency proposal in both directions (milliseconds on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsCaps {
    pub version: u32,
    pub flags: u32,
    pub snd_latency_ms: u16,
    pub rcv_latency_ms: u16,
}

/// One decoded extension block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HsExtension {
    HsReq(HsCaps),
    HsRsp(HsCaps),
    KmReq(Bytes),
    KmRsp(Bytes),
    StreamId(String),
    Congestion(String),
    /// Recognized-by-code but uninterpreted blocks (filter, group) and
    /// everything from a newer peer; kept for accounting.
    Unknown { ext_type: u16, body: Bytes },
}

/// The handshake control-packet body.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeInfo {
    pub version: u32,
    /// Advertised cipher family (key length in 8-byte units, 0 = none).
    pub encryption: u16,
    /// Induction: the magic. Conclusion: extension presence flags.
    pub extension: u16,
    pub init_seq: SeqNo,
    pub mss: u32,
    pub flow_window: u32,
    pub req_type: HsReqType,
    pub socket_id: u32,
    pub cookie: u32,
    pub peer_ip: IpAddr,
    pub extensions: Vec<HsExtension>,
}

impl HandshakeInfo {
    pub fn new(req_type: HsReqType, socket_id: u32, init_seq: SeqNo) -> Self {
        Self {
            version: HS_VERSION,
            encryption: 0,
            extension: 0,
            init_seq,
            mss: 1500,
            flow_window: 25_600,
            req_type,
            socket_id,
            cookie: 0,
            peer_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            extensions: Vec::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = BinaryWriter::with_capacity(48 + self.extensions.len() * 16);
        w.write_u32(self.version);
        w.write_u16(self.encryption);
        w.write_u16(self.extension);
        w.write_u32(self.init_seq.value());
        w.write_u32(self.mss);
        w.write_u32(self.flow_window);
        w.write_i32(self.req_type.encode());
        w.write_u32(self.socket_id);
        w.write_u32(self.cookie);
        w.write_ip(&self.peer_ip);
        for ext in &self.extensions {
            encode_extension(&mut w, ext);
        }
        w.freeze()
    }

    pub fn decode(body: &Bytes) -> Result<Self, BinaryError> {
        let mut r = BinaryReader::new(body.clone());
        let version = r.read_u32()?;
        let encryption = r.read_u16()?;
        let extension = r.read_u16()?;
        let init_seq = SeqNo::new(r.read_u32()?);
        let mss = r.read_u32()?;
        let flow_window = r.read_u32()?;
        let req_type = HsReqType::decode(r.read_i32()?)?;
        let socket_id = r.read_u32()?;
        let cookie = r.read_u32()?;
        let peer_ip = r.read_ip()?;
        let mut extensions = Vec::new();
        let mut unknown = 0usize;
        while r.remaining() >= 4 {
            let ext = decode_extension(&mut r)?;
            if matches!(ext, HsExtension::Unknown { .. }) {
                unknown += 1;
            }
            extensions.push(ext);
        }
        if unknown > 0 {
            log::debug!("handshake carried {} unrecognized extension blocks", unknown);
        }
        Ok(Self {
            version,
            encryption,
            extension,
            init_seq,
            mss,
            flow_window,
            req_type,
            socket_id,
            cookie,
            peer_ip,
            extensions,
        })
    }

    pub fn find_caps(&self) -> Option<HsCaps> {
        self.extensions.iter().find_map(|e| match e {
            HsExtension::HsReq(caps) | HsExtension::HsRsp(caps) => Some(*caps),
            _ => None,
        })
    }

    pub fn find_stream_id(&self) -> Option<&str> {
        self.extensions.iter().find_map(|e| match e {
            HsExtension::StreamId(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn find_km(&self) -> Option<&Bytes> {
        self.extensions.iter().find_map(|e| match e {
            HsExtension::KmReq(b) | HsExtension::KmRsp(b) => Some(b),
            _ => None,
        })
    }
}

fn encode_extension(w: &mut BinaryWriter, ext: &HsExtension) {
    match ext {
        HsExtension::HsReq(caps) | HsExtension::HsRsp(caps) => {
            let code = if matches!(ext, HsExtension::HsReq(_)) {
                ext_type::HS_REQ
            } else {
                ext_type::HS_RSP
            };
            w.write_u16(code);
            w.write_u16(3); // words
            w.write_u32(caps.version);
            w.write_u32(caps.flags);
            w.write_u16(caps.snd_latency_ms);
            w.write_u16(caps.rcv_latency_ms);
        }
        HsExtension::KmReq(body) | HsExtension::KmRsp(body) => {
            let code = if matches!(ext, HsExtension::KmReq(_)) {
                ext_type::KM_REQ
            } else {
                ext_type::KM_RSP
            };
            let padded = body.len().div_ceil(4);
            w.write_u16(code);
            w.write_u16(padded as u16);
            w.write_bytes(body);
            w.pad_to(4);
        }
        HsExtension::StreamId(s) | HsExtension::Congestion(s) => {
            let code = if matches!(ext, HsExtension::StreamId(_)) {
                ext_type::STREAM_ID
            } else {
                ext_type::CONGESTION
            };
            let padded = s.len().div_ceil(4);
            w.write_u16(code);
            w.write_u16(padded as u16);
            w.write_bytes(s.as_bytes());
            w.pad_to(4);
        }
        HsExtension::Unknown { ext_type, body } => {
            w.write_u16(*ext_type);
            w.write_u16(body.len().div_ceil(4) as u16);
            w.write_bytes(body);
            w.pad_to(4);
        }
    }
}

fn decode_extension(r: &mut BinaryReader) -> Result<HsExtension, BinaryError> {
    let code = r.read_u16()?;
    let words = r.read_u16()? as usize;
    let body = r.read_bytes(words * 4)?;
    Ok(match code {
        ext_type::HS_REQ | ext_type::HS_RSP => {
            if body.len() < 12 {
                return Err(BinaryError::InvalidData(
                    "handshake capability block too short".into(),
                ));
            }
            let mut br = BinaryReader::new(body);
            let caps = HsCaps {
                version: br.read_u32()?,
                flags: br.read_u32()?,
                snd_latency_ms: br.read_u16()?,
                rcv_latency_ms: br.read_u16()?,
            };
            if code == ext_type::HS_REQ {
                HsExtension::HsReq(caps)
            } else {
                HsExtension::HsRsp(caps)
            }
        }
        ext_type::KM_REQ => HsExtension::KmReq(body),
        ext_type::KM_RSP => HsExtension::KmRsp(body),
        ext_type::STREAM_ID | ext_type::CONGESTION => {
            let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
            let text = std::str::from_utf8(&body[..end])
                .map_err(|_| BinaryError::InvalidData("extension text is not UTF-8".into()))?
                .to_string();
            if code == ext_type::STREAM_ID {
                HsExtension::StreamId(text)
            } else {
                HsExtension::Congestion(text)
            }
        }
        other => HsExtension::Unknown {
            ext_type: other,
            body,
        },
    })
}

/// Anti-spoof cookie source. The cookie binds the peer address to a
/// minute-granularity salt under a random per-listener secret; a cookie
/// from the current or the previous minute validates, anything older is
/// refused.
pub struct CookieJar {
    secret: [u8; 16],
}

/// Salt rotation period.
const COOKIE_PERIOD_US: u64 = 60_000_000;

impl CookieJar {
    pub fn new() -> Self {
        let mut secret = [0u8; 16];
        rand::rng().fill_bytes(&mut secret);
        Self { secret }
    }

    fn cookie_at(&self, addr: &SocketAddr, window: u64) -> u32 {
        type HmacSha1 = Hmac<Sha1>;
        let mut mac =
            HmacSha1::new_from_slice(&self.secret).expect("hmac accepts any key length");
        match addr.ip() {
            IpAddr::V4(v4) => mac.update(&v4.octets()),
            IpAddr::V6(v6) => mac.update(&v6.octets()),
        }
        mac.update(&addr.port().to_be_bytes());
        mac.update(&window.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    pub fn generate(&self, addr: &SocketAddr, now_us: u64) -> u32 {
        self.cookie_at(addr, now_us / COOKIE_PERIOD_US)
    }

    /// Accepts the current and the immediately preceding salt window.
    pub fn verify(&self, addr: &SocketAddr, cookie: u32, now_us: u64) -> bool {
        let window = now_us / COOKIE_PERIOD_US;
        if self.cookie_at(addr, window) == cookie {
            return true;
        }
        window > 0 && self.cookie_at(addr, window - 1) == cookie
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

/// Rendezvous tie-break: the side with the larger socket id drives the
/// conclusion exchange.
pub fn rendezvous_initiator(local_socket_id: u32, peer_socket_id: u32) -> bool {
    local_socket_id > peer_socket_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HandshakeInfo {
        let mut hs = HandshakeInfo::new(HsReqType::Conclusion, 0x1234, SeqNo::new(777));
        hs.encryption = 4;
        hs.extension = 0b101;
        hs.mss = 1400;
        hs.flow_window = 8192;
        hs.cookie = 0xDEAD_BEEF;
        hs.peer_ip = "10.1.2.3".parse().unwrap();
        hs.extensions = vec![
            HsExtension::HsReq(HsCaps {
                version: 0x0001_0500,
                flags: hs_flags::TSBPD_SND | hs_flags::TSBPD_RCV | hs_flags::TL_PKT_DROP,
                snd_latency_ms: 120,
                rcv_latency_ms: 120,
            }),
            HsExtension::StreamId("#!::u=alice,m=publish".into()),
            HsExtension::KmReq(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8])),
        ];
        hs
    }

    #[test]
    fn handshake_round_trip() {
        let hs = sample();
        let decoded = HandshakeInfo::decode(&hs.encode()).unwrap();
        assert_eq!(decoded, hs);
        assert_eq!(decoded.find_stream_id(), Some("#!::u=alice,m=publish"));
        assert!(decoded.find_caps().is_some());
        assert!(decoded.find_km().is_some());
    }

    #[test]
    fn induction_has_no_extensions() {
        let mut hs = HandshakeInfo::new(HsReqType::Induction, 42, SeqNo::new(1));
        hs.extension = HS_MAGIC;
        let decoded = HandshakeInfo::decode(&hs.encode()).unwrap();
        assert_eq!(decoded.req_type, HsReqType::Induction);
        assert_eq!(decoded.extension, HS_MAGIC);
        assert!(decoded.extensions.is_empty());
    }

    #[test]
    fn stream_id_pads_to_word_boundary() {
        let mut hs = HandshakeInfo::new(HsReqType::Conclusion, 1, SeqNo::new(1));
        hs.extensions = vec![HsExtension::StreamId("abcde".into())];
        let raw = hs.encode();
        // Fixed part 48 bytes + 4 TLV header + 8 padded body.
        assert_eq!(raw.len(), 48 + 4 + 8);
        let decoded = HandshakeInfo::decode(&raw).unwrap();
        assert_eq!(decoded.find_stream_id(), Some("abcde"));
    }

    #[test]
    fn reject_reason_round_trips_through_req_type() {
        for reason in [
            RejectReason::BadSecret,
            RejectReason::Unsecure,
            RejectReason::Peer,
            RejectReason::Timeout,
        ] {
            let encoded = HsReqType::Reject(reason).encode();
            assert_eq!(HsReqType::decode(encoded).unwrap(), HsReqType::Reject(reason));
        }
    }

    #[test]
    fn unknown_extension_is_preserved_not_fatal() {
        let mut hs = HandshakeInfo::new(HsReqType::Conclusion, 1, SeqNo::new(1));
        hs.extensions = vec![HsExtension::Unknown {
            ext_type: 0x7A7A,
            body: Bytes::from_static(&[9, 9, 9, 9]),
        }];
        let decoded = HandshakeInfo::decode(&hs.encode()).unwrap();
        assert_eq!(decoded.extensions.len(), 1);
        assert!(matches!(
            decoded.extensions[0],
            HsExtension::Unknown { ext_type: 0x7A7A, .. }
        ));
    }

    #[test]
    fn cookie_verifies_within_two_windows() {
        let jar = CookieJar::new();
        let addr: SocketAddr = "192.168.1.5:4200".parse().unwrap();
        let t0 = 30_000_000u64; // middle of minute 0
        let cookie = jar.generate(&addr, t0);
        assert_ne!(cookie, 0);

        assert!(jar.verify(&addr, cookie, t0));
        // Next minute still validates (previous window).
        assert!(jar.verify(&addr, cookie, t0 + 60_000_000));
        // Two minutes later it does not.
        assert!(!jar.verify(&addr, cookie, t0 + 120_000_000));
    }

    #[test]
    fn cookie_is_address_bound() {
        let jar = CookieJar::new();
        let a: SocketAddr = "192.168.1.5:4200".parse().unwrap();
        let b: SocketAddr = "192.168.1.5:4201".parse().unwrap();
        let cookie = jar.generate(&a, 0);
        assert!(!jar.verify(&b, cookie, 0));
    }

    #[test]
    fn cookies_differ_between_jars() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let c1 = CookieJar::new().generate(&addr, 0);
        let c2 = CookieJar::new().generate(&addr, 0);
        assert_ne!(c1, c2);
    }

    #[test]
    fn rendezvous_tie_break_is_antisymmetric() {
        assert!(rendezvous_initiator(10, 5));
        assert!(!rendezvous_initiator(5, 10));
        assert!(!rendezvous_initiator(7, 7));
    }
}
