//! Per-connection state: the handshake state machine, both pipelines,
//! and the timer-driven control loop.
//!
//! Lock order inside a connection is `state < send < recv < ack`; the
//! key-material lock is leaf-level and never held across another lock.
//! Workers call in with a current timestamp, application threads block on
//! the send/receive events until the corresponding worker wakes them.

use crate::ack::{AckWindow, DriftTracer, PktTimeWindow, ReorderTolerance, RttFilter};
use crate::buffer::recv::RcvUnit;
use crate::buffer::{InsertResult, RecvBuffer, SendBuffer};
use crate::congestion::{self, AckEvent, CcView, CongestionCtrl, RexmitMethod, TimerStage};
use crate::error::{RejectReason, Result, TransportError};
use crate::handshake::{
    HandshakeInfo, HsCaps, HsExtension, HsReqType, HS_MAGIC, HS_VERSION, hs_flags,
};
use crate::km::{KeyMaterial, KmMessage, KmState};
use crate::loss::{ReceiverLossList, SenderLossList};
use crate::options::{CryptoMode, Options, TransType};
use crate::packet::{
    AckBody, AckStats, ControlPacket, ControlType, DataPacket, DropReqBody, KeyFlag, Packet,
    SeqRange, decode_loss_list, encode_loss_list,
};
use crate::seq::SeqNo;
use crate::sync::{Clock, SyncEvent};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Handshake retry period.
pub const SYN_INTERVAL_US: u64 = 10_000;
/// Periodic full-ACK interval.
pub const ACK_INTERVAL_US: u64 = 10_000;
/// Data packets between forced ACKs.
pub const ACK_PKT_INTERVAL: u32 = 64;
/// Data packets between light ACKs at high rates.
pub const LIGHT_ACK_PKT_INTERVAL: u32 = 64;
/// Keep-alive after this much send silence.
pub const KEEPALIVE_INTERVAL_US: u64 = 1_000_000;
/// Lower bound for the NAK re-report deadline.
pub const MIN_NAK_INTERVAL_US: u64 = 20_000;

/// Where this datagram goes; the core hands encoded datagrams to this
/// endpoint rather than owning a socket.
pub trait PacketSender: Send + Sync {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl PacketSender for std::net::UdpSocket {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        std::net::UdpSocket::send_to(self, data, addr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Opened,
    Listening,
    Connecting,
    Connected,
    Broken,
    Closing,
    Closed,
    Nonexist,
}

/// Which side of the handshake this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Caller,
    Listener,
    Rendezvous,
}

struct StateData {
    state: ConnState,
    reject: Option<RejectReason>,
}

struct SendSide {
    buffer: SendBuffer,
    loss: SenderLossList,
    cc: Box<dyn CongestionCtrl>,
    /// Highest sequence actually transmitted.
    curr_seq: SeqNo,
    /// Next-expected sequence from the newest ACK.
    last_ack_seq: SeqNo,
    next_send_time_us: u64,
    last_send_time_us: u64,
    /// Smoothed values lifted from peer ACK statistics.
    rtt_us: u64,
    last_rtt_us: u64,
    delivery_rate_pktps: u64,
    bandwidth_pktps: u64,
    /// Last time the acknowledged point moved forward.
    last_ack_progress_us: u64,
}

struct RecvSide {
    buffer: Option<RecvBuffer>,
    /// Highest sequence seen from the peer.
    curr_seq: SeqNo,
}

struct AckSide {
    loss: ReceiverLossList,
    ack_window: AckWindow,
    rtt: RttFilter,
    drift: DriftTracer,
    time_window: PktTimeWindow,
    reorder: ReorderTolerance,
    next_ack_no: u32,
    last_full_ack_seq: SeqNo,
    last_ack_time_us: u64,
    pkts_since_ack: u32,
    pkts_since_light_ack: u32,
    quick_ack: bool,
}

struct HsCtx {
    role: HandshakeRole,
    last_sent: Option<HandshakeInfo>,
    last_send_time_us: u64,
    deadline_us: u64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_socket_id", &self.local_socket_id)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

pub struct Connection {
    pub local_socket_id: u32,
    pub peer_addr: SocketAddr,
    clock: Clock,
    opts: Options,
    sender: Arc<dyn PacketSender>,
    /// Local socket-start instant; packet timestamps count from here.
    start_time_us: u64,

    state: Mutex<StateData>,
    peer_socket_id: AtomicU32,
    hs: Mutex<HsCtx>,
    send: Mutex<SendSide>,
    recv: Mutex<RecvSide>,
    ackd: Mutex<AckSide>,
    km: Mutex<Option<KeyMaterial>>,

    /// Wakes application senders blocked on a full buffer.
    pub snd_event: SyncEvent,
    /// Wakes application receivers blocked on an empty buffer.
    pub rcv_event: SyncEvent,

    last_peer_time_us: Mutex<u64>,
    closed_flag: AtomicBool,
}

impl Connection {
    pub fn new(
        role: HandshakeRole,
        opts: Options,
        local_socket_id: u32,
        peer_addr: SocketAddr,
        sender: Arc<dyn PacketSender>,
        clock: Clock,
        km: Option<KeyMaterial>,
    ) -> Arc<Self> {
        let now = clock.now_us();
        let isn = SeqNo::random();
        let mut cc = congestion::make_controller(&opts);
        cc.init(isn);
        let snd_buf = SendBuffer::new(isn, opts.snd_buf_pkts, opts.max_payload_size());
        Arc::new(Self {
            local_socket_id,
            peer_addr,
            clock,
            sender,
            start_time_us: now,
            state: Mutex::new(StateData {
                state: ConnState::Init,
                reject: None,
            }),
            peer_socket_id: AtomicU32::new(0),
            hs: Mutex::new(HsCtx {
                role,
                last_sent: None,
                last_send_time_us: 0,
                deadline_us: now + opts.conn_timeout_ms * 1000,
            }),
            send: Mutex::new(SendSide {
                buffer: snd_buf,
                loss: SenderLossList::new(),
                cc,
                curr_seq: isn.prev(),
                last_ack_seq: isn,
                next_send_time_us: 0,
                last_send_time_us: 0,
                rtt_us: 100_000,
                last_rtt_us: 100_000,
                delivery_rate_pktps: 0,
                bandwidth_pktps: 0,
                last_ack_progress_us: now,
            }),
            recv: Mutex::new(RecvSide {
                buffer: None,
                curr_seq: SeqNo::new(0),
            }),
            ackd: Mutex::new(AckSide {
                loss: ReceiverLossList::new(),
                ack_window: AckWindow::new(),
                rtt: RttFilter::new(),
                drift: DriftTracer::new(),
                time_window: PktTimeWindow::new(),
                reorder: ReorderTolerance::new(opts.reorder_tolerance_max),
                next_ack_no: 1,
                last_full_ack_seq: SeqNo::new(0),
                last_ack_time_us: now,
                pkts_since_ack: 0,
                pkts_since_light_ack: 0,
                quick_ack: false,
            }),
            km: Mutex::new(km),
            snd_event: SyncEvent::new(),
            rcv_event: SyncEvent::new(),
            last_peer_time_us: Mutex::new(now),
            opts,
            closed_flag: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn state(&self) -> ConnState {
        self.state.lock().unwrap().state
    }

    pub fn peer_socket_id(&self) -> u32 {
        self.peer_socket_id.load(Ordering::Relaxed)
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        self.state.lock().unwrap().reject
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn is_defunct(&self) -> bool {
        matches!(
            self.state(),
            ConnState::Broken | ConnState::Closing | ConnState::Closed
        )
    }

    fn timestamp(&self, now_us: u64) -> u32 {
        (now_us - self.start_time_us) as u32
    }

    fn set_state(&self, new: ConnState) {
        let mut st = self.state.lock().unwrap();
        if st.state == new {
            return;
        }
        log::debug!(
            "socket @{}: {:?} -> {:?}",
            self.local_socket_id,
            st.state,
            new
        );
        st.state = new;
        drop(st);
        if matches!(
            new,
            ConnState::Broken | ConnState::Closing | ConnState::Closed | ConnState::Connected
        ) {
            // Any terminal or ready transition releases every waiter.
            self.snd_event.notify();
            self.rcv_event.notify();
        }
    }

    fn send_control(&self, mut pkt: ControlPacket) {
        pkt.dst_socket_id = self.peer_socket_id();
        pkt.timestamp = self.timestamp(self.clock.now_us());
        let raw = Packet::Control(pkt).encode();
        if let Err(e) = self.sender.send_to(&raw, self.peer_addr) {
            log::warn!("socket @{}: control send failed: {}", self.local_socket_id, e);
        }
    }

    // ----------------------------------------------------------------
    // Handshake
    // ----------------------------------------------------------------

    /// Starts the caller (or rendezvous) exchange. Retries are driven by
    /// `tick()` until the conclusion lands or the deadline passes.
    pub fn start_connect(&self, now_us: u64) {
        self.set_state(ConnState::Connecting);
        let role = self.hs.lock().unwrap().role;
        let mut hs = HandshakeInfo::new(
            match role {
                HandshakeRole::Rendezvous => HsReqType::Waveahand,
                _ => HsReqType::Induction,
            },
            self.local_socket_id,
            self.send.lock().unwrap().buffer.next_seq(),
        );
        hs.extension = HS_MAGIC;
        hs.mss = self.opts.mss as u32;
        hs.flow_window = self.opts.flow_window as u32;
        hs.peer_ip = self.peer_addr.ip();
        self.send_handshake(hs, now_us);
    }

    fn send_handshake(&self, hs: HandshakeInfo, now_us: u64) {
        let mut pkt = ControlPacket::new(ControlType::Handshake, 0, 0);
        pkt.body = hs.encode();
        {
            let mut ctx = self.hs.lock().unwrap();
            ctx.last_sent = Some(hs);
            ctx.last_send_time_us = now_us;
        }
        self.send_control(pkt);
    }

    fn caps_flags(&self) -> u32 {
        let mut flags = hs_flags::REXMIT_FLAG;
        if self.opts.tsbpd_mode {
            flags |= hs_flags::TSBPD_SND | hs_flags::TSBPD_RCV;
        }
        if self.opts.too_late_drop {
            flags |= hs_flags::TL_PKT_DROP;
        }
        if self.opts.nak_report {
            flags |= hs_flags::NAK_REPORT;
        }
        if self.opts.crypto_mode != CryptoMode::None {
            flags |= hs_flags::CRYPT;
        }
        if self.opts.transtype == TransType::File && !self.opts.messageapi {
            flags |= hs_flags::STREAM;
        }
        flags
    }

    fn conclusion_extensions(&self, response: bool) -> Result<Vec<HsExtension>> {
        let caps = HsCaps {
            version: 0x0001_0500,
            flags: self.caps_flags(),
            snd_latency_ms: (self.opts.tsbpd_delay_us / 1000) as u16,
            rcv_latency_ms: (self.opts.tsbpd_delay_us / 1000) as u16,
        };
        let mut exts = vec![if response {
            HsExtension::HsRsp(caps)
        } else {
            HsExtension::HsReq(caps)
        }];
        if !response && !self.opts.stream_id.is_empty() {
            exts.push(HsExtension::StreamId(self.opts.stream_id.clone()));
        }
        let km = self.km.lock().unwrap();
        if let Some(km) = km.as_ref() {
            if response {
                if let Some(echo) = km.response() {
                    exts.push(HsExtension::KmRsp(echo.encode()));
                }
            } else {
                exts.push(HsExtension::KmReq(km.initial_request()?.encode()));
            }
        }
        Ok(exts)
    }

    /// Feeds a handshake control packet into the state machine.
    pub fn on_handshake(&self, body: &Bytes, pkt_timestamp: u32, now_us: u64) {
        let info = match HandshakeInfo::decode(body) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("socket @{}: bad handshake: {}", self.local_socket_id, e);
                return;
            }
        };
        let role = self.hs.lock().unwrap().role;
        match (role, info.req_type) {
            (_, HsReqType::Reject(reason)) => {
                log::warn!(
                    "socket @{}: connection rejected by peer: {}",
                    self.local_socket_id,
                    reason
                );
                self.state.lock().unwrap().reject = Some(reason);
                self.set_state(ConnState::Broken);
            }
            (HandshakeRole::Caller, HsReqType::Induction) => {
                // The cookie response. A version-4 peer never echoes the
                // magic and cannot serve this protocol.
                if info.extension != HS_MAGIC || info.version != HS_VERSION {
                    self.state.lock().unwrap().reject = Some(RejectReason::Version);
                    self.set_state(ConnState::Broken);
                    return;
                }
                let exts = match self.conclusion_extensions(false) {
                    Ok(exts) => exts,
                    Err(e) => {
                        log::error!("socket @{}: {}", self.local_socket_id, e);
                        self.set_state(ConnState::Broken);
                        return;
                    }
                };
                let mut hs = HandshakeInfo::new(
                    HsReqType::Conclusion,
                    self.local_socket_id,
                    self.send.lock().unwrap().buffer.next_seq(),
                );
                hs.cookie = info.cookie;
                hs.mss = self.opts.mss as u32;
                hs.flow_window = self.opts.flow_window as u32;
                hs.peer_ip = self.peer_addr.ip();
                hs.encryption = (self.opts.pb_key_len / 8) as u16;
                hs.extensions = exts;
                self.send_handshake(hs, now_us);
            }
            (HandshakeRole::Caller, HsReqType::Conclusion) => {
                if self.is_connected() {
                    return; // duplicate response
                }
                self.finalize(&info, pkt_timestamp, now_us);
            }
            (HandshakeRole::Rendezvous, HsReqType::Waveahand) => {
                if crate::handshake::rendezvous_initiator(self.local_socket_id, info.socket_id) {
                    let exts = match self.conclusion_extensions(false) {
                        Ok(exts) => exts,
                        Err(e) => {
                            log::error!("socket @{}: {}", self.local_socket_id, e);
                            self.set_state(ConnState::Broken);
                            return;
                        }
                    };
                    let mut hs = HandshakeInfo::new(
                        HsReqType::Conclusion,
                        self.local_socket_id,
                        self.send.lock().unwrap().buffer.next_seq(),
                    );
                    hs.mss = self.opts.mss as u32;
                    hs.flow_window = self.opts.flow_window as u32;
                    hs.peer_ip = self.peer_addr.ip();
                    hs.extensions = exts;
                    self.send_handshake(hs, now_us);
                }
                // The responder keeps waving until a conclusion arrives.
            }
            (HandshakeRole::Rendezvous, HsReqType::Conclusion) => {
                if !self.is_connected() {
                    // The tie-break winner's key material governs; adopt
                    // its session key before answering.
                    if let Some(km_body) = info.find_km() {
                        if let Ok(msg) = KmMessage::decode(km_body) {
                            let state = {
                                let mut km = self.km.lock().unwrap();
                                km.as_mut()
                                    .map(|km| km.on_request(&msg, self.opts.passphrase.as_deref()))
                            };
                            if let Some(reason) =
                                state.and_then(KeyMaterial::reject_reason)
                            {
                                if self.opts.enforced_encryption {
                                    self.state.lock().unwrap().reject = Some(reason);
                                    self.set_state(ConnState::Broken);
                                    return;
                                }
                            }
                        }
                    }
                    // Answer with our own conclusion so the initiator can
                    // finalize too.
                    let exts = match self.conclusion_extensions(true) {
                        Ok(exts) => exts,
                        Err(e) => {
                            log::error!("socket @{}: {}", self.local_socket_id, e);
                            self.set_state(ConnState::Broken);
                            return;
                        }
                    };
                    let mut hs = HandshakeInfo::new(
                        HsReqType::Agreement,
                        self.local_socket_id,
                        self.send.lock().unwrap().buffer.next_seq(),
                    );
                    hs.mss = self.opts.mss as u32;
                    hs.flow_window = self.opts.flow_window as u32;
                    hs.peer_ip = self.peer_addr.ip();
                    hs.extensions = exts;
                    self.finalize(&info, pkt_timestamp, now_us);
                    self.send_handshake(hs, now_us);
                }
            }
            (HandshakeRole::Rendezvous, HsReqType::Agreement) => {
                if !self.is_connected() {
                    self.finalize(&info, pkt_timestamp, now_us);
                }
            }
            (HandshakeRole::Listener, HsReqType::Conclusion) => {
                // Response lost; repeat it.
                let ctx = self.hs.lock().unwrap();
                if let Some(prev) = ctx.last_sent.clone() {
                    drop(ctx);
                    log::debug!(
                        "socket @{}: repeating conclusion response",
                        self.local_socket_id
                    );
                    self.send_handshake(prev, now_us);
                }
            }
            (role, ty) => {
                log::debug!(
                    "socket @{}: ignoring handshake {:?} in role {:?}",
                    self.local_socket_id,
                    ty,
                    role
                );
            }
        }
    }

    /// Listener side: absorbs the caller's conclusion and produces the
    /// response to send back. The connection is Connected afterwards.
    pub fn accept_conclusion(
        &self,
        info: &HandshakeInfo,
        pkt_timestamp: u32,
        now_us: u64,
    ) -> Result<()> {
        // Key material first; a failure refuses the whole connection.
        if let Some(km_body) = info.find_km() {
            let msg = KmMessage::decode(km_body)
                .map_err(|e| TransportError::MalformedPacket(e.to_string()))?;
            let mut km_guard = self.km.lock().unwrap();
            let state = match km_guard.as_mut() {
                Some(km) => {
                    let state = km.on_request(&msg, self.opts.passphrase.as_deref());
                    if state == KmState::Secured {
                        km.mark_secured();
                    }
                    state
                }
                None => KmState::NoSecret,
            };
            drop(km_guard);
            if state != KmState::Secured {
                if self.opts.enforced_encryption {
                    let reason =
                        KeyMaterial::reject_reason(state).unwrap_or(RejectReason::Unsecure);
                    self.state.lock().unwrap().reject = Some(reason);
                    return Err(TransportError::Rejected(reason));
                }
                log::warn!(
                    "socket @{}: continuing unencrypted (km state {:?})",
                    self.local_socket_id,
                    state
                );
            }
        } else if self.opts.passphrase.is_some() && self.opts.enforced_encryption {
            self.state.lock().unwrap().reject = Some(RejectReason::Unsecure);
            return Err(TransportError::Rejected(RejectReason::Unsecure));
        }

        self.finalize(info, pkt_timestamp, now_us);

        let exts = self.conclusion_extensions(true)?;
        let mut resp = HandshakeInfo::new(
            HsReqType::Conclusion,
            self.local_socket_id,
            self.send.lock().unwrap().buffer.next_seq(),
        );
        resp.mss = self.opts.mss.min(info.mss as usize) as u32;
        resp.flow_window = self.opts.flow_window as u32;
        resp.peer_ip = self.peer_addr.ip();
        resp.extensions = exts;
        self.send_handshake(resp, now_us);
        Ok(())
    }

    /// Applies negotiated parameters and brings the connection up.
    fn finalize(&self, info: &HandshakeInfo, pkt_timestamp: u32, now_us: u64) {
        self.peer_socket_id.store(info.socket_id, Ordering::Relaxed);

        let peer_caps = info.find_caps();
        let tsbpd_delay_us = match peer_caps {
            Some(caps) => {
                (caps.snd_latency_ms.max((self.opts.tsbpd_delay_us / 1000) as u16) as u64) * 1000
            }
            None => self.opts.tsbpd_delay_us,
        };

        {
            let mut recv = self.recv.lock().unwrap();
            let mut buffer = RecvBuffer::new(info.init_seq, self.opts.rcv_buf_pkts);
            if self.opts.tsbpd_mode {
                // The peer's timestamp zero maps to (arrival - timestamp)
                // on our clock.
                let base = now_us.saturating_sub(pkt_timestamp as u64);
                buffer.set_tsbpd(base, tsbpd_delay_us, self.opts.too_late_drop);
            }
            recv.buffer = Some(buffer);
            recv.curr_seq = info.init_seq.prev();
        }
        {
            let mut ackd = self.ackd.lock().unwrap();
            ackd.last_full_ack_seq = info.init_seq;
        }

        // A still-pending key exchange is confirmed by the conclusion:
        // the peer would have rejected us on a key failure.
        {
            let mut km = self.km.lock().unwrap();
            if let Some(km) = km.as_mut() {
                if km.state() == KmState::Securing {
                    km.mark_secured();
                }
            }
        }

        self.set_state(ConnState::Connected);
        log::info!(
            "socket @{}: connected to {} (peer @{}, isn {}, latency {} ms)",
            self.local_socket_id,
            self.peer_addr,
            info.socket_id,
            info.init_seq,
            tsbpd_delay_us / 1000
        );
    }

    // ----------------------------------------------------------------
    // Data ingress
    // ----------------------------------------------------------------

    pub fn on_data(&self, pkt: DataPacket, now_us: u64) {
        *self.last_peer_time_us.lock().unwrap() = now_us;

        let payload = {
            let km = self.km.lock().unwrap();
            match km.as_ref() {
                Some(km) if pkt.key_flag != KeyFlag::None => {
                    match km.decrypt(pkt.key_flag, pkt.seq, &pkt.payload) {
                        Ok(clear) => Bytes::from(clear),
                        Err(e) => {
                            log::warn!(
                                "socket @{}: dropping undecryptable packet {}: {}",
                                self.local_socket_id,
                                pkt.seq,
                                e
                            );
                            return;
                        }
                    }
                }
                _ => pkt.payload.clone(),
            }
        };

        let mut quick_ack = false;
        {
            let mut ackd = self.ackd.lock().unwrap();
            ackd.time_window.on_arrival(now_us, payload.len());
            if pkt.seq.value() % 16 == 0 {
                ackd.time_window.on_probe1(now_us);
            } else if pkt.seq.value() % 16 == 1 {
                ackd.time_window.on_probe2(now_us);
            }
            ackd.pkts_since_ack += 1;
            ackd.pkts_since_light_ack += 1;
        }

        let mut lost: Option<SeqRange> = None;
        {
            let mut recv = self.recv.lock().unwrap();
            let expected = recv.curr_seq.next();
            let offset = expected.offset_to(pkt.seq);
            if offset > 0 {
                lost = Some(SeqRange {
                    from: expected,
                    to: pkt.seq.prev(),
                });
                recv.curr_seq = pkt.seq;
            } else if offset == 0 {
                recv.curr_seq = pkt.seq;
            }

            let Some(buffer) = recv.buffer.as_mut() else {
                return;
            };
            match buffer.insert(
                pkt.seq,
                RcvUnit {
                    msg_no: pkt.msg_no,
                    boundary: pkt.boundary,
                    in_order: pkt.in_order,
                    timestamp: pkt.timestamp,
                    payload,
                },
            ) {
                InsertResult::Ok => {}
                InsertResult::Duplicate => {
                    log::trace!("socket @{}: duplicate {}", self.local_socket_id, pkt.seq);
                }
                InsertResult::BeforeAck => {
                    log::trace!(
                        "socket @{}: {} is before the ack point",
                        self.local_socket_id,
                        pkt.seq
                    );
                }
                InsertResult::Overflow => {
                    log::warn!(
                        "socket @{}: receive ring overflow at {}",
                        self.local_socket_id,
                        pkt.seq
                    );
                    return;
                }
            }
        }

        {
            let mut ackd = self.ackd.lock().unwrap();
            if let Some(range) = lost {
                // Plain reordering should not trigger repeated reports:
                // the tolerance pushes the re-report deadline out.
                let tolerance_us = ackd.reorder.value() as u64 * SYN_INTERVAL_US;
                let deadline =
                    now_us + ackd.rtt.nak_interval_us(MIN_NAK_INTERVAL_US) + tolerance_us;
                ackd.loss.insert(range, deadline);
                ackd.reorder.on_ordered();
                drop(ackd);
                // Tell the sender right away.
                let mut nak = ControlPacket::new(ControlType::Nak, 0, 0);
                nak.body = encode_loss_list(&[range]);
                self.send_control(nak);
            } else {
                // In sequence or filling a hole.
                let was_lost = ackd.loss.remove_sequence(pkt.seq);
                if was_lost && !pkt.retransmitted {
                    // A reordered original arrival, not a recovery.
                    ackd.reorder.on_reordered();
                } else {
                    ackd.reorder.on_ordered();
                }
                drop(ackd);
            }
        }

        {
            let send = self.send.lock().unwrap();
            quick_ack |= send
                .cc
                .needs_quick_ack(pkt.payload.len(), self.opts.max_payload_size());
        }
        if quick_ack {
            self.ackd.lock().unwrap().quick_ack = true;
        }

        // Wake a blocked reader if something became deliverable.
        let readable = {
            let recv = self.recv.lock().unwrap();
            recv.buffer
                .as_ref()
                .map(|b| b.can_read(now_us))
                .unwrap_or(false)
        };
        if readable {
            self.rcv_event.notify();
        }
    }

    // ----------------------------------------------------------------
    // Control ingress
    // ----------------------------------------------------------------

    pub fn on_control(&self, pkt: ControlPacket, now_us: u64) {
        *self.last_peer_time_us.lock().unwrap() = now_us;
        match pkt.ctrl_type {
            ControlType::Handshake => self.on_handshake(&pkt.body, pkt.timestamp, now_us),
            ControlType::Ack => self.on_ack(&pkt, now_us),
            ControlType::AckAck => self.on_ackack(&pkt, now_us),
            ControlType::Nak => self.on_nak(&pkt, now_us),
            ControlType::DropReq => self.on_dropreq(&pkt),
            ControlType::KeepAlive => {}
            ControlType::Shutdown => {
                log::info!("socket @{}: peer shut down", self.local_socket_id);
                self.set_state(ConnState::Broken);
            }
            ControlType::PeerError => {
                log::warn!(
                    "socket @{}: peer error {:#x}",
                    self.local_socket_id,
                    pkt.type_field
                );
                self.set_state(ConnState::Broken);
            }
            ControlType::CongestionWarning => {
                let mut send = self.send.lock().unwrap();
                let view = self.cc_view_locked(&send, now_us);
                send.cc.on_timer(&view, TimerStage::Init);
            }
            ControlType::UserDefined => self.on_ext_control(&pkt),
        }
    }

    /// Extended control commands: in-stream key refresh requests and
    /// their confirmations.
    fn on_ext_control(&self, pkt: &ControlPacket) {
        match pkt.subtype {
            crate::packet::ext_cmd::KM_REQ => {
                let msg = match KmMessage::decode(&pkt.body) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!(
                            "socket @{}: bad key-material message: {}",
                            self.local_socket_id,
                            e
                        );
                        return;
                    }
                };
                let state = {
                    let mut km = self.km.lock().unwrap();
                    match km.as_mut() {
                        Some(km) => km.on_request(&msg, self.opts.passphrase.as_deref()),
                        None => return,
                    }
                };
                if state != KmState::Secured {
                    log::warn!(
                        "socket @{}: key refresh failed ({:?})",
                        self.local_socket_id,
                        state
                    );
                    return;
                }
                let mut rsp = ControlPacket::new(ControlType::UserDefined, 0, 0);
                rsp.subtype = crate::packet::ext_cmd::KM_RSP;
                rsp.body = pkt.body.clone();
                self.send_control(rsp);
            }
            crate::packet::ext_cmd::KM_RSP => {
                log::debug!("socket @{}: key refresh confirmed", self.local_socket_id);
            }
            other => {
                log::debug!(
                    "socket @{}: user control subtype {:#x}",
                    self.local_socket_id,
                    other
                );
            }
        }
    }

    fn cc_view_locked(&self, send: &SendSide, now_us: u64) -> CcView {
        CcView {
            now_us,
            rtt_us: send.rtt_us,
            last_rtt_us: send.last_rtt_us,
            mss: self.opts.max_payload_size(),
            snd_curr_seq: send.curr_seq,
            snd_loss_len: send.loss.len(),
            delivery_rate_pktps: send.delivery_rate_pktps,
            bandwidth_pktps: send.bandwidth_pktps,
            flow_window: self.opts.flow_window,
        }
    }

    fn on_ack(&self, pkt: &ControlPacket, now_us: u64) {
        let body = match AckBody::decode(&pkt.body) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("socket @{}: bad ack: {}", self.local_socket_id, e);
                return;
            }
        };
        let mut send = self.send.lock().unwrap();
        let next = body.next_seq;
        if !next.after(send.last_ack_seq) && body.stats.is_none() {
            return; // stale light ack
        }
        let (pkts, bytes) = send.buffer.ack_up_to(next);
        send.loss.remove_up_to(next);
        if next.after(send.last_ack_seq) {
            send.last_ack_seq = next;
            send.last_ack_progress_us = now_us;
        }
        if let Some(stats) = body.stats {
            if stats.rtt_us > 0 {
                send.last_rtt_us = stats.rtt_us as u64;
                send.rtt_us = (7 * send.rtt_us + stats.rtt_us as u64) / 8;
            }
            if stats.recv_rate_pktps > 0 {
                send.delivery_rate_pktps = if send.delivery_rate_pktps == 0 {
                    stats.recv_rate_pktps as u64
                } else {
                    (7 * send.delivery_rate_pktps + stats.recv_rate_pktps as u64) / 8
                };
            }
            if stats.link_capacity_pktps > 0 {
                send.bandwidth_pktps = if send.bandwidth_pktps == 0 {
                    stats.link_capacity_pktps as u64
                } else {
                    (7 * send.bandwidth_pktps + stats.link_capacity_pktps as u64) / 8
                };
            }
        }
        let view = self.cc_view_locked(&send, now_us);
        send.cc.on_ack(
            &view,
            &AckEvent {
                ack_seq: next,
                acked_pkts: pkts,
                acked_bytes: bytes,
            },
        );
        let freed = pkts > 0;
        drop(send);

        // Full ACKs are confirmed so the peer can measure RTT.
        if body.stats.is_some() {
            let mut ackack = ControlPacket::new(ControlType::AckAck, 0, 0);
            ackack.type_field = pkt.type_field;
            self.send_control(ackack);
        }
        if freed {
            self.snd_event.notify();
        }
    }

    fn on_ackack(&self, pkt: &ControlPacket, now_us: u64) {
        // Drift sample: where the peer's clock appears to sit relative to
        // ours, taken from the control timestamp.
        let drift_sample = {
            let recv = self.recv.lock().unwrap();
            recv.buffer
                .as_ref()
                .and_then(|b| b.drift_sample(pkt.timestamp, now_us))
        };
        let drift_step = {
            let mut ackd = self.ackd.lock().unwrap();
            let Some((rtt_sample, _seq)) = ackd.ack_window.acknowledge(pkt.type_field, now_us)
            else {
                log::trace!(
                    "socket @{}: ackack for unknown journal {}",
                    self.local_socket_id,
                    pkt.type_field
                );
                return;
            };
            ackd.rtt.update(rtt_sample);
            drift_sample.and_then(|sample| ackd.drift.sample(sample))
        };
        if let Some(step) = drift_step {
            log::debug!(
                "socket @{}: drift step {} us applied",
                self.local_socket_id,
                step
            );
            let mut recv = self.recv.lock().unwrap();
            if let Some(buffer) = recv.buffer.as_mut() {
                buffer.adjust_drift(step);
            }
        }
    }

    fn on_nak(&self, pkt: &ControlPacket, now_us: u64) {
        let ranges = match decode_loss_list(&pkt.body) {
            Ok(ranges) => ranges,
            Err(e) => {
                log::warn!("socket @{}: bad nak: {}", self.local_socket_id, e);
                return;
            }
        };
        if ranges.is_empty() {
            return;
        }
        let mut send = self.send.lock().unwrap();
        let mut accepted = Vec::with_capacity(ranges.len());
        for range in &ranges {
            // Only sequences we actually have in flight can be lost.
            if range.from.after(send.curr_seq) || send.last_ack_seq.after(range.to) {
                log::debug!(
                    "socket @{}: nak outside the flight window: {}..{}",
                    self.local_socket_id,
                    range.from,
                    range.to
                );
                continue;
            }
            send.loss.insert(*range);
            accepted.push(*range);
        }
        if accepted.is_empty() {
            return;
        }
        let view = self.cc_view_locked(&send, now_us);
        send.cc.on_loss(&view, &accepted);
    }

    fn on_dropreq(&self, pkt: &ControlPacket) {
        let body = match DropReqBody::decode(&pkt.body) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("socket @{}: bad dropreq: {}", self.local_socket_id, e);
                return;
            }
        };
        {
            let mut recv = self.recv.lock().unwrap();
            if let Some(buffer) = recv.buffer.as_mut() {
                let dropped = buffer.drop_message(body.first_seq, body.last_seq);
                if dropped > 0 {
                    log::debug!(
                        "socket @{}: sender dropped message, discarded {} stored packets",
                        self.local_socket_id,
                        dropped
                    );
                }
            }
        }
        let mut ackd = self.ackd.lock().unwrap();
        ackd.loss.remove_up_to(body.last_seq.next());
    }

    // ----------------------------------------------------------------
    // Transmit path (called from the scheduler worker)
    // ----------------------------------------------------------------

    /// Sends at most one datagram. Returns the next send time while data
    /// remains queued.
    pub fn transmit_one(&self, now_us: u64) -> Option<u64> {
        if !self.is_connected() {
            return None;
        }
        let mut send = self.send.lock().unwrap();

        // Live mode: expired head messages turn into drop requests.
        if self.opts.transtype == TransType::Live && self.opts.tsbpd_mode {
            while let Some((msg_no, range)) =
                send.buffer.drop_expired(now_us, self.opts.tsbpd_delay_us)
            {
                send.loss.remove_up_to(range.to.next());
                if range.to.after(send.curr_seq) {
                    send.curr_seq = range.to;
                }
                log::debug!(
                    "socket @{}: message {} expired, requesting drop of {}..{}",
                    self.local_socket_id,
                    msg_no,
                    range.from,
                    range.to
                );
                let mut drop_req = ControlPacket::new(ControlType::DropReq, 0, 0);
                drop_req.type_field = msg_no.value();
                drop_req.body = DropReqBody {
                    first_seq: range.from,
                    last_seq: range.to,
                }
                .encode();
                drop(send);
                self.send_control(drop_req);
                send = self.send.lock().unwrap();
            }
        }

        // Retransmission has priority over new data.
        let item = loop {
            let Some(seq) = send.loss.pop_first() else {
                break None;
            };
            if let Some(item) = send.buffer.rexmit_packet(seq) {
                break Some(item);
            }
            // Already acked or beyond its retransmit budget; try the next.
        };

        let item = match item {
            Some(item) => Some(item),
            None => {
                let window = (send.cc.cwnd() as usize).min(self.opts.flow_window);
                let in_flight = send.last_ack_seq.offset_to(send.curr_seq) + 1;
                if in_flight >= 0 && (in_flight as usize) < window {
                    send.buffer.next_new_packet()
                } else {
                    None
                }
            }
        };

        let Some(item) = item else {
            return None;
        };

        if item.seq.after(send.curr_seq) {
            send.curr_seq = item.seq;
        }

        // Count this packet against the rekey schedule; a due refresh is
        // announced on the control path before the data goes out.
        let announce = {
            let mut km_guard = self.km.lock().unwrap();
            match km_guard.as_mut() {
                Some(km) if !item.retransmitted => km
                    .on_data_sent()
                    .and_then(|flag| km.announce(flag).ok()),
                _ => None,
            }
        };
        if let Some(msg) = announce {
            let mut pkt = ControlPacket::new(ControlType::UserDefined, 0, 0);
            pkt.subtype = crate::packet::ext_cmd::KM_REQ;
            pkt.body = msg.encode();
            self.send_control(pkt);
        }

        let (key_flag, payload) = {
            let km_guard = self.km.lock().unwrap();
            match km_guard.as_ref() {
                Some(km) => match km.encrypt(item.seq, &item.payload) {
                    Ok((flag, data)) => (flag, Bytes::from(data)),
                    Err(e) => {
                        log::error!("socket @{}: encrypt failed: {}", self.local_socket_id, e);
                        return None;
                    }
                },
                None => (KeyFlag::None, item.payload.clone()),
            }
        };

        let pkt = DataPacket {
            seq: item.seq,
            boundary: item.boundary,
            in_order: item.in_order,
            key_flag,
            retransmitted: item.retransmitted,
            msg_no: item.msg_no,
            timestamp: self.timestamp(now_us),
            dst_socket_id: self.peer_socket_id(),
            payload,
        };
        let raw = Packet::Data(pkt).encode();
        if let Err(e) = self.sender.send_to(&raw, self.peer_addr) {
            log::warn!("socket @{}: data send failed: {}", self.local_socket_id, e);
        }
        send.last_send_time_us = now_us;

        // Pace the next send; late wakeups are not compounded.
        let period = send.cc.pkt_send_period_us() as u64;
        let scheduled = send.next_send_time_us;
        let next = if scheduled != 0 && scheduled + period > now_us {
            scheduled + period
        } else {
            now_us + period
        };
        send.next_send_time_us = next;

        let more = !send.loss.is_empty() || send.buffer.has_unsent();
        drop(send);
        if more { Some(next) } else { None }
    }

    /// Earliest time the pacer allows the next send.
    pub fn next_send_time_us(&self) -> u64 {
        self.send.lock().unwrap().next_send_time_us
    }

    /// Whether the scheduler should keep this connection queued.
    pub fn has_pending_output(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let send = self.send.lock().unwrap();
        !send.loss.is_empty() || send.buffer.has_unsent()
    }

    // ----------------------------------------------------------------
    // Periodic timers (called from the receive worker's tick)
    // ----------------------------------------------------------------

    pub fn tick(&self, now_us: u64) {
        match self.state() {
            ConnState::Connecting => self.tick_handshake(now_us),
            ConnState::Connected => {
                self.tick_ack(now_us);
                self.tick_nak(now_us);
                self.tick_rexmit(now_us);
                self.tick_keepalive(now_us);
                self.tick_peer_idle(now_us);
                self.tick_tlpktdrop(now_us);
            }
            _ => {}
        }
    }

    fn tick_handshake(&self, now_us: u64) {
        let (resend, expired) = {
            let ctx = self.hs.lock().unwrap();
            (
                now_us.saturating_sub(ctx.last_send_time_us) >= SYN_INTERVAL_US,
                now_us >= ctx.deadline_us,
            )
        };
        if expired {
            log::warn!("socket @{}: connection timed out", self.local_socket_id);
            self.state.lock().unwrap().reject = Some(RejectReason::Timeout);
            self.set_state(ConnState::Broken);
            return;
        }
        if resend {
            let hs = self.hs.lock().unwrap().last_sent.clone();
            if let Some(hs) = hs {
                self.send_handshake(hs, now_us);
            }
        }
    }

    fn tick_ack(&self, now_us: u64) {
        let mut ackd = self.ackd.lock().unwrap();
        let full_due = now_us.saturating_sub(ackd.last_ack_time_us) >= ACK_INTERVAL_US
            || ackd.pkts_since_ack >= ACK_PKT_INTERVAL
            || ackd.quick_ack;
        let light_due = !full_due && ackd.pkts_since_light_ack >= LIGHT_ACK_PKT_INTERVAL;
        if !full_due && !light_due {
            return;
        }

        let (next_ackable, avail) = {
            let mut recv = self.recv.lock().unwrap();
            let Some(buffer) = recv.buffer.as_mut() else {
                return;
            };
            let next = buffer.next_ackable();
            buffer.ack(next);
            (next, buffer.avail_size() as u32)
        };

        if light_due {
            ackd.pkts_since_light_ack = 0;
            drop(ackd);
            let mut pkt = ControlPacket::new(ControlType::Ack, 0, 0);
            pkt.body = AckBody {
                next_seq: next_ackable,
                stats: None,
            }
            .encode();
            self.send_control(pkt);
            self.rcv_event.notify();
            return;
        }

        ackd.quick_ack = false;
        ackd.pkts_since_ack = 0;
        ackd.pkts_since_light_ack = 0;
        ackd.last_ack_time_us = now_us;
        if next_ackable == ackd.last_full_ack_seq {
            return; // nothing new to report
        }
        ackd.last_full_ack_seq = next_ackable;

        let ack_no = ackd.next_ack_no;
        ackd.next_ack_no = ackd.next_ack_no.wrapping_add(1);
        ackd.ack_window.store(ack_no, next_ackable, now_us);

        let stats = AckStats {
            rtt_us: ackd.rtt.rtt_us() as u32,
            rtt_var_us: ackd.rtt.rtt_var_us() as u32,
            avail_buf_pkts: avail,
            recv_rate_pktps: ackd.time_window.recv_rate_pktps() as u32,
            link_capacity_pktps: ackd.time_window.bandwidth_pktps() as u32,
            recv_rate_bps: ackd.time_window.recv_rate_bps() as u32,
        };
        drop(ackd);

        let mut pkt = ControlPacket::new(ControlType::Ack, 0, 0);
        pkt.type_field = ack_no;
        pkt.body = AckBody {
            next_seq: next_ackable,
            stats: Some(stats),
        }
        .encode();
        self.send_control(pkt);

        // Newly acknowledged data may now be readable.
        self.rcv_event.notify();
    }

    fn tick_nak(&self, now_us: u64) {
        if !self.opts.nak_report {
            return;
        }
        let due = {
            let mut ackd = self.ackd.lock().unwrap();
            if ackd.loss.is_empty() {
                return;
            }
            let interval = ackd.rtt.nak_interval_us(MIN_NAK_INTERVAL_US);
            ackd.loss.collect_due(now_us, now_us + interval)
        };
        if due.is_empty() {
            return;
        }
        let mut pkt = ControlPacket::new(ControlType::Nak, 0, 0);
        pkt.body = encode_loss_list(&due);
        self.send_control(pkt);
    }

    /// Retransmission safety net: with fast retransmit, a stretch of
    /// silence after unacknowledged data resurrects the whole flight;
    /// with late retransmit the controller only gets its timer event.
    fn tick_rexmit(&self, now_us: u64) {
        let mut send = self.send.lock().unwrap();
        let unacked = send.last_ack_seq.offset_to(send.curr_seq) + 1;
        if unacked <= 0 {
            return;
        }
        let timeout = 2 * send.rtt_us + SYN_INTERVAL_US;
        if now_us.saturating_sub(send.last_ack_progress_us) < timeout {
            return;
        }
        send.last_ack_progress_us = now_us;
        let stage = match send.cc.rexmit_method() {
            RexmitMethod::Fast => {
                let range = SeqRange {
                    from: send.last_ack_seq,
                    to: send.curr_seq,
                };
                let added = send.loss.insert(range);
                if added > 0 {
                    log::debug!(
                        "socket @{}: fast rexmit resurrects {} packets",
                        self.local_socket_id,
                        added
                    );
                }
                TimerStage::FastRexmit
            }
            RexmitMethod::Late => TimerStage::Rexmit,
        };
        let view = self.cc_view_locked(&send, now_us);
        send.cc.on_timer(&view, stage);
    }

    fn tick_keepalive(&self, now_us: u64) {
        let due = {
            let mut send = self.send.lock().unwrap();
            let last = send.last_send_time_us.max(self.start_time_us);
            if now_us.saturating_sub(last) >= KEEPALIVE_INTERVAL_US {
                send.last_send_time_us = now_us;
                true
            } else {
                false
            }
        };
        if due {
            self.send_control(ControlPacket::new(ControlType::KeepAlive, 0, 0));
        }
    }

    fn tick_peer_idle(&self, now_us: u64) {
        let last = *self.last_peer_time_us.lock().unwrap();
        if now_us.saturating_sub(last) >= self.opts.peer_idle_timeout_ms * 1000 {
            log::warn!(
                "socket @{}: peer idle for {} ms, breaking",
                self.local_socket_id,
                self.opts.peer_idle_timeout_ms
            );
            self.set_state(ConnState::Broken);
        }
    }

    fn tick_tlpktdrop(&self, now_us: u64) {
        if !self.opts.too_late_drop {
            return;
        }
        let dropped_to = {
            let mut recv = self.recv.lock().unwrap();
            let Some(buffer) = recv.buffer.as_mut() else {
                return;
            };
            let before = buffer.next_expected();
            buffer.update_state(now_us);
            let after = buffer.next_expected();
            if after != before { Some(after) } else { None }
        };
        if let Some(next) = dropped_to {
            let mut ackd = self.ackd.lock().unwrap();
            ackd.loss.remove_up_to(next);
            drop(ackd);
            self.rcv_event.notify();
        }
    }

    // ----------------------------------------------------------------
    // Application calls
    // ----------------------------------------------------------------

    /// Queues one in-order message for transmission.
    pub fn api_send(&self, data: &[u8]) -> Result<()> {
        self.api_send_msg(data, true)
    }

    /// Queues one message. With `in_order` false (file message mode) the
    /// receiver may deliver it past a gap. In blocking mode waits for
    /// buffer room; otherwise fails with `BufferFull`.
    pub fn api_send_msg(&self, data: &[u8], in_order: bool) -> Result<()> {
        loop {
            match self.state() {
                ConnState::Connected => {}
                ConnState::Broken => return Err(TransportError::ConnectionBroken),
                ConnState::Closing | ConnState::Closed => return Err(TransportError::Closed),
                _ => return Err(TransportError::Unreachable),
            }
            let now = self.clock.now_us();
            let result = {
                let mut send = self.send.lock().unwrap();
                send.buffer.add_message(data, in_order, now)
            };
            match result {
                Ok(_range) => return Ok(()),
                Err(TransportError::BufferFull) if self.opts.is_blocking_send() => {
                    self.snd_event
                        .wait_for(std::time::Duration::from_millis(100));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads one complete message. In blocking mode waits until one is
    /// deliverable (TsbPd-gated in live mode); otherwise `WouldBlock`.
    pub fn api_recv(&self, dst: &mut [u8]) -> Result<usize> {
        loop {
            match self.state() {
                ConnState::Connected => {}
                ConnState::Broken => return Err(TransportError::ConnectionBroken),
                ConnState::Closing | ConnState::Closed => return Err(TransportError::Closed),
                _ => return Err(TransportError::Unreachable),
            }
            let now = self.clock.now_us();
            {
                let mut recv = self.recv.lock().unwrap();
                if let Some(buffer) = recv.buffer.as_mut() {
                    if buffer.can_read(now) {
                        let n = buffer.read_message(dst);
                        if n > 0 {
                            return Ok(n);
                        }
                    }
                }
            }
            if !self.opts.is_blocking_recv() {
                return Err(TransportError::WouldBlock);
            }
            self.rcv_event
                .wait_for(std::time::Duration::from_millis(10));
        }
    }

    /// Initiates a local close: tells the peer, moves to CLOSING, wakes
    /// every waiter.
    pub fn close(&self) {
        if self.closed_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_connected() {
            self.send_control(ControlPacket::new(ControlType::Shutdown, 0, 0));
        }
        self.set_state(ConnState::Closing);
        self.snd_event.interrupt();
        self.rcv_event.interrupt();
    }

    /// Final sweep by the endpoint garbage collector.
    pub fn sweep(&self) {
        self.set_state(ConnState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Captures outgoing datagrams for inspection.
    #[derive(Default)]
    struct MockWire {
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl PacketSender for MockWire {
        fn send_to(&self, data: &[u8], _addr: SocketAddr) -> io::Result<usize> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }
    }

    impl MockWire {
        fn take(&self) -> Vec<Packet> {
            self.sent
                .lock()
                .unwrap()
                .drain(..)
                .map(|raw| Packet::decode(Bytes::from(raw)).unwrap())
                .collect()
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn caller(opts: Options) -> (Arc<Connection>, Arc<MockWire>) {
        let wire = Arc::new(MockWire::default());
        let conn = Connection::new(
            HandshakeRole::Caller,
            opts,
            11,
            peer(),
            wire.clone() as Arc<dyn PacketSender>,
            Clock::new(),
            None,
        );
        (conn, wire)
    }

    /// Drives a caller through a synthetic listener handshake and returns
    /// the peer's initial sequence.
    fn connect(conn: &Arc<Connection>, wire: &Arc<MockWire>) -> SeqNo {
        conn.start_connect(0);
        let sent = wire.take();
        assert_eq!(sent.len(), 1);
        let Packet::Control(ref induction) = sent[0] else {
            panic!("expected control packet");
        };
        let hs = HandshakeInfo::decode(&induction.body).unwrap();
        assert_eq!(hs.req_type, HsReqType::Induction);
        assert_eq!(conn.state(), ConnState::Connecting);

        // Synthesize the listener's cookie response.
        let mut resp = HandshakeInfo::new(HsReqType::Induction, 0, SeqNo::new(1));
        resp.extension = HS_MAGIC;
        resp.cookie = 0x5EED;
        conn.on_handshake(&resp.encode(), 0, 1000);

        let sent = wire.take();
        assert_eq!(sent.len(), 1);
        let Packet::Control(ref conclusion) = sent[0] else {
            panic!("expected control packet");
        };
        let hs = HandshakeInfo::decode(&conclusion.body).unwrap();
        assert_eq!(hs.req_type, HsReqType::Conclusion);
        assert_eq!(hs.cookie, 0x5EED);
        assert!(hs.find_caps().is_some());

        // And the listener's conclusion response.
        let peer_isn = SeqNo::new(5000);
        let mut resp = HandshakeInfo::new(HsReqType::Conclusion, 99, peer_isn);
        resp.extensions = vec![HsExtension::HsRsp(HsCaps {
            version: 0x0001_0500,
            flags: hs_flags::TSBPD_SND | hs_flags::TSBPD_RCV,
            snd_latency_ms: 120,
            rcv_latency_ms: 120,
        })];
        conn.on_handshake(&resp.encode(), 0, 2000);
        assert_eq!(conn.state(), ConnState::Connected);
        assert_eq!(conn.peer_socket_id(), 99);
        peer_isn
    }

    #[test]
    fn caller_handshake_reaches_connected() {
        let (conn, wire) = caller(Options::file());
        connect(&conn, &wire);
    }

    #[test]
    fn reject_breaks_the_caller() {
        let (conn, wire) = caller(Options::file());
        conn.start_connect(0);
        wire.take();
        let mut resp = HandshakeInfo::new(
            HsReqType::Reject(RejectReason::BadSecret),
            0,
            SeqNo::new(1),
        );
        resp.extension = HS_MAGIC;
        conn.on_handshake(&resp.encode(), 0, 1000);
        assert_eq!(conn.state(), ConnState::Broken);
        assert_eq!(conn.reject_reason(), Some(RejectReason::BadSecret));
    }

    #[test]
    fn legacy_peer_is_refused() {
        let (conn, wire) = caller(Options::file());
        conn.start_connect(0);
        wire.take();
        let mut resp = HandshakeInfo::new(HsReqType::Induction, 0, SeqNo::new(1));
        resp.version = 4;
        resp.extension = 2; // no magic echo
        conn.on_handshake(&resp.encode(), 0, 1000);
        assert_eq!(conn.state(), ConnState::Broken);
        assert_eq!(conn.reject_reason(), Some(RejectReason::Version));
    }

    #[test]
    fn handshake_retry_until_timeout() {
        let mut opts = Options::file();
        opts.conn_timeout_ms = 100;
        let (conn, wire) = caller(opts);
        conn.start_connect(0);
        wire.take();

        conn.tick(SYN_INTERVAL_US + 1);
        let resent = wire.take();
        assert_eq!(resent.len(), 1);

        // Past the deadline the attempt is abandoned.
        conn.tick(2_000_000);
        assert_eq!(conn.state(), ConnState::Broken);
        assert_eq!(conn.reject_reason(), Some(RejectReason::Timeout));
    }

    #[test]
    fn data_flows_out_paced_and_acked() {
        let (conn, wire) = caller(Options::file());
        connect(&conn, &wire);

        conn.api_send(b"hello transport").unwrap();
        let next = conn.transmit_one(10_000);
        // One message fits one packet: queue is empty afterwards.
        assert!(next.is_none());
        let sent = wire.take();
        assert_eq!(sent.len(), 1);
        let Packet::Data(ref data) = sent[0] else {
            panic!("expected data");
        };
        assert_eq!(&data.payload[..], b"hello transport");
        assert!(!data.retransmitted);
        assert_eq!(data.dst_socket_id, 99);

        // The peer acknowledges: buffer drains, ACKACK goes out.
        let first_seq = data.seq;
        let mut ack = ControlPacket::new(ControlType::Ack, 11, 0);
        ack.type_field = 1;
        ack.body = AckBody {
            next_seq: first_seq.next(),
            stats: Some(AckStats {
                rtt_us: 30_000,
                rtt_var_us: 5_000,
                avail_buf_pkts: 8000,
                recv_rate_pktps: 100,
                link_capacity_pktps: 1000,
                recv_rate_bps: 145_600,
            }),
        }
        .encode();
        conn.on_control(ack, 20_000);

        let sent = wire.take();
        assert_eq!(sent.len(), 1);
        let Packet::Control(ref ackack) = sent[0] else {
            panic!("expected ackack");
        };
        assert_eq!(ackack.ctrl_type, ControlType::AckAck);
        assert_eq!(ackack.type_field, 1);

        assert_eq!(conn.send.lock().unwrap().last_ack_seq, first_seq.next());
    }

    #[test]
    fn nak_triggers_retransmission_first() {
        let (conn, wire) = caller(Options::file());
        connect(&conn, &wire);

        conn.api_send(&[0xAA; 3000]).unwrap(); // 3 packets
        let mut seqs = Vec::new();
        for _ in 0..3 {
            conn.transmit_one(1_000_000);
        }
        for pkt in wire.take() {
            if let Packet::Data(d) = pkt {
                seqs.push(d.seq);
            }
        }
        assert_eq!(seqs.len(), 3);

        // The peer reports the middle packet missing.
        let mut nak = ControlPacket::new(ControlType::Nak, 11, 0);
        nak.body = encode_loss_list(&[SeqRange::single(seqs[1])]);
        conn.on_control(nak, 1_100_000);

        conn.transmit_one(1_200_000);
        let sent = wire.take();
        let Packet::Data(ref rexmit) = sent[0] else {
            panic!("expected data");
        };
        assert_eq!(rexmit.seq, seqs[1]);
        assert!(rexmit.retransmitted);
    }

    #[test]
    fn incoming_gap_emits_an_immediate_nak() {
        let (conn, wire) = caller(Options::file());
        let peer_isn = connect(&conn, &wire);

        let mk = |seq: SeqNo| DataPacket {
            seq,
            boundary: crate::seq::PacketBoundary::Solo,
            in_order: true,
            key_flag: KeyFlag::None,
            retransmitted: false,
            msg_no: crate::seq::MsgNo::new(1),
            timestamp: 0,
            dst_socket_id: 11,
            payload: Bytes::from_static(&[1, 2, 3]),
        };

        conn.on_data(mk(peer_isn), 10_000);
        assert!(wire.take().iter().all(|p| !matches!(
            p,
            Packet::Control(c) if c.ctrl_type == ControlType::Nak
        )));

        // Skip two sequences: the gap is reported at once.
        conn.on_data(mk(peer_isn.add(3)), 11_000);
        let sent = wire.take();
        let naks: Vec<_> = sent
            .iter()
            .filter_map(|p| match p {
                Packet::Control(c) if c.ctrl_type == ControlType::Nak => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(naks.len(), 1);
        let ranges = decode_loss_list(&naks[0].body).unwrap();
        assert_eq!(
            ranges,
            vec![SeqRange {
                from: peer_isn.add(1),
                to: peer_isn.add(2)
            }]
        );
    }

    #[test]
    fn periodic_ack_reports_progress_and_rtt_flows_back() {
        let (conn, wire) = caller(Options::file());
        let peer_isn = connect(&conn, &wire);

        let mk = |seq: SeqNo| DataPacket {
            seq,
            boundary: crate::seq::PacketBoundary::Solo,
            in_order: true,
            key_flag: KeyFlag::None,
            retransmitted: false,
            msg_no: crate::seq::MsgNo::new(1),
            timestamp: 0,
            dst_socket_id: 11,
            payload: Bytes::from_static(&[7; 8]),
        };
        conn.on_data(mk(peer_isn), 5_000);
        conn.on_data(mk(peer_isn.add(1)), 6_000);

        conn.tick(5_000 + ACK_INTERVAL_US + 1);
        let sent = wire.take();
        let acks: Vec<_> = sent
            .iter()
            .filter_map(|p| match p {
                Packet::Control(c) if c.ctrl_type == ControlType::Ack => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(acks.len(), 1);
        let body = AckBody::decode(&acks[0].body).unwrap();
        assert_eq!(body.next_seq, peer_isn.add(2));
        assert!(body.stats.is_some());

        // The ACKACK round trip feeds the RTT filter.
        let mut ackack = ControlPacket::new(ControlType::AckAck, 11, 0);
        ackack.type_field = acks[0].type_field;
        conn.on_control(ackack, 5_000 + ACK_INTERVAL_US + 1 + 40_000);
        let rtt = conn.ackd.lock().unwrap().rtt.rtt_us();
        assert!(rtt < 100_000, "rtt = {}", rtt);
    }

    #[test]
    fn remote_shutdown_breaks_and_fails_api_calls() {
        let (conn, wire) = caller(Options::file());
        connect(&conn, &wire);
        conn.on_control(ControlPacket::new(ControlType::Shutdown, 11, 0), 50_000);
        assert_eq!(conn.state(), ConnState::Broken);
        assert!(matches!(
            conn.api_send(b"x"),
            Err(TransportError::ConnectionBroken)
        ));
        let mut buf = [0u8; 16];
        assert!(matches!(
            conn.api_recv(&mut buf),
            Err(TransportError::ConnectionBroken)
        ));
    }

    #[test]
    fn peer_idle_timeout_breaks() {
        let mut opts = Options::file();
        opts.peer_idle_timeout_ms = 100;
        let (conn, wire) = caller(opts);
        connect(&conn, &wire);
        conn.tick(10_000_000);
        assert_eq!(conn.state(), ConnState::Broken);
    }

    #[test]
    fn nonblocking_recv_would_block() {
        let mut opts = Options::file();
        opts.rcv_syn = false;
        let (conn, wire) = caller(opts);
        connect(&conn, &wire);
        let mut buf = [0u8; 16];
        assert!(matches!(
            conn.api_recv(&mut buf),
            Err(TransportError::WouldBlock)
        ));
    }

    #[test]
    fn close_notifies_the_peer() {
        let (conn, wire) = caller(Options::file());
        connect(&conn, &wire);
        conn.close();
        let sent = wire.take();
        assert!(sent.iter().any(|p| matches!(
            p,
            Packet::Control(c) if c.ctrl_type == ControlType::Shutdown
        )));
        assert_eq!(conn.state(), ConnState::Closing);
        conn.sweep();
        assert_eq!(conn.state(), ConnState::Closed);
    }
}
