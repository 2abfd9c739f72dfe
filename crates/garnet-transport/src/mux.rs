//! Endpoint multiplexer: one UDP socket shared by many connections.
//!
//! A receive worker demultiplexes datagrams to connections by the
//! destination socket-id field; zero addresses the handshake machinery
//! (listener induction/conclusion, rendezvous). A garbage-collector
//! thread sweeps broken and closing connections out of the table. The
//! socket table is the only state shared between workers; each entry is
//! an `Arc<Connection>` with its own internal locks.

use crate::connection::{ConnState, Connection, HandshakeRole, PacketSender};
use crate::crypto::{CryptoProvider, StdCrypto};
use crate::error::{RejectReason, Result, TransportError};
use crate::handshake::{CookieJar, HS_MAGIC, HS_VERSION, HandshakeInfo, HsReqType};
use crate::km::KeyMaterial;
use crate::options::Options;
use crate::packet::{ControlPacket, ControlType, Packet, peek_dst_socket_id};
use crate::sched::SendScheduler;
use crate::sync::{Clock, SyncEvent};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

/// How often the receive worker runs the per-connection timers.
const TICK_INTERVAL_US: u64 = 10_000;
/// Garbage-collection sweep period.
const GC_INTERVAL: Duration = Duration::from_millis(200);

/// Listener-side connection admission: peer address and raw stream id in,
/// verdict out.
pub type AcceptCallback =
    Box<dyn Fn(&SocketAddr, &str) -> std::result::Result<(), RejectReason> + Send + Sync>;

struct ListenerCtx {
    opts: Options,
    backlog: usize,
    accept_cb: Option<AcceptCallback>,
}

pub struct Multiplexer {
    socket: Arc<UdpSocket>,
    pub clock: Clock,
    conns: DashMap<u32, Arc<Connection>>,
    listener: Mutex<Option<ListenerCtx>>,
    accept_queue: Mutex<VecDeque<Arc<Connection>>>,
    accept_event: SyncEvent,
    cookie_jar: CookieJar,
    next_socket_id: AtomicU32,
    pub scheduler: Arc<SendScheduler>,
    crypto: Arc<dyn CryptoProvider>,
    running: AtomicBool,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Multiplexer {
    pub fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(10)))?;
        let clock = Clock::new();
        let mux = Arc::new(Self {
            socket: Arc::new(socket),
            clock,
            conns: DashMap::new(),
            listener: Mutex::new(None),
            accept_queue: Mutex::new(VecDeque::new()),
            accept_event: SyncEvent::new(),
            cookie_jar: CookieJar::new(),
            next_socket_id: AtomicU32::new(rand::random::<u32>() | 1),
            scheduler: SendScheduler::new(clock),
            crypto: Arc::new(StdCrypto),
            running: AtomicBool::new(true),
            workers: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&mux);
        let recv_worker = thread::Builder::new()
            .name("garnet-rcv".into())
            .spawn(move || recv_loop(weak))
            .map_err(|e| TransportError::Internal(format!("spawn failed: {}", e)))?;
        let weak = Arc::downgrade(&mux);
        let gc_worker = thread::Builder::new()
            .name("garnet-gc".into())
            .spawn(move || gc_loop(weak))
            .map_err(|e| TransportError::Internal(format!("spawn failed: {}", e)))?;
        mux.workers
            .lock()
            .unwrap()
            .extend([recv_worker, gc_worker]);
        log::info!("endpoint bound to {}", mux.socket.local_addr()?);
        Ok(mux)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn alloc_socket_id(&self) -> u32 {
        loop {
            let id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.conns.contains_key(&id) {
                return id;
            }
        }
    }

    fn packet_sender(&self) -> Arc<dyn PacketSender> {
        Arc::clone(&self.socket) as Arc<dyn PacketSender>
    }

    // ----------------------------------------------------------------
    // Establishment entry points
    // ----------------------------------------------------------------

    /// Puts the endpoint into listening mode.
    pub fn listen(
        &self,
        opts: Options,
        backlog: usize,
        accept_cb: Option<AcceptCallback>,
    ) -> Result<()> {
        opts.validate()?;
        let mut listener = self.listener.lock().unwrap();
        if listener.is_some() {
            return Err(TransportError::UnsupportedMode("already listening"));
        }
        *listener = Some(ListenerCtx {
            opts,
            backlog,
            accept_cb,
        });
        Ok(())
    }

    /// Takes the next established incoming connection, waiting up to
    /// `timeout`.
    pub fn accept(&self, timeout: Duration) -> Result<Arc<Connection>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(conn) = self.accept_queue.lock().unwrap().pop_front() {
                return Ok(conn);
            }
            if !self.running.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            if std::time::Instant::now() >= deadline {
                return Err(TransportError::ConnectionTimeout);
            }
            self.accept_event.wait_until(deadline);
        }
    }

    /// Establishes an outgoing connection. Blocks until connected when
    /// the options ask for synchronous mode.
    pub fn connect(&self, remote: SocketAddr, opts: Options) -> Result<Arc<Connection>> {
        self.start_conn(remote, opts, HandshakeRole::Caller)
    }

    /// Symmetric establishment: both sides call this at both ends.
    pub fn rendezvous(&self, remote: SocketAddr, opts: Options) -> Result<Arc<Connection>> {
        self.start_conn(remote, opts, HandshakeRole::Rendezvous)
    }

    fn start_conn(
        &self,
        remote: SocketAddr,
        opts: Options,
        role: HandshakeRole,
    ) -> Result<Arc<Connection>> {
        opts.validate()?;
        let km = if opts.passphrase.is_some() {
            Some(KeyMaterial::new_initiator(&opts, Arc::clone(&self.crypto))?)
        } else {
            None
        };
        let id = self.alloc_socket_id();
        let blocking = opts.rcv_syn;
        let timeout = Duration::from_millis(opts.conn_timeout_ms + 100);
        let conn = Connection::new(
            role,
            opts,
            id,
            remote,
            self.packet_sender(),
            self.clock,
            km,
        );
        self.conns.insert(id, Arc::clone(&conn));
        conn.start_connect(self.clock.now_us());

        if !blocking {
            return Ok(conn);
        }
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match conn.state() {
                ConnState::Connected => return Ok(conn),
                ConnState::Broken => {
                    let err = match conn.reject_reason() {
                        Some(RejectReason::Timeout) => TransportError::ConnectionTimeout,
                        Some(reason) => TransportError::Rejected(reason),
                        None => TransportError::ConnectionBroken,
                    };
                    self.conns.remove(&id);
                    return Err(err);
                }
                _ => {}
            }
            if std::time::Instant::now() >= deadline {
                self.conns.remove(&id);
                return Err(TransportError::ConnectionTimeout);
            }
            conn.rcv_event.wait_for(Duration::from_millis(10));
        }
    }

    // ----------------------------------------------------------------
    // Ingress
    // ----------------------------------------------------------------

    fn handle_datagram(&self, raw: Bytes, addr: SocketAddr, now_us: u64) {
        let Some(dst) = peek_dst_socket_id(&raw) else {
            log::trace!("runt datagram from {}", addr);
            return;
        };
        if dst == 0 {
            self.handle_unaddressed(raw, addr, now_us);
            return;
        }
        let Some(conn) = self.conns.get(&dst).map(|c| Arc::clone(c.value())) else {
            log::debug!("datagram for unknown socket @{} from {}", dst, addr);
            return;
        };
        if conn.peer_addr != addr {
            // Mid-connection rebinding is not a thing; a mismatched source
            // is either spoofed or stale.
            log::warn!(
                "socket @{}: datagram from {} but peer is {}, discarded",
                dst,
                addr,
                conn.peer_addr
            );
            return;
        }
        match Packet::decode(raw) {
            Ok(Packet::Data(pkt)) => conn.on_data(pkt, now_us),
            Ok(Packet::Control(pkt)) => conn.on_control(pkt, now_us),
            Err(e) => {
                log::warn!("socket @{}: malformed datagram: {}", dst, e);
                return;
            }
        }
        self.scheduler.schedule_if_pending(&conn);
    }

    /// Datagrams with a zero destination id: handshake traffic for the
    /// listener, or rendezvous peers that have not learned our id yet.
    fn handle_unaddressed(&self, raw: Bytes, addr: SocketAddr, now_us: u64) {
        let pkt = match Packet::decode(raw) {
            Ok(Packet::Control(pkt)) if pkt.ctrl_type == ControlType::Handshake => pkt,
            Ok(_) => {
                log::debug!("non-handshake datagram without a socket id from {}", addr);
                return;
            }
            Err(e) => {
                log::debug!("malformed unaddressed datagram from {}: {}", addr, e);
                return;
            }
        };
        let info = match HandshakeInfo::decode(&pkt.body) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("bad handshake from {}: {}", addr, e);
                return;
            }
        };

        // A connecting (rendezvous or caller) socket for this peer takes
        // precedence over the listener.
        if let Some(conn) = self.find_by_peer(addr, info.socket_id) {
            conn.on_handshake(&pkt.body, pkt.timestamp, now_us);
            return;
        }
        if let Some(conn) = self
            .conns
            .iter()
            .find(|c| c.peer_addr == addr && c.state() == ConnState::Connecting)
            .map(|c| Arc::clone(c.value()))
        {
            conn.on_handshake(&pkt.body, pkt.timestamp, now_us);
            return;
        }

        match info.req_type {
            HsReqType::Induction => self.listener_induction(&info, addr, now_us),
            HsReqType::Conclusion => self.listener_conclusion(&info, &pkt, addr, now_us),
            other => {
                log::debug!("unexpected handshake {:?} from {}", other, addr);
            }
        }
    }

    fn find_by_peer(&self, addr: SocketAddr, peer_socket_id: u32) -> Option<Arc<Connection>> {
        if peer_socket_id == 0 {
            return None;
        }
        self.conns
            .iter()
            .find(|c| c.peer_addr == addr && c.peer_socket_id() == peer_socket_id)
            .map(|c| Arc::clone(c.value()))
    }

    fn send_handshake_to(&self, hs: HandshakeInfo, dst_socket_id: u32, addr: SocketAddr) {
        let mut pkt = ControlPacket::new(ControlType::Handshake, dst_socket_id, 0);
        pkt.timestamp = self.clock.now_us() as u32;
        pkt.body = hs.encode();
        let raw = Packet::Control(pkt).encode();
        if let Err(e) = self.socket.send_to(&raw, addr) {
            log::warn!("handshake send to {} failed: {}", addr, e);
        }
    }

    fn reject(&self, info: &HandshakeInfo, addr: SocketAddr, reason: RejectReason) {
        log::warn!("refusing connection from {}: {}", addr, reason);
        let mut resp = HandshakeInfo::new(HsReqType::Reject(reason), 0, info.init_seq);
        resp.extension = HS_MAGIC;
        self.send_handshake_to(resp, info.socket_id, addr);
    }

    /// Phase one: hand out a cookie, commit nothing.
    fn listener_induction(&self, info: &HandshakeInfo, addr: SocketAddr, now_us: u64) {
        let listening = self.listener.lock().unwrap().is_some();
        if !listening {
            log::debug!("induction from {} but not listening", addr);
            return;
        }
        let mut resp = HandshakeInfo::new(HsReqType::Induction, 0, info.init_seq);
        resp.extension = HS_MAGIC;
        resp.cookie = self.cookie_jar.generate(&addr, now_us);
        resp.mss = info.mss;
        resp.flow_window = info.flow_window;
        resp.peer_ip = addr.ip();
        self.send_handshake_to(resp, info.socket_id, addr);
    }

    /// Phase two: validate the cookie, consult the acceptance callback,
    /// build the connection.
    fn listener_conclusion(
        &self,
        info: &HandshakeInfo,
        pkt: &ControlPacket,
        addr: SocketAddr,
        now_us: u64,
    ) {
        let Some(listener) = self.listener.lock().unwrap().as_ref().map(|l| ListenerCtx {
            opts: l.opts.clone(),
            backlog: l.backlog,
            accept_cb: None,
        }) else {
            return;
        };
        if info.version != HS_VERSION {
            self.reject(info, addr, RejectReason::Version);
            return;
        }
        if !self.cookie_jar.verify(&addr, info.cookie, now_us) {
            self.reject(info, addr, RejectReason::RdvCookie);
            return;
        }
        if self.accept_queue.lock().unwrap().len() >= listener.backlog {
            self.reject(info, addr, RejectReason::Backlog);
            return;
        }

        // The callback sees the raw stream id and may veto.
        {
            let guard = self.listener.lock().unwrap();
            if let Some(ctx) = guard.as_ref() {
                if let Some(cb) = &ctx.accept_cb {
                    let stream_id = info.find_stream_id().unwrap_or("");
                    if let Err(reason) = cb(&addr, stream_id) {
                        drop(guard);
                        self.reject(info, addr, reason);
                        return;
                    }
                }
            }
        }

        let opts = listener.opts;
        let km = if opts.passphrase.is_some() {
            Some(KeyMaterial::new_responder(&opts, Arc::clone(&self.crypto)))
        } else {
            None
        };
        let id = self.alloc_socket_id();
        let conn = Connection::new(
            HandshakeRole::Listener,
            opts,
            id,
            addr,
            self.packet_sender(),
            self.clock,
            km,
        );
        match conn.accept_conclusion(info, pkt.timestamp, now_us) {
            Ok(()) => {
                self.conns.insert(id, Arc::clone(&conn));
                self.accept_queue.lock().unwrap().push_back(conn);
                self.accept_event.notify();
            }
            Err(TransportError::Rejected(reason)) => {
                self.reject(info, addr, reason);
            }
            Err(e) => {
                log::error!("conclusion from {} failed: {}", addr, e);
                self.reject(info, addr, RejectReason::Ipe);
            }
        }
    }

    // ----------------------------------------------------------------
    // Maintenance
    // ----------------------------------------------------------------

    fn tick_all(&self, now_us: u64) {
        let conns: Vec<Arc<Connection>> =
            self.conns.iter().map(|c| Arc::clone(c.value())).collect();
        for conn in conns {
            conn.tick(now_us);
            self.scheduler.schedule_if_pending(&conn);
        }
    }

    fn break_all(&self) {
        for entry in self.conns.iter() {
            entry.value().close();
        }
    }

    fn sweep(&self) {
        let mut dead = Vec::new();
        for entry in self.conns.iter() {
            match entry.value().state() {
                ConnState::Broken | ConnState::Closing | ConnState::Closed => {
                    dead.push(*entry.key());
                }
                _ => {}
            }
        }
        for id in dead {
            if let Some((_, conn)) = self.conns.remove(&id) {
                conn.sweep();
                log::debug!("swept socket @{}", id);
            }
        }
    }

    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.break_all();
        self.scheduler.shutdown();
        self.accept_event.interrupt();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.join();
        }
        self.sweep();
    }
}

fn recv_loop(weak: Weak<Multiplexer>) {
    let mut buf = [0u8; 65536];
    let mut last_tick_us = 0u64;
    loop {
        let Some(mux) = weak.upgrade() else {
            return;
        };
        if !mux.running.load(Ordering::SeqCst) {
            return;
        }
        match mux.socket.recv_from(&mut buf) {
            Ok((len, addr)) => {
                let now = mux.clock.now_us();
                let raw = Bytes::copy_from_slice(&buf[..len]);
                mux.handle_datagram(raw, addr, now);
                if now.saturating_sub(last_tick_us) >= TICK_INTERVAL_US {
                    last_tick_us = now;
                    mux.tick_all(now);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        // ICMP-induced resets concern one peer, not the
                        // endpoint.
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                let now = mux.clock.now_us();
                last_tick_us = now;
                mux.tick_all(now);
            }
            Err(e) => {
                // An endpoint failure is fatal to every connection on it.
                log::error!("endpoint receive failed: {}", e);
                mux.break_all();
                return;
            }
        }
        drop(mux);
    }
}

fn gc_loop(weak: Weak<Multiplexer>) {
    loop {
        let Some(mux) = weak.upgrade() else {
            return;
        };
        if !mux.running.load(Ordering::SeqCst) {
            return;
        }
        mux.sweep();
        drop(mux);
        thread::sleep(GC_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind_any() -> Arc<Multiplexer> {
        Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn bind_and_shutdown() {
        let mux = bind_any();
        assert!(mux.local_addr().is_ok());
        mux.shutdown();
    }

    #[test]
    fn socket_ids_are_unique_and_nonzero() {
        let mux = bind_any();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = mux.alloc_socket_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
        mux.shutdown();
    }

    #[test]
    fn double_listen_is_refused() {
        let mux = bind_any();
        mux.listen(Options::live(), 8, None).unwrap();
        assert!(mux.listen(Options::live(), 8, None).is_err());
        mux.shutdown();
    }

    #[test]
    fn accept_times_out_when_idle() {
        let mux = bind_any();
        mux.listen(Options::file(), 8, None).unwrap();
        let err = mux.accept(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionTimeout));
        mux.shutdown();
    }
}
