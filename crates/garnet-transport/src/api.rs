//! Public entry points: endpoints, listeners and established streams.
//!
//! An [`Endpoint`] owns one UDP socket and its worker threads. It can
//! serve any number of outgoing connections and, after [`Endpoint::listen`],
//! incoming ones as well; every established connection is handed out as
//! a [`Stream`].

use crate::connection::{ConnState, Connection};
use crate::error::Result;
use crate::mux::{AcceptCallback, Multiplexer};
use crate::options::Options;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct Endpoint {
    mux: Arc<Multiplexer>,
}

impl Endpoint {
    /// Binds a datagram endpoint and starts its workers.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            mux: Multiplexer::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.mux.local_addr()
    }

    /// Starts serving incoming callers with the given per-connection
    /// options.
    pub fn listen(&self, opts: Options, backlog: usize) -> Result<Listener> {
        self.mux.listen(opts, backlog, None)?;
        Ok(Listener {
            mux: Arc::clone(&self.mux),
        })
    }

    /// Like [`Endpoint::listen`], with an admission callback that sees
    /// the peer address and raw stream id and may refuse with a reason.
    pub fn listen_with_callback(
        &self,
        opts: Options,
        backlog: usize,
        callback: AcceptCallback,
    ) -> Result<Listener> {
        self.mux.listen(opts, backlog, Some(callback))?;
        Ok(Listener {
            mux: Arc::clone(&self.mux),
        })
    }

    /// Calls a listening peer. Blocks until established (or failed) when
    /// the options select synchronous mode.
    pub fn connect(&self, remote: SocketAddr, opts: Options) -> Result<Stream> {
        let conn = self.mux.connect(remote, opts)?;
        Ok(Stream {
            conn,
            mux: Arc::clone(&self.mux),
        })
    }

    /// Rendezvous establishment; both peers call this simultaneously.
    pub fn rendezvous(&self, remote: SocketAddr, opts: Options) -> Result<Stream> {
        let conn = self.mux.rendezvous(remote, opts)?;
        Ok(Stream {
            conn,
            mux: Arc::clone(&self.mux),
        })
    }

    /// Tears the endpoint down: every connection is closed and the
    /// workers join.
    pub fn shutdown(&self) {
        self.mux.shutdown();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.mux.shutdown();
    }
}

/// Accept side of a listening endpoint.
pub struct Listener {
    mux: Arc<Multiplexer>,
}

impl Listener {
    /// Waits for the next established incoming connection.
    pub fn accept(&self, timeout: Duration) -> Result<Stream> {
        let conn = self.mux.accept(timeout)?;
        Ok(Stream {
            conn,
            mux: Arc::clone(&self.mux),
        })
    }
}

/// Convenience alias kept for symmetry with the listener side.
pub type Caller = Endpoint;

/// One established connection.
pub struct Stream {
    conn: Arc<Connection>,
    mux: Arc<Multiplexer>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl Stream {
    /// Sends one message, in order.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.conn.api_send(data)?;
        self.mux.scheduler.schedule_if_pending(&self.conn);
        Ok(())
    }

    /// Sends one message that the receiver may deliver out of order
    /// (file message mode).
    pub fn send_out_of_order(&self, data: &[u8]) -> Result<()> {
        self.conn.api_send_msg(data, false)?;
        self.mux.scheduler.schedule_if_pending(&self.conn);
        Ok(())
    }

    /// Receives one complete message into `buf`, returning its length.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.conn.api_recv(buf)
    }

    pub fn state(&self) -> ConnState {
        self.conn.state()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr
    }

    pub fn socket_id(&self) -> u32 {
        self.conn.local_socket_id
    }

    pub fn close(&self) {
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RejectReason, TransportError};
    use crate::options::CryptoMode;

    fn file_opts() -> Options {
        let mut opts = Options::file();
        opts.conn_timeout_ms = 3000;
        opts
    }

    fn bind() -> Endpoint {
        Endpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn loopback_file_transfer() {
        let server = bind();
        let listener = server.listen(file_opts(), 8).unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = bind();
        let tx = client.connect(server_addr, file_opts()).unwrap();
        let rx = listener.accept(Duration::from_secs(3)).unwrap();
        assert_eq!(tx.state(), ConnState::Connected);
        assert_eq!(rx.state(), ConnState::Connected);

        tx.send(b"first message").unwrap();
        let mut buf = vec![0u8; 2048];
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first message");

        // A multi-packet message reassembles in order.
        let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        tx.send(&big).unwrap();
        let mut buf = vec![0u8; 8192];
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &big[..]);

        // The reverse direction works over the same connection pair.
        rx.send(b"reply").unwrap();
        let n = tx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");

        tx.close();
        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn loopback_encrypted_transfer() {
        let mut opts = file_opts();
        opts.passphrase = Some("sufficiently long".into());
        opts.crypto_mode = CryptoMode::Ctr;

        let server = bind();
        let listener = server.listen(opts.clone(), 8).unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = bind();
        let tx = client.connect(server_addr, opts).unwrap();
        let rx = listener.accept(Duration::from_secs(3)).unwrap();

        tx.send(b"secret payload").unwrap();
        let mut buf = vec![0u8; 2048];
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"secret payload");

        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let mut server_opts = file_opts();
        server_opts.passphrase = Some("the server secret".into());
        server_opts.crypto_mode = CryptoMode::Ctr;

        let server = bind();
        let _listener = server.listen(server_opts, 8).unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut client_opts = file_opts();
        client_opts.passphrase = Some("a different secret".into());
        client_opts.crypto_mode = CryptoMode::Ctr;

        let client = bind();
        let err = client.connect(server_addr, client_opts).unwrap_err();
        assert!(
            matches!(err, TransportError::Rejected(RejectReason::BadSecret)),
            "got {:?}",
            err
        );

        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn cipher_mismatch_is_rejected_as_unsecure() {
        let mut server_opts = file_opts();
        server_opts.passphrase = Some("a shared passphrase".into());
        server_opts.crypto_mode = CryptoMode::Ctr;

        let server = bind();
        let _listener = server.listen(server_opts, 8).unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut client_opts = file_opts();
        client_opts.passphrase = Some("a shared passphrase".into());
        client_opts.crypto_mode = CryptoMode::Gcm;

        let client = bind();
        let err = client.connect(server_addr, client_opts).unwrap_err();
        assert!(
            matches!(err, TransportError::Rejected(RejectReason::Unsecure)),
            "got {:?}",
            err
        );

        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn accept_callback_can_refuse() {
        let server = bind();
        let _listener = server
            .listen_with_callback(
                file_opts(),
                8,
                Box::new(|_addr, stream_id| {
                    if stream_id.contains("u=alice") {
                        Ok(())
                    } else {
                        Err(RejectReason::Peer)
                    }
                }),
            )
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut denied = file_opts();
        denied.stream_id = "#!::u=bob".into();
        let client = bind();
        let err = client.connect(server_addr, denied).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Rejected(RejectReason::Peer)
        ));

        let mut allowed = file_opts();
        allowed.stream_id = "#!::u=alice,m=publish".into();
        let tx = client.connect(server_addr, allowed).unwrap();
        assert_eq!(tx.state(), ConnState::Connected);

        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn connect_to_silence_times_out() {
        let mut opts = file_opts();
        opts.conn_timeout_ms = 200;
        let client = bind();
        // Nobody listens here.
        let err = client
            .connect("127.0.0.1:9".parse().unwrap(), opts)
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionTimeout));
        client.shutdown();
    }

    #[test]
    fn live_mode_delivers_within_latency() {
        let mut opts = Options::live();
        opts.conn_timeout_ms = 3000;
        opts.tsbpd_delay_us = 50_000;

        let server = bind();
        let listener = server.listen(opts.clone(), 8).unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = bind();
        let tx = client.connect(server_addr, opts).unwrap();
        let rx = listener.accept(Duration::from_secs(3)).unwrap();

        let started = std::time::Instant::now();
        tx.send(b"a live sample").unwrap();
        let mut buf = vec![0u8; 2048];
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"a live sample");
        // Gated by TsbPd: not before the configured delay, but within a
        // sane envelope after it.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(40), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);

        client.shutdown();
        server.shutdown();
    }
}
