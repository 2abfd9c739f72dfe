use crate::crypto::CryptoError;
use garnet_binary::BinaryError;
use std::io;
use thiserror::Error;

/// Why a listener (or a rendezvous peer) refused a connection. Carried in
/// the handshake response so the caller can report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Unknown,
    System,
    Peer,
    Resource,
    Rogue,
    Backlog,
    /// Internal program error on the listener.
    Ipe,
    Close,
    Version,
    RdvCookie,
    BadSecret,
    Unsecure,
    MessageApi,
    Congestion,
    Filter,
    Group,
    Timeout,
    Timestamp,
}

impl RejectReason {
    /// Wire code; the caller-side decoder falls back to `Unknown` for
    /// codes minted by a newer peer.
    pub fn code(self) -> u32 {
        match self {
            RejectReason::Unknown => 1000,
            RejectReason::System => 1001,
            RejectReason::Peer => 1002,
            RejectReason::Resource => 1003,
            RejectReason::Rogue => 1004,
            RejectReason::Backlog => 1005,
            RejectReason::Ipe => 1006,
            RejectReason::Close => 1007,
            RejectReason::Version => 1008,
            RejectReason::RdvCookie => 1009,
            RejectReason::BadSecret => 1010,
            RejectReason::Unsecure => 1011,
            RejectReason::MessageApi => 1012,
            RejectReason::Congestion => 1013,
            RejectReason::Filter => 1014,
            RejectReason::Group => 1015,
            RejectReason::Timeout => 1016,
            RejectReason::Timestamp => 1017,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1001 => RejectReason::System,
            1002 => RejectReason::Peer,
            1003 => RejectReason::Resource,
            1004 => RejectReason::Rogue,
            1005 => RejectReason::Backlog,
            1006 => RejectReason::Ipe,
            1007 => RejectReason::Close,
            1008 => RejectReason::Version,
            1009 => RejectReason::RdvCookie,
            1010 => RejectReason::BadSecret,
            1011 => RejectReason::Unsecure,
            1012 => RejectReason::MessageApi,
            1013 => RejectReason::Congestion,
            1014 => RejectReason::Filter,
            1015 => RejectReason::Group,
            1016 => RejectReason::Timeout,
            1017 => RejectReason::Timestamp,
            _ => RejectReason::Unknown,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RejectReason::Unknown => "unknown",
            RejectReason::System => "system resource failure",
            RejectReason::Peer => "rejected by peer",
            RejectReason::Resource => "out of resources",
            RejectReason::Rogue => "malformed handshake data",
            RejectReason::Backlog => "listener backlog exceeded",
            RejectReason::Ipe => "internal program error",
            RejectReason::Close => "socket is closing",
            RejectReason::Version => "peer version too old",
            RejectReason::RdvCookie => "rendezvous cookie collision",
            RejectReason::BadSecret => "wrong passphrase",
            RejectReason::Unsecure => "unsecure connection not allowed",
            RejectReason::MessageApi => "message api mismatch",
            RejectReason::Congestion => "congestion controller mismatch",
            RejectReason::Filter => "packet filter mismatch",
            RejectReason::Group => "group settings mismatch",
            RejectReason::Timeout => "connection timed out",
            RejectReason::Timestamp => "timestamp mode mismatch",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("wire format error: {0}")]
    Binary(#[from] BinaryError),

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid option `{name}`: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("unsupported mode combination: {0}")]
    UnsupportedMode(&'static str),

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("connection rejected: {0}")]
    Rejected(RejectReason),

    #[error("peer unreachable")]
    Unreachable,

    /// The connection went to the BROKEN state (peer idle timeout, remote
    /// shutdown, or an endpoint failure). All pending and subsequent
    /// application calls fail with this.
    #[error("connection is broken")]
    ConnectionBroken,

    #[error("connection is closed")]
    Closed,

    #[error("operation would block")]
    WouldBlock,

    #[error("send buffer is full")]
    BufferFull,

    #[error("message of {size} bytes exceeds the limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("duplicate handshake")]
    DuplicateHandshake,

    #[error("sequence {0} is too far in the past")]
    StaleSequence(u32),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Whether a non-blocking caller may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::WouldBlock | TransportError::BufferFull
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
