//! Sender and receiver packet stores.

pub mod recv;
pub mod send;

pub use recv::{InsertResult, PacketInfo, RecvBuffer};
pub use send::{SendBuffer, SendItem};
