//! Wire serialization toolkit shared by the transport crates.
//!
//! Everything is big-endian; the reader and writer operate on `bytes`
//! buffers so decoded payloads can be split off without copying.

pub mod error;
pub mod io;
pub mod traits;

pub use error::BinaryError;
pub use io::{BinaryReader, BinaryWriter};
pub use traits::{Readable, Writable};
