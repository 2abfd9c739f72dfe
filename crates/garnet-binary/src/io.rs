use crate::error::BinaryError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Cursor over an immutable byte buffer. All multi-byte reads are
/// big-endian, matching the network byte order of the wire format.
#[derive(Debug, Clone)]
pub struct BinaryReader {
    buffer: Bytes,
}

impl BinaryReader {
    pub fn new(buffer: Bytes) -> Self {
        Self { buffer }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.remaining()
    }

    pub fn has_remaining(&self) -> bool {
        self.buffer.has_remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), BinaryError> {
        if self.buffer.remaining() < needed {
            return Err(BinaryError::UnexpectedEof {
                needed,
                remaining: self.buffer.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, BinaryError> {
        self.ensure(1)?;
        Ok(self.buffer.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, BinaryError> {
        self.ensure(2)?;
        Ok(self.buffer.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32, BinaryError> {
        self.ensure(4)?;
        Ok(self.buffer.get_u32())
    }

    pub fn read_i32(&mut self) -> Result<i32, BinaryError> {
        self.ensure(4)?;
        Ok(self.buffer.get_i32())
    }

    pub fn read_u64(&mut self) -> Result<u64, BinaryError> {
        self.ensure(8)?;
        Ok(self.buffer.get_u64())
    }

    /// Splits off the next `len` bytes without copying.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, BinaryError> {
        self.ensure(len)?;
        Ok(self.buffer.copy_to_bytes(len))
    }

    /// Consumes the rest of the buffer.
    pub fn read_remaining(&mut self) -> Bytes {
        let len = self.buffer.remaining();
        self.buffer.copy_to_bytes(len)
    }

    pub fn read_exact(&mut self, dst: &mut [u8]) -> Result<(), BinaryError> {
        self.ensure(dst.len())?;
        self.buffer.copy_to_slice(dst);
        Ok(())
    }

    /// Reads a 16-byte address block: IPv4 is carried as the first four
    /// bytes with the remaining twelve zero, IPv6 occupies all sixteen.
    pub fn read_ip(&mut self) -> Result<IpAddr, BinaryError> {
        let mut raw = [0u8; 16];
        self.read_exact(&mut raw)?;
        if raw[4..].iter().all(|b| *b == 0) {
            Ok(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])))
        } else {
            Ok(IpAddr::V6(Ipv6Addr::from(raw)))
        }
    }
}

/// Growable write buffer. Big-endian, mirroring `BinaryReader`.
#[derive(Debug, Clone, Default)]
pub struct BinaryWriter {
    buffer: BytesMut,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.put_u16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.put_u32(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.put_i32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.put_u64(value);
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buffer.put_slice(value);
    }

    /// Writes the 16-byte address block described at `BinaryReader::read_ip`.
    pub fn write_ip(&mut self, addr: &IpAddr) {
        match addr {
            IpAddr::V4(v4) => {
                self.buffer.put_slice(&v4.octets());
                self.buffer.put_slice(&[0u8; 12]);
            }
            IpAddr::V6(v6) => self.buffer.put_slice(&v6.octets()),
        }
    }

    /// Pads with zero bytes up to the next multiple of `align`.
    pub fn pad_to(&mut self, align: usize) {
        let rem = self.buffer.len() % align;
        if rem != 0 {
            for _ in rem..align {
                self.buffer.put_u8(0);
            }
        }
    }

    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }
}
