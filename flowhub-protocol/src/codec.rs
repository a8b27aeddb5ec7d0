//! Payload primitives.
//!
//! Payloads are built from little-endian fixed-width integers, LSB-first
//! varints and length-prefixed fields. A length prefix is a `u16`; the escape
//! value `0xFFFF` means the real length follows as a `u32`.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Escape marker in a 16-bit length prefix.
pub const LEN16_ESCAPE: u16 = 0xFFFF;

/// Maximum number of 7-bit groups in a varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Returns the number of bytes `value` occupies as a varint.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Appends payload fields to a growable buffer.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    /// Writes `v` as 7-bit groups, least significant first.
    pub fn put_varint(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.buf.put_u8((v as u8 & 0x7F) | 0x80);
            v >>= 7;
        }
        self.buf.put_u8(v as u8);
    }

    /// Writes a length prefix, escaping to 32 bits when needed.
    pub fn put_len(&mut self, len: usize) -> Result<(), ProtocolError> {
        if len < LEN16_ESCAPE as usize {
            self.buf.put_u16_le(len as u16);
            return Ok(());
        }
        let long = u32::try_from(len).map_err(|_| ProtocolError::LengthOverflow(len))?;
        self.buf.put_u16_le(LEN16_ESCAPE);
        self.buf.put_u32_le(long);
        Ok(())
    }

    /// Writes raw bytes without a prefix.
    pub fn put_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Writes a length-prefixed byte string.
    pub fn put_bytes(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.put_len(data.len())?;
        self.buf.put_slice(data);
        Ok(())
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, s: &str) -> Result<(), ProtocolError> {
        self.put_bytes(s.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads payload fields from a borrowed buffer.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Consumes exactly `n` bytes.
    pub fn get_raw(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::ShortBuffer {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get_raw(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.get_raw(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        self.get_array().map(u16::from_le_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        self.get_array().map(u32::from_le_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64, ProtocolError> {
        self.get_array().map(u64::from_le_bytes)
    }

    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        self.get_array().map(i32::from_le_bytes)
    }

    pub fn get_i64(&mut self) -> Result<i64, ProtocolError> {
        self.get_array().map(i64::from_le_bytes)
    }

    /// Reads an LSB-first varint of at most ten groups.
    pub fn get_varint(&mut self) -> Result<u64, ProtocolError> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.get_u8()?;
            // The tenth group may only carry the 64th bit.
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(ProtocolError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::VarintOverflow)
    }

    /// Reads a 16-bit length prefix, following the 32-bit escape.
    pub fn get_len(&mut self) -> Result<usize, ProtocolError> {
        let short = self.get_u16()?;
        if short != LEN16_ESCAPE {
            return Ok(short as usize);
        }
        Ok(self.get_u32()? as usize)
    }

    /// Reads a length-prefixed byte string.
    pub fn get_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.get_len()?;
        self.get_raw(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn get_str(&mut self) -> Result<&'a str, ProtocolError> {
        std::str::from_utf8(self.get_bytes()?).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn get_string(&mut self) -> Result<String, ProtocolError> {
        self.get_str().map(str::to_owned)
    }
}
