//! Write cursor for building packet bodies.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::{Endian, LengthPrefix};
use crate::error::{PebblewireError, Result};

/// Appends fields to a growing buffer in declaration order.
#[derive(Debug, Default)]
pub struct StructWriter {
    buf: BytesMut,
}

impl StructWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Create an empty writer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    #[inline]
    pub fn u16(&mut self, value: u16, endian: Endian) {
        match endian {
            Endian::Big => self.buf.put_u16(value),
            Endian::Little => self.buf.put_u16_le(value),
        }
    }

    #[inline]
    pub fn u32(&mut self, value: u32, endian: Endian) {
        match endian {
            Endian::Big => self.buf.put_u32(value),
            Endian::Little => self.buf.put_u32_le(value),
        }
    }

    #[inline]
    pub fn u64(&mut self, value: u64, endian: Endian) {
        match endian {
            Endian::Big => self.buf.put_u64(value),
            Endian::Little => self.buf.put_u64_le(value),
        }
    }

    /// Raw bytes with no length information.
    #[inline]
    pub fn bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Exactly `len` bytes; `data` must match.
    pub fn fixed_bytes(&mut self, data: &[u8], len: usize) -> Result<()> {
        if data.len() != len {
            return Err(PebblewireError::Malformed(format!(
                "fixed field expects {} bytes, got {}",
                len,
                data.len()
            )));
        }
        self.buf.put_slice(data);
        Ok(())
    }

    /// A string occupying exactly `len` bytes.
    ///
    /// Shorter strings are padded with nulls, longer ones are cut at `len`.
    pub fn fixed_string(&mut self, value: &str, len: usize) {
        let mut n = value.len().min(len);
        // Never split a multi-byte character.
        while !value.is_char_boundary(n) {
            n -= 1;
        }
        self.buf.put_slice(&value.as_bytes()[..n]);
        self.buf.put_bytes(0, len - n);
    }

    /// A 128-bit identifier as 16 bytes, most significant first.
    #[inline]
    pub fn uuid(&mut self, value: &Uuid) {
        self.buf.put_slice(value.as_bytes());
    }

    /// A variable byte field preceded by its length.
    pub fn sized_bytes(&mut self, prefix: LengthPrefix, data: &[u8]) -> Result<()> {
        self.sized(prefix, |w| {
            w.bytes(data);
            Ok(())
        })
    }

    /// A variable field written by `body`, preceded by its length.
    ///
    /// The prefix slot is reserved first and filled in after the body, so
    /// its value always equals the body's serialized length.
    pub fn sized<F>(&mut self, prefix: LengthPrefix, body: F) -> Result<()>
    where
        F: FnOnce(&mut StructWriter) -> Result<()>,
    {
        let slot = self.buf.len();
        self.buf.put_bytes(0, prefix.width());
        body(self)?;

        let len = self.buf.len() - slot - prefix.width();
        if len > prefix.max_len() {
            return Err(PebblewireError::Malformed(format!(
                "field of {} bytes exceeds {}-byte length prefix",
                len,
                prefix.width()
            )));
        }

        match prefix {
            LengthPrefix::U8 => self.buf[slot] = len as u8,
            LengthPrefix::U16(Endian::Big) => {
                self.buf[slot..slot + 2].copy_from_slice(&(len as u16).to_be_bytes())
            }
            LengthPrefix::U16(Endian::Little) => {
                self.buf[slot..slot + 2].copy_from_slice(&(len as u16).to_le_bytes())
            }
        }
        Ok(())
    }

    /// Freeze the written bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
