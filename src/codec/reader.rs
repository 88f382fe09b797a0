//! Read cursor for parsing packet bodies.

use uuid::Uuid;

use super::{Endian, LengthPrefix};
use crate::error::{PebblewireError, Result};

/// Consumes fields from a byte slice in declaration order.
///
/// Every read either advances the cursor by the field's size or fails with
/// [`PebblewireError::TruncatedInput`] and leaves the cursor untouched.
#[derive(Debug, Clone)]
pub struct StructReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> StructReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset from the start of the buffer.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(PebblewireError::TruncatedInput {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Look at the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(PebblewireError::TruncatedInput {
                needed: 1,
                remaining: 0,
            })
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self, endian: Endian) -> Result<u16> {
        let raw = self.array::<2>()?;
        Ok(match endian {
            Endian::Big => u16::from_be_bytes(raw),
            Endian::Little => u16::from_le_bytes(raw),
        })
    }

    pub fn u32(&mut self, endian: Endian) -> Result<u32> {
        let raw = self.array::<4>()?;
        Ok(match endian {
            Endian::Big => u32::from_be_bytes(raw),
            Endian::Little => u32::from_le_bytes(raw),
        })
    }

    pub fn u64(&mut self, endian: Endian) -> Result<u64> {
        let raw = self.array::<8>()?;
        Ok(match endian {
            Endian::Big => u64::from_be_bytes(raw),
            Endian::Little => u64::from_le_bytes(raw),
        })
    }

    /// Exactly `len` raw bytes.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// A `len`-byte string field, cut at the first null.
    pub fn fixed_string(&mut self, len: usize) -> Result<String> {
        let raw = self.take(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// A 128-bit identifier stored as 16 bytes, most significant first.
    pub fn uuid(&mut self) -> Result<Uuid> {
        Ok(Uuid::from_bytes(self.array::<16>()?))
    }

    /// A variable byte field whose length precedes it.
    ///
    /// The prefix is only consumed if the whole field is available.
    pub fn sized_bytes(&mut self, prefix: LengthPrefix) -> Result<&'a [u8]> {
        let start = self.pos;
        let len = match prefix {
            LengthPrefix::U8 => self.u8()? as usize,
            LengthPrefix::U16(endian) => self.u16(endian)? as usize,
        };
        match self.take(len) {
            Ok(data) => Ok(data),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Everything left in the buffer.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}
