//! Codec module - declarative binary field mapping.
//!
//! Every packet body is described as an ordered list of fields written
//! through a [`StructWriter`] and read back through a [`StructReader`]:
//!
//! - Fixed-width integers with an explicit [`Endian`] per field
//! - Fixed-length byte arrays and null-padded strings
//! - 128-bit identifiers ([`uuid::Uuid`], 16 raw bytes)
//! - Length-prefixed byte fields whose size is derived from the content
//!
//! # Design
//!
//! The device protocol mixes endianness per field, so there is no
//! "default" byte order: every multi-byte read/write names one.
//!
//! # Example
//!
//! ```
//! use pebblewire::codec::{Endian, LengthPrefix, StructReader, StructWriter};
//!
//! let mut w = StructWriter::new();
//! w.u8(1);
//! w.u16(0xB1DB, Endian::Little);
//! w.sized_bytes(LengthPrefix::U8, b"key").unwrap();
//! let bytes = w.finish();
//!
//! let mut r = StructReader::new(&bytes);
//! assert_eq!(r.u8().unwrap(), 1);
//! assert_eq!(r.u16(Endian::Little).unwrap(), 0xB1DB);
//! assert_eq!(r.sized_bytes(LengthPrefix::U8).unwrap(), b"key");
//! ```

mod reader;
mod writer;

pub use reader::StructReader;
pub use writer::StructWriter;

use bytes::Bytes;

use crate::error::Result;

/// Byte order of a multi-byte field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Most significant byte first.
    Big,
    /// Least significant byte first.
    Little,
}

/// Width and byte order of a length prefix bound to a variable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    /// Single byte, max 255.
    U8,
    /// Two bytes, max 65535.
    U16(Endian),
}

impl LengthPrefix {
    /// Number of bytes the prefix itself occupies.
    #[inline]
    pub fn width(&self) -> usize {
        match self {
            LengthPrefix::U8 => 1,
            LengthPrefix::U16(_) => 2,
        }
    }

    /// Largest content length the prefix can describe.
    #[inline]
    pub fn max_len(&self) -> usize {
        match self {
            LengthPrefix::U8 => u8::MAX as usize,
            LengthPrefix::U16(_) => u16::MAX as usize,
        }
    }
}

/// A structure with a deterministic binary layout.
pub trait Mappable: Sized {
    /// Append this structure's fields in declaration order.
    fn write_to(&self, w: &mut StructWriter) -> Result<()>;

    /// Consume this structure's fields in declaration order.
    fn read_from(r: &mut StructReader<'_>) -> Result<Self>;

    /// Serialize into a fresh buffer.
    fn serialize(&self) -> Result<Bytes> {
        let mut w = StructWriter::new();
        self.write_to(&mut w)?;
        Ok(w.finish())
    }

    /// Deserialize from the start of `bytes`. Trailing bytes are ignored.
    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = StructReader::new(bytes);
        Self::read_from(&mut r)
    }

    /// Exact number of bytes `serialize` produces.
    fn encoded_len(&self) -> Result<usize> {
        let mut w = StructWriter::new();
        self.write_to(&mut w)?;
        Ok(w.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[derive(Debug, PartialEq)]
    struct Sample {
        id: u32,
        name: String,
        uuid: Uuid,
        blob: Vec<u8>,
    }

    impl Mappable for Sample {
        fn write_to(&self, w: &mut StructWriter) -> Result<()> {
            w.u32(self.id, Endian::Little);
            w.fixed_string(&self.name, 8);
            w.uuid(&self.uuid);
            w.sized_bytes(LengthPrefix::U16(Endian::Big), &self.blob)?;
            Ok(())
        }

        fn read_from(r: &mut StructReader<'_>) -> Result<Self> {
            Ok(Self {
                id: r.u32(Endian::Little)?,
                name: r.fixed_string(8)?,
                uuid: r.uuid()?,
                blob: r.sized_bytes(LengthPrefix::U16(Endian::Big))?.to_vec(),
            })
        }
    }

    fn sample() -> Sample {
        Sample {
            id: 0xDEADBEEF,
            name: "watch".to_string(),
            uuid: Uuid::from_u128(0x0102030405060708090a0b0c0d0e0f10),
            blob: vec![9, 8, 7],
        }
    }

    #[test]
    fn test_mappable_round_trip() {
        let original = sample();
        let bytes = original.serialize().unwrap();
        assert_eq!(Sample::deserialize(&bytes).unwrap(), original);
    }

    #[test]
    fn test_encoded_len_matches_serialize() {
        let s = sample();
        assert_eq!(s.encoded_len().unwrap(), 4 + 8 + 16 + 2 + 3);
        assert_eq!(s.serialize().unwrap().len(), s.encoded_len().unwrap());
    }

    #[test]
    fn test_truncated_struct_fails() {
        let bytes = sample().serialize().unwrap();
        let err = Sample::deserialize(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(
            err,
            crate::PebblewireError::TruncatedInput { .. }
        ));
    }

    #[test]
    fn test_length_prefix_limits() {
        assert_eq!(LengthPrefix::U8.width(), 1);
        assert_eq!(LengthPrefix::U16(Endian::Little).width(), 2);
        assert_eq!(LengthPrefix::U8.max_len(), 255);
        assert_eq!(LengthPrefix::U16(Endian::Big).max_len(), 65535);
    }
}
