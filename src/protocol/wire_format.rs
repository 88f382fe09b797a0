//! Wire format encoding and decoding.
//!
//! Implements the 4-byte Pebble Protocol header:
//! ```text
//! ┌──────────────┬──────────┬─────────────┐
//! │ Payload len  │ Endpoint │ Payload ... │
//! │ 2 bytes      │ 2 bytes  │ len bytes   │
//! │ uint16 BE    │ uint16 BE│             │
//! └──────────────┴──────────┴─────────────┘
//! ```
//!
//! The length counts payload bytes only, not the header itself.

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size a header can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes.
    pub payload_length: u16,
    /// Protocol endpoint the payload belongs to.
    pub endpoint: u16,
}

impl Header {
    /// Create a new header.
    pub fn new(endpoint: u16, payload_length: u16) -> Self {
        Self {
            payload_length,
            endpoint,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use pebblewire::protocol::Header;
    ///
    /// let header = Header::new(0xB1DB, 7);
    /// assert_eq!(header.encode(), [0x00, 0x07, 0xB1, 0xDB]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (4 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[2..4].copy_from_slice(&self.endpoint.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            payload_length: u16::from_be_bytes([buf[0], buf[1]]),
            endpoint: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    /// Header plus payload size.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(0x0034, 17);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let bytes = Header::new(0x0102, 0x0304).encode();
        assert_eq!(bytes, [0x03, 0x04, 0x01, 0x02]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Header::decode(&[0u8; 3]).is_none());
    }

    #[test]
    fn test_frame_len_includes_header() {
        assert_eq!(Header::new(1, 10).frame_len(), 14);
        assert_eq!(Header::new(1, 0).frame_len(), HEADER_SIZE);
    }
}
