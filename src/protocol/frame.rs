//! Frame struct with typed accessors.
//!
//! Represents one complete protocol frame: header plus payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use pebblewire::protocol::{build_frame, FrameBuffer};
//!
//! let bytes = build_frame(0x07D1, b"\x00\x00\x00\x00\x01").unwrap();
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&bytes);
//!
//! assert_eq!(frames[0].endpoint(), 0x07D1);
//! assert_eq!(frames[0].payload_len(), 5);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{Header, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::{PebblewireError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Endpoint the payload is addressed to.
    #[inline]
    pub fn endpoint(&self) -> u16 {
        self.header.endpoint
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Header and payload re-joined into wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Build a complete frame as one contiguous buffer.
///
/// Fails if the payload is longer than a u16 length field can describe.
pub fn build_frame(endpoint: u16, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(PebblewireError::Malformed(format!(
            "payload of {} bytes exceeds maximum {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    let header = Header::new(endpoint, payload.len() as u16);
    let mut buf = BytesMut::with_capacity(header.frame_len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    Ok(buf.freeze())
}
