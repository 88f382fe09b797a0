//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 4 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes
//!
//! A partial frame is never an error: the buffer simply holds on to the
//! bytes until the next push completes it.
//!
//! # Example
//!
//! ```
//! use pebblewire::protocol::{build_frame, FrameBuffer};
//!
//! let bytes = build_frame(0x0034, &[3]).unwrap();
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&bytes[..2]).is_empty());
//! let frames = buffer.push(&bytes[2..]);
//! assert_eq!(frames.len(), 1);
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, HEADER_SIZE};
use super::Frame;

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: Header },
}

/// Accumulates incoming bytes and extracts complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
}

impl FrameBuffer {
    /// Create a new frame buffer (4 KB initial capacity).
    pub fn new() -> Self {
        Self::with_capacity(4 * 1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }
        frames
    }

    fn try_extract_one(&mut self) -> Option<Frame> {
        match self.state {
            State::WaitingForHeader => {
                let header = Header::decode(&self.buffer)?;
                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.payload_length == 0 {
                    return Some(Frame::new(header, Bytes::new()));
                }

                self.state = State::WaitingForPayload { header };
                self.try_extract_one()
            }

            State::WaitingForPayload { header } => {
                let remaining = header.payload_length as usize;
                if self.buffer.len() < remaining {
                    return None;
                }

                let payload = self.buffer.split_to(remaining).freeze();
                self.state = State::WaitingForHeader;
                Some(Frame::new(header, payload))
            }
        }
    }

    /// Number of buffered bytes not yet part of an extracted frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::WaitingForHeader)
    }

    /// Drop any partial frame and start over.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_frame;

    fn make_frame_bytes(endpoint: u16, payload: &[u8]) -> Vec<u8> {
        build_frame(endpoint, payload).unwrap().to_vec()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame_bytes(0xB1DB, b"hello"));

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].endpoint(), 0xB1DB);
        assert_eq!(&frames[0].payload[..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = Vec::new();
        combined.extend_from_slice(&make_frame_bytes(1, b"first"));
        combined.extend_from_slice(&make_frame_bytes(2, b"second"));
        combined.extend_from_slice(&make_frame_bytes(3, b"third"));

        let frames = buffer.push(&combined);

        let endpoints: Vec<u16> = frames.iter().map(|f| f.endpoint()).collect();
        assert_eq!(endpoints, vec![1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let frame_bytes = make_frame_bytes(1, b"test");

        assert!(buffer.push(&frame_bytes[..3]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        let frames = buffer.push(&frame_bytes[3..]);
        assert_eq!(frames.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = b"this is a longer payload that will be fragmented";
        let frame_bytes = make_frame_bytes(1, payload);

        let partial_len = HEADER_SIZE + 10;
        assert!(buffer.push(&frame_bytes[..partial_len]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        let frames = buffer.push(&frame_bytes[partial_len..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], payload);
    }

    #[test]
    fn test_empty_payload() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame_bytes(7, b""));

        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
        assert_eq!(frames[0].header.payload_length, 0);
    }

    #[test]
    fn test_max_size_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = vec![0xAB; u16::MAX as usize];
        let frames = buffer.push(&make_frame_bytes(1, &payload));

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), u16::MAX as usize);
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let frame_bytes = make_frame_bytes(1, b"test");

        buffer.push(&frame_bytes[..HEADER_SIZE + 1]);
        assert_eq!(buffer.state_name(), "WaitingForPayload");
        assert!(!buffer.is_empty());

        buffer.clear();

        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(buffer.is_empty());

        // Fresh frame decodes normally after the reset
        let frames = buffer.push(&make_frame_bytes(2, b"ok"));
        assert_eq!(frames[0].endpoint(), 2);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let frame_bytes = make_frame_bytes(0x07D1, b"hi");

        let mut all_frames = Vec::new();
        for (i, byte) in frame_bytes.iter().enumerate() {
            let frames = buffer.push(&[*byte]);
            if i + 1 < frame_bytes.len() {
                assert!(frames.is_empty());
            }
            all_frames.extend(frames);
        }

        assert_eq!(all_frames.len(), 1);
        assert_eq!(&all_frames[0].payload[..], b"hi");
    }
}
