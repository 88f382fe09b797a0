//! Protocol module - wire format, framing, and typed packets.
//!
//! This module implements the device packet layer:
//! - 4-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Endpoint-keyed typed packets with a raw passthrough variant

mod endpoint;
mod frame;
mod frame_buffer;
pub mod messages;
mod packet;
mod wire_format;

pub use endpoint::ProtocolEndpoint;
pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use messages::{
    ActionResponseCode, AppRunStateMessage, BlobCommand, BlobDatabase, BlobOperation,
    BlobResponse, BlobStatus, PingMessage, TimelineActionMessage, TimelineAttribute,
};
pub use packet::{decode, Decoded, Direction, Packet};
pub use wire_format::{Header, HEADER_SIZE, MAX_PAYLOAD_SIZE};
