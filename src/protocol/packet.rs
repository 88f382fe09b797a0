//! Typed packets keyed by endpoint.
//!
//! [`Packet`] is a closed set of known message kinds plus a
//! [`Packet::Raw`] catch-all. Unknown endpoints, and unknown command bytes
//! on known endpoints, decode to `Raw` so the stream stays in sync and the
//! caller can still route or discard them.
//!
//! # Example
//!
//! ```
//! use pebblewire::protocol::{decode, Decoded, Direction, Packet, PingMessage};
//!
//! let bytes = Packet::Ping(PingMessage::Pong { cookie: 9 }).encode().unwrap();
//!
//! match decode(&bytes, Direction::FromWatch) {
//!     Decoded::Packet { packet, consumed } => {
//!         assert_eq!(packet, Packet::Ping(PingMessage::Pong { cookie: 9 }));
//!         assert_eq!(consumed, bytes.len());
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

use bytes::Bytes;

use super::endpoint::ProtocolEndpoint;
use super::frame::{build_frame, Frame};
use super::messages::{
    AppRunStateMessage, BlobCommand, BlobResponse, PingMessage, TimelineActionMessage,
};
use super::wire_format::Header;
use crate::codec::Mappable;
use crate::error::{PebblewireError, Result};

/// Which side produced the bytes being decoded.
///
/// Some endpoints carry different structures per direction (BlobDB sends
/// commands one way and responses the other).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromWatch,
    ToWatch,
}

/// A decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    AppRunState(AppRunStateMessage),
    BlobCommand(BlobCommand),
    BlobResponse(BlobResponse),
    TimelineAction(TimelineActionMessage),
    Ping(PingMessage),
    /// Endpoint or command not modelled here; payload passed through untouched.
    Raw { endpoint: u16, payload: Bytes },
}

impl Packet {
    /// Endpoint identifier this packet travels on.
    pub fn endpoint(&self) -> u16 {
        match self {
            Packet::AppRunState(_) => ProtocolEndpoint::APP_RUN_STATE,
            Packet::BlobCommand(_) | Packet::BlobResponse(_) => ProtocolEndpoint::BLOB_DB,
            Packet::TimelineAction(_) => ProtocolEndpoint::TIMELINE_ACTIONS,
            Packet::Ping(_) => ProtocolEndpoint::PING,
            Packet::Raw { endpoint, .. } => *endpoint,
        }
    }

    /// Serialized payload, without the frame header.
    pub fn payload(&self) -> Result<Bytes> {
        match self {
            Packet::AppRunState(m) => m.serialize(),
            Packet::BlobCommand(m) => m.serialize(),
            Packet::BlobResponse(m) => m.serialize(),
            Packet::TimelineAction(m) => m.serialize(),
            Packet::Ping(m) => m.serialize(),
            Packet::Raw { payload, .. } => Ok(payload.clone()),
        }
    }

    /// Full wire frame: header followed by payload.
    pub fn encode(&self) -> Result<Bytes> {
        build_frame(self.endpoint(), &self.payload()?)
    }

    /// Interpret a frame's payload.
    ///
    /// Returns an error only when a known structure is truncated or
    /// malformed; anything unrecognised becomes [`Packet::Raw`].
    pub fn from_frame(frame: &Frame, direction: Direction) -> Result<Packet> {
        Self::from_payload(frame.endpoint(), frame.payload.clone(), direction)
    }

    pub fn from_payload(endpoint: u16, payload: Bytes, direction: Direction) -> Result<Packet> {
        let raw = || Packet::Raw {
            endpoint,
            payload: payload.clone(),
        };
        let Some(known) = ProtocolEndpoint::from_id(endpoint) else {
            return Ok(raw());
        };
        let command = payload.first().copied();

        let packet = match (known, direction) {
            (ProtocolEndpoint::AppRunState, _) => match command {
                Some(c) if !AppRunStateMessage::is_known_command(c) => raw(),
                _ => Packet::AppRunState(AppRunStateMessage::deserialize(&payload)?),
            },
            (ProtocolEndpoint::BlobDb, Direction::ToWatch) => match command {
                Some(c) if !BlobCommand::is_known_command(c) => raw(),
                _ => Packet::BlobCommand(BlobCommand::deserialize(&payload)?),
            },
            (ProtocolEndpoint::BlobDb, Direction::FromWatch) => {
                Packet::BlobResponse(BlobResponse::deserialize(&payload)?)
            }
            (ProtocolEndpoint::TimelineActions, _) => match command {
                Some(c) if !TimelineActionMessage::is_known_command(c) => raw(),
                _ => Packet::TimelineAction(TimelineActionMessage::deserialize(&payload)?),
            },
            (ProtocolEndpoint::Ping, _) => match command {
                Some(c) if !PingMessage::is_known_command(c) => raw(),
                _ => Packet::Ping(PingMessage::deserialize(&payload)?),
            },
        };
        Ok(packet)
    }
}

/// Result of decoding from the front of a byte buffer.
#[derive(Debug)]
pub enum Decoded {
    /// A whole frame was available; `consumed` bytes belong to it.
    Packet { packet: Packet, consumed: usize },
    /// The buffer holds only part of a frame. Not an error.
    NeedMoreBytes,
    /// A complete frame whose payload could not be parsed. Skipping
    /// `consumed` bytes keeps the stream in sync.
    Malformed {
        endpoint: u16,
        consumed: usize,
        error: PebblewireError,
    },
}

/// Decode one frame from the front of `bytes`.
pub fn decode(bytes: &[u8], direction: Direction) -> Decoded {
    let Some(header) = Header::decode(bytes) else {
        return Decoded::NeedMoreBytes;
    };
    let consumed = header.frame_len();
    if bytes.len() < consumed {
        return Decoded::NeedMoreBytes;
    }
    let payload = Bytes::copy_from_slice(&bytes[super::HEADER_SIZE..consumed]);
    match Packet::from_payload(header.endpoint, payload, direction) {
        Ok(packet) => Decoded::Packet { packet, consumed },
        Err(error) => Decoded::Malformed {
            endpoint: header.endpoint,
            consumed,
            error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{BlobDatabase, BlobStatus};
    use uuid::Uuid;

    #[test]
    fn test_unknown_endpoint_is_raw() {
        let bytes = build_frame(0x1234, b"\x01\x02").unwrap();
        match decode(&bytes, Direction::FromWatch) {
            Decoded::Packet { packet, consumed } => {
                assert_eq!(
                    packet,
                    Packet::Raw {
                        endpoint: 0x1234,
                        payload: Bytes::from_static(b"\x01\x02")
                    }
                );
                assert_eq!(consumed, 6);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command_on_known_endpoint_is_raw() {
        let bytes = build_frame(ProtocolEndpoint::APP_RUN_STATE, &[0x7F]).unwrap();
        match decode(&bytes, Direction::FromWatch) {
            Decoded::Packet {
                packet: Packet::Raw { endpoint, .. },
                ..
            } => assert_eq!(endpoint, ProtocolEndpoint::APP_RUN_STATE),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_blobdb_direction_selects_structure() {
        let cmd = Packet::BlobCommand(BlobCommand::clear(5, BlobDatabase::Pin));
        let bytes = cmd.encode().unwrap();
        match decode(&bytes, Direction::ToWatch) {
            Decoded::Packet { packet, .. } => assert_eq!(packet, cmd),
            other => panic!("unexpected {:?}", other),
        }

        let resp = Packet::BlobResponse(BlobResponse {
            token: 5,
            status: BlobStatus::Success,
        });
        let bytes = resp.encode().unwrap();
        match decode(&bytes, Direction::FromWatch) {
            Decoded::Packet { packet, .. } => assert_eq!(packet, resp),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_needs_more_bytes() {
        let bytes = Packet::AppRunState(AppRunStateMessage::Start(Uuid::from_u128(3)))
            .encode()
            .unwrap();
        for cut in 0..bytes.len() {
            assert!(matches!(
                decode(&bytes[..cut], Direction::FromWatch),
                Decoded::NeedMoreBytes
            ));
        }
    }

    #[test]
    fn test_truncated_known_structure_is_malformed() {
        // Start command but only 2 of 16 uuid bytes
        let bytes = build_frame(ProtocolEndpoint::APP_RUN_STATE, &[1, 0xAA, 0xBB]).unwrap();
        match decode(&bytes, Direction::FromWatch) {
            Decoded::Malformed {
                endpoint,
                consumed,
                error,
            } => {
                assert_eq!(endpoint, ProtocolEndpoint::APP_RUN_STATE);
                assert_eq!(consumed, 7);
                assert!(matches!(error, PebblewireError::TruncatedInput { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encode_prepends_header() {
        let packet = Packet::Ping(PingMessage::Ping { cookie: 1 });
        let bytes = packet.encode().unwrap();
        assert_eq!(&bytes[..4], &[0x00, 0x05, 0x07, 0xD1]);
    }
}
