//! PPoG link-layer packets.
//!
//! ```text
//! ┌───────────────┬──────────┬─────────────────────────────────────┐
//! │ Sequence      │ Type     │ Body                                │
//! │ bits 7..3     │ bits 2..0│ Data: fragment bytes                │
//! │ (mod 32)      │          │ ResetRequest: version u8            │
//! │               │          │ ResetComplete (v1): rx u8, tx u8    │
//! └───────────────┴──────────┴─────────────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{PebblewireError, Result};

/// Sequence numbers wrap at this value.
pub const SEQUENCE_MODULO: u8 = 32;

/// Window implied by a version 0 reset complete.
pub const V0_WINDOW_SIZE: u8 = 4;

/// Per-fragment overhead: our type/sequence byte plus the ATT write header.
pub const DATA_HEADER_OVERHEAD: usize = 1 + 3;

const SEQUENCE_MASK: u8 = 0b1111_1000;
const TYPE_MASK: u8 = 0b0000_0111;

const TYPE_DATA: u8 = 0b000;
const TYPE_ACK: u8 = 0b001;
const TYPE_RESET_REQUEST: u8 = 0b010;
const TYPE_RESET_COMPLETE: u8 = 0b011;

/// Link-layer protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpogVersion {
    Zero,
    One,
}

impl PpogVersion {
    pub fn number(self) -> u8 {
        match self {
            PpogVersion::Zero => 0,
            PpogVersion::One => 1,
        }
    }

    pub fn from_number(n: u8) -> Result<Self> {
        match n {
            0 => Ok(PpogVersion::Zero),
            1 => Ok(PpogVersion::One),
            other => Err(PebblewireError::Malformed(format!(
                "unsupported PPoG version {}",
                other
            ))),
        }
    }

    /// Whether reset complete carries explicit window sizes.
    pub fn supports_window_negotiation(self) -> bool {
        self == PpogVersion::One
    }
}

/// One link-layer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PpogPacket {
    Data { sequence: u8, data: Bytes },
    Ack { sequence: u8 },
    ResetRequest { sequence: u8, version: PpogVersion },
    ResetComplete { sequence: u8, rx_window: u8, tx_window: u8 },
}

impl PpogPacket {
    pub fn sequence(&self) -> u8 {
        match *self {
            PpogPacket::Data { sequence, .. }
            | PpogPacket::Ack { sequence }
            | PpogPacket::ResetRequest { sequence, .. }
            | PpogPacket::ResetComplete { sequence, .. } => sequence,
        }
    }

    fn type_bits(&self) -> u8 {
        match self {
            PpogPacket::Data { .. } => TYPE_DATA,
            PpogPacket::Ack { .. } => TYPE_ACK,
            PpogPacket::ResetRequest { .. } => TYPE_RESET_REQUEST,
            PpogPacket::ResetComplete { .. } => TYPE_RESET_COMPLETE,
        }
    }

    /// Serialize for a link running `version`.
    ///
    /// Version 0 reset completes carry no window bytes.
    pub fn serialize(&self, version: PpogVersion) -> Bytes {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(((self.sequence() << 3) & SEQUENCE_MASK) | self.type_bits());
        match self {
            PpogPacket::Data { data, .. } => buf.put_slice(data),
            PpogPacket::Ack { .. } => {}
            PpogPacket::ResetRequest { version, .. } => buf.put_u8(version.number()),
            PpogPacket::ResetComplete {
                rx_window,
                tx_window,
                ..
            } => {
                if version.supports_window_negotiation() {
                    buf.put_u8(*rx_window);
                    buf.put_u8(*tx_window);
                }
            }
        }
        buf.freeze()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let first = *bytes.first().ok_or(PebblewireError::TruncatedInput {
            needed: 1,
            remaining: 0,
        })?;
        let sequence = (first & SEQUENCE_MASK) >> 3;
        match first & TYPE_MASK {
            TYPE_DATA => Ok(PpogPacket::Data {
                sequence,
                data: Bytes::copy_from_slice(&bytes[1..]),
            }),
            TYPE_ACK => Ok(PpogPacket::Ack { sequence }),
            TYPE_RESET_REQUEST => {
                let version = *bytes.get(1).ok_or(PebblewireError::TruncatedInput {
                    needed: 1,
                    remaining: 0,
                })?;
                Ok(PpogPacket::ResetRequest {
                    sequence,
                    version: PpogVersion::from_number(version)?,
                })
            }
            TYPE_RESET_COMPLETE => {
                let (rx_window, tx_window) = if bytes.len() >= 3 {
                    (bytes[1], bytes[2])
                } else {
                    (V0_WINDOW_SIZE, V0_WINDOW_SIZE)
                };
                Ok(PpogPacket::ResetComplete {
                    sequence,
                    rx_window,
                    tx_window,
                })
            }
            other => Err(PebblewireError::Malformed(format!(
                "unknown PPoG packet type {}",
                other
            ))),
        }
    }
}

/// Next sequence number after `seq`.
#[inline]
pub fn next_sequence(seq: u8) -> u8 {
    (seq + 1) % SEQUENCE_MODULO
}
