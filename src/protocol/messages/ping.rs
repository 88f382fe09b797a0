//! Ping/pong (endpoint 0x07D1).

use crate::codec::{Endian, Mappable, StructReader, StructWriter};
use crate::error::{PebblewireError, Result};

const CMD_PING: u8 = 0;
const CMD_PONG: u8 = 1;

/// Keep-alive exchange; the pong echoes the ping's cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingMessage {
    Ping { cookie: u32 },
    Pong { cookie: u32 },
}

impl PingMessage {
    pub fn cookie(&self) -> u32 {
        match *self {
            PingMessage::Ping { cookie } | PingMessage::Pong { cookie } => cookie,
        }
    }

    pub fn is_known_command(command: u8) -> bool {
        matches!(command, CMD_PING | CMD_PONG)
    }
}

impl Mappable for PingMessage {
    fn write_to(&self, w: &mut StructWriter) -> Result<()> {
        let command = match self {
            PingMessage::Ping { .. } => CMD_PING,
            PingMessage::Pong { .. } => CMD_PONG,
        };
        w.u8(command);
        w.u32(self.cookie(), Endian::Big);
        Ok(())
    }

    fn read_from(r: &mut StructReader<'_>) -> Result<Self> {
        match r.u8()? {
            CMD_PING => Ok(PingMessage::Ping {
                cookie: r.u32(Endian::Big)?,
            }),
            CMD_PONG => Ok(PingMessage::Pong {
                cookie: r.u32(Endian::Big)?,
            }),
            other => Err(PebblewireError::Malformed(format!(
                "unknown ping command {}",
                other
            ))),
        }
    }
}
