//! App run state messages (endpoint 0x0034).
//!
//! Same layout in both directions: a command byte, followed by the app
//! UUID for start/stop.

use uuid::Uuid;

use crate::codec::{Mappable, StructReader, StructWriter};
use crate::error::{PebblewireError, Result};

const CMD_START: u8 = 1;
const CMD_STOP: u8 = 2;
const CMD_REQUEST: u8 = 3;

/// Application lifecycle message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppRunStateMessage {
    /// Phone → watch: launch. Watch → phone: this app is now running.
    Start(Uuid),
    /// Phone → watch: stop. Watch → phone: this app stopped.
    Stop(Uuid),
    /// Phone → watch: report the running app.
    Request,
}

impl AppRunStateMessage {
    /// Whether the command byte is one this module understands.
    pub fn is_known_command(command: u8) -> bool {
        matches!(command, CMD_START | CMD_STOP | CMD_REQUEST)
    }
}

impl Mappable for AppRunStateMessage {
    fn write_to(&self, w: &mut StructWriter) -> Result<()> {
        match self {
            AppRunStateMessage::Start(uuid) => {
                w.u8(CMD_START);
                w.uuid(uuid);
            }
            AppRunStateMessage::Stop(uuid) => {
                w.u8(CMD_STOP);
                w.uuid(uuid);
            }
            AppRunStateMessage::Request => w.u8(CMD_REQUEST),
        }
        Ok(())
    }

    fn read_from(r: &mut StructReader<'_>) -> Result<Self> {
        match r.u8()? {
            CMD_START => Ok(AppRunStateMessage::Start(r.uuid()?)),
            CMD_STOP => Ok(AppRunStateMessage::Stop(r.uuid()?)),
            CMD_REQUEST => Ok(AppRunStateMessage::Request),
            other => Err(PebblewireError::Malformed(format!(
                "unknown app run state command {}",
                other
            ))),
        }
    }
}
