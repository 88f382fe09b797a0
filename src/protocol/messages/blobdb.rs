//! BlobDB messages (endpoint 0xB1DB).
//!
//! Phone → watch commands:
//! ```text
//! ┌─────────┬───────────┬──────────┬──────────────────────────────────┐
//! │ Command │ Token     │ Database │ Insert: key_len u8, key,         │
//! │ u8      │ u16 LE    │ u8       │         val_len u16 LE, value    │
//! │         │           │          │ Delete: key_len u8, key          │
//! └─────────┴───────────┴──────────┴──────────────────────────────────┘
//! ```
//!
//! Watch → phone responses carry the echoed token (u16 LE) and a status byte.

use bytes::Bytes;

use crate::codec::{Endian, LengthPrefix, Mappable, StructReader, StructWriter};
use crate::error::{PebblewireError, Result};

const CMD_INSERT: u8 = 0x01;
const CMD_DELETE: u8 = 0x04;
const CMD_CLEAR: u8 = 0x05;

/// Watch-side database a record belongs to. Compares by id.
#[derive(Debug, Clone, Copy)]
pub enum BlobDatabase {
    Test,
    Pin,
    App,
    Reminder,
    Notification,
    Weather,
    CannedResponses,
    HealthParams,
    Contacts,
    AppConfigs,
    HealthStats,
    AppGlance,
    /// Any id this crate doesn't know about.
    Other(u8),
}

impl BlobDatabase {
    pub fn id(self) -> u8 {
        match self {
            BlobDatabase::Test => 0,
            BlobDatabase::Pin => 1,
            BlobDatabase::App => 2,
            BlobDatabase::Reminder => 3,
            BlobDatabase::Notification => 4,
            BlobDatabase::Weather => 5,
            BlobDatabase::CannedResponses => 6,
            BlobDatabase::HealthParams => 7,
            BlobDatabase::Contacts => 8,
            BlobDatabase::AppConfigs => 9,
            BlobDatabase::HealthStats => 10,
            BlobDatabase::AppGlance => 11,
            BlobDatabase::Other(id) => id,
        }
    }

    pub fn from_id(id: u8) -> Self {
        match id {
            0 => BlobDatabase::Test,
            1 => BlobDatabase::Pin,
            2 => BlobDatabase::App,
            3 => BlobDatabase::Reminder,
            4 => BlobDatabase::Notification,
            5 => BlobDatabase::Weather,
            6 => BlobDatabase::CannedResponses,
            7 => BlobDatabase::HealthParams,
            8 => BlobDatabase::Contacts,
            9 => BlobDatabase::AppConfigs,
            10 => BlobDatabase::HealthStats,
            11 => BlobDatabase::AppGlance,
            other => BlobDatabase::Other(other),
        }
    }
}

impl PartialEq for BlobDatabase {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for BlobDatabase {}

impl std::hash::Hash for BlobDatabase {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

/// Outcome the watch reports for a command. Compares by code.
#[derive(Debug, Clone, Copy)]
pub enum BlobStatus {
    Success,
    GeneralFailure,
    InvalidOperation,
    InvalidDatabaseId,
    InvalidData,
    KeyDoesNotExist,
    DatabaseFull,
    DataStale,
    NotSupported,
    Locked,
    TryLater,
    Other(u8),
}

impl BlobStatus {
    pub fn code(self) -> u8 {
        match self {
            BlobStatus::Success => 1,
            BlobStatus::GeneralFailure => 2,
            BlobStatus::InvalidOperation => 3,
            BlobStatus::InvalidDatabaseId => 4,
            BlobStatus::InvalidData => 5,
            BlobStatus::KeyDoesNotExist => 6,
            BlobStatus::DatabaseFull => 7,
            BlobStatus::DataStale => 8,
            BlobStatus::NotSupported => 9,
            BlobStatus::Locked => 10,
            BlobStatus::TryLater => 11,
            BlobStatus::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => BlobStatus::Success,
            2 => BlobStatus::GeneralFailure,
            3 => BlobStatus::InvalidOperation,
            4 => BlobStatus::InvalidDatabaseId,
            5 => BlobStatus::InvalidData,
            6 => BlobStatus::KeyDoesNotExist,
            7 => BlobStatus::DatabaseFull,
            8 => BlobStatus::DataStale,
            9 => BlobStatus::NotSupported,
            10 => BlobStatus::Locked,
            11 => BlobStatus::TryLater,
            other => BlobStatus::Other(other),
        }
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self == BlobStatus::Success
    }
}

impl PartialEq for BlobStatus {
    fn eq(&self, other: &Self) -> bool {
        self.code() == other.code()
    }
}

impl Eq for BlobStatus {}

/// What a command does to the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobOperation {
    Insert { key: Bytes, value: Bytes },
    Delete { key: Bytes },
    Clear,
}

/// A token-correlated command sent to the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobCommand {
    pub token: u16,
    pub database: BlobDatabase,
    pub operation: BlobOperation,
}

impl BlobCommand {
    pub fn insert(
        token: u16,
        database: BlobDatabase,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            token,
            database,
            operation: BlobOperation::Insert {
                key: key.into(),
                value: value.into(),
            },
        }
    }

    pub fn delete(token: u16, database: BlobDatabase, key: impl Into<Bytes>) -> Self {
        Self {
            token,
            database,
            operation: BlobOperation::Delete { key: key.into() },
        }
    }

    pub fn clear(token: u16, database: BlobDatabase) -> Self {
        Self {
            token,
            database,
            operation: BlobOperation::Clear,
        }
    }

    fn command_byte(&self) -> u8 {
        match self.operation {
            BlobOperation::Insert { .. } => CMD_INSERT,
            BlobOperation::Delete { .. } => CMD_DELETE,
            BlobOperation::Clear => CMD_CLEAR,
        }
    }

    /// Whether the command byte is one this module understands.
    pub fn is_known_command(command: u8) -> bool {
        matches!(command, CMD_INSERT | CMD_DELETE | CMD_CLEAR)
    }
}

impl Mappable for BlobCommand {
    fn write_to(&self, w: &mut StructWriter) -> Result<()> {
        w.u8(self.command_byte());
        w.u16(self.token, Endian::Little);
        w.u8(self.database.id());
        match &self.operation {
            BlobOperation::Insert { key, value } => {
                w.sized_bytes(LengthPrefix::U8, key)?;
                w.sized_bytes(LengthPrefix::U16(Endian::Little), value)?;
            }
            BlobOperation::Delete { key } => {
                w.sized_bytes(LengthPrefix::U8, key)?;
            }
            BlobOperation::Clear => {}
        }
        Ok(())
    }

    fn read_from(r: &mut StructReader<'_>) -> Result<Self> {
        let command = r.u8()?;
        let token = r.u16(Endian::Little)?;
        let database = BlobDatabase::from_id(r.u8()?);
        let operation = match command {
            CMD_INSERT => {
                let key = Bytes::copy_from_slice(r.sized_bytes(LengthPrefix::U8)?);
                let value =
                    Bytes::copy_from_slice(r.sized_bytes(LengthPrefix::U16(Endian::Little))?);
                BlobOperation::Insert { key, value }
            }
            CMD_DELETE => BlobOperation::Delete {
                key: Bytes::copy_from_slice(r.sized_bytes(LengthPrefix::U8)?),
            },
            CMD_CLEAR => BlobOperation::Clear,
            other => {
                return Err(PebblewireError::Malformed(format!(
                    "unknown blobdb command {}",
                    other
                )))
            }
        };
        Ok(Self {
            token,
            database,
            operation,
        })
    }
}

/// The watch's answer to a [`BlobCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobResponse {
    pub token: u16,
    pub status: BlobStatus,
}

impl Mappable for BlobResponse {
    fn write_to(&self, w: &mut StructWriter) -> Result<()> {
        w.u16(self.token, Endian::Little);
        w.u8(self.status.code());
        Ok(())
    }

    fn read_from(r: &mut StructReader<'_>) -> Result<Self> {
        Ok(Self {
            token: r.u16(Endian::Little)?,
            status: BlobStatus::from_code(r.u8()?),
        })
    }
}
