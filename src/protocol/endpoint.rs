//! Protocol endpoint identifiers.

/// Logical sub-protocols multiplexed over one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolEndpoint {
    /// Application launch/stop notifications and queries.
    AppRunState,
    /// Key/value record replication.
    BlobDb,
    /// Timeline and notification action invocations.
    TimelineActions,
    /// Keep-alive ping/pong.
    Ping,
}

impl ProtocolEndpoint {
    pub const APP_RUN_STATE: u16 = 0x0034;
    pub const BLOB_DB: u16 = 0xB1DB;
    pub const TIMELINE_ACTIONS: u16 = 0x2CB0;
    pub const PING: u16 = 0x07D1;

    /// Numeric identifier on the wire.
    pub fn id(self) -> u16 {
        match self {
            ProtocolEndpoint::AppRunState => Self::APP_RUN_STATE,
            ProtocolEndpoint::BlobDb => Self::BLOB_DB,
            ProtocolEndpoint::TimelineActions => Self::TIMELINE_ACTIONS,
            ProtocolEndpoint::Ping => Self::PING,
        }
    }

    /// Known endpoint for a wire identifier, if any.
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            Self::APP_RUN_STATE => Some(ProtocolEndpoint::AppRunState),
            Self::BLOB_DB => Some(ProtocolEndpoint::BlobDb),
            Self::TIMELINE_ACTIONS => Some(ProtocolEndpoint::TimelineActions),
            Self::PING => Some(ProtocolEndpoint::Ping),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_mapping_is_bijective() {
        for ep in [
            ProtocolEndpoint::AppRunState,
            ProtocolEndpoint::BlobDb,
            ProtocolEndpoint::TimelineActions,
            ProtocolEndpoint::Ping,
        ] {
            assert_eq!(ProtocolEndpoint::from_id(ep.id()), Some(ep));
        }
    }

    #[test]
    fn test_unknown_id() {
        assert_eq!(ProtocolEndpoint::from_id(0x1234), None);
    }
}
