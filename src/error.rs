//! Error types for pebblewire.

use std::fmt;

use thiserror::Error;

/// Why a connection ended (or never started).
///
/// Reported to callers as a structured value so they can decide whether
/// reconnecting makes sense.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The Bluetooth Classic socket could not be opened.
    ClassicConnectionFailed(String),
    /// The BLE GATT connection could not be established.
    BleConnectionFailed(String),
    /// Bonding with the watch failed.
    PairingFailed(String),
    /// The negotiated MTU was unusable.
    MtuNegotiationFailed(u16),
    /// The link layer never completed its reset handshake.
    NegotiationTimeout,
    /// The link was reset and could not be renegotiated.
    LinkReset,
    /// A fragment exhausted its retransmission budget.
    RetriesExhausted,
    /// Read or write on the underlying transport failed.
    TransportError(String),
    /// The watch (or the platform) closed the link.
    RemoteClosed,
    /// We asked for the disconnection.
    LocalDisconnect,
    /// The platform Bluetooth radio was switched off.
    BluetoothDisabled,
}

impl DisconnectReason {
    /// Whether an automatic reconnect is worth attempting.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DisconnectReason::LocalDisconnect | DisconnectReason::BluetoothDisabled
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClassicConnectionFailed(e) => {
                write!(f, "classic connection failed: {}", e)
            }
            DisconnectReason::BleConnectionFailed(e) => write!(f, "BLE connection failed: {}", e),
            DisconnectReason::PairingFailed(e) => write!(f, "pairing failed: {}", e),
            DisconnectReason::MtuNegotiationFailed(mtu) => {
                write!(f, "MTU negotiation failed (got {})", mtu)
            }
            DisconnectReason::NegotiationTimeout => write!(f, "link negotiation timed out"),
            DisconnectReason::LinkReset => write!(f, "link reset"),
            DisconnectReason::RetriesExhausted => write!(f, "fragment retries exhausted"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {}", e),
            DisconnectReason::RemoteClosed => write!(f, "closed by remote"),
            DisconnectReason::LocalDisconnect => write!(f, "disconnected locally"),
            DisconnectReason::BluetoothDisabled => write!(f, "bluetooth disabled"),
        }
    }
}

/// Main error type for all pebblewire operations.
#[derive(Debug, Error)]
pub enum PebblewireError {
    /// I/O error on a transport stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Not enough bytes left to read a field.
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    TruncatedInput { needed: usize, remaining: usize },

    /// Bytes that cannot be interpreted (bad discriminator, oversized field, ...).
    #[error("malformed data: {0}")]
    Malformed(String),

    /// The transport failed; the session is over.
    #[error("transport failure: {0}")]
    TransportFailure(DisconnectReason),

    /// The link-layer send window is full.
    #[error("send window exhausted")]
    WindowExhausted,

    /// No response arrived within the configured timeout.
    #[error("request timed out")]
    RequestTimeout,

    /// The connection closed while the operation was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// A request with this correlation token is already in flight.
    #[error("duplicate correlation token: {0}")]
    DuplicateToken(u32),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias using PebblewireError.
pub type Result<T> = std::result::Result<T, PebblewireError>;
