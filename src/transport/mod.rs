//! Transport module - the physical link under the packet stream.
//!
//! Provides abstraction over:
//! - Bluetooth Classic (a plain byte stream, see [`classic`])
//! - BLE GATT with PPoG flow control (see [`ble`])
//!
//! A connector hands the protocol handler a [`LinkStreams`] pair: a channel
//! of inbound [`LinkEvent`]s and a [`MessageSink`] for outbound frames.
//! Platform Bluetooth APIs stay behind the `*Platform` traits.

pub mod ble;
pub mod classic;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::error::{DisconnectReason, Result};

pub use ble::{BleConnector, BlePlatform, ConnectivityStatus, GattConnectOptions, GattConnection};
pub use classic::{ClassicConnector, ClassicPlatform};

/// Which kind of physical link a connector drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Classic,
    Ble,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Classic => write!(f, "classic"),
            TransportKind::Ble => write!(f, "ble"),
        }
    }
}

/// Something that happened on the inbound side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Packet-stream bytes, in order.
    Data(Bytes),
    /// The link layer reset; any partially received frame is void.
    Reset,
    /// The link is gone.
    Closed(DisconnectReason),
}

/// Outbound half of a link. Owned by the protocol handler's writer task.
#[async_trait]
pub trait MessageSink: Send {
    /// Write one complete frame.
    ///
    /// May suspend while the link applies backpressure.
    async fn send(&mut self, frame: Bytes) -> Result<()>;
}

/// Both directions of an open link.
pub struct LinkStreams {
    pub inbound: mpsc::Receiver<LinkEvent>,
    pub outbound: Box<dyn MessageSink>,
}

impl fmt::Debug for LinkStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkStreams").finish_non_exhaustive()
    }
}

/// Capability over one physical connection to a watch.
///
/// `connect` brings up the physical link, `negotiate` brings up whatever
/// framing rides on it and returns the packet streams.
#[async_trait]
pub trait TransportConnector: Send {
    fn kind(&self) -> TransportKind;

    async fn connect(&mut self) -> Result<()>;

    async fn negotiate(&mut self) -> Result<LinkStreams>;

    /// Tear the link down. Safe to call more than once.
    async fn disconnect(&mut self);

    /// Resolves with the reason once the link ends.
    fn disconnected(&self) -> DisconnectSignal;
}

/// Sending side of a one-shot disconnect notification. First reason wins.
#[derive(Debug, Clone)]
pub struct DisconnectNotifier {
    tx: watch::Sender<Option<DisconnectReason>>,
}

impl DisconnectNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Record `reason` unless a reason is already set. Returns whether it was recorded.
    pub fn notify(&self, reason: DisconnectReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_notified(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn signal(&self) -> DisconnectSignal {
        DisconnectSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for DisconnectNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`DisconnectNotifier`].
#[derive(Debug, Clone)]
pub struct DisconnectSignal {
    rx: watch::Receiver<Option<DisconnectReason>>,
}

impl DisconnectSignal {
    /// Reason, if the link has already ended.
    pub fn current(&self) -> Option<DisconnectReason> {
        self.rx.borrow().clone()
    }

    /// Wait for the link to end.
    ///
    /// If the notifier is dropped without a reason, reports `RemoteClosed`.
    pub async fn wait(&mut self) -> DisconnectReason {
        let seen = self
            .rx
            .wait_for(|r| r.is_some())
            .await
            .map(|r| (*r).clone());
        match seen {
            Ok(Some(reason)) => reason,
            _ => self.current().unwrap_or(DisconnectReason::RemoteClosed),
        }
    }
}
