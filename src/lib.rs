//! # pebblewire
//!
//! Phone-side protocol stack for Pebble-style smartwatches.
//!
//! Carries the framed, endpoint-multiplexed packet protocol over Bluetooth
//! Classic or BLE, and turns it into awaitable service calls.
//!
//! ## Architecture
//!
//! ```text
//! services (BlobDB, app run state, timeline, system)
//!     │  ▲
//!     ▼  │  priority queue out, broadcast in
//! protocol handler ── framing ── codec
//!     │  ▲
//!     ▼  │
//! transport connector ── Classic socket
//!                     └─ BLE GATT + PPoG link layer
//! ```
//!
//! Platform Bluetooth APIs stay outside the crate, behind
//! [`transport::ClassicPlatform`] and [`transport::BlePlatform`].
//!
//! ## Example
//!
//! ```ignore
//! use pebblewire::{ConnectionSession, SessionConfig};
//! use pebblewire::protocol::BlobDatabase;
//! use pebblewire::transport::ClassicConnector;
//!
//! #[tokio::main]
//! async fn main() -> pebblewire::Result<()> {
//!     let config = SessionConfig::from_json_file("pebble.json")?;
//!     let connector = Box::new(ClassicConnector::new(platform));
//!     let session = ConnectionSession::establish(connector, &config).await?;
//!
//!     session.system().ping(0xC0FFEE).await?;
//!     session.blobdb().clear(BlobDatabase::Notification).await?;
//!
//!     let reason = session.wait_for_disconnect().await;
//!     println!("disconnected: {}", reason);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod ppog;
pub mod protocol;
pub mod services;
pub mod session;
pub mod transport;

pub use config::{BleConfig, HandlerConfig, SessionBuilder, SessionConfig};
pub use error::{DisconnectReason, PebblewireError, Result};
pub use handler::{PacketPriority, ProtocolHandler};
pub use protocol::{Direction, Packet};
pub use session::{ConnectionSession, ConnectionState, ReconnectPolicy, Reconnector};
