//! PPoG (Pebble Protocol over GATT) link layer.
//!
//! Carries the packet stream over a BLE characteristic pair:
//! - Reset handshake that negotiates protocol version and window sizes
//! - Sequence-numbered fragments sized to the MTU
//! - Cumulative acknowledgments with bounded retransmission
//!
//! Only BLE connections use this layer; Classic sockets are already a
//! reliable byte stream.

mod link;
mod packet;

pub use link::{spawn_link, LinkParams, LinkState, PacketSender, PpogHandle, PpogSink};
pub use packet::{
    next_sequence, PpogPacket, PpogVersion, DATA_HEADER_OVERHEAD, SEQUENCE_MODULO,
    V0_WINDOW_SIZE,
};
