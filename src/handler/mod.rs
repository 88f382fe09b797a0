//! Protocol handler - sole owner of a link's packet streams.
//!
//! Provides:
//! - [`ProtocolHandler::send`] - priority-queued outbound packets
//! - [`ProtocolHandler::subscribe`] - broadcast stream of decoded inbound packets
//!
//! # Architecture
//!
//! ```text
//! Service 1 ─┐                                  ┌─► subscriber 1
//! Service 2 ─┼─► OutboundQueue ─► writer task   │
//! Service N ─┘   (urgent/normal/low)   │        ├─► subscriber 2
//!                                      ▼        │
//!                                 MessageSink   └─◄ receive task ◄─ LinkEvent stream
//! ```
//!
//! Each subscriber reads from its own broadcast cursor. A subscriber that
//! falls more than `inbound_capacity` packets behind loses the oldest ones
//! and sees `RecvError::Lagged`; nobody else is held up.
//!
//! # Example
//!
//! ```ignore
//! use pebblewire::handler::{PacketPriority, ProtocolHandler};
//! use pebblewire::protocol::{Packet, PingMessage};
//!
//! let handler = ProtocolHandler::spawn(streams, &config.handler);
//! let mut inbound = handler.subscribe();
//! handler
//!     .send(&Packet::Ping(PingMessage::Ping { cookie: 1 }), PacketPriority::Urgent)
//!     .await?;
//! ```

mod queue;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

pub use queue::{PacketPriority, SendReceipt};
use queue::OutboundQueue;

use crate::config::HandlerConfig;
use crate::error::{DisconnectReason, PebblewireError, Result};
use crate::protocol::{build_frame, Direction, FrameBuffer, Packet};
use crate::transport::{DisconnectNotifier, DisconnectSignal, LinkEvent, LinkStreams, MessageSink};

struct Shared {
    queue: OutboundQueue,
    inbound: broadcast::Sender<Packet>,
    notifier: DisconnectNotifier,
}

impl Shared {
    /// Stop accepting work and fail everything still queued.
    fn shutdown(&self, reason: DisconnectReason) {
        if self.notifier.notify(reason.clone()) {
            tracing::debug!("protocol handler closing: {}", reason);
        }
        for item in self.queue.close() {
            item.complete(Err(PebblewireError::ConnectionClosed));
        }
    }
}

/// Handle to a running protocol handler. Cheap to clone.
#[derive(Clone)]
pub struct ProtocolHandler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("queued", &self.shared.queue.len())
            .field("closed", &self.close_reason())
            .finish()
    }
}

impl ProtocolHandler {
    /// Take ownership of a link's streams and start the writer and receive tasks.
    pub fn spawn(streams: LinkStreams, config: &HandlerConfig) -> Self {
        let (inbound, _) = broadcast::channel(config.inbound_capacity.max(1));
        let shared = Arc::new(Shared {
            queue: OutboundQueue::new(),
            inbound,
            notifier: DisconnectNotifier::new(),
        });

        tokio::spawn(writer_loop(shared.clone(), streams.outbound));
        tokio::spawn(receive_loop(shared.clone(), streams.inbound));

        Self { shared }
    }

    /// Queue a packet without waiting for delivery.
    ///
    /// Fails immediately if the packet can't be encoded or the handler is
    /// closed.
    pub fn enqueue(&self, packet: &Packet, priority: PacketPriority) -> Result<SendReceipt> {
        let frame = packet.encode()?;
        self.shared.queue.push(packet.endpoint(), frame, priority)
    }

    /// Queue an opaque payload on `endpoint`.
    pub fn enqueue_raw(
        &self,
        endpoint: u16,
        payload: &[u8],
        priority: PacketPriority,
    ) -> Result<SendReceipt> {
        let frame = build_frame(endpoint, payload)?;
        self.shared.queue.push(endpoint, frame, priority)
    }

    /// Send a packet and wait until it has been handed to the link.
    pub async fn send(&self, packet: &Packet, priority: PacketPriority) -> Result<()> {
        self.enqueue(packet, priority)?.delivered().await
    }

    pub async fn send_raw(&self, endpoint: u16, payload: &[u8], priority: PacketPriority) -> Result<()> {
        self.enqueue_raw(endpoint, payload, priority)?
            .delivered()
            .await
    }

    /// New cursor on the inbound packet stream. Sees packets received
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.shared.inbound.subscribe()
    }

    /// Frames waiting for the writer task.
    pub fn queued_frames(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.notifier.is_notified()
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.closed_signal().current()
    }

    pub fn closed_signal(&self) -> DisconnectSignal {
        self.shared.notifier.signal()
    }

    /// Wait until the handler stops.
    pub async fn closed(&self) -> DisconnectReason {
        self.closed_signal().wait().await
    }

    /// Stop the handler. Queued sends fail with `ConnectionClosed`.
    pub fn close(&self, reason: DisconnectReason) {
        self.shared.shutdown(reason);
    }
}

/// Drain the queue into the sink, one frame at a time.
async fn writer_loop(shared: Arc<Shared>, mut sink: Box<dyn MessageSink>) {
    while let Some(item) = shared.queue.pop().await {
        tracing::trace!(
            "writing frame for endpoint {:#06x} ({} bytes)",
            item.endpoint,
            item.frame.len()
        );
        match sink.send(item.frame.clone()).await {
            Ok(()) => item.complete(Ok(())),
            Err(e) => {
                let reason = match &e {
                    PebblewireError::TransportFailure(reason) => reason.clone(),
                    other => DisconnectReason::TransportError(other.to_string()),
                };
                tracing::error!("frame write failed: {}", e);
                item.complete(Err(e));
                shared.shutdown(reason);
                break;
            }
        }
    }
    tracing::debug!("writer task stopped");
}

/// Reassemble frames from link events and publish decoded packets.
async fn receive_loop(shared: Arc<Shared>, mut inbound: mpsc::Receiver<LinkEvent>) {
    let mut frames = FrameBuffer::new();
    let mut closed = shared.notifier.signal();

    let reason = loop {
        let event = tokio::select! {
            biased;
            reason = closed.wait() => break reason,
            event = inbound.recv() => event,
        };
        match event {
            Some(LinkEvent::Data(bytes)) => publish(&shared, &mut frames, &bytes),
            Some(LinkEvent::Reset) => {
                if !frames.is_empty() {
                    tracing::debug!("link reset; discarding {} buffered bytes", frames.len());
                }
                frames.clear();
            }
            Some(LinkEvent::Closed(reason)) => break reason,
            None => break DisconnectReason::RemoteClosed,
        }
    };
    shared.shutdown(reason);
    tracing::debug!("receive task stopped");
}

fn publish(shared: &Shared, frames: &mut FrameBuffer, bytes: &Bytes) {
    for frame in frames.push(bytes) {
        match Packet::from_frame(&frame, Direction::FromWatch) {
            Ok(packet) => {
                tracing::trace!("received packet on endpoint {:#06x}", frame.endpoint());
                // No subscribers is fine; the packet is simply unobserved.
                let _ = shared.inbound.send(packet);
            }
            Err(e) => {
                tracing::warn!(
                    "skipping malformed frame on endpoint {:#06x}: {}",
                    frame.endpoint(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BlobResponse, BlobStatus, PingMessage};
    use async_trait::async_trait;

    /// Sink that forwards frames to a channel and can be told to fail.
    struct ChannelSink {
        tx: mpsc::UnboundedSender<Bytes>,
        fail: bool,
    }

    #[async_trait]
    impl MessageSink for ChannelSink {
        async fn send(&mut self, frame: Bytes) -> Result<()> {
            if self.fail {
                return Err(PebblewireError::TransportFailure(
                    DisconnectReason::TransportError("broken pipe".to_string()),
                ));
            }
            let _ = self.tx.send(frame);
            Ok(())
        }
    }

    struct Harness {
        handler: ProtocolHandler,
        link: mpsc::Sender<LinkEvent>,
        written: mpsc::UnboundedReceiver<Bytes>,
    }

    fn harness(fail_writes: bool) -> Harness {
        let (link, inbound) = mpsc::channel(16);
        let (tx, written) = mpsc::unbounded_channel();
        let streams = LinkStreams {
            inbound,
            outbound: Box::new(ChannelSink {
                tx,
                fail: fail_writes,
            }),
        };
        Harness {
            handler: ProtocolHandler::spawn(streams, &HandlerConfig::default()),
            link,
            written,
        }
    }

    fn ping(cookie: u32) -> Packet {
        Packet::Ping(PingMessage::Ping { cookie })
    }

    #[tokio::test]
    async fn test_urgent_overtakes_queued_normal() {
        let mut h = harness(false);
        // Current-thread runtime: the writer can't run until we yield.
        let a = h.handler.enqueue(&ping(1), PacketPriority::Normal).unwrap();
        let b = h.handler.enqueue(&ping(2), PacketPriority::Urgent).unwrap();
        let c = h.handler.enqueue(&ping(3), PacketPriority::Normal).unwrap();
        for receipt in [a, b, c] {
            receipt.delivered().await.unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(h.written.recv().await.unwrap());
        }
        assert_eq!(
            order,
            vec![
                ping(2).encode().unwrap(),
                ping(1).encode().unwrap(),
                ping(3).encode().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_inbound() {
        let h = harness(false);
        let mut first = h.handler.subscribe();
        let mut second = h.handler.subscribe();

        let response = Packet::BlobResponse(BlobResponse {
            token: 7,
            status: BlobStatus::Success,
        });
        let bytes = response.encode().unwrap();
        // Split mid-header to exercise reassembly.
        h.link
            .send(LinkEvent::Data(bytes.slice(..3)))
            .await
            .unwrap();
        h.link.send(LinkEvent::Data(bytes.slice(3..))).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), response);
        assert_eq!(second.recv().await.unwrap(), response);
    }

    #[tokio::test]
    async fn test_malformed_frame_skipped() {
        let h = harness(false);
        let mut inbound = h.handler.subscribe();

        // BlobDB response needs three bytes; one is a corrupt frame.
        let mut data = build_frame(0xB1DB, &[0x01]).unwrap().to_vec();
        data.extend_from_slice(&ping(5).encode().unwrap());
        h.link.send(LinkEvent::Data(data.into())).await.unwrap();

        assert_eq!(inbound.recv().await.unwrap(), ping(5));
        assert!(!h.handler.is_closed());
    }

    #[tokio::test]
    async fn test_reset_discards_partial_frame() {
        let h = harness(false);
        let mut inbound = h.handler.subscribe();
        let bytes = ping(9).encode().unwrap();

        h.link
            .send(LinkEvent::Data(bytes.slice(..5)))
            .await
            .unwrap();
        h.link.send(LinkEvent::Reset).await.unwrap();
        h.link.send(LinkEvent::Data(bytes.clone())).await.unwrap();

        assert_eq!(inbound.recv().await.unwrap(), ping(9));
    }

    #[tokio::test]
    async fn test_write_failure_surfaces_and_closes() {
        let h = harness(true);
        let queued = h.handler.enqueue(&ping(1), PacketPriority::Normal).unwrap();
        let later = h.handler.enqueue(&ping(2), PacketPriority::Low).unwrap();

        assert!(matches!(
            queued.delivered().await,
            Err(PebblewireError::TransportFailure(DisconnectReason::TransportError(_)))
        ));
        assert!(matches!(
            later.delivered().await,
            Err(PebblewireError::ConnectionClosed)
        ));
        assert!(matches!(
            h.handler.closed().await,
            DisconnectReason::TransportError(_)
        ));
        assert!(matches!(
            h.handler.send(&ping(3), PacketPriority::Urgent).await,
            Err(PebblewireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_link_close_closes_handler() {
        let h = harness(false);
        h.link
            .send(LinkEvent::Closed(DisconnectReason::LinkReset))
            .await
            .unwrap();
        assert_eq!(h.handler.closed().await, DisconnectReason::LinkReset);

        let h = harness(false);
        drop(h.link);
        assert_eq!(h.handler.closed().await, DisconnectReason::RemoteClosed);
    }

    #[tokio::test]
    async fn test_raw_send_passthrough() {
        let mut h = harness(false);
        h.handler
            .send_raw(0x1234, b"\xAA", PacketPriority::Low)
            .await
            .unwrap();
        assert_eq!(
            h.written.recv().await.unwrap(),
            Bytes::from_static(b"\x00\x01\x12\x34\xAA")
        );
    }
}
