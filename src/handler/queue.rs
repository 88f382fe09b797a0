//! Outbound priority queue.
//!
//! Three FIFO lanes drained highest-first by the handler's single writer
//! task. Each queued frame carries a oneshot that reports whether it made it
//! onto the link.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};

use crate::error::{PebblewireError, Result};

/// Delivery priority of an outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PacketPriority {
    /// Bulk background traffic.
    Low,
    #[default]
    Normal,
    /// Jumps every queued lower-priority packet.
    Urgent,
}

impl PacketPriority {
    const LANES: usize = 3;

    fn lane(self) -> usize {
        match self {
            PacketPriority::Urgent => 0,
            PacketPriority::Normal => 1,
            PacketPriority::Low => 2,
        }
    }
}

/// Resolves once the writer task has handed the frame to the link.
#[derive(Debug)]
pub struct SendReceipt {
    rx: oneshot::Receiver<Result<()>>,
}

impl SendReceipt {
    pub async fn delivered(self) -> Result<()> {
        self.rx.await.map_err(|_| PebblewireError::ConnectionClosed)?
    }
}

#[derive(Debug)]
pub(crate) struct QueuedFrame {
    pub endpoint: u16,
    pub frame: Bytes,
    pub done: oneshot::Sender<Result<()>>,
}

impl QueuedFrame {
    pub fn complete(self, result: Result<()>) {
        // Caller may have stopped waiting.
        let _ = self.done.send(result);
    }
}

#[derive(Debug, Default)]
struct Lanes {
    lanes: [VecDeque<QueuedFrame>; PacketPriority::LANES],
    closed: bool,
}

/// Multi-producer, single-consumer priority queue.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    state: Mutex<Lanes>,
    ready: Notify,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Lanes> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, endpoint: u16, frame: Bytes, priority: PacketPriority) -> Result<SendReceipt> {
        let (done, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PebblewireError::ConnectionClosed);
            }
            state.lanes[priority.lane()].push_back(QueuedFrame {
                endpoint,
                frame,
                done,
            });
        }
        self.ready.notify_one();
        Ok(SendReceipt { rx })
    }

    /// Next frame in priority order, or `None` once closed.
    pub async fn pop(&self) -> Option<QueuedFrame> {
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.lanes.iter_mut().find_map(|lane| lane.pop_front()) {
                    return Some(item);
                }
            }
            self.ready.notified().await;
        }
    }

    /// Close the queue and hand back everything still waiting.
    pub fn close(&self) -> Vec<QueuedFrame> {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            state.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
        };
        self.ready.notify_one();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().lanes.iter().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(queue: &OutboundQueue, tag: &'static [u8], priority: PacketPriority) -> SendReceipt {
        queue.push(0, Bytes::from_static(tag), priority).unwrap()
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = OutboundQueue::new();
        push(&queue, b"a", PacketPriority::Normal);
        push(&queue, b"low", PacketPriority::Low);
        push(&queue, b"b", PacketPriority::Urgent);
        push(&queue, b"c", PacketPriority::Normal);
        push(&queue, b"d", PacketPriority::Urgent);

        let mut order = Vec::new();
        while queue.len() > 0 {
            order.push(queue.pop().await.unwrap().frame);
        }
        assert_eq!(order, vec!["b", "d", "a", "c", "low"]);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = std::sync::Arc::new(OutboundQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.map(|f| f.frame) })
        };
        tokio::task::yield_now().await;
        push(&queue, b"late", PacketPriority::Low);
        assert_eq!(consumer.await.unwrap(), Some(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_close_drains_and_rejects() {
        let queue = OutboundQueue::new();
        let receipt = push(&queue, b"a", PacketPriority::Normal);

        let drained = queue.close();
        assert_eq!(drained.len(), 1);
        for item in drained {
            item.complete(Err(PebblewireError::ConnectionClosed));
        }
        assert!(matches!(
            receipt.delivered().await,
            Err(PebblewireError::ConnectionClosed)
        ));

        assert!(queue.pop().await.is_none());
        assert!(matches!(
            queue.push(0, Bytes::new(), PacketPriority::Urgent),
            Err(PebblewireError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(PacketPriority::Urgent > PacketPriority::Normal);
        assert!(PacketPriority::Normal > PacketPriority::Low);
        assert_eq!(PacketPriority::default(), PacketPriority::Normal);
    }
}
