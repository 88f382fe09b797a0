//! BlobDB: key/value replication to the watch.
//!
//! Every command carries a 16-bit token; the watch echoes it in a
//! [`BlobResponse`]. Tokens are handed out sequentially, skipping any still
//! in flight.
//!
//! # Example
//!
//! ```ignore
//! use pebblewire::protocol::{BlobDatabase, BlobStatus};
//!
//! let status = session.blobdb().insert(BlobDatabase::Notification, key, record).await?;
//! assert_eq!(status, BlobStatus::Success);
//! ```

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;

use super::pending::{PendingRequests, Registration};
use super::spawn_listener;
use crate::error::{PebblewireError, Result};
use crate::handler::{PacketPriority, ProtocolHandler};
use crate::protocol::{BlobCommand, BlobDatabase, BlobStatus, Packet};

pub struct BlobDbService {
    handler: ProtocolHandler,
    pending: Arc<PendingRequests<u16, BlobStatus>>,
    next_token: AtomicU16,
    timeout: Option<Duration>,
    listener: JoinHandle<()>,
}

impl BlobDbService {
    pub fn new(handler: ProtocolHandler, timeout: Option<Duration>) -> Self {
        let pending = PendingRequests::new();
        let fulfill = pending.clone();
        let drain = pending.clone();
        let listener = spawn_listener(
            "blobdb",
            &handler,
            move |packet| {
                if let Packet::BlobResponse(response) = packet {
                    if !fulfill.fulfill(response.token, response.status) {
                        tracing::debug!("blobdb response for unknown token {}", response.token);
                    }
                }
            },
            move || drain.fail_all(),
        );
        Self {
            handler,
            pending,
            next_token: AtomicU16::new(1),
            timeout,
            listener,
        }
    }

    /// Send a command with a caller-chosen token and wait for the watch's status.
    ///
    /// Fails with `DuplicateToken` if that token is already in flight.
    pub async fn send(&self, command: BlobCommand, priority: PacketPriority) -> Result<BlobStatus> {
        let registration = self.pending.register(command.token)?;
        self.dispatch(registration, command, priority).await
    }

    pub async fn insert(
        &self,
        database: BlobDatabase,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<BlobStatus> {
        let registration = self.allocate()?;
        let command = BlobCommand::insert(registration.token(), database, key, value);
        self.dispatch(registration, command, PacketPriority::Normal)
            .await
    }

    pub async fn delete(&self, database: BlobDatabase, key: impl Into<Bytes>) -> Result<BlobStatus> {
        let registration = self.allocate()?;
        let command = BlobCommand::delete(registration.token(), database, key);
        self.dispatch(registration, command, PacketPriority::Normal)
            .await
    }

    pub async fn clear(&self, database: BlobDatabase) -> Result<BlobStatus> {
        let registration = self.allocate()?;
        let command = BlobCommand::clear(registration.token(), database);
        self.dispatch(registration, command, PacketPriority::Normal)
            .await
    }

    /// Commands awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn allocate(&self) -> Result<Registration<u16, BlobStatus>> {
        for _ in 0..=u16::MAX {
            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            match self.pending.register(token) {
                Err(PebblewireError::DuplicateToken(_)) => continue,
                other => return other,
            }
        }
        Err(PebblewireError::DuplicateToken(0))
    }

    async fn dispatch(
        &self,
        registration: Registration<u16, BlobStatus>,
        command: BlobCommand,
        priority: PacketPriority,
    ) -> Result<BlobStatus> {
        tracing::debug!(
            "blobdb command token {} on {:?}",
            command.token,
            command.database
        );
        self.handler
            .send(&Packet::BlobCommand(command), priority)
            .await?;
        registration.wait(self.timeout).await
    }
}

impl Drop for BlobDbService {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
