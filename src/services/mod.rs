//! Services built on the protocol handler.
//!
//! - [`BlobDbService`] - token-correlated database commands
//! - [`AppRunStateService`] - running app, pushed by the watch
//! - [`TimelineService`] - timeline action invocations and their responses
//! - [`SystemService`] - cookie-correlated ping
//!
//! Each service subscribes to the inbound stream when created and keeps one
//! listener task for the life of the connection. When the handler closes,
//! everything still waiting on a service resolves with
//! [`PebblewireError::ConnectionClosed`](crate::PebblewireError::ConnectionClosed).

mod app_run_state;
mod blobdb;
mod pending;
mod system;
mod timeline;

use std::future::Future;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub use app_run_state::{AppRunStateService, RunState};
pub use blobdb::BlobDbService;
pub use pending::{PendingRequests, Registration};
pub use system::SystemService;
pub use timeline::{TimelineActionInvocation, TimelineActionResult, TimelineService};

use crate::handler::ProtocolHandler;
use crate::protocol::Packet;

/// Route inbound packets to `on_packet` until the handler closes, then run `on_close`.
///
/// Subscribes before returning, so nothing received after this call is missed.
pub(crate) fn spawn_listener<F, C>(
    service: &'static str,
    handler: &ProtocolHandler,
    mut on_packet: F,
    on_close: C,
) -> JoinHandle<()>
where
    F: FnMut(Packet) + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    let mut inbound = handler.subscribe();
    let mut closed = handler.closed_signal();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                received = inbound.recv() => match received {
                    Ok(packet) => on_packet(packet),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("{} service lagged; {} packets dropped", service, skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                reason = closed.wait() => {
                    tracing::debug!("{} service stopping: {}", service, reason);
                    break;
                }
            }
        }
        on_close();
    })
}

/// Run `fut`, bounded by `timeout` when one is set.
pub(crate) async fn with_timeout<T>(
    timeout: Option<std::time::Duration>,
    fut: impl Future<Output = crate::Result<T>>,
) -> crate::Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| crate::PebblewireError::RequestTimeout)?,
        None => fut.await,
    }
}
