//! Timeline action invocations.
//!
//! The watch sends `InvokeAction` when the user picks an action on a
//! timeline item; the phone answers with an `ActionResponse` carrying an
//! icon and a subtitle to show.

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::spawn_listener;
use crate::error::{PebblewireError, Result};
use crate::handler::{PacketPriority, ProtocolHandler};
use crate::protocol::{ActionResponseCode, Packet, TimelineActionMessage, TimelineAttribute};

/// Invocations buffered before the app picks them up.
const INVOCATION_BACKLOG: usize = 32;

/// What to show on the watch after an action ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineActionResult {
    pub success: bool,
    /// Watch resource id of the icon.
    pub icon: u32,
    pub title: String,
}

impl TimelineActionResult {
    fn into_message(self, item_id: Uuid) -> TimelineActionMessage {
        let response = if self.success {
            ActionResponseCode::Ack
        } else {
            ActionResponseCode::Nack
        };
        TimelineActionMessage::ActionResponse {
            item_id,
            response,
            attributes: vec![
                TimelineAttribute::large_icon(self.icon),
                TimelineAttribute::subtitle(&self.title),
            ],
        }
    }
}

/// An action the user invoked on the watch.
#[derive(Debug)]
pub struct TimelineActionInvocation {
    pub item_id: Uuid,
    pub action_id: u8,
    pub attributes: Vec<TimelineAttribute>,
    handler: ProtocolHandler,
}

impl TimelineActionInvocation {
    /// Report the outcome to the watch.
    pub async fn respond(self, result: TimelineActionResult) -> Result<()> {
        let message = result.into_message(self.item_id);
        self.handler
            .send(&Packet::TimelineAction(message), PacketPriority::Urgent)
            .await
    }
}

pub struct TimelineService {
    invocations: Mutex<mpsc::Receiver<TimelineActionInvocation>>,
    listener: JoinHandle<()>,
}

impl TimelineService {
    pub fn new(handler: ProtocolHandler) -> Self {
        let (tx, rx) = mpsc::channel(INVOCATION_BACKLOG);
        let responder = handler.clone();
        let listener = spawn_listener(
            "timeline",
            &handler,
            move |packet| {
                let Packet::TimelineAction(TimelineActionMessage::InvokeAction {
                    item_id,
                    action_id,
                    attributes,
                }) = packet
                else {
                    return;
                };
                tracing::debug!("action {} invoked on item {}", action_id, item_id);
                let invocation = TimelineActionInvocation {
                    item_id,
                    action_id,
                    attributes,
                    handler: responder.clone(),
                };
                if tx.try_send(invocation).is_err() {
                    tracing::warn!("timeline invocation backlog full; dropping action on {}", item_id);
                }
            },
            || {},
        );
        Self {
            invocations: Mutex::new(rx),
            listener,
        }
    }

    /// Wait for the next action invocation.
    ///
    /// Fails with `ConnectionClosed` once the connection is gone and the
    /// backlog is empty.
    pub async fn next_invocation(&self) -> Result<TimelineActionInvocation> {
        self.invocations
            .lock()
            .await
            .recv()
            .await
            .ok_or(PebblewireError::ConnectionClosed)
    }
}

impl Drop for TimelineService {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
