//! Which app is running on the watch.
//!
//! The watch pushes `Start`/`Stop` whenever the foreground app changes; the
//! cached [`RunState`] follows those pushes and is only eventually
//! consistent with the device. [`AppRunStateService::refresh`] asks the
//! watch explicitly and waits for the next push.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{spawn_listener, with_timeout};
use crate::error::{PebblewireError, Result};
use crate::handler::{PacketPriority, ProtocolHandler};
use crate::protocol::{AppRunStateMessage, Packet};

/// Last pushed run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunState {
    /// Foreground app, if any.
    pub app: Option<Uuid>,
    /// Pushes received so far on this connection.
    pub updates: u64,
}

pub struct AppRunStateService {
    handler: ProtocolHandler,
    state: watch::Sender<RunState>,
    timeout: Option<Duration>,
    listener: JoinHandle<()>,
}

impl AppRunStateService {
    pub fn new(handler: ProtocolHandler, timeout: Option<Duration>) -> Self {
        let (state, _) = watch::channel(RunState::default());
        let pushes = state.clone();
        let listener = spawn_listener(
            "app run state",
            &handler,
            move |packet| {
                let app = match packet {
                    Packet::AppRunState(AppRunStateMessage::Start(uuid)) => Some(uuid),
                    Packet::AppRunState(AppRunStateMessage::Stop(_)) => None,
                    _ => return,
                };
                tracing::debug!("running app now {:?}", app);
                pushes.send_modify(|s| {
                    s.app = app;
                    s.updates += 1;
                });
            },
            || {},
        );
        Self {
            handler,
            state,
            timeout,
            listener,
        }
    }

    /// Cached foreground app.
    pub fn running_app(&self) -> Option<Uuid> {
        self.state.borrow().app
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Start `app` and wait until the watch reports it running.
    pub async fn launch(&self, app: Uuid) -> Result<()> {
        let mut rx = self.state.subscribe();
        self.send(AppRunStateMessage::Start(app)).await?;
        self.wait_until(&mut rx, |s| s.app == Some(app)).await?;
        Ok(())
    }

    /// Ask the watch to stop `app`. Does not wait for the resulting push.
    pub async fn stop(&self, app: Uuid) -> Result<()> {
        self.send(AppRunStateMessage::Stop(app)).await
    }

    /// Query the watch and wait for its answer.
    pub async fn refresh(&self) -> Result<Option<Uuid>> {
        let mut rx = self.state.subscribe();
        let seen = rx.borrow_and_update().updates;
        self.send(AppRunStateMessage::Request).await?;
        let state = self.wait_until(&mut rx, |s| s.updates > seen).await?;
        Ok(state.app)
    }

    async fn send(&self, message: AppRunStateMessage) -> Result<()> {
        self.handler
            .send(&Packet::AppRunState(message), PacketPriority::Normal)
            .await
    }

    async fn wait_until(
        &self,
        rx: &mut watch::Receiver<RunState>,
        predicate: impl Fn(&RunState) -> bool,
    ) -> Result<RunState> {
        let mut closed = self.handler.closed_signal();
        let wait = async {
            tokio::select! {
                state = rx.wait_for(|s| predicate(s)) => {
                    state.map(|s| *s).map_err(|_| PebblewireError::ConnectionClosed)
                }
                _ = closed.wait() => Err(PebblewireError::ConnectionClosed),
            }
        };
        with_timeout(self.timeout, wait).await
    }
}

impl Drop for AppRunStateService {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
