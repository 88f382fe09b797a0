//! Connection sessions and reconnection.
//!
//! A [`ConnectionSession`] owns one connector, one protocol handler and the
//! services built on it, for exactly one connection. It is never reused: a
//! [`Reconnector`] builds a fresh connector and session per attempt.
//!
//! ```text
//! Inactive ─► Connecting ─► Negotiating ─► Connected ─► Disconnected(reason)
//!                  │              │
//!                  └──────────────┴──────► Failed(reason)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pebblewire::session::{ConnectionSession, ReconnectPolicy, Reconnector};
//!
//! let mut reconnector = Reconnector::new(
//!     || Box::new(ClassicConnector::new(platform.clone())),
//!     config,
//!     ReconnectPolicy::default(),
//! );
//! loop {
//!     let session = reconnector.next_session().await?;
//!     session.blobdb().clear(BlobDatabase::Notification).await?;
//!     let reason = session.wait_for_disconnect().await;
//!     tracing::info!("disconnected: {}", reason);
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::{DisconnectReason, PebblewireError, Result};
use crate::handler::ProtocolHandler;
use crate::services::{AppRunStateService, BlobDbService, SystemService, TimelineService};
use crate::transport::{TransportConnector, TransportKind};

/// How long to wait for the watch to report its running app after connect.
const INITIAL_APP_STATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Inactive,
    Connecting,
    Negotiating,
    Connected,
    /// An established connection ended.
    Disconnected(DisconnectReason),
    /// The connection never came up.
    Failed(DisconnectReason),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Disconnected or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected(_) | ConnectionState::Failed(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Inactive => write!(f, "inactive"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Negotiating => write!(f, "negotiating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({})", reason),
            ConnectionState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

type SharedConnector = Arc<Mutex<Box<dyn TransportConnector>>>;

fn failure_reason(error: &PebblewireError) -> DisconnectReason {
    match error {
        PebblewireError::TransportFailure(reason) => reason.clone(),
        other => DisconnectReason::TransportError(other.to_string()),
    }
}

/// One live connection to a watch.
pub struct ConnectionSession {
    kind: TransportKind,
    connector: SharedConnector,
    handler: ProtocolHandler,
    blobdb: BlobDbService,
    app_run_state: AppRunStateService,
    timeline: TimelineService,
    system: SystemService,
    state: Arc<watch::Sender<ConnectionState>>,
    monitor: JoinHandle<()>,
}

impl ConnectionSession {
    /// Connect, negotiate, and start the handler and services.
    pub async fn establish(
        connector: Box<dyn TransportConnector>,
        config: &SessionConfig,
    ) -> Result<Self> {
        let (state, _) = watch::channel(ConnectionState::Inactive);
        Self::establish_observed(connector, config, Arc::new(state)).await
    }

    /// Like [`establish`](Self::establish), publishing progress on `state`.
    pub async fn establish_observed(
        mut connector: Box<dyn TransportConnector>,
        config: &SessionConfig,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Result<Self> {
        config.validate()?;
        let kind = connector.kind();

        state.send_replace(ConnectionState::Connecting);
        tracing::debug!("connecting over {}", kind);
        if let Err(e) = connector.connect().await {
            tracing::warn!("{} connect failed: {}", kind, e);
            state.send_replace(ConnectionState::Failed(failure_reason(&e)));
            connector.disconnect().await;
            return Err(e);
        }

        state.send_replace(ConnectionState::Negotiating);
        let streams = match connector.negotiate().await {
            Ok(streams) => streams,
            Err(e) => {
                tracing::warn!("{} negotiation failed: {}", kind, e);
                state.send_replace(ConnectionState::Failed(failure_reason(&e)));
                connector.disconnect().await;
                return Err(e);
            }
        };

        let mut link_closed = connector.disconnected();
        let handler = ProtocolHandler::spawn(streams, &config.handler);
        let timeout = config.request_timeout();
        let blobdb = BlobDbService::new(handler.clone(), timeout);
        let app_run_state = AppRunStateService::new(handler.clone(), timeout);
        let timeline = TimelineService::new(handler.clone());
        let system = SystemService::new(handler.clone(), timeout);

        let connector: SharedConnector = Arc::new(Mutex::new(connector));
        let monitor = {
            let handler = handler.clone();
            let connector = connector.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let reason = tokio::select! {
                    reason = handler.closed() => reason,
                    reason = link_closed.wait() => reason,
                };
                handler.close(reason.clone());
                connector.lock().await.disconnect().await;
                if reason == DisconnectReason::LocalDisconnect {
                    tracing::info!("{} session closed", kind);
                } else {
                    tracing::error!("{} session lost: {}", kind, reason);
                }
                state.send_replace(ConnectionState::Disconnected(reason));
            })
        };

        state.send_replace(ConnectionState::Connected);
        tracing::info!("{} session connected", kind);

        let session = Self {
            kind,
            connector,
            handler,
            blobdb,
            app_run_state,
            timeline,
            system,
            state,
            monitor,
        };

        if config.query_initial_app_state {
            match tokio::time::timeout(INITIAL_APP_STATE_TIMEOUT, session.app_run_state.refresh())
                .await
            {
                Ok(Ok(app)) => tracing::debug!("initial running app: {:?}", app),
                Ok(Err(e)) => tracing::warn!("initial app state query failed: {}", e),
                Err(_) => tracing::warn!("watch did not report its running app"),
            }
        }

        Ok(session)
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn handler(&self) -> &ProtocolHandler {
        &self.handler
    }

    pub fn blobdb(&self) -> &BlobDbService {
        &self.blobdb
    }

    pub fn app_run_state(&self) -> &AppRunStateService {
        &self.app_run_state
    }

    pub fn timeline(&self) -> &TimelineService {
        &self.timeline
    }

    pub fn system(&self) -> &SystemService {
        &self.system
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the session ends, for any reason.
    pub async fn wait_for_disconnect(&self) -> DisconnectReason {
        let mut rx = self.state.subscribe();
        let seen = rx
            .wait_for(|s| matches!(s, ConnectionState::Disconnected(_)))
            .await
            .map(|s| (*s).clone());
        match seen {
            Ok(ConnectionState::Disconnected(reason)) => reason,
            _ => DisconnectReason::LocalDisconnect,
        }
    }

    /// Tear the connection down. Pending requests fail with `ConnectionClosed`.
    pub async fn disconnect(&self) -> DisconnectReason {
        self.handler.close(DisconnectReason::LocalDisconnect);
        self.connector.lock().await.disconnect().await;
        self.wait_for_disconnect().await
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if !self.monitor.is_finished() {
            self.handler.close(DisconnectReason::LocalDisconnect);
        }
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Reconnection
// ============================================================================

/// Backoff between connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the attempt following `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Builds a new session per connection attempt.
pub struct Reconnector<F>
where
    F: FnMut() -> Box<dyn TransportConnector>,
{
    make_connector: F,
    config: SessionConfig,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
    failures: u32,
}

impl<F> Reconnector<F>
where
    F: FnMut() -> Box<dyn TransportConnector>,
{
    pub fn new(make_connector: F, config: SessionConfig, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Inactive);
        Self {
            make_connector,
            config,
            policy,
            state: Arc::new(state),
            failures: 0,
        }
    }

    /// State of whichever session is current. Survives across sessions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Connect, retrying with backoff.
    ///
    /// Returns the first error that isn't worth retrying, or the last error
    /// once `max_attempts` is reached.
    pub async fn next_session(&mut self) -> Result<ConnectionSession> {
        loop {
            let delay = self.policy.delay_after(self.failures);
            if !delay.is_zero() {
                tracing::debug!("reconnecting in {:?}", delay);
                tokio::time::sleep(delay).await;
            }

            let connector = (self.make_connector)();
            match ConnectionSession::establish_observed(connector, &self.config, self.state.clone())
                .await
            {
                Ok(session) => {
                    self.failures = 0;
                    return Ok(session);
                }
                Err(e) => {
                    self.failures += 1;
                    let retryable = failure_reason(&e).is_retryable()
                        && !matches!(e, PebblewireError::InvalidConfig(_));
                    let exhausted = self
                        .policy
                        .max_attempts
                        .is_some_and(|max| self.failures >= max);
                    if !retryable || exhausted {
                        tracing::error!("giving up after {} attempts: {}", self.failures, e);
                        return Err(e);
                    }
                    tracing::warn!("connection attempt {} failed: {}", self.failures, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DisconnectReason;
    use crate::protocol::{Packet, PingMessage};
    use crate::transport::{DisconnectNotifier, DisconnectSignal, LinkEvent, LinkStreams, MessageSink};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    struct NullSink;

    #[async_trait]
    impl MessageSink for NullSink {
        async fn send(&mut self, _frame: Bytes) -> Result<()> {
            Ok(())
        }
    }

    /// Connector whose link is an mpsc channel the test controls.
    struct ScriptedConnector {
        fail_connect: bool,
        notifier: DisconnectNotifier,
        link: Option<mpsc::Receiver<LinkEvent>>,
    }

    fn scripted(fail_connect: bool) -> (Box<dyn TransportConnector>, mpsc::Sender<LinkEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let connector = ScriptedConnector {
            fail_connect,
            notifier: DisconnectNotifier::new(),
            link: Some(rx),
        };
        (Box::new(connector), tx)
    }

    #[async_trait]
    impl TransportConnector for ScriptedConnector {
        fn kind(&self) -> TransportKind {
            TransportKind::Classic
        }

        async fn connect(&mut self) -> Result<()> {
            if self.fail_connect {
                let reason = DisconnectReason::ClassicConnectionFailed("out of range".to_string());
                self.notifier.notify(reason.clone());
                return Err(PebblewireError::TransportFailure(reason));
            }
            Ok(())
        }

        async fn negotiate(&mut self) -> Result<LinkStreams> {
            let inbound = self.link.take().ok_or(PebblewireError::ConnectionClosed)?;
            Ok(LinkStreams {
                inbound,
                outbound: Box::new(NullSink),
            })
        }

        async fn disconnect(&mut self) {
            self.notifier.notify(DisconnectReason::LocalDisconnect);
        }

        fn disconnected(&self) -> DisconnectSignal {
            self.notifier.signal()
        }
    }

    #[tokio::test]
    async fn test_state_progression_and_remote_loss() {
        let (connector, link) = scripted(false);
        let (state, _) = watch::channel(ConnectionState::Inactive);
        let state = Arc::new(state);
        let mut observed = state.subscribe();

        let session = ConnectionSession::establish_observed(
            connector,
            &SessionConfig::default(),
            state.clone(),
        )
        .await
        .unwrap();
        assert!(observed.borrow_and_update().is_connected());

        link.send(LinkEvent::Closed(DisconnectReason::LinkReset))
            .await
            .unwrap();
        assert_eq!(session.wait_for_disconnect().await, DisconnectReason::LinkReset);
        assert_eq!(
            session.state(),
            ConnectionState::Disconnected(DisconnectReason::LinkReset)
        );
        assert!(session.handler().is_closed());
    }

    #[tokio::test]
    async fn test_local_disconnect_fails_pending() {
        let (connector, _link) = scripted(false);
        let session = ConnectionSession::establish(connector, &SessionConfig::default())
            .await
            .unwrap();

        let ping = session.system().ping(1);
        let teardown = async {
            tokio::task::yield_now().await;
            session.disconnect().await
        };
        let (ping, reason) = tokio::join!(ping, teardown);
        assert!(matches!(ping, Err(PebblewireError::ConnectionClosed)));
        assert_eq!(reason, DisconnectReason::LocalDisconnect);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_failed() {
        let (connector, _link) = scripted(true);
        let (state, _) = watch::channel(ConnectionState::Inactive);
        let state = Arc::new(state);
        let err = ConnectionSession::establish_observed(connector, &SessionConfig::default(), state.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, PebblewireError::TransportFailure(_)));
        assert!(matches!(*state.borrow(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_services_see_inbound_after_connect() {
        let (connector, link) = scripted(false);
        let session = ConnectionSession::establish(connector, &SessionConfig::default())
            .await
            .unwrap();
        let mut inbound = session.handler().subscribe();
        let pong = Packet::Ping(PingMessage::Pong { cookie: 4 });
        link.send(LinkEvent::Data(pong.encode().unwrap()))
            .await
            .unwrap();
        assert_eq!(inbound.recv().await.unwrap(), pong);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_attempts: None,
        };
        assert_eq!(policy.delay_after(0), Duration::ZERO);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnector_retries_then_connects() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut links = Vec::new();
        let mut reconnector = Reconnector::new(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (connector, link) = scripted(n < 2);
                links.push(link);
                connector
            },
            SessionConfig::default(),
            ReconnectPolicy::default(),
        );

        let session = reconnector.next_session().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(reconnector.failures(), 0);
        assert!(session.state().is_connected());
        assert!(reconnector.subscribe_state().borrow().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnector_gives_up() {
        let mut reconnector = Reconnector::new(
            || scripted(true).0,
            SessionConfig::default(),
            ReconnectPolicy {
                max_attempts: Some(2),
                ..ReconnectPolicy::default()
            },
        );
        assert!(reconnector.next_session().await.is_err());
        assert_eq!(reconnector.failures(), 2);
    }
}
