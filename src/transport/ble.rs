//! BLE transport: GATT connection plus the PPoG link layer.
//!
//! Connection policy comes from [`BleConfig`]; each knob is applied at one
//! point in the sequence below and can be toggled independently.
//!
//! ```text
//! connect:    [app-start delay] → GATT connect (pin address, reversed role)
//!             → [connectivity trigger] → bond if needed (phone or watch initiated)
//!             → MTU (native or fixed)
//! negotiate:  PPoG reset handshake → LinkStreams
//! disconnect: [PPoG reset] → [disconnect delay] → GATT disconnect
//!             → [reset request fallback on failure]
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    DisconnectNotifier, DisconnectSignal, LinkStreams, TransportConnector, TransportKind,
};
use crate::config::{BleConfig, BLE_MIN_MTU};
use crate::error::{DisconnectReason, PebblewireError, Result};
use crate::ppog::{spawn_link, PacketSender, PpogHandle, PpogPacket, PpogVersion};

/// Options for opening the GATT connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattConnectOptions {
    /// Connect to the remembered address rather than scanning.
    pub pin_address: bool,
    /// The watch acts as GATT server for PPoG.
    pub reversed_ppog: bool,
}

/// An open GATT connection.
#[derive(Debug)]
pub struct GattConnection {
    /// Raw PPoG packets written by the watch. Closes when the link drops.
    pub inbound: mpsc::Receiver<Bytes>,
}

/// Pairing state as reported by the watch's connectivity characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectivityStatus {
    pub connected: bool,
    pub paired: bool,
}

/// Host-provided BLE primitives.
#[async_trait]
pub trait BlePlatform: Send + Sync + 'static {
    async fn connect_gatt(&self, options: GattConnectOptions) -> Result<GattConnection>;

    async fn connectivity_status(&self) -> Result<ConnectivityStatus>;

    async fn write_connectivity_trigger(&self) -> Result<()>;

    async fn is_bonded(&self) -> bool;

    /// Phone-initiated bonding.
    async fn create_bond(&self) -> Result<()>;

    /// Wait for the watch to initiate bonding.
    async fn wait_for_bond(&self) -> Result<()>;

    /// Ask for `mtu`; returns what the platform granted.
    async fn request_mtu(&self, mtu: u16) -> Result<u16>;

    async fn write_ppog(&self, packet: Bytes) -> Result<()>;

    async fn disconnect_gatt(&self) -> Result<()>;

    /// Shut down the local GATT server role.
    async fn close_server(&self);
}

struct PlatformSender<P> {
    platform: Arc<P>,
}

#[async_trait]
impl<P: BlePlatform> PacketSender for PlatformSender<P> {
    async fn send_packet(&self, packet: Bytes) -> Result<()> {
        self.platform.write_ppog(packet).await
    }
}

/// Connector for a BLE watch.
pub struct BleConnector<P: BlePlatform> {
    platform: Arc<P>,
    config: BleConfig,
    app_started_at: Instant,
    gatt_inbound: Option<mpsc::Receiver<Bytes>>,
    mtu: u16,
    link: Option<PpogHandle>,
    monitor: Option<JoinHandle<()>>,
    notifier: DisconnectNotifier,
}

impl<P: BlePlatform> BleConnector<P> {
    pub fn new(platform: Arc<P>, config: BleConfig) -> Self {
        let mtu = config.initial_mtu;
        Self {
            platform,
            config,
            app_started_at: Instant::now(),
            gatt_inbound: None,
            mtu,
            link: None,
            monitor: None,
            notifier: DisconnectNotifier::new(),
        }
    }

    /// When the host process started; used for the connection hold-off.
    pub fn with_app_start(mut self, started_at: Instant) -> Self {
        self.app_started_at = started_at;
        self
    }

    /// MTU the link is currently using.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn link(&self) -> Option<&PpogHandle> {
        self.link.as_ref()
    }

    /// Platform reported a new MTU. Only increases take effect.
    pub async fn update_mtu(&mut self, mtu: u16) {
        if mtu > self.mtu {
            self.mtu = mtu;
        }
        if let Some(link) = &self.link {
            link.update_mtu(mtu).await;
        }
    }

    /// The platform radio was switched off.
    pub async fn on_bluetooth_disabled(&mut self) {
        tracing::info!("bluetooth disabled; closing BLE link");
        self.notifier.notify(DisconnectReason::BluetoothDisabled);
        if let Some(link) = self.link.take() {
            link.close(false).await;
        }
        if self.config.close_server_when_bt_disabled {
            self.platform.close_server().await;
        }
    }

    async fn fail(&mut self, reason: DisconnectReason) -> PebblewireError {
        tracing::warn!("BLE connection failed: {}", reason);
        self.notifier.notify(reason.clone());
        if let Err(e) = self.platform.disconnect_gatt().await {
            tracing::debug!("GATT disconnect after failure: {}", e);
        }
        PebblewireError::TransportFailure(reason)
    }

    async fn wait_for_app_start_delay(&self) {
        if !self.config.delay_ble_connections_after_app_start {
            return;
        }
        let ready_at = self.app_started_at + self.config.app_start_delay();
        if Instant::now() < ready_at {
            tracing::debug!("holding BLE connection until app start delay passes");
            tokio::time::sleep_until(ready_at).await;
        }
    }

    async fn pair_if_needed(&self) -> Result<()> {
        let status = self.platform.connectivity_status().await?;
        let bonded = self.platform.is_bonded().await;
        if status.paired && bonded {
            tracing::debug!("already paired");
            return Ok(());
        }
        tracing::debug!(
            "pairing needed (watch paired: {}, phone bonded: {})",
            status.paired,
            bonded
        );
        if self.config.phone_requests_pairing {
            self.platform.create_bond().await
        } else {
            self.platform.wait_for_bond().await
        }
    }

    async fn negotiate_mtu(&self) -> Result<u16> {
        if self.config.use_native_mtu {
            self.platform.request_mtu(self.config.desired_mtu).await
        } else {
            Ok(self.config.initial_mtu)
        }
    }
}

#[async_trait]
impl<P: BlePlatform> TransportConnector for BleConnector<P> {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn connect(&mut self) -> Result<()> {
        self.wait_for_app_start_delay().await;

        let options = GattConnectOptions {
            pin_address: self.config.pin_address,
            reversed_ppog: self.config.reversed_ppog,
        };
        tracing::debug!("connecting GATT: {:?}", options);
        let connection = match self.platform.connect_gatt(options).await {
            Ok(c) => c,
            Err(e) => return Err(self.fail(DisconnectReason::BleConnectionFailed(e.to_string())).await),
        };

        if self.config.write_connectivity_trigger {
            if let Err(e) = self.platform.write_connectivity_trigger().await {
                return Err(self.fail(DisconnectReason::BleConnectionFailed(e.to_string())).await);
            }
        }

        if let Err(e) = self.pair_if_needed().await {
            return Err(self.fail(DisconnectReason::PairingFailed(e.to_string())).await);
        }

        let mtu = match self.negotiate_mtu().await {
            Ok(mtu) if mtu >= BLE_MIN_MTU => mtu,
            Ok(mtu) => return Err(self.fail(DisconnectReason::MtuNegotiationFailed(mtu)).await),
            Err(e) => {
                tracing::warn!("MTU request failed: {}", e);
                return Err(self.fail(DisconnectReason::MtuNegotiationFailed(0)).await);
            }
        };
        tracing::debug!("GATT connected, MTU {}", mtu);
        self.mtu = mtu;
        self.gatt_inbound = Some(connection.inbound);
        Ok(())
    }

    async fn negotiate(&mut self) -> Result<LinkStreams> {
        let Some(inbound) = self.gatt_inbound.take() else {
            return Err(self
                .fail(DisconnectReason::BleConnectionFailed(
                    "negotiate called before connect".to_string(),
                ))
                .await);
        };
        let sender = Arc::new(PlatformSender {
            platform: self.platform.clone(),
        });
        let (link, events) = spawn_link(sender, inbound, self.mtu, &self.config);

        if let Err(e) = link.wait_open().await {
            let reason = match e {
                PebblewireError::TransportFailure(reason) => reason,
                _ => DisconnectReason::NegotiationTimeout,
            };
            return Err(self.fail(reason).await);
        }

        let notifier = self.notifier.clone();
        let watcher = link.clone();
        self.monitor = Some(tokio::spawn(async move {
            let reason = watcher.closed().await;
            notifier.notify(reason);
        }));

        let sink = link.sink();
        self.link = Some(link);
        Ok(LinkStreams {
            inbound: events,
            outbound: Box::new(sink),
        })
    }

    async fn disconnect(&mut self) {
        self.notifier.notify(DisconnectReason::LocalDisconnect);
        if let Some(link) = self.link.take() {
            link.close(self.config.send_ppog_reset_on_disconnect).await;
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }

        if self.config.delay_ble_disconnections {
            tokio::time::sleep(self.config.disconnect_delay()).await;
        }

        if let Err(e) = self.platform.disconnect_gatt().await {
            tracing::warn!("GATT disconnect failed: {}", e);
            if self.config.fallback_to_reset_request {
                let reset = PpogPacket::ResetRequest {
                    sequence: 0,
                    version: PpogVersion::One,
                };
                if let Err(e) = self
                    .platform
                    .write_ppog(reset.serialize(PpogVersion::One))
                    .await
                {
                    tracing::debug!("reset request fallback failed: {}", e);
                }
            }
        }
    }

    fn disconnected(&self) -> DisconnectSignal {
        self.notifier.signal()
    }
}

impl<P: BlePlatform> Drop for BleConnector<P> {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeState {
        calls: Vec<String>,
        gatt_inbound: Option<mpsc::Receiver<Bytes>>,
        options: Option<GattConnectOptions>,
    }

    struct FakePlatform {
        state: Mutex<FakeState>,
        written: mpsc::UnboundedSender<PpogPacket>,
        bonded: bool,
        watch_paired: bool,
        granted_mtu: u16,
        disconnect_fails: bool,
    }

    impl FakePlatform {
        fn record(&self, call: &str) {
            self.state.lock().unwrap().calls.push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }
    }

    #[async_trait]
    impl BlePlatform for FakePlatform {
        async fn connect_gatt(&self, options: GattConnectOptions) -> Result<GattConnection> {
            self.record("connect_gatt");
            let mut state = self.state.lock().unwrap();
            state.options = Some(options);
            let inbound = state
                .gatt_inbound
                .take()
                .ok_or(PebblewireError::ConnectionClosed)?;
            Ok(GattConnection { inbound })
        }

        async fn connectivity_status(&self) -> Result<ConnectivityStatus> {
            Ok(ConnectivityStatus {
                connected: true,
                paired: self.watch_paired,
            })
        }

        async fn write_connectivity_trigger(&self) -> Result<()> {
            self.record("connectivity_trigger");
            Ok(())
        }

        async fn is_bonded(&self) -> bool {
            self.bonded
        }

        async fn create_bond(&self) -> Result<()> {
            self.record("create_bond");
            Ok(())
        }

        async fn wait_for_bond(&self) -> Result<()> {
            self.record("wait_for_bond");
            Ok(())
        }

        async fn request_mtu(&self, mtu: u16) -> Result<u16> {
            self.record(&format!("request_mtu {}", mtu));
            Ok(self.granted_mtu)
        }

        async fn write_ppog(&self, packet: Bytes) -> Result<()> {
            let parsed = PpogPacket::parse(&packet)?;
            let _ = self.written.send(parsed);
            Ok(())
        }

        async fn disconnect_gatt(&self) -> Result<()> {
            self.record("disconnect_gatt");
            if self.disconnect_fails {
                return Err(PebblewireError::Malformed("gatt busy".to_string()));
            }
            Ok(())
        }

        async fn close_server(&self) {
            self.record("close_server");
        }
    }

    struct Harness {
        platform: Arc<FakePlatform>,
        to_phone: mpsc::Sender<Bytes>,
        from_phone: mpsc::UnboundedReceiver<PpogPacket>,
    }

    fn harness(bonded: bool, watch_paired: bool, granted_mtu: u16, disconnect_fails: bool) -> Harness {
        let (to_phone, gatt_inbound) = mpsc::channel(16);
        let (written, from_phone) = mpsc::unbounded_channel();
        let platform = Arc::new(FakePlatform {
            state: Mutex::new(FakeState {
                gatt_inbound: Some(gatt_inbound),
                ..FakeState::default()
            }),
            written,
            bonded,
            watch_paired,
            granted_mtu,
            disconnect_fails,
        });
        Harness {
            platform,
            to_phone,
            from_phone,
        }
    }

    async fn watch_handshake(h: &mut Harness) {
        let request = PpogPacket::ResetRequest {
            sequence: 0,
            version: PpogVersion::One,
        };
        h.to_phone
            .send(request.serialize(PpogVersion::One))
            .await
            .unwrap();
        assert!(matches!(
            h.from_phone.recv().await.unwrap(),
            PpogPacket::ResetComplete { .. }
        ));
        let complete = PpogPacket::ResetComplete {
            sequence: 0,
            rx_window: 25,
            tx_window: 25,
        };
        h.to_phone
            .send(complete.serialize(PpogVersion::One))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_applies_policy() {
        let mut h = harness(true, true, 185, false);
        let mut connector = BleConnector::new(h.platform.clone(), BleConfig::default());

        connector.connect().await.unwrap();
        assert_eq!(connector.mtu(), 185);
        assert_eq!(
            h.platform.state.lock().unwrap().options,
            Some(GattConnectOptions {
                pin_address: true,
                reversed_ppog: false
            })
        );

        let negotiate = tokio::spawn(async move {
            let streams = connector.negotiate().await.map(|_| ());
            (connector, streams)
        });
        watch_handshake(&mut h).await;
        let (connector, streams) = negotiate.await.unwrap();
        streams.unwrap();
        assert!(connector.link().is_some());

        assert_eq!(
            h.platform.calls(),
            vec!["connect_gatt", "connectivity_trigger", "request_mtu 339"]
        );
    }

    #[tokio::test]
    async fn test_pairing_initiator() {
        let h = harness(false, false, 185, false);
        let mut connector = BleConnector::new(h.platform.clone(), BleConfig::default());
        connector.connect().await.unwrap();
        assert!(h.platform.calls().contains(&"create_bond".to_string()));

        let h = harness(true, false, 185, false);
        let config = BleConfig {
            phone_requests_pairing: false,
            write_connectivity_trigger: false,
            ..BleConfig::default()
        };
        let mut connector = BleConnector::new(h.platform.clone(), config);
        connector.connect().await.unwrap();
        let calls = h.platform.calls();
        assert!(calls.contains(&"wait_for_bond".to_string()));
        assert!(!calls.contains(&"connectivity_trigger".to_string()));
    }

    #[tokio::test]
    async fn test_fixed_mtu_skips_request() {
        let h = harness(true, true, 185, false);
        let config = BleConfig {
            use_native_mtu: false,
            ..BleConfig::default()
        };
        let mut connector = BleConnector::new(h.platform.clone(), config);
        connector.connect().await.unwrap();
        assert_eq!(connector.mtu(), 23);
        assert!(!h.platform.calls().iter().any(|c| c.starts_with("request_mtu")));
    }

    #[tokio::test]
    async fn test_tiny_mtu_fails() {
        let h = harness(true, true, 20, false);
        let mut connector = BleConnector::new(h.platform.clone(), BleConfig::default());
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(
            err,
            PebblewireError::TransportFailure(DisconnectReason::MtuNegotiationFailed(20))
        ));
        assert_eq!(
            connector.disconnected().current(),
            Some(DisconnectReason::MtuNegotiationFailed(20))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_app_start_delay() {
        let h = harness(true, true, 185, false);
        let config = BleConfig {
            delay_ble_connections_after_app_start: true,
            ..BleConfig::default()
        };
        let started = Instant::now();
        let mut connector =
            BleConnector::new(h.platform.clone(), config.clone()).with_app_start(started);
        connector.connect().await.unwrap();
        assert!(started.elapsed() >= config.app_start_delay());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_sends_reset_and_falls_back() {
        let mut h = harness(true, true, 185, true);
        let config = BleConfig {
            send_ppog_reset_on_disconnect: true,
            ..BleConfig::default()
        };
        let mut connector = BleConnector::new(h.platform.clone(), config.clone());
        connector.connect().await.unwrap();
        let negotiate = tokio::spawn(async move {
            let ok = connector.negotiate().await.is_ok();
            (connector, ok)
        });
        watch_handshake(&mut h).await;
        let (mut connector, ok) = negotiate.await.unwrap();
        assert!(ok);

        let before = Instant::now();
        connector.disconnect().await;
        assert!(before.elapsed() >= config.disconnect_delay());

        // Courtesy reset from the link, then the fallback after GATT disconnect failed
        for _ in 0..2 {
            assert!(matches!(
                h.from_phone.recv().await.unwrap(),
                PpogPacket::ResetRequest { .. }
            ));
        }
        assert_eq!(
            connector.disconnected().current(),
            Some(DisconnectReason::LocalDisconnect)
        );
    }

    #[tokio::test]
    async fn test_bluetooth_disabled_closes_server() {
        let h = harness(true, true, 185, false);
        let mut connector = BleConnector::new(h.platform.clone(), BleConfig::default());
        connector.on_bluetooth_disabled().await;
        assert!(h.platform.calls().contains(&"close_server".to_string()));
        assert_eq!(
            connector.disconnected().current(),
            Some(DisconnectReason::BluetoothDisabled)
        );
    }
}
