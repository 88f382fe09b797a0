//! Configuration for the link, the protocol handler, and the session.
//!
//! Every knob is an independent field with a serde default, so a partial
//! JSON document overrides only what it names:
//!
//! ```
//! use pebblewire::config::SessionConfig;
//!
//! let config = SessionConfig::from_json_str(r#"{ "ble": { "reversed_ppog": true } }"#).unwrap();
//! assert!(config.ble.reversed_ppog);
//! assert!(config.ble.pin_address); // untouched default
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PebblewireError, Result};

/// Smallest MTU a BLE link can have.
pub const BLE_MIN_MTU: u16 = 23;

/// MTU asked for when the platform doesn't supply one.
pub const DEFAULT_DESIRED_MTU: u16 = 339;

/// Largest window the link layer supports.
pub const MAX_WINDOW: u8 = 25;

/// Default inbound broadcast capacity.
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// Default size of a single transport read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4 * 1024;

/// BLE link policy.
///
/// Each flag trades reliability against speed or power; defaults favour
/// reliability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Watch starts the PPoG reset handshake instead of waiting for us.
    pub reversed_ppog: bool,
    /// Log each link-layer fragment at trace level.
    pub verbose_ppog_logging: bool,
    /// Pin the peer address when connecting.
    pub pin_address: bool,
    /// Phone initiates bonding rather than waiting for the watch.
    pub phone_requests_pairing: bool,
    /// Write the connectivity trigger characteristic once connected.
    pub write_connectivity_trigger: bool,
    /// MTU assumed before negotiation.
    pub initial_mtu: u16,
    /// MTU requested from the platform.
    pub desired_mtu: u16,
    /// Window we would like for sending.
    pub desired_tx_window: u8,
    /// Window we would like for receiving.
    pub desired_rx_window: u8,
    /// Trust the platform's negotiated MTU over `desired_mtu`.
    pub use_native_mtu: bool,
    /// Send a link reset request before disconnecting.
    pub send_ppog_reset_on_disconnect: bool,
    /// Hold off new BLE connections right after process start.
    pub delay_ble_connections_after_app_start: bool,
    /// How long that hold-off lasts.
    pub app_start_delay_ms: u64,
    /// Wait before tearing down the GATT connection.
    pub delay_ble_disconnections: bool,
    /// How long that wait lasts.
    pub disconnect_delay_ms: u64,
    /// Send a reset request if a graceful disconnect fails.
    pub fallback_to_reset_request: bool,
    /// Close the GATT server role when the radio is switched off.
    pub close_server_when_bt_disabled: bool,
    /// Fragment retransmission timeout.
    pub ack_timeout_ms: u64,
    /// Retransmissions per fragment before escalating to a reset.
    pub max_retries: u8,
    /// How long to wait for the watch's reset request.
    pub negotiation_timeout_ms: u64,
    /// How long to wait for a reset complete after sending our own request.
    pub reset_complete_timeout_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            reversed_ppog: false,
            verbose_ppog_logging: false,
            pin_address: true,
            phone_requests_pairing: true,
            write_connectivity_trigger: true,
            initial_mtu: BLE_MIN_MTU,
            desired_mtu: DEFAULT_DESIRED_MTU,
            desired_tx_window: MAX_WINDOW,
            desired_rx_window: MAX_WINDOW,
            use_native_mtu: true,
            send_ppog_reset_on_disconnect: false,
            delay_ble_connections_after_app_start: false,
            app_start_delay_ms: 5_000,
            delay_ble_disconnections: true,
            disconnect_delay_ms: 1_000,
            fallback_to_reset_request: true,
            close_server_when_bt_disabled: true,
            ack_timeout_ms: 10_000,
            max_retries: 2,
            negotiation_timeout_ms: 12_000,
            reset_complete_timeout_ms: 5_000,
        }
    }
}

impl BleConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn reset_complete_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_complete_timeout_ms)
    }

    pub fn app_start_delay(&self) -> Duration {
        Duration::from_millis(self.app_start_delay_ms)
    }

    pub fn disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.disconnect_delay_ms)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.desired_tx_window == 0 || self.desired_rx_window == 0 {
            return Err(PebblewireError::InvalidConfig(
                "window size must be at least 1".to_string(),
            ));
        }
        if self.initial_mtu < BLE_MIN_MTU || self.desired_mtu < BLE_MIN_MTU {
            return Err(PebblewireError::InvalidConfig(format!(
                "MTU must be at least {}",
                BLE_MIN_MTU
            )));
        }
        if self.ack_timeout_ms == 0 {
            return Err(PebblewireError::InvalidConfig(
                "ack timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Protocol handler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Packets buffered per subscriber before the slowest one starts lagging.
    pub inbound_capacity: usize,
    /// Bytes requested per transport read.
    pub read_chunk_size: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl HandlerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.inbound_capacity == 0 {
            return Err(PebblewireError::InvalidConfig(
                "inbound capacity must be at least 1".to_string(),
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(PebblewireError::InvalidConfig(
                "read chunk size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything a connection session needs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ble: BleConfig,
    pub handler: HandlerConfig,
    /// End-to-end timeout for correlated requests. `None` waits until disconnect.
    pub request_timeout_ms: Option<u64>,
    /// Ask the watch for its running app right after connecting.
    pub query_initial_app_state: bool,
}

impl SessionConfig {
    /// Parse from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        self.ble.validate()?;
        self.handler.validate()?;
        if self.request_timeout_ms == Some(0) {
            return Err(PebblewireError::InvalidConfig(
                "request timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }
}

/// Fluent construction of a [`SessionConfig`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use pebblewire::config::SessionBuilder;
///
/// let config = SessionBuilder::new()
///     .desired_mtu(185)
///     .request_timeout(Duration::from_secs(5))
///     .build()
///     .unwrap();
/// assert_eq!(config.ble.desired_mtu, 185);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn reversed_ppog(mut self, enabled: bool) -> Self {
        self.config.ble.reversed_ppog = enabled;
        self
    }

    pub fn verbose_ppog_logging(mut self, enabled: bool) -> Self {
        self.config.ble.verbose_ppog_logging = enabled;
        self
    }

    pub fn pin_address(mut self, enabled: bool) -> Self {
        self.config.ble.pin_address = enabled;
        self
    }

    pub fn phone_requests_pairing(mut self, enabled: bool) -> Self {
        self.config.ble.phone_requests_pairing = enabled;
        self
    }

    pub fn write_connectivity_trigger(mut self, enabled: bool) -> Self {
        self.config.ble.write_connectivity_trigger = enabled;
        self
    }

    pub fn initial_mtu(mut self, mtu: u16) -> Self {
        self.config.ble.initial_mtu = mtu;
        self
    }

    pub fn desired_mtu(mut self, mtu: u16) -> Self {
        self.config.ble.desired_mtu = mtu;
        self
    }

    pub fn desired_tx_window(mut self, window: u8) -> Self {
        self.config.ble.desired_tx_window = window;
        self
    }

    pub fn desired_rx_window(mut self, window: u8) -> Self {
        self.config.ble.desired_rx_window = window;
        self
    }

    pub fn use_native_mtu(mut self, enabled: bool) -> Self {
        self.config.ble.use_native_mtu = enabled;
        self
    }

    pub fn send_ppog_reset_on_disconnect(mut self, enabled: bool) -> Self {
        self.config.ble.send_ppog_reset_on_disconnect = enabled;
        self
    }

    pub fn delay_ble_connections_after_app_start(mut self, enabled: bool) -> Self {
        self.config.ble.delay_ble_connections_after_app_start = enabled;
        self
    }

    pub fn delay_ble_disconnections(mut self, enabled: bool) -> Self {
        self.config.ble.delay_ble_disconnections = enabled;
        self
    }

    pub fn fallback_to_reset_request(mut self, enabled: bool) -> Self {
        self.config.ble.fallback_to_reset_request = enabled;
        self
    }

    pub fn close_server_when_bt_disabled(mut self, enabled: bool) -> Self {
        self.config.ble.close_server_when_bt_disabled = enabled;
        self
    }

    /// Fragment retransmission timeout.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ble.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.config.handler.inbound_capacity = capacity;
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.handler.read_chunk_size = size;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn query_initial_app_state(mut self, enabled: bool) -> Self {
        self.config.query_initial_app_state = enabled;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
