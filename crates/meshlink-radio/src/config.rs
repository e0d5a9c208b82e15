//! Configuration types for the radio protocol engine
//!
//! This module provides the connection parameters for each transport, the
//! protocol timing table, reconnection behaviour and the client settings
//! consumed by the packet dispatcher.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::collaborators::Settings;
use crate::error::{MeshlinkError, Result};

/// Maximum payload carried by one framed message on stream transports
pub const MAX_FRAME_PAYLOAD: usize = 512;

/// Maximum application payload inside one mesh data packet
pub const DATA_PAYLOAD_MAX: usize = 233;

/// Frame magic number (first 2 bytes of every framed message)
pub const FRAME_MAGIC: u16 = 0x94C3;

/// Default baud rate for serial radios
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default TCP port exposed by networked radios
pub const DEFAULT_TCP_PORT: u16 = 4403;

/// Default connection timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 10000;

/// Default hop limit for outgoing packets
pub const DEFAULT_HOP_LIMIT: u8 = 3;

/// Maximum hop limit accepted by the mesh
pub const MAX_HOP_LIMIT: u8 = 7;

/// Number of channel slots on a radio
pub const CHANNEL_SLOTS: u8 = 8;

/// Recipient id addressing every node
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Maximum long name length in bytes
pub const MAX_LONG_NAME: usize = 39;

/// Maximum short name length in characters
pub const MAX_SHORT_NAME: usize = 4;

/// Main configuration for a radio client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshlinkConfig {
    /// Connection target (serial, BLE, or TCP)
    #[serde(default)]
    pub connection: Option<ConnectionParameters>,

    /// Protocol timing settings
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Client-side settings read by the dispatcher
    #[serde(default)]
    pub client: ClientSettings,
}

impl MeshlinkConfig {
    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;
        self.reconnect.validate()?;
        if let Some(params) = &self.connection {
            params.validate()?;
        }
        Ok(())
    }
}

/// How bytes are delimited on a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Continuous byte stream carrying `0x94 0xC3 <len> <payload>` frames
    Stream,
    /// Every received buffer is already one complete message
    Datagram,
}

/// Transport-specific connection target
///
/// Immutable once a connection attempt starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionParameters {
    /// Serial/USB connection
    Serial {
        /// Path to serial port (e.g., /dev/ttyUSB0, COM3)
        port: PathBuf,
        /// Baud rate (default: 115200)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// Bluetooth Low Energy connection
    Ble {
        /// Advertised device name or address
        device: String,
    },
    /// TCP connection (for radios with network)
    Tcp {
        /// Host address
        host: String,
        /// Port number
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

impl ConnectionParameters {
    /// Serial connection at the default baud rate
    pub fn serial(port: impl Into<PathBuf>) -> Self {
        ConnectionParameters::Serial {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    /// TCP connection to `host:port`
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ConnectionParameters::Tcp {
            host: host.into(),
            port,
        }
    }

    /// BLE connection to a named device
    pub fn ble(device: impl Into<String>) -> Self {
        ConnectionParameters::Ble {
            device: device.into(),
        }
    }

    /// Framing used by this transport kind
    pub fn framing(&self) -> Framing {
        match self {
            ConnectionParameters::Ble { .. } => Framing::Datagram,
            ConnectionParameters::Serial { .. } | ConnectionParameters::Tcp { .. } => {
                Framing::Stream
            }
        }
    }

    /// Short label for logs ("serial:/dev/ttyUSB0", "tcp:host:4403")
    pub fn describe(&self) -> String {
        match self {
            ConnectionParameters::Serial { port, .. } => format!("serial:{}", port.display()),
            ConnectionParameters::Ble { device } => format!("ble:{}", device),
            ConnectionParameters::Tcp { host, port } => format!("tcp:{}:{}", host, port),
        }
    }

    /// Reject parameters no transport could use
    pub fn validate(&self) -> Result<()> {
        match self {
            ConnectionParameters::Serial { port, baud_rate } => {
                if port.as_os_str().is_empty() {
                    return Err(MeshlinkError::InvalidParameters(
                        "serial port path is empty".to_string(),
                    ));
                }
                if *baud_rate == 0 {
                    return Err(MeshlinkError::InvalidParameters(
                        "baud rate must be non-zero".to_string(),
                    ));
                }
            }
            ConnectionParameters::Ble { device } => {
                if device.trim().is_empty() {
                    return Err(MeshlinkError::InvalidParameters(
                        "BLE device name is empty".to_string(),
                    ));
                }
            }
            ConnectionParameters::Tcp { host, port } => {
                if host.trim().is_empty() {
                    return Err(MeshlinkError::InvalidParameters(
                        "TCP host is empty".to_string(),
                    ));
                }
                if *port == 0 {
                    return Err(MeshlinkError::InvalidParameters(
                        "TCP port must be non-zero".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ConnectionParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Protocol timing and sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Delay between connect and the first bytes written
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,

    /// Number of wakeup bytes sent to stream transports
    #[serde(default = "default_wakeup_len")]
    pub wakeup_len: usize,

    /// Deadline for the device to finish the handshake
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,

    /// Deadline for the device to issue an admin session passkey
    #[serde(with = "humantime_serde", default = "default_session_key_timeout")]
    pub session_key_timeout: Duration,

    /// How long a started frame may wait for its remaining bytes
    #[serde(with = "humantime_serde", default = "default_frame_timeout")]
    pub frame_timeout: Duration,

    /// Silence (no decoded messages) after which text traffic triggers recovery
    #[serde(with = "humantime_serde", default = "default_stale_link_after")]
    pub stale_link_after: Duration,

    /// Maximum channel sync rounds
    #[serde(default = "default_channel_sync_rounds")]
    pub channel_sync_rounds: u32,

    /// Delay between channel requests on wired transports
    #[serde(with = "humantime_serde", default = "default_wired_request_delay")]
    pub wired_request_delay: Duration,

    /// Delay between channel requests over BLE
    #[serde(with = "humantime_serde", default = "default_ble_request_delay")]
    pub ble_request_delay: Duration,

    /// Wait after each channel round on wired transports
    #[serde(with = "humantime_serde", default = "default_wired_round_settle")]
    pub wired_round_settle: Duration,

    /// Wait after each channel round over BLE
    #[serde(with = "humantime_serde", default = "default_ble_round_settle")]
    pub ble_round_settle: Duration,

    /// Hop limit for outgoing packets
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u8,

    /// Keep-alive interval while synced (`None` disables)
    #[serde(with = "humantime_serde_opt", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Option<Duration>,
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_wakeup_len() -> usize {
    64
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_session_key_timeout() -> Duration {
    Duration::from_secs(4)
}

fn default_frame_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_stale_link_after() -> Duration {
    Duration::from_secs(60)
}

fn default_channel_sync_rounds() -> u32 {
    3
}

fn default_wired_request_delay() -> Duration {
    Duration::from_millis(150)
}

fn default_ble_request_delay() -> Duration {
    Duration::from_millis(300)
}

fn default_wired_round_settle() -> Duration {
    Duration::from_secs(5)
}

fn default_ble_round_settle() -> Duration {
    Duration::from_secs(3)
}

fn default_hop_limit() -> u8 {
    DEFAULT_HOP_LIMIT
}

fn default_heartbeat_interval() -> Option<Duration> {
    Some(Duration::from_secs(300))
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            settle_delay: default_settle_delay(),
            wakeup_len: default_wakeup_len(),
            handshake_timeout: default_handshake_timeout(),
            session_key_timeout: default_session_key_timeout(),
            frame_timeout: default_frame_timeout(),
            stale_link_after: default_stale_link_after(),
            channel_sync_rounds: default_channel_sync_rounds(),
            wired_request_delay: default_wired_request_delay(),
            ble_request_delay: default_ble_request_delay(),
            wired_round_settle: default_wired_round_settle(),
            ble_round_settle: default_ble_round_settle(),
            hop_limit: DEFAULT_HOP_LIMIT,
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

impl ProtocolConfig {
    /// Inter-request delay for channel sync on the given framing
    pub fn request_delay(&self, framing: Framing) -> Duration {
        match framing {
            Framing::Stream => self.wired_request_delay,
            Framing::Datagram => self.ble_request_delay,
        }
    }

    /// Round-settle delay for channel sync on the given framing
    pub fn round_settle(&self, framing: Framing) -> Duration {
        match framing {
            Framing::Stream => self.wired_round_settle,
            Framing::Datagram => self.ble_round_settle,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.handshake_timeout.is_zero() {
            return Err(MeshlinkError::InvalidConfig(
                "handshake_timeout must be non-zero".to_string(),
            ));
        }
        if self.frame_timeout.is_zero() {
            return Err(MeshlinkError::InvalidConfig(
                "frame_timeout must be non-zero".to_string(),
            ));
        }
        if self.hop_limit == 0 || self.hop_limit > MAX_HOP_LIMIT {
            return Err(MeshlinkError::InvalidConfig(format!(
                "hop_limit must be within 1..={}",
                MAX_HOP_LIMIT
            )));
        }
        if self.heartbeat_interval.is_some_and(|d| d.is_zero()) {
            return Err(MeshlinkError::InvalidConfig(
                "heartbeat_interval must be non-zero (use none to disable)".to_string(),
            ));
        }
        if self.channel_sync_rounds == 0 {
            return Err(MeshlinkError::InvalidConfig(
                "channel_sync_rounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    #[serde(default = "default_auto_reconnect")]
    pub enabled: bool,

    /// Delay before the first reconnection attempt
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Maximum number of reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 0, // Infinite
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay before reconnection attempt `attempt` (1-based)
    ///
    /// Doubles from `initial_delay` and saturates at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn validate(&self) -> Result<()> {
        if self.initial_delay.is_zero() {
            return Err(MeshlinkError::InvalidConfig(
                "reconnect initial_delay must be non-zero".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(MeshlinkError::InvalidConfig(
                "reconnect max_delay is shorter than initial_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client-side flags and per-node display data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Log every frame at trace level
    #[serde(default)]
    pub verbose_frame_logging: bool,

    /// Surface encrypted packets as placeholder messages
    #[serde(default = "default_show_undecodable")]
    pub show_undecodable: bool,

    /// Number of recent messages kept in memory
    #[serde(default = "default_message_history")]
    pub message_history: usize,

    /// Display colour per node number
    #[serde(default)]
    pub node_colors: HashMap<u32, String>,

    /// Free-form note per node number
    #[serde(default)]
    pub node_notes: HashMap<u32, String>,
}

fn default_show_undecodable() -> bool {
    true
}

fn default_message_history() -> usize {
    500
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            verbose_frame_logging: false,
            show_undecodable: true,
            message_history: 500,
            node_colors: HashMap::new(),
            node_notes: HashMap::new(),
        }
    }
}

impl Settings for ClientSettings {
    fn verbose_frame_logging(&self) -> bool {
        self.verbose_frame_logging
    }

    fn show_undecodable_messages(&self) -> bool {
        self.show_undecodable
    }

    fn node_color(&self, node_num: u32) -> Option<String> {
        self.node_colors.get(&node_num).cloned()
    }

    fn node_note(&self, node_num: u32) -> Option<String> {
        self.node_notes.get(&node_num).cloned()
    }
}

/// Builder for MeshlinkConfig
#[derive(Debug, Default)]
pub struct MeshlinkConfigBuilder {
    config: MeshlinkConfig,
}

impl MeshlinkConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.connection = Some(ConnectionParameters::serial(port));
        self
    }

    /// Set serial port with baud rate
    pub fn serial_port_with_baud(mut self, port: impl Into<PathBuf>, baud_rate: u32) -> Self {
        self.config.connection = Some(ConnectionParameters::Serial {
            port: port.into(),
            baud_rate,
        });
        self
    }

    /// Set TCP target
    pub fn tcp(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.connection = Some(ConnectionParameters::tcp(host, port));
        self
    }

    /// Set BLE target
    pub fn ble(mut self, device: impl Into<String>) -> Self {
        self.config.connection = Some(ConnectionParameters::ble(device));
        self
    }

    /// Set hop limit for outgoing packets
    pub fn hop_limit(mut self, hops: u8) -> Self {
        self.config.protocol.hop_limit = hops.clamp(1, MAX_HOP_LIMIT);
        self
    }

    /// Set the handshake deadline
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.protocol.handshake_timeout = timeout;
        self
    }

    /// Set or disable the keep-alive interval
    pub fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.protocol.heartbeat_interval = interval;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Limit reconnection attempts (0 = infinite)
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    /// Show or hide placeholders for undecodable packets
    pub fn show_undecodable(mut self, enabled: bool) -> Self {
        self.config.client.show_undecodable = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> MeshlinkConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod humantime_serde_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshlinkConfig::default();
        assert_eq!(config.protocol.hop_limit, DEFAULT_HOP_LIMIT);
        assert_eq!(config.protocol.handshake_timeout, Duration::from_secs(15));
        assert_eq!(config.protocol.session_key_timeout, Duration::from_secs(4));
        assert!(config.reconnect.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = MeshlinkConfigBuilder::new()
            .serial_port("/dev/ttyACM0")
            .hop_limit(5)
            .auto_reconnect(false)
            .build();

        assert_eq!(config.protocol.hop_limit, 5);
        assert!(!config.reconnect.enabled);
        assert_eq!(
            config.connection,
            Some(ConnectionParameters::serial("/dev/ttyACM0"))
        );
    }

    #[test]
    fn test_hop_limit_clamping() {
        let config = MeshlinkConfigBuilder::new().hop_limit(10).build();
        assert_eq!(config.protocol.hop_limit, MAX_HOP_LIMIT);
    }

    #[test]
    fn test_backoff_sequence() {
        let reconnect = ReconnectConfig::default();
        let delays: Vec<u64> = (1..=8)
            .map(|attempt| reconnect.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(reconnect.delay_for_attempt(200), Duration::from_secs(30));
    }

    #[test]
    fn test_framing_per_transport() {
        assert_eq!(ConnectionParameters::ble("T-Echo").framing(), Framing::Datagram);
        assert_eq!(ConnectionParameters::tcp("10.0.0.2", 4403).framing(), Framing::Stream);
        assert_eq!(ConnectionParameters::serial("/dev/ttyUSB0").framing(), Framing::Stream);
    }

    #[test]
    fn test_channel_sync_delays() {
        let protocol = ProtocolConfig::default();
        assert_eq!(protocol.request_delay(Framing::Stream), Duration::from_millis(150));
        assert_eq!(protocol.request_delay(Framing::Datagram), Duration::from_millis(300));
        assert_eq!(protocol.round_settle(Framing::Stream), Duration::from_secs(5));
        assert_eq!(protocol.round_settle(Framing::Datagram), Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(ConnectionParameters::tcp("", 4403).validate().is_err());
        assert!(ConnectionParameters::tcp("radio.local", 0).validate().is_err());
        assert!(ConnectionParameters::ble("  ").validate().is_err());
        assert!(ConnectionParameters::serial("/dev/ttyUSB0").validate().is_ok());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = MeshlinkConfigBuilder::new()
            .tcp("radio.local", DEFAULT_TCP_PORT)
            .heartbeat_interval(None)
            .build();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"type\":\"tcp\""));
        assert!(json.contains("15s"));

        let parsed: MeshlinkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.connection, config.connection);
        assert_eq!(parsed.protocol.heartbeat_interval, None);
        assert_eq!(parsed.protocol.handshake_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_zero_handshake_timeout_rejected() {
        let config = MeshlinkConfigBuilder::new()
            .handshake_timeout(Duration::ZERO)
            .build();
        assert!(matches!(
            config.validate(),
            Err(MeshlinkError::InvalidConfig(_))
        ));
    }
}
