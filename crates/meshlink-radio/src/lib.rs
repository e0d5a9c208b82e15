//! Client protocol engine for LoRa mesh radios
//!
//! This crate talks to a mesh radio over serial/USB, TCP or Bluetooth LE
//! and presents one consistent state machine upward: node and channel
//! tables, text messages with delivery tracking, and a connection state
//! that recovers on its own.
//!
//! # Architecture
//!
//! 1. **Transport** - [`RadioTransport`] moves raw bytes and reports link loss
//! 2. **Framing** - [`FrameDecoder`] splits the byte stream into frames and
//!    separates interleaved device console text
//! 3. **Protocol** - [`ProtocolEngine`] runs the handshake, channel sync and
//!    session key negotiation on its own task
//! 4. **Dispatch** - [`PacketDispatcher`] turns mesh packets into
//!    [`MeshUpdate`]s; [`DeliveryTracker`] resolves ACKs
//! 5. **Lifecycle** - [`ReconnectionCoordinator`] owns [`ConnectionState`]
//!    and reconnects with exponential backoff
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Cargo.toml: meshlink-radio = { version = "0.1", features = ["serial"] }
//! use std::sync::Arc;
//! use meshlink_radio::{
//!     default_transport_factory, ConnectionParameters, MeshContext, MeshlinkConfig,
//!     ReconnectionCoordinator, BROADCAST_ADDR,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = Arc::new(MeshContext::detached());
//!     let coordinator = ReconnectionCoordinator::new(
//!         default_transport_factory(),
//!         ctx.clone(),
//!         MeshlinkConfig::default(),
//!     );
//!     coordinator
//!         .connect(ConnectionParameters::serial("/dev/ttyUSB0"))
//!         .await?;
//!
//!     if let Some(engine) = coordinator.engine().await {
//!         engine.send_text("hello mesh", BROADCAST_ADDR, 0).await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port transport (requires `libudev-dev` on Linux)
//! - `ble` - Bluetooth Low Energy transport (requires `btleplug`)
//! - `tcp` - TCP transport for radios with WiFi or Ethernet
//! - `full` - Enable the wired transports
//!
//! # Protocol Details
//!
//! Stream transports carry frames of
//! - Bytes 0-1: Magic number `0x94C3`
//! - Bytes 2-3: Payload length (big-endian u16, 1-512)
//! - Bytes 4+: Protobuf payload
//!
//! BLE delivers one unframed protobuf per read.

pub mod cache;
pub mod collaborators;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod framing;
pub mod interface;
pub mod model;
pub mod proto;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod wire;

pub mod test_utils;

pub use cache::{CacheStats, DuplicateCache, PacketKey};
pub use collaborators::{MeshObserver, MeshStore, NoopObserver, NoopStore, Settings};
pub use config::{
    ClientSettings, ConnectionParameters, Framing, MeshlinkConfig, MeshlinkConfigBuilder,
    ProtocolConfig, ReconnectConfig,
};
pub use delivery::{DeliveryTracker, RoutingOutcome};
pub use dispatch::{Dispatched, PacketDispatcher};
pub use engine::{ChannelSyncReport, ProtocolEngine};
pub use error::{MeshlinkError, Result};
pub use framing::{encode_frame, DecodeEvent, FrameDecoder};
pub use interface::{
    default_transport_factory, RadioTransport, TransportCallback, TransportEvent,
    TransportFactory,
};
pub use model::{
    ChannelInfo, ChannelRole, MeshUpdate, MessageDeliveryState, MessageItem, NodePatch,
    NodeRecord, TracerouteResult, WaypointInfo,
};
pub use reconnect::{ConnectionState, ReconnectionCoordinator};
pub use session::{InboundBuffer, SessionPhase, SessionSnapshot};
pub use state::{MeshContext, MeshState};

#[cfg(feature = "ble")]
pub use interface::BleTransport;
#[cfg(feature = "serial")]
pub use interface::SerialTransport;
#[cfg(feature = "tcp")]
pub use interface::TcpTransport;

pub use config::{
    BROADCAST_ADDR, CHANNEL_SLOTS, DATA_PAYLOAD_MAX, DEFAULT_BAUD_RATE, DEFAULT_TCP_PORT,
    FRAME_MAGIC, MAX_FRAME_PAYLOAD, MAX_HOP_LIMIT,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(FRAME_MAGIC, 0x94C3);
        assert_eq!(MAX_FRAME_PAYLOAD, 512);
        assert_eq!(DEFAULT_BAUD_RATE, 115200);
        assert_eq!(DEFAULT_TCP_PORT, 4403);
        assert_eq!(MAX_HOP_LIMIT, 7);
        assert_eq!(CHANNEL_SLOTS, 8);
    }
}
