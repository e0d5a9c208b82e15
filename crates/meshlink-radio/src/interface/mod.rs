//! Radio transports
//!
//! A transport moves raw bytes between the host and the radio and reports
//! what it received through a callback. It knows nothing about frames or
//! protobufs; the protocol engine does all decoding.
//!
//! - [`SerialTransport`] - USB/serial stream (requires `serial` feature)
//! - [`TcpTransport`] - network stream to port 4403 (requires `tcp` feature)
//! - [`BleTransport`] - GATT datagrams (requires `ble` feature)
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```
//!
//! - `ble`: Requires BlueZ development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev
//!   ```

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "serial")]
pub use serial::SerialTransport;

#[cfg(feature = "tcp")]
mod tcp;
#[cfg(feature = "tcp")]
pub use tcp::TcpTransport;

#[cfg(feature = "ble")]
mod ble;
#[cfg(feature = "ble")]
pub use ble::BleTransport;

use crate::config::{ConnectionParameters, Framing};
use crate::error::{MeshlinkError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Something a transport observed on its link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes arrived; a whole message for datagram transports
    Received(Bytes),
    /// The link dropped without `disconnect` being called
    Disconnected {
        reason: String,
        /// The failure will not go away by retrying
        permanent: bool,
    },
}

/// Receiver for transport events
///
/// Called from the transport's reader task. Must not block.
pub type TransportCallback = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Byte pipe to a radio
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Open the link and start delivering events to `on_event`
    async fn connect(
        &self,
        params: &ConnectionParameters,
        on_event: TransportCallback,
    ) -> Result<()>;

    /// Close the link; no `Disconnected` event is emitted
    async fn disconnect(&self) -> Result<()>;

    /// Write bytes as-is
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// How received bytes are delimited
    fn framing(&self) -> Framing;

    /// Name for logs
    fn name(&self) -> &str;
}

/// Builds a transport for a set of connection parameters
pub type TransportFactory =
    Arc<dyn Fn(&ConnectionParameters) -> Result<Arc<dyn RadioTransport>> + Send + Sync>;

/// Factory for the transports compiled into this build
pub fn default_transport_factory() -> TransportFactory {
    Arc::new(build_transport)
}

fn build_transport(params: &ConnectionParameters) -> Result<Arc<dyn RadioTransport>> {
    match params {
        #[cfg(feature = "serial")]
        ConnectionParameters::Serial { .. } => Ok(Arc::new(SerialTransport::new())),
        #[cfg(feature = "tcp")]
        ConnectionParameters::Tcp { .. } => Ok(Arc::new(TcpTransport::new())),
        #[cfg(feature = "ble")]
        ConnectionParameters::Ble { .. } => Ok(Arc::new(BleTransport::new())),
        #[allow(unreachable_patterns)]
        other => Err(MeshlinkError::UnsupportedTransport(format!(
            "{} (enable the matching crate feature)",
            other.describe()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "ble"))]
    #[test]
    fn test_missing_transport_is_permanent() {
        let factory = default_transport_factory();
        let err = match factory(&ConnectionParameters::ble("T-Beam")) {
            Err(e) => e,
            Ok(_) => panic!("BLE transport should not be available"),
        };
        assert!(matches!(err, MeshlinkError::UnsupportedTransport(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_transport_event_equality() {
        let a = TransportEvent::Received(Bytes::from_static(b"\x94\xc3"));
        assert_eq!(a.clone(), a);
        assert_ne!(
            a,
            TransportEvent::Disconnected {
                reason: "eof".to_string(),
                permanent: false
            }
        );
    }
}
