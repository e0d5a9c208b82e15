//! Error types for the radio protocol engine
//!
//! Errors are grouped the way the engine reacts to them:
//!
//! - **Transport** errors end in reconnection (or a terminal error state
//!   when the operating system refuses access to the device).
//! - **Decode** errors are logged and trigger frame recovery.
//! - **Protocol** errors degrade a connection to "connected but not ready".
//!
//! Device-reported routing failures are not errors at all; they surface as
//! per-message delivery state (see [`crate::delivery`]).

use thiserror::Error;

/// Main error type for radio protocol operations
#[derive(Error, Debug)]
pub enum MeshlinkError {
    // ===== Transport Errors =====
    /// Connection parameters are unusable for the selected transport
    #[error("Invalid connection parameters: {0}")]
    InvalidParameters(String),

    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// The operating system denied access to the device
    #[error("Permission denied for {device}: {reason}")]
    PermissionDenied {
        /// Device path or name
        device: String,
        /// Failure reason
        reason: String,
    },

    /// BLE device could not be found during scanning
    #[error("Bluetooth device not found: {0}")]
    DeviceNotFound(String),

    /// Bluetooth stack error
    #[error("Bluetooth error: {0}")]
    Ble(String),

    /// The transport was compiled out of this build
    #[error("Transport not supported in this build: {0}")]
    UnsupportedTransport(String),

    /// Operation requires a connected transport
    #[error("Transport not connected")]
    NotConnected,

    /// Transport link dropped
    #[error("Transport disconnected")]
    Disconnected,

    /// Read error on the transport
    #[error("Transport read error: {0}")]
    ReadError(String),

    /// Write error on the transport
    #[error("Transport write error: {0}")]
    WriteError(String),

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Operation was cancelled by a newer connect/disconnect request
    #[error("Operation cancelled")]
    Cancelled,

    // ===== Decode Errors =====
    /// Frame declared a length outside 1..=512
    #[error("Invalid frame length {length} (max {max})")]
    InvalidFrameLength {
        /// Declared payload length
        length: usize,
        /// Maximum accepted payload length
        max: usize,
    },

    /// Protobuf decode error
    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(String),

    /// Protobuf encode error
    #[error("Protobuf encode error: {0}")]
    ProtobufEncode(String),

    /// Manual field scan hit malformed wire data
    #[error("Malformed protobuf field: {0}")]
    MalformedField(String),

    // ===== Protocol Errors =====
    /// Device did not finish the handshake in time
    #[error("Handshake not completed after {duration_ms}ms")]
    HandshakeTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Admin operation could not obtain a session passkey
    #[error("No admin session passkey available")]
    MissingSessionKey,

    /// Operation requires a completed handshake
    #[error("Radio session not ready: {0}")]
    NotReady(String),

    /// Payload exceeds what the radio can carry in one packet
    #[error("Message too large: {size} bytes exceeds radio maximum of {max} bytes")]
    MessageTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Caller supplied an argument the device would reject
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ===== General Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Engine command channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshlinkError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            MeshlinkError::ConnectionTimeout { .. }
                | MeshlinkError::Disconnected
                | MeshlinkError::NotConnected
                | MeshlinkError::ReadError(_)
                | MeshlinkError::WriteError(_)
                | MeshlinkError::PortNotFound(_)
                | MeshlinkError::PortOpenFailed { .. }
                | MeshlinkError::DeviceNotFound(_)
                | MeshlinkError::Ble(_)
                | MeshlinkError::Io(_)
        )
    }

    /// Check if this failure must not be retried
    ///
    /// Permanent failures skip reconnection backoff and surface as a
    /// terminal error state.
    pub fn is_permanent(&self) -> bool {
        match self {
            MeshlinkError::PermissionDenied { .. }
            | MeshlinkError::InvalidParameters(_)
            | MeshlinkError::UnsupportedTransport(_) => true,
            MeshlinkError::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Check if this is a protocol error (bad data from device)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            MeshlinkError::InvalidFrameLength { .. }
                | MeshlinkError::ProtobufDecode(_)
                | MeshlinkError::MalformedField(_)
                | MeshlinkError::HandshakeTimeout { .. }
                | MeshlinkError::MissingSessionKey
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            MeshlinkError::InvalidParameters(_) => "INVALID_PARAMETERS",
            MeshlinkError::PortNotFound(_) => "PORT_NOT_FOUND",
            MeshlinkError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            MeshlinkError::PermissionDenied { .. } => "PERMISSION_DENIED",
            MeshlinkError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            MeshlinkError::Ble(_) => "BLE_ERROR",
            MeshlinkError::UnsupportedTransport(_) => "UNSUPPORTED_TRANSPORT",
            MeshlinkError::NotConnected => "NOT_CONNECTED",
            MeshlinkError::Disconnected => "DISCONNECTED",
            MeshlinkError::ReadError(_) => "READ_ERROR",
            MeshlinkError::WriteError(_) => "WRITE_ERROR",
            MeshlinkError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            MeshlinkError::Cancelled => "CANCELLED",
            MeshlinkError::InvalidFrameLength { .. } => "INVALID_FRAME_LENGTH",
            MeshlinkError::ProtobufDecode(_) => "PROTOBUF_DECODE",
            MeshlinkError::ProtobufEncode(_) => "PROTOBUF_ENCODE",
            MeshlinkError::MalformedField(_) => "MALFORMED_FIELD",
            MeshlinkError::HandshakeTimeout { .. } => "HANDSHAKE_TIMEOUT",
            MeshlinkError::MissingSessionKey => "MISSING_SESSION_KEY",
            MeshlinkError::NotReady(_) => "NOT_READY",
            MeshlinkError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            MeshlinkError::InvalidArgument(_) => "INVALID_ARGUMENT",
            MeshlinkError::InvalidConfig(_) => "INVALID_CONFIG",
            MeshlinkError::ChannelClosed => "CHANNEL_CLOSED",
            MeshlinkError::Internal(_) => "INTERNAL_ERROR",
            MeshlinkError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for radio protocol operations
pub type Result<T> = std::result::Result<T, MeshlinkError>;

// Conversion from prost decode error
impl From<prost::DecodeError> for MeshlinkError {
    fn from(err: prost::DecodeError) -> Self {
        MeshlinkError::ProtobufDecode(err.to_string())
    }
}

// Conversion from prost encode error
impl From<prost::EncodeError> for MeshlinkError {
    fn from(err: prost::EncodeError) -> Self {
        MeshlinkError::ProtobufEncode(err.to_string())
    }
}

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for MeshlinkError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => MeshlinkError::PortNotFound(err.description),
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                MeshlinkError::PermissionDenied {
                    device: String::new(),
                    reason: err.description,
                }
            }
            serialport::ErrorKind::Io(kind) => {
                MeshlinkError::Io(std::io::Error::new(kind, err.description))
            }
            serialport::ErrorKind::InvalidInput => MeshlinkError::InvalidParameters(err.description),
            _ => MeshlinkError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

// Conversion from btleplug error (only when ble feature is enabled)
#[cfg(feature = "ble")]
impl From<btleplug::Error> for MeshlinkError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => MeshlinkError::PermissionDenied {
                device: "bluetooth".to_string(),
                reason: err.to_string(),
            },
            btleplug::Error::DeviceNotFound => MeshlinkError::DeviceNotFound(err.to_string()),
            btleplug::Error::NotConnected => MeshlinkError::NotConnected,
            btleplug::Error::TimedOut(d) => MeshlinkError::ConnectionTimeout {
                duration_ms: d.as_millis() as u64,
            },
            other => MeshlinkError::Ble(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = MeshlinkError::PortNotFound("/dev/ttyUSB0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
        assert_eq!(MeshlinkError::MissingSessionKey.error_code(), "MISSING_SESSION_KEY");
    }

    #[test]
    fn test_is_retriable() {
        assert!(MeshlinkError::Disconnected.is_retriable());
        assert!(MeshlinkError::ConnectionTimeout { duration_ms: 5000 }.is_retriable());
        assert!(!MeshlinkError::InvalidFrameLength { length: 0, max: 512 }.is_retriable());
    }

    #[test]
    fn test_permission_denied_is_permanent() {
        let err = MeshlinkError::PermissionDenied {
            device: "/dev/ttyACM0".to_string(),
            reason: "EACCES".to_string(),
        };
        assert!(err.is_permanent());
        assert!(!err.is_retriable());

        let io = MeshlinkError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(io.is_permanent());
        assert!(!MeshlinkError::Disconnected.is_permanent());
    }

    #[test]
    fn test_is_protocol_error() {
        assert!(MeshlinkError::InvalidFrameLength { length: 600, max: 512 }.is_protocol_error());
        assert!(MeshlinkError::ProtobufDecode("test".to_string()).is_protocol_error());
        assert!(!MeshlinkError::Disconnected.is_protocol_error());
    }

    #[test]
    fn test_message_too_large() {
        let err = MeshlinkError::MessageTooLarge { size: 300, max: 233 };
        assert!(err.to_string().contains("300"));
        assert!(err.to_string().contains("233"));
    }
}
