//! Serial port transport
//!
//! Uses tokio-serial. The radio speaks the framed stream protocol on its
//! USB serial port and mixes in plain-text debug console output, which the
//! frame decoder separates out.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace};

use super::{RadioTransport, TransportCallback, TransportEvent};
use crate::config::{ConnectionParameters, Framing, DEFAULT_TIMEOUT_MS};
use crate::error::{MeshlinkError, Result};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 512;

/// Serial stream transport
pub struct SerialTransport {
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    timeout: Duration,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Create with custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn open(port: &Path, baud_rate: u32, timeout: Duration) -> Result<SerialStream> {
        // Check if port exists
        if !port.exists() {
            return Err(MeshlinkError::PortNotFound(port.display().to_string()));
        }

        tokio_serial::new(port.to_string_lossy(), baud_rate)
            .timeout(timeout)
            .open_native_async()
            .map_err(|e| {
                let device = port.display().to_string();
                match e.kind() {
                    tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                        MeshlinkError::PermissionDenied {
                            device,
                            reason: e.to_string(),
                        }
                    }
                    tokio_serial::ErrorKind::NoDevice => MeshlinkError::PortNotFound(device),
                    _ => MeshlinkError::PortOpenFailed {
                        port: device,
                        reason: e.to_string(),
                    },
                }
            })
    }

    async fn read_loop(
        mut reader: ReadHalf<SerialStream>,
        connected: Arc<AtomicBool>,
        on_event: TransportCallback,
    ) {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let event = loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    break TransportEvent::Disconnected {
                        reason: "serial port closed".to_string(),
                        permanent: false,
                    };
                }
                Ok(n) => {
                    trace!(bytes = n, "Read from serial port");
                    on_event(TransportEvent::Received(Bytes::copy_from_slice(&buf[..n])));
                }
                // Read timeouts are normal on an idle port
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) => {}
                Err(e) => {
                    error!(error = %e, "Serial read error");
                    break TransportEvent::Disconnected {
                        permanent: e.kind() == std::io::ErrorKind::PermissionDenied,
                        reason: e.to_string(),
                    };
                }
            }
        };
        if connected.swap(false, Ordering::SeqCst) {
            on_event(event);
        }
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioTransport for SerialTransport {
    async fn connect(
        &self,
        params: &ConnectionParameters,
        on_event: TransportCallback,
    ) -> Result<()> {
        let ConnectionParameters::Serial { port, baud_rate } = params else {
            return Err(MeshlinkError::InvalidParameters(format!(
                "serial transport cannot connect to {}",
                params
            )));
        };
        params.validate()?;
        info!(port = %port.display(), baud = baud_rate, "Connecting to serial port");

        let stream = Self::open(port, *baud_rate, self.timeout)?;
        let (reader, writer) = tokio::io::split(stream);

        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(Self::read_loop(reader, self.connected.clone(), on_event));
        if let Some(old) = self.reader.lock().replace(handle) {
            old.abort();
        }

        info!(port = %port.display(), "Connected to radio");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        // Dropping both halves closes the port
        self.writer.lock().await.take();
        debug!("Serial transport closed");
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(MeshlinkError::NotConnected)?;

        writer.write_all(bytes).await.map_err(|e| {
            error!(error = %e, "Serial write error");
            MeshlinkError::WriteError(e.to_string())
        })?;
        writer
            .flush()
            .await
            .map_err(|e| MeshlinkError::WriteError(format!("Flush failed: {}", e)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn framing(&self) -> Framing {
        Framing::Stream
    }

    fn name(&self) -> &str {
        "serial"
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("connected", &self.is_connected())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TransportCallback {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn test_missing_port() {
        let transport = SerialTransport::new();
        let err = transport
            .connect(
                &ConnectionParameters::serial("/dev/meshlink-does-not-exist"),
                noop(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeshlinkError::PortNotFound(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_rejects_other_parameters() {
        let transport = SerialTransport::new();
        let err = transport
            .connect(&ConnectionParameters::tcp("radio.local", 4403), noop())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshlinkError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_disconnect_when_idle() {
        let transport = SerialTransport::new();
        transport.disconnect().await.unwrap();
        assert!(matches!(
            transport.write(b"x").await,
            Err(MeshlinkError::NotConnected)
        ));
    }

    #[test]
    fn test_framing() {
        assert_eq!(SerialTransport::new().framing(), Framing::Stream);
    }
}
