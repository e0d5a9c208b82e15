//! TCP transport for radios with WiFi or Ethernet
//!
//! The device serves the same framed byte stream as its serial port on
//! TCP port 4403.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RadioTransport, TransportCallback, TransportEvent};
use crate::config::{ConnectionParameters, Framing, DEFAULT_TIMEOUT_MS};
use crate::error::{MeshlinkError, Result};

const READ_BUFFER_SIZE: usize = 1024;

/// TCP stream transport
pub struct TcpTransport {
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            connect_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Override the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        connected: Arc<AtomicBool>,
        on_event: TransportCallback,
        target: String,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let event = loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(%target, "Peer closed connection");
                    break TransportEvent::Disconnected {
                        reason: "connection closed by radio".to_string(),
                        permanent: false,
                    };
                }
                Ok(n) => on_event(TransportEvent::Received(Bytes::copy_from_slice(&buf[..n]))),
                Err(e) => {
                    warn!(%target, error = %e, "TCP read error");
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

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioTransport for TcpTransport {
    async fn connect(
        &self,
        params: &ConnectionParameters,
        on_event: TransportCallback,
    ) -> Result<()> {
        let ConnectionParameters::Tcp { host, port } = params else {
            return Err(MeshlinkError::InvalidParameters(format!(
                "TCP transport cannot connect to {}",
                params
            )));
        };
        params.validate()?;
        let target = format!("{}:{}", host, port);
        info!(%target, "Connecting to radio over TCP");

        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(target.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(MeshlinkError::PermissionDenied {
                    device: target,
                    reason: e.to_string(),
                })
            }
            Ok(Err(e)) => return Err(MeshlinkError::Io(e)),
            Err(_) => {
                return Err(MeshlinkError::ConnectionTimeout {
                    duration_ms: self.connect_timeout.as_millis() as u64,
                })
            }
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(Self::read_loop(
            reader,
            self.connected.clone(),
            on_event,
            target.clone(),
        ));
        if let Some(old) = self.reader.lock().replace(handle) {
            old.abort();
        }

        info!(%target, "Connected to radio");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        debug!("TCP transport closed");
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(MeshlinkError::NotConnected)?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| MeshlinkError::WriteError(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn framing(&self) -> Framing {
        Framing::Stream
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use tokio::net::TcpListener;

    fn collector() -> (TransportCallback, Arc<SyncMutex<Vec<TransportEvent>>>) {
        let events = Arc::new(SyncMutex::new(Vec::new()));
        let sink = events.clone();
        (Arc::new(move |e| sink.lock().push(e)), events)
    }

    #[tokio::test]
    async fn test_rejects_other_parameters() {
        let transport = TcpTransport::new();
        let (cb, _) = collector();
        let err = transport
            .connect(&ConnectionParameters::serial("/dev/ttyUSB0"), cb)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshlinkError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_write_before_connect() {
        let transport = TcpTransport::new();
        assert!(matches!(
            transport.write(b"x").await,
            Err(MeshlinkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_exchange_and_remote_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let transport = TcpTransport::new();
        let (cb, events) = collector();
        transport
            .connect(&ConnectionParameters::tcp("127.0.0.1", port), cb)
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        assert!(transport.is_connected());

        transport.write(b"\x94\xc3\x00\x00").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x94\xc3\x00\x00");

        peer.write_all(b"hello").await.unwrap();
        drop(peer);

        for _ in 0..100 {
            if !transport.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!transport.is_connected());

        let events = events.lock();
        let received: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Received(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(received, b"hello");
        assert!(matches!(
            events.last(),
            Some(TransportEvent::Disconnected { permanent: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_local_disconnect_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let transport = TcpTransport::new();
        let (cb, events) = collector();
        transport
            .connect(&ConnectionParameters::tcp("127.0.0.1", port), cb)
            .await
            .unwrap();
        let (_peer, _) = listener.accept().await.unwrap();

        transport.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!transport.is_connected());
        assert!(events
            .lock()
            .iter()
            .all(|e| !matches!(e, TransportEvent::Disconnected { .. })));
    }
}
