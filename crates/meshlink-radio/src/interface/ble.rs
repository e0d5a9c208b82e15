//! Bluetooth Low Energy transport
//!
//! Radios expose one GATT service with three characteristics:
//!
//! | characteristic | use                                               |
//! |----------------|---------------------------------------------------|
//! | `toRadio`      | write one unframed `ToRadio` message              |
//! | `fromRadio`    | read one unframed `FromRadio`; empty when drained |
//! | `fromNum`      | notifies when `fromRadio` has something to read   |
//!
//! Each read of `fromRadio` yields a whole message, so this transport uses
//! datagram framing. The queue is drained after every notification and
//! after every write, since a write often triggers a response.
//!
//! On Linux, you'll also need:
//! ```bash
//! apt install libdbus-1-dev
//! ```

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{RadioTransport, TransportCallback, TransportEvent};
use crate::config::{ConnectionParameters, Framing};
use crate::error::{MeshlinkError, Result};

/// Radio GATT service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);
/// Host to radio
pub const TO_RADIO_UUID: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);
/// Radio to host, one message per read
pub const FROM_RADIO_UUID: Uuid = Uuid::from_u128(0x2c55e69e_4993_11ed_b878_0242ac120002);
/// Notifies pending `fromRadio` data
pub const FROM_NUM_UUID: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);

const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_POLL: Duration = Duration::from_millis(500);

/// Upper bound on reads per drain, in case the radio never reports empty
const MAX_DRAIN: usize = 256;

#[derive(Clone)]
struct Link {
    peripheral: Peripheral,
    to_radio: Characteristic,
    from_radio: Characteristic,
}

/// GATT transport
pub struct BleTransport {
    link: Mutex<Option<Link>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    drain: Arc<Notify>,
    connected: Arc<AtomicBool>,
    scan_timeout: Duration,
}

impl BleTransport {
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
            drain: Arc::new(Notify::new()),
            connected: Arc::new(AtomicBool::new(false)),
            scan_timeout: SCAN_TIMEOUT,
        }
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    async fn find_peripheral(&self, adapter: &Adapter, device: &str) -> Result<Peripheral> {
        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await?;

        let wanted = device.to_lowercase();
        let deadline = tokio::time::Instant::now() + self.scan_timeout;
        let found = loop {
            if let Some(peripheral) = Self::match_peripheral(adapter, &wanted).await? {
                break Some(peripheral);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(SCAN_POLL).await;
        };

        if let Err(e) = adapter.stop_scan().await {
            debug!(error = %e, "Failed to stop BLE scan");
        }
        found.ok_or_else(|| MeshlinkError::DeviceNotFound(device.to_string()))
    }

    async fn match_peripheral(adapter: &Adapter, wanted: &str) -> Result<Option<Peripheral>> {
        for peripheral in adapter.peripherals().await? {
            if peripheral.address().to_string().to_lowercase() == wanted {
                return Ok(Some(peripheral));
            }
            let name = peripheral
                .properties()
                .await?
                .and_then(|p| p.local_name)
                .unwrap_or_default();
            if name.to_lowercase() == wanted {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| MeshlinkError::Ble(format!("radio is missing characteristic {}", uuid)))
    }

    /// Read `fromRadio` until it comes back empty
    async fn drain_queue(link: &Link, on_event: &TransportCallback) -> Result<()> {
        for _ in 0..MAX_DRAIN {
            let message = link.peripheral.read(&link.from_radio).await?;
            if message.is_empty() {
                return Ok(());
            }
            trace!(len = message.len(), "Read fromRadio");
            on_event(TransportEvent::Received(Bytes::from(message)));
        }
        warn!("fromRadio did not drain, continuing on next notification");
        Ok(())
    }

    async fn read_loop(
        adapter: Adapter,
        link: Link,
        drain: Arc<Notify>,
        connected: Arc<AtomicBool>,
        on_event: TransportCallback,
    ) {
        let event = match Self::pump(&adapter, &link, &drain, &on_event).await {
            Ok(()) => TransportEvent::Disconnected {
                reason: "radio disconnected".to_string(),
                permanent: false,
            },
            Err(e) => TransportEvent::Disconnected {
                permanent: e.is_permanent(),
                reason: e.to_string(),
            },
        };
        if connected.swap(false, Ordering::SeqCst) {
            on_event(event);
        }
    }

    /// Runs until the peripheral disconnects or a read fails
    async fn pump(
        adapter: &Adapter,
        link: &Link,
        drain: &Notify,
        on_event: &TransportCallback,
    ) -> Result<()> {
        let id = link.peripheral.id();
        let mut notifications = link.peripheral.notifications().await?;
        let mut central = adapter.events().await?;

        // Anything queued before we subscribed
        Self::drain_queue(link, on_event).await?;

        loop {
            tokio::select! {
                note = notifications.next() => match note {
                    Some(_) => Self::drain_queue(link, on_event).await?,
                    None => return Ok(()),
                },
                _ = drain.notified() => Self::drain_queue(link, on_event).await?,
                event = central.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => return Ok(()),
                    Some(_) => {}
                    None => return Ok(()),
                },
            }
        }
    }
}

impl Default for BleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioTransport for BleTransport {
    async fn connect(
        &self,
        params: &ConnectionParameters,
        on_event: TransportCallback,
    ) -> Result<()> {
        let ConnectionParameters::Ble { device } = params else {
            return Err(MeshlinkError::InvalidParameters(format!(
                "BLE transport cannot connect to {}",
                params
            )));
        };
        params.validate()?;
        info!(device = %device, "Scanning for radio");

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MeshlinkError::Ble("no Bluetooth adapter available".to_string()))?;

        let peripheral = self.find_peripheral(&adapter, device).await?;
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let link = Link {
            to_radio: Self::characteristic(&peripheral, TO_RADIO_UUID)?,
            from_radio: Self::characteristic(&peripheral, FROM_RADIO_UUID)?,
            peripheral,
        };
        let from_num = Self::characteristic(&link.peripheral, FROM_NUM_UUID)?;
        link.peripheral.subscribe(&from_num).await?;

        *self.link.lock().await = Some(link.clone());
        self.connected.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(Self::read_loop(
            adapter,
            link,
            self.drain.clone(),
            self.connected.clone(),
            on_event,
        ));
        if let Some(old) = self.reader.lock().replace(handle) {
            old.abort();
        }

        info!(device = %device, "Connected to radio");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(link) = self.link.lock().await.take() {
            if let Err(e) = link.peripheral.disconnect().await {
                debug!(error = %e, "BLE disconnect failed");
            }
        }
        debug!("BLE transport closed");
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let link = self
            .link
            .lock()
            .await
            .clone()
            .ok_or(MeshlinkError::NotConnected)?;
        link.peripheral
            .write(&link.to_radio, bytes, WriteType::WithResponse)
            .await
            .map_err(|e| MeshlinkError::WriteError(e.to_string()))?;
        self.drain.notify_one();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn framing(&self) -> Framing {
        Framing::Datagram
    }

    fn name(&self) -> &str {
        "ble"
    }
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("connected", &self.is_connected())
            .field("scan_timeout", &self.scan_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "6ba1b218-15a8-461f-9fa8-5dcae273eafd"
        );
        assert_eq!(
            FROM_RADIO_UUID.to_string(),
            "2c55e69e-4993-11ed-b878-0242ac120002"
        );
    }

    #[tokio::test]
    async fn test_write_before_connect() {
        let transport = BleTransport::new();
        assert_eq!(transport.framing(), Framing::Datagram);
        assert!(matches!(
            transport.write(b"x").await,
            Err(MeshlinkError::NotConnected)
        ));
    }
}
