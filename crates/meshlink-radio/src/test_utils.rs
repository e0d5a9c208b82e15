//! Test utilities
//!
//! - [`MockTransport`] - in-memory transport that records writes and lets a
//!   test inject received bytes or drop the link
//! - [`DeviceSimulator`] - scripted radio answering the handshake, channel
//!   requests and session key requests
//! - [`MemoryStore`] and [`RecordingObserver`] - collaborators that keep
//!   what they are given for later assertions
//! - [`find_radio_device`] and [`list_available_devices`] - serial port
//!   discovery for hardware tests
//!
//! # Example
//!
//! ```rust,ignore
//! use meshlink_radio::test_utils::{DeviceSimulator, MockTransport};
//!
//! let transport = MockTransport::stream()
//!     .with_simulator(DeviceSimulator::new(0x1234_5678).with_passkey(vec![1, 2, 3]));
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::collaborators::{MeshObserver, MeshStore};
use crate::config::{ConnectionParameters, Framing, FRAME_MAGIC};
use crate::error::{MeshlinkError, Result};
use crate::framing::encode_for;
use crate::interface::{RadioTransport, TransportCallback, TransportEvent, TransportFactory};
use crate::model::{
    node_id_string, ChannelInfo, ChannelRole, MeshUpdate, MessageDeliveryState, MessageItem,
    NodeRecord,
};
use crate::proto::{
    self, admin_message, from_radio, mesh_packet, to_radio, AdminMessage, ConfigType, Data,
    FromRadio, MeshPacket, PortNum, ToRadio,
};
use crate::reconnect::ConnectionState;

/// Common serial port paths for radios on different platforms
const COMMON_DEVICE_PATHS: &[&str] = &[
    // Linux
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/ttyACM0",
    "/dev/ttyACM1",
    "/dev/serial/by-id/usb-Silicon_Labs_CP210x_USB_to_UART_Bridge*",
    // macOS
    "/dev/tty.usbserial-*",
    "/dev/tty.SLAB_USBtoUART*",
    "/dev/cu.usbserial-*",
    "/dev/cu.SLAB_USBtoUART*",
];

/// USB vendors of common radio boards: Silicon Labs CP210x, FTDI, Espressif, WCH
const KNOWN_VENDOR_IDS: &[u16] = &[0x10C4, 0x0403, 0x303A, 0x1A86];

/// Find a connected radio by scanning serial ports
///
/// Returns the path to the first likely device.
pub fn find_radio_device() -> Option<String> {
    #[cfg(feature = "serial")]
    {
        if let Ok(ports) = serialport::available_ports() {
            for port in ports {
                if is_likely_radio_port(&port) {
                    info!("Found likely radio: {}", port.port_name);
                    return Some(port.port_name);
                }
            }
        }
    }

    // Fall back to checking common paths
    for pattern in COMMON_DEVICE_PATHS {
        if let Ok(entries) = glob::glob(pattern) {
            if let Some(entry) = entries.flatten().find(|p| p.exists()) {
                let path = entry.to_string_lossy().to_string();
                info!("Found serial port: {}", path);
                return Some(path);
            }
        }
    }

    warn!("No radio found on any serial port");
    None
}

/// Check if a serial port looks like a radio based on its USB descriptor
#[cfg(feature = "serial")]
fn is_likely_radio_port(port: &serialport::SerialPortInfo) -> bool {
    use serialport::SerialPortType;

    let SerialPortType::UsbPort(usb) = &port.port_type else {
        return false;
    };
    if KNOWN_VENDOR_IDS.contains(&usb.vid) {
        tracing::debug!(
            "USB device matches known vendor: VID={:#06X} PID={:#06X}",
            usb.vid, usb.pid
        );
        return true;
    }
    usb.product
        .as_deref()
        .map(|p| p.to_lowercase())
        .is_some_and(|p| {
            ["meshtastic", "t-beam", "t-echo", "lora", "cp210", "uart"]
                .iter()
                .any(|needle| p.contains(needle))
        })
}

/// List serial ports that might be radios
pub fn list_available_devices() -> Vec<DeviceInfo> {
    #[cfg(feature = "serial")]
    {
        serialport::available_ports()
            .map(|ports| ports.iter().map(DeviceInfo::from_serial_port).collect())
            .unwrap_or_default()
    }

    #[cfg(not(feature = "serial"))]
    {
        COMMON_DEVICE_PATHS
            .iter()
            .filter_map(|pattern| glob::glob(pattern).ok())
            .flat_map(|entries| entries.flatten())
            .map(|path| DeviceInfo::from_path(&path.to_string_lossy()))
            .collect()
    }
}

/// Information about a detected serial device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Path to the device (e.g., /dev/ttyUSB0)
    pub path: String,
    /// USB, PCI, Bluetooth or Unknown
    pub device_type: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product_name: Option<String>,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    pub is_likely_radio: bool,
}

impl DeviceInfo {
    #[cfg(feature = "serial")]
    fn from_serial_port(port: &serialport::SerialPortInfo) -> Self {
        use serialport::SerialPortType;

        let (device_type, vendor_id, product_id, product_name, manufacturer, serial_number) =
            match &port.port_type {
                SerialPortType::UsbPort(usb) => (
                    "USB",
                    Some(usb.vid),
                    Some(usb.pid),
                    usb.product.clone(),
                    usb.manufacturer.clone(),
                    usb.serial_number.clone(),
                ),
                SerialPortType::PciPort => ("PCI", None, None, None, None, None),
                SerialPortType::BluetoothPort => ("Bluetooth", None, None, None, None, None),
                SerialPortType::Unknown => ("Unknown", None, None, None, None, None),
            };

        Self {
            path: port.port_name.clone(),
            device_type: device_type.to_string(),
            vendor_id,
            product_id,
            product_name,
            manufacturer,
            serial_number,
            is_likely_radio: is_likely_radio_port(port),
        }
    }

    #[cfg(not(feature = "serial"))]
    fn from_path(path: &str) -> Self {
        Self {
            path: path.to_string(),
            device_type: "Unknown".to_string(),
            vendor_id: None,
            product_id: None,
            product_name: None,
            manufacturer: None,
            serial_number: None,
            is_likely_radio: false,
        }
    }
}

/// Extract the `ToRadio` carried by one write, if any
///
/// Stream writes are whole frames or wakeup bursts; the latter yield `None`.
pub fn parse_written(framing: Framing, bytes: &[u8]) -> Option<ToRadio> {
    let payload = match framing {
        Framing::Datagram => bytes,
        Framing::Stream => {
            if bytes.len() < 4 || u16::from_be_bytes([bytes[0], bytes[1]]) != FRAME_MAGIC {
                return None;
            }
            let len = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
            bytes.get(4..4 + len)?
        }
    };
    ToRadio::decode(payload).ok()
}

/// Encode a device message the way `framing` delivers it
pub fn encode_from_radio(framing: Framing, message: &FromRadio) -> Vec<u8> {
    let payload = message.encode_to_vec();
    match encode_for(framing, &payload) {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => panic!("test message does not fit in a frame: {}", e),
    }
}

/// Wrap a mesh packet for delivery
pub fn packet_message(packet: MeshPacket) -> FromRadio {
    FromRadio {
        id: 0,
        payload_variant: Some(from_radio::PayloadVariant::Packet(packet)),
    }
}

/// Decoded data packet
pub fn data_packet(from: u32, to: u32, id: u32, data: Data) -> MeshPacket {
    MeshPacket {
        from,
        to,
        id,
        payload_variant: Some(mesh_packet::PayloadVariant::Decoded(data)),
        ..Default::default()
    }
}

/// Text message from `from`
pub fn text_message(from: u32, to: u32, channel: u32, id: u32, text: &str) -> FromRadio {
    packet_message(MeshPacket {
        channel,
        ..data_packet(
            from,
            to,
            id,
            Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                ..Default::default()
            },
        )
    })
}

/// Routing result for `request_id` reported by `reporter`
pub fn routing_report(reporter: u32, to: u32, request_id: u32, code: u32) -> FromRadio {
    let mut payload = Vec::new();
    if code != 0 {
        prost::encoding::encode_key(3, prost::encoding::WireType::Varint, &mut payload);
        prost::encoding::encode_varint(u64::from(code), &mut payload);
    }
    packet_message(data_packet(
        reporter,
        to,
        rand::random::<u32>() | 1,
        Data {
            portnum: PortNum::RoutingApp as i32,
            payload,
            request_id,
            ..Default::default()
        },
    ))
}

/// Scripted radio
///
/// Answers `want_config` with its identity, peers and a completion (unless
/// told never to complete), admin channel requests for the slots it has,
/// and session key requests when it has a passkey.
#[derive(Debug, Clone)]
pub struct DeviceSimulator {
    pub node_num: u32,
    pub long_name: String,
    pub short_name: String,
    pub peers: Vec<proto::NodeInfo>,
    /// Slots the device answers for
    pub channels: BTreeMap<u8, ChannelInfo>,
    /// Send channels during the handshake instead of only on request
    pub channels_in_config: bool,
    pub passkey: Option<Vec<u8>>,
    pub complete_handshake: bool,
    /// Indices of every channel request seen
    pub channel_requests: Vec<u8>,
    pub config_requests: usize,
}

impl DeviceSimulator {
    pub fn new(node_num: u32) -> Self {
        Self {
            node_num,
            long_name: "Simulated Radio".to_string(),
            short_name: "SIM".to_string(),
            peers: Vec::new(),
            channels: BTreeMap::new(),
            channels_in_config: false,
            passkey: None,
            complete_handshake: true,
            channel_requests: Vec::new(),
            config_requests: 0,
        }
    }

    pub fn with_channel(mut self, index: u8, name: &str) -> Self {
        let role = if index == 0 {
            ChannelRole::Primary
        } else {
            ChannelRole::Secondary
        };
        self.channels.insert(
            index,
            ChannelInfo {
                index,
                name: name.to_string(),
                psk: vec![1],
                role,
                uplink: false,
                downlink: false,
            },
        );
        self
    }

    pub fn with_peer(mut self, num: u32, long_name: &str, short_name: &str) -> Self {
        self.peers.push(proto::NodeInfo {
            num,
            user: Some(proto::User {
                id: node_id_string(num),
                long_name: long_name.to_string(),
                short_name: short_name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        self
    }

    pub fn with_passkey(mut self, passkey: Vec<u8>) -> Self {
        self.passkey = Some(passkey);
        self
    }

    pub fn with_channels_in_config(mut self) -> Self {
        self.channels_in_config = true;
        self
    }

    /// Accept config requests but never send the completion
    pub fn never_complete(mut self) -> Self {
        self.complete_handshake = false;
        self
    }

    fn own_node_info(&self) -> proto::NodeInfo {
        proto::NodeInfo {
            num: self.node_num,
            user: Some(proto::User {
                id: node_id_string(self.node_num),
                long_name: self.long_name.clone(),
                short_name: self.short_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Device messages answering one client message
    pub fn respond(&mut self, message: &ToRadio) -> Vec<FromRadio> {
        match &message.payload_variant {
            Some(to_radio::PayloadVariant::WantConfigId(nonce)) => self.config_dump(*nonce),
            Some(to_radio::PayloadVariant::Packet(packet)) => self.answer_packet(packet),
            _ => Vec::new(),
        }
    }

    fn config_dump(&mut self, nonce: u32) -> Vec<FromRadio> {
        self.config_requests += 1;
        let wrap = |variant| FromRadio {
            id: 0,
            payload_variant: Some(variant),
        };

        let mut out = vec![
            wrap(from_radio::PayloadVariant::MyInfo(proto::MyNodeInfo {
                my_node_num: self.node_num,
                reboot_count: 0,
            })),
            wrap(from_radio::PayloadVariant::NodeInfo(self.own_node_info())),
        ];
        out.extend(
            self.peers
                .iter()
                .cloned()
                .map(|p| wrap(from_radio::PayloadVariant::NodeInfo(p))),
        );
        if self.channels_in_config {
            out.extend(
                self.channels
                    .values()
                    .map(|c| wrap(from_radio::PayloadVariant::Channel(c.to_proto()))),
            );
        }
        if self.complete_handshake {
            out.push(wrap(from_radio::PayloadVariant::ConfigCompleteId(nonce)));
        }
        out
    }

    fn answer_packet(&mut self, packet: &MeshPacket) -> Vec<FromRadio> {
        let Some(mesh_packet::PayloadVariant::Decoded(data)) = &packet.payload_variant else {
            return Vec::new();
        };
        if data.portnum != PortNum::AdminApp as i32 || packet.to != self.node_num {
            return Vec::new();
        }
        let Ok(admin) = AdminMessage::decode(data.payload.as_slice()) else {
            return Vec::new();
        };

        let reply = match admin.payload_variant {
            Some(admin_message::PayloadVariant::GetChannelRequest(slot)) => {
                let index = u8::try_from(slot.saturating_sub(1)).unwrap_or(u8::MAX);
                self.channel_requests.push(index);
                let channel = self.channels.get(&index).map(ChannelInfo::to_proto);
                channel.map(admin_message::PayloadVariant::GetChannelResponse)
            }
            Some(admin_message::PayloadVariant::GetConfigRequest(kind))
                if kind == ConfigType::SessionkeyConfig as i32 =>
            {
                if self.passkey.is_none() {
                    return Vec::new();
                }
                None
            }
            Some(admin_message::PayloadVariant::GetOwnerRequest(_)) => Some(
                admin_message::PayloadVariant::GetOwnerResponse(
                    self.own_node_info().user.unwrap_or_default(),
                ),
            ),
            Some(admin_message::PayloadVariant::SetChannel(channel)) => {
                if let Some(info) = ChannelInfo::from_proto(&channel) {
                    self.channels.insert(info.index, info);
                }
                return Vec::new();
            }
            Some(admin_message::PayloadVariant::SetOwner(user)) => {
                self.long_name = user.long_name;
                self.short_name = user.short_name;
                return Vec::new();
            }
            _ => return Vec::new(),
        };

        let response = AdminMessage {
            session_passkey: self.passkey.clone().unwrap_or_default(),
            payload_variant: reply,
        };
        vec![packet_message(data_packet(
            self.node_num,
            self.node_num,
            rand::random::<u32>() | 1,
            Data {
                portnum: PortNum::AdminApp as i32,
                payload: response.encode_to_vec(),
                request_id: packet.id,
                ..Default::default()
            },
        ))]
    }
}

/// In-memory transport
///
/// Writes are recorded and, when a simulator is attached, answered through
/// the registered callback before `write` returns.
pub struct MockTransport {
    framing: Framing,
    callback: Mutex<Option<TransportCallback>>,
    writes: Mutex<Vec<Vec<u8>>>,
    connected: AtomicBool,
    connect_results: Mutex<VecDeque<Result<()>>>,
    connects: AtomicUsize,
    fail_writes: AtomicBool,
    simulator: Mutex<Option<DeviceSimulator>>,
}

impl MockTransport {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            callback: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            connect_results: Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            simulator: Mutex::new(None),
        }
    }

    /// Byte-stream transport, like serial or TCP
    pub fn stream() -> Self {
        Self::new(Framing::Stream)
    }

    /// Message-per-read transport, like BLE
    pub fn datagram() -> Self {
        Self::new(Framing::Datagram)
    }

    pub fn with_simulator(self, simulator: DeviceSimulator) -> Self {
        *self.simulator.lock() = Some(simulator);
        self
    }

    /// Queue the result of the next `connect` call; unscripted calls succeed
    pub fn script_connect(&self, result: Result<()>) {
        self.connect_results.lock().push_back(result);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Raw writes in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    /// Decoded client messages in order, wakeup bursts skipped
    pub fn sent_messages(&self) -> Vec<ToRadio> {
        self.writes
            .lock()
            .iter()
            .filter_map(|w| parse_written(self.framing, w))
            .collect()
    }

    /// Admin messages sent, in order
    pub fn sent_admin(&self) -> Vec<AdminMessage> {
        self.sent_messages()
            .into_iter()
            .filter_map(|m| match m.payload_variant {
                Some(to_radio::PayloadVariant::Packet(MeshPacket {
                    payload_variant: Some(mesh_packet::PayloadVariant::Decoded(data)),
                    ..
                })) if data.portnum == PortNum::AdminApp as i32 => {
                    AdminMessage::decode(data.payload.as_slice()).ok()
                }
                _ => None,
            })
            .collect()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Inspect or change the attached simulator
    pub fn with_device<R>(&self, f: impl FnOnce(&mut DeviceSimulator) -> R) -> Option<R> {
        self.simulator.lock().as_mut().map(f)
    }

    /// Deliver raw bytes as if received from the radio
    pub fn inject(&self, bytes: &[u8]) {
        let callback = self.callback.lock().clone();
        match callback {
            Some(cb) => cb(TransportEvent::Received(Bytes::copy_from_slice(bytes))),
            None => warn!("Injected bytes dropped, transport not connected"),
        }
    }

    /// Deliver a device message in this transport's framing
    pub fn inject_message(&self, message: &FromRadio) {
        self.inject(&encode_from_radio(self.framing, message));
    }

    /// Simulate the link dropping
    pub fn drop_link(&self, reason: &str, permanent: bool) {
        self.connected.store(false, Ordering::SeqCst);
        let callback = self.callback.lock().clone();
        if let Some(cb) = callback {
            cb(TransportEvent::Disconnected {
                reason: reason.to_string(),
                permanent,
            });
        }
    }
}

#[async_trait::async_trait]
impl RadioTransport for MockTransport {
    async fn connect(
        &self,
        _params: &ConnectionParameters,
        on_event: TransportCallback,
    ) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let scripted = self.connect_results.lock().pop_front();
        if let Some(Err(e)) = scripted {
            return Err(e);
        }
        *self.callback.lock() = Some(on_event);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.callback.lock().take();
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MeshlinkError::NotConnected);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MeshlinkError::WriteError("simulated write failure".to_string()));
        }
        self.writes.lock().push(bytes.to_vec());

        let replies = match parse_written(self.framing, bytes) {
            Some(message) => self
                .simulator
                .lock()
                .as_mut()
                .map(|sim| sim.respond(&message))
                .unwrap_or_default(),
            None => Vec::new(),
        };
        for reply in &replies {
            self.inject_message(reply);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    fn name(&self) -> &str {
        "mock"
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("framing", &self.framing)
            .field("connected", &self.is_connected())
            .field("writes", &self.writes.lock().len())
            .finish()
    }
}

/// Factory handing out the same mock for every connect
pub fn mock_factory(transport: Arc<MockTransport>) -> TransportFactory {
    Arc::new(move |_params: &ConnectionParameters| {
        Ok(transport.clone() as Arc<dyn RadioTransport>)
    })
}

/// Store that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub nodes: Mutex<HashMap<u32, NodeRecord>>,
    pub channels: Mutex<BTreeMap<u8, ChannelInfo>>,
    /// Messages with their direct flag and conversation partner
    pub messages: Mutex<Vec<(MessageItem, bool, u32)>>,
    pub deliveries: Mutex<Vec<(u32, MessageDeliveryState)>>,
}

impl MeshStore for MemoryStore {
    fn upsert_node(&self, node: &NodeRecord) {
        self.nodes.lock().insert(node.num, node.clone());
    }

    fn upsert_channel(&self, channel: &ChannelInfo) {
        self.channels.lock().insert(channel.index, channel.clone());
    }

    fn upsert_message(&self, message: &MessageItem, is_direct: bool, partner: u32) {
        self.messages
            .lock()
            .push((message.clone(), is_direct, partner));
    }

    fn update_delivery_state(&self, packet_id: u32, state: &MessageDeliveryState) {
        self.deliveries.lock().push((packet_id, state.clone()));
    }
}

/// Observer that records every call
#[derive(Debug, Default)]
pub struct RecordingObserver {
    updates: Mutex<Vec<MeshUpdate>>,
    states: Mutex<Vec<ConnectionState>>,
}

impl RecordingObserver {
    pub fn updates(&self) -> Vec<MeshUpdate> {
        self.updates.lock().clone()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().clone()
    }

    pub fn clear(&self) {
        self.updates.lock().clear();
        self.states.lock().clear();
    }
}

impl MeshObserver for RecordingObserver {
    fn on_update(&self, update: &MeshUpdate) {
        self.updates.lock().push(update.clone());
    }

    fn on_connection_state(&self, state: &ConnectionState) {
        self.states.lock().push(state.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (TransportCallback, Arc<Mutex<Vec<TransportEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (Arc::new(move |e| sink.lock().push(e)), events)
    }

    #[test]
    fn test_parse_written_skips_wakeup() {
        let frame = encode_for(Framing::Stream, &ToRadio::heartbeat().encode_to_vec()).unwrap();
        assert!(parse_written(Framing::Stream, &frame).is_some());
        assert!(parse_written(Framing::Stream, &[0xC3; 64]).is_none());
    }

    #[test]
    fn test_simulator_config_dump() {
        let mut sim = DeviceSimulator::new(0x42)
            .with_peer(0x43, "Peer", "PR")
            .with_channel(0, "LongFast")
            .with_channels_in_config();
        let out = sim.respond(&ToRadio::want_config(7));

        assert_eq!(out.len(), 5);
        assert!(matches!(
            out.last().and_then(|m| m.payload_variant.clone()),
            Some(from_radio::PayloadVariant::ConfigCompleteId(7))
        ));
        assert_eq!(sim.config_requests, 1);
    }

    #[test]
    fn test_simulator_never_complete() {
        let mut sim = DeviceSimulator::new(0x42).never_complete();
        let out = sim.respond(&ToRadio::want_config(7));
        assert!(out.iter().all(|m| !matches!(
            m.payload_variant,
            Some(from_radio::PayloadVariant::ConfigCompleteId(_))
        )));
    }

    #[tokio::test]
    async fn test_mock_records_and_answers() {
        let transport = MockTransport::stream().with_simulator(DeviceSimulator::new(0x42));
        let (cb, events) = collector();
        transport
            .connect(&ConnectionParameters::tcp("mock", 1), cb)
            .await
            .unwrap();

        let frame = encode_for(Framing::Stream, &ToRadio::want_config(9).encode_to_vec()).unwrap();
        transport.write(&frame).await.unwrap();

        assert_eq!(transport.sent_messages().len(), 1);
        assert_eq!(events.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_scripted_connect_failure() {
        let transport = MockTransport::datagram();
        transport.script_connect(Err(MeshlinkError::ConnectionTimeout { duration_ms: 10 }));
        let (cb, _) = collector();

        assert!(transport
            .connect(&ConnectionParameters::ble("x"), cb.clone())
            .await
            .is_err());
        assert!(transport
            .connect(&ConnectionParameters::ble("x"), cb)
            .await
            .is_ok());
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_drop_link_notifies() {
        let transport = MockTransport::stream();
        let (cb, events) = collector();
        transport
            .connect(&ConnectionParameters::serial("/dev/mock"), cb)
            .await
            .unwrap();
        transport.drop_link("unplugged", false);

        assert!(!transport.is_connected());
        assert!(matches!(
            events.lock().last(),
            Some(TransportEvent::Disconnected { permanent: false, .. })
        ));
    }

    #[test]
    fn test_routing_report_payload() {
        let message = routing_report(1, 2, 99, 5);
        let Some(from_radio::PayloadVariant::Packet(packet)) = message.payload_variant else {
            panic!("expected packet");
        };
        let Some(mesh_packet::PayloadVariant::Decoded(data)) = packet.payload_variant else {
            panic!("expected decoded payload");
        };
        assert_eq!(data.request_id, 99);
        assert_eq!(data.payload, vec![0x18, 0x05]);
    }

    #[test]
    fn test_device_listing() {
        // Only checks that discovery does not panic without hardware
        let devices = list_available_devices();
        assert!(devices.iter().all(|d| !d.path.is_empty()));
    }
}
