//! Minimal protobuf schema for the radio client API
//!
//! Only the messages and fields the engine reads or writes are modelled.
//! Field numbers match the device firmware, so unknown fields in real
//! traffic are skipped by `prost` without error.
//!
//! # Envelopes
//!
//! - [`ToRadio`] - client to device
//! - [`FromRadio`] - device to client
//!
//! A [`MeshPacket`] carries either a decoded [`Data`] payload (dispatched by
//! [`PortNum`]) or an encrypted blob the client cannot read.

use prost::Message;

use crate::error::Result;

/// Application port numbers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    WaypointApp = 8,
    TelemetryApp = 67,
    TracerouteApp = 70,
    NeighborinfoApp = 71,
    PrivateApp = 256,
}

/// Client to device envelope
#[derive(Clone, PartialEq, Message)]
pub struct ToRadio {
    #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
    pub payload_variant: Option<to_radio::PayloadVariant>,
}

pub mod to_radio {
    /// Payload of a [`super::ToRadio`]
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Packet(super::MeshPacket),
        #[prost(uint32, tag = "3")]
        WantConfigId(u32),
        #[prost(bool, tag = "4")]
        Disconnect(bool),
        #[prost(message, tag = "7")]
        Heartbeat(super::Heartbeat),
    }
}

impl ToRadio {
    /// Wrap a mesh packet
    pub fn packet(packet: MeshPacket) -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
        }
    }

    /// Handshake request carrying a correlation nonce
    pub fn want_config(nonce: u32) -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(nonce)),
        }
    }

    /// Graceful disconnect notice
    pub fn disconnect() -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
        }
    }

    /// Keep-alive
    pub fn heartbeat() -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::Heartbeat(Heartbeat {})),
        }
    }
}

/// Device to client envelope
#[derive(Clone, PartialEq, Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "from_radio::PayloadVariant", tags = "2, 3, 4, 6, 7, 8, 10")]
    pub payload_variant: Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    /// Payload of a [`super::FromRadio`]
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Packet(super::MeshPacket),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(message, tag = "4")]
        NodeInfo(super::NodeInfo),
        #[prost(message, tag = "6")]
        LogRecord(super::LogRecord),
        #[prost(uint32, tag = "7")]
        ConfigCompleteId(u32),
        #[prost(bool, tag = "8")]
        Rebooted(bool),
        #[prost(message, tag = "10")]
        Channel(super::Channel),
    }
}

/// Empty keep-alive body
#[derive(Clone, PartialEq, Message)]
pub struct Heartbeat {}

/// Packet travelling over the mesh
#[derive(Clone, PartialEq, Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
}

pub mod mesh_packet {
    /// Decoded or still-encrypted payload
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        #[prost(bytes = "vec", tag = "5")]
        Encrypted(Vec<u8>),
    }
}

/// Application payload of a mesh packet
#[derive(Clone, PartialEq, Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
}

/// Node identity
#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
}

/// GPS fix, coordinates in 1e-7 degrees
#[derive(Clone, PartialEq, Message)]
pub struct Position {
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: Option<i32>,
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub altitude: Option<i32>,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
}

impl Position {
    /// Latitude in degrees
    pub fn latitude(&self) -> Option<f64> {
        self.latitude_i.map(|v| v as f64 * 1e-7)
    }

    /// Longitude in degrees
    pub fn longitude(&self) -> Option<f64> {
        self.longitude_i.map(|v| v as f64 * 1e-7)
    }
}

/// Node database entry sent during the handshake
#[derive(Clone, PartialEq, Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
    #[prost(message, optional, tag = "3")]
    pub position: Option<Position>,
    #[prost(float, tag = "4")]
    pub snr: f32,
    #[prost(fixed32, tag = "5")]
    pub last_heard: u32,
    #[prost(message, optional, tag = "6")]
    pub device_metrics: Option<DeviceMetrics>,
    #[prost(uint32, tag = "7")]
    pub channel: u32,
    #[prost(uint32, optional, tag = "9")]
    pub hops_away: Option<u32>,
}

/// Identity of the locally attached radio
#[derive(Clone, PartialEq, Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
    #[prost(uint32, tag = "8")]
    pub reboot_count: u32,
}

/// Channel slot role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ChannelRole {
    Disabled = 0,
    Primary = 1,
    Secondary = 2,
}

/// Channel slot definition
#[derive(Clone, PartialEq, Message)]
pub struct Channel {
    #[prost(int32, tag = "1")]
    pub index: i32,
    #[prost(message, optional, tag = "2")]
    pub settings: Option<ChannelSettings>,
    #[prost(enumeration = "ChannelRole", tag = "3")]
    pub role: i32,
}

/// Channel name, key and relay flags
#[derive(Clone, PartialEq, Message)]
pub struct ChannelSettings {
    #[prost(bytes = "vec", tag = "2")]
    pub psk: Vec<u8>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(fixed32, tag = "4")]
    pub id: u32,
    #[prost(bool, tag = "5")]
    pub uplink_enabled: bool,
    #[prost(bool, tag = "6")]
    pub downlink_enabled: bool,
}

/// Routing control payload
///
/// The error reason (field 3) is read with [`crate::wire`] instead.
#[derive(Clone, PartialEq, Message)]
pub struct Routing {
    #[prost(oneof = "routing::Variant", tags = "1, 2")]
    pub variant: Option<routing::Variant>,
}

pub mod routing {
    /// Route discovery variants
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "1")]
        RouteRequest(super::RouteDiscovery),
        #[prost(message, tag = "2")]
        RouteReply(super::RouteDiscovery),
    }
}

/// Hops recorded by a traceroute
#[derive(Clone, PartialEq, Message)]
pub struct RouteDiscovery {
    #[prost(fixed32, repeated, tag = "1")]
    pub route: Vec<u32>,
    #[prost(int32, repeated, tag = "2")]
    pub snr_towards: Vec<i32>,
    #[prost(fixed32, repeated, tag = "3")]
    pub route_back: Vec<u32>,
    #[prost(int32, repeated, tag = "4")]
    pub snr_back: Vec<i32>,
}

/// Config section selector for admin get requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ConfigType {
    DeviceConfig = 0,
    PositionConfig = 1,
    PowerConfig = 2,
    NetworkConfig = 3,
    DisplayConfig = 4,
    LoraConfig = 5,
    BluetoothConfig = 6,
    SecurityConfig = 7,
    SessionkeyConfig = 8,
}

/// Admin request/response exchanged with the local node
#[derive(Clone, PartialEq, Message)]
pub struct AdminMessage {
    #[prost(bytes = "vec", tag = "101")]
    pub session_passkey: Vec<u8>,
    #[prost(oneof = "admin_message::PayloadVariant", tags = "1, 2, 3, 4, 5, 32, 33")]
    pub payload_variant: Option<admin_message::PayloadVariant>,
}

pub mod admin_message {
    /// Admin operation
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        /// Channel index plus one
        #[prost(uint32, tag = "1")]
        GetChannelRequest(u32),
        #[prost(message, tag = "2")]
        GetChannelResponse(super::Channel),
        #[prost(bool, tag = "3")]
        GetOwnerRequest(bool),
        #[prost(message, tag = "4")]
        GetOwnerResponse(super::User),
        #[prost(enumeration = "super::ConfigType", tag = "5")]
        GetConfigRequest(i32),
        #[prost(message, tag = "32")]
        SetOwner(super::User),
        #[prost(message, tag = "33")]
        SetChannel(super::Channel),
    }
}

/// Shared map marker
#[derive(Clone, PartialEq, Message)]
pub struct Waypoint {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(sfixed32, optional, tag = "2")]
    pub latitude_i: Option<i32>,
    #[prost(sfixed32, optional, tag = "3")]
    pub longitude_i: Option<i32>,
    #[prost(uint32, tag = "4")]
    pub expire: u32,
    #[prost(uint32, tag = "5")]
    pub locked_to: u32,
    #[prost(string, tag = "6")]
    pub name: String,
    #[prost(string, tag = "7")]
    pub description: String,
    #[prost(fixed32, tag = "8")]
    pub icon: u32,
}

/// Telemetry report
#[derive(Clone, PartialEq, Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(message, optional, tag = "2")]
    pub device_metrics: Option<DeviceMetrics>,
}

/// Battery and airtime figures
#[derive(Clone, PartialEq, Message)]
pub struct DeviceMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub channel_utilization: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub air_util_tx: Option<f32>,
    #[prost(uint32, optional, tag = "5")]
    pub uptime_seconds: Option<u32>,
}

/// Neighbor summary broadcast by a node
#[derive(Clone, PartialEq, Message)]
pub struct NeighborInfo {
    #[prost(uint32, tag = "1")]
    pub node_id: u32,
    #[prost(uint32, tag = "2")]
    pub last_sent_by_id: u32,
    #[prost(uint32, tag = "3")]
    pub node_broadcast_interval_secs: u32,
    #[prost(message, repeated, tag = "4")]
    pub neighbors: Vec<Neighbor>,
}

/// One neighbor entry
#[derive(Clone, PartialEq, Message)]
pub struct Neighbor {
    #[prost(uint32, tag = "1")]
    pub node_id: u32,
    #[prost(float, tag = "2")]
    pub snr: f32,
}

/// Severity of a device log record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LogLevel {
    Unset = 0,
    Trace = 5,
    Debug = 10,
    Info = 20,
    Warning = 30,
    Error = 40,
    Critical = 50,
}

/// Structured log line emitted by the device
#[derive(Clone, PartialEq, Message)]
pub struct LogRecord {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(fixed32, tag = "2")]
    pub time: u32,
    #[prost(string, tag = "3")]
    pub source: String,
    #[prost(enumeration = "LogLevel", tag = "4")]
    pub level: i32,
}

/// Decode any message from a byte slice
pub fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M> {
    Ok(M::decode(bytes)?)
}

/// Encode any message into a fresh buffer
pub fn encode<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_want_config_encoding() {
        // field 3, varint: 0x18 then LEB128 of the nonce
        let bytes = encode(&ToRadio::want_config(1));
        assert_eq!(bytes, vec![0x18, 0x01]);
    }

    #[test]
    fn test_from_radio_config_complete() {
        // field 7, varint 42
        let msg: FromRadio = decode(&[0x38, 0x2A]).unwrap();
        assert_eq!(
            msg.payload_variant,
            Some(from_radio::PayloadVariant::ConfigCompleteId(42))
        );
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        // field 5 (config, length-delimited, 2 bytes) followed by my_info
        let mut bytes = vec![0x2A, 0x02, 0x08, 0x01];
        bytes.extend(encode(&FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::MyInfo(MyNodeInfo {
                my_node_num: 0x1234,
                reboot_count: 0,
            })),
        }));
        let msg: FromRadio = decode(&bytes).unwrap();
        match msg.payload_variant {
            Some(from_radio::PayloadVariant::MyInfo(info)) => assert_eq!(info.my_node_num, 0x1234),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_port_numbers() {
        assert_eq!(PortNum::try_from(1), Ok(PortNum::TextMessageApp));
        assert_eq!(PortNum::try_from(70), Ok(PortNum::TracerouteApp));
        assert!(PortNum::try_from(2).is_err());
    }

    #[test]
    fn test_position_degrees() {
        let pos = Position {
            latitude_i: Some(515_000_000),
            longitude_i: Some(-1_200_000),
            altitude: None,
            time: 0,
        };
        assert!((pos.latitude().unwrap() - 51.5).abs() < 1e-9);
        assert!((pos.longitude().unwrap() + 0.12).abs() < 1e-9);
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(decode::<FromRadio>(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
