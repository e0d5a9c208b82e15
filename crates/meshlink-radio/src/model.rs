//! Mesh data model
//!
//! Plain data types shared by the dispatcher, the mesh state and the
//! external collaborators. Everything here is serializable so a host can
//! forward updates as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BROADCAST_ADDR;
use crate::proto;

/// Whether a recipient id addresses every node
pub fn is_broadcast(to: u32) -> bool {
    to == BROADCAST_ADDR || to == 0
}

/// Render a node number the way devices print user ids (`!a1b2c3d4`)
pub fn node_id_string(node_num: u32) -> String {
    format!("!{:08x}", node_num)
}

/// Channel slot role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Primary,
    Secondary,
    Disabled,
}

impl From<proto::ChannelRole> for ChannelRole {
    fn from(role: proto::ChannelRole) -> Self {
        match role {
            proto::ChannelRole::Primary => ChannelRole::Primary,
            proto::ChannelRole::Secondary => ChannelRole::Secondary,
            proto::ChannelRole::Disabled => ChannelRole::Disabled,
        }
    }
}

impl From<ChannelRole> for proto::ChannelRole {
    fn from(role: ChannelRole) -> Self {
        match role {
            ChannelRole::Primary => proto::ChannelRole::Primary,
            ChannelRole::Secondary => proto::ChannelRole::Secondary,
            ChannelRole::Disabled => proto::ChannelRole::Disabled,
        }
    }
}

/// One channel slot as reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Slot index, 0-7
    pub index: u8,
    pub name: String,
    /// Pre-shared key, opaque
    #[serde(with = "hex_bytes")]
    pub psk: Vec<u8>,
    pub role: ChannelRole,
    pub uplink: bool,
    pub downlink: bool,
}

impl ChannelInfo {
    /// Build from a device channel definition
    ///
    /// Returns `None` for indices outside the 8 slots.
    pub fn from_proto(channel: &proto::Channel) -> Option<Self> {
        let index = u8::try_from(channel.index).ok().filter(|i| *i < 8)?;
        let role = proto::ChannelRole::try_from(channel.role)
            .map(ChannelRole::from)
            .unwrap_or(ChannelRole::Disabled);
        let settings = channel.settings.clone().unwrap_or_default();
        Some(Self {
            index,
            name: settings.name,
            psk: settings.psk,
            role,
            uplink: settings.uplink_enabled,
            downlink: settings.downlink_enabled,
        })
    }

    /// Convert back into a device channel definition
    pub fn to_proto(&self) -> proto::Channel {
        proto::Channel {
            index: i32::from(self.index),
            settings: Some(proto::ChannelSettings {
                psk: self.psk.clone(),
                name: self.name.clone(),
                id: 0,
                uplink_enabled: self.uplink,
                downlink_enabled: self.downlink,
            }),
            role: proto::ChannelRole::from(self.role) as i32,
        }
    }

    /// Whether the slot is in use
    pub fn is_enabled(&self) -> bool {
        self.role != ChannelRole::Disabled
    }
}

/// Delivery progress of an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageDeliveryState {
    /// Inbound, or never tracked
    None,
    /// Sent, waiting for a routing result
    Pending,
    Acknowledged,
    Failed { reason: String, can_retry: bool },
}

impl MessageDeliveryState {
    /// `Acknowledged` and `Failed` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageDeliveryState::Acknowledged | MessageDeliveryState::Failed { .. }
        )
    }
}

/// One text message on a channel or in a direct conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageItem {
    /// Mesh packet id; absent for locally synthesized placeholders
    pub packet_id: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub text: String,
    pub delivery: MessageDeliveryState,
}

impl MessageItem {
    pub fn is_broadcast(&self) -> bool {
        is_broadcast(self.to)
    }
}

/// Node identity fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUser {
    pub id: String,
    pub long_name: String,
    pub short_name: String,
    pub hw_model: i32,
}

impl From<&proto::User> for NodeUser {
    fn from(user: &proto::User) -> Self {
        Self {
            id: user.id.clone(),
            long_name: user.long_name.clone(),
            short_name: user.short_name.clone(),
            hw_model: user.hw_model,
        }
    }
}

/// Last known position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    pub time: u32,
}

impl NodePosition {
    /// `None` when the fix carries no coordinates
    pub fn from_proto(position: &proto::Position) -> Option<Self> {
        Some(Self {
            latitude: position.latitude()?,
            longitude: position.longitude()?,
            altitude: position.altitude,
            time: position.time,
        })
    }
}

/// Latest device metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

impl From<&proto::DeviceMetrics> for NodeMetrics {
    fn from(m: &proto::DeviceMetrics) -> Self {
        Self {
            battery_level: m.battery_level,
            voltage: m.voltage,
            channel_utilization: m.channel_utilization,
            air_util_tx: m.air_util_tx,
            uptime_seconds: m.uptime_seconds,
        }
    }
}

/// Everything known about one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub num: u32,
    pub user: Option<NodeUser>,
    pub position: Option<NodePosition>,
    pub metrics: Option<NodeMetrics>,
    pub last_heard: Option<DateTime<Utc>>,
    pub snr: Option<f32>,
    pub hops_away: Option<u32>,
    /// Display colour from client settings
    pub color: Option<String>,
    /// User note from client settings
    pub note: Option<String>,
}

impl NodeRecord {
    pub fn new(num: u32) -> Self {
        Self {
            num,
            user: None,
            position: None,
            metrics: None,
            last_heard: None,
            snr: None,
            hops_away: None,
            color: None,
            note: None,
        }
    }

    /// Best display name: long name, short name, or `!hex` id
    pub fn display_name(&self) -> String {
        match &self.user {
            Some(user) if !user.long_name.is_empty() => user.long_name.clone(),
            Some(user) if !user.short_name.is_empty() => user.short_name.clone(),
            _ => node_id_string(self.num),
        }
    }

    /// Merge a patch; absent fields keep their previous value
    pub fn merge(&mut self, patch: &NodePatch) {
        if let Some(user) = &patch.user {
            self.user = Some(user.clone());
        }
        if let Some(position) = patch.position {
            self.position = Some(position);
        }
        if let Some(metrics) = patch.metrics {
            self.metrics = Some(metrics);
        }
        if let Some(heard) = patch.last_heard {
            self.last_heard = Some(match self.last_heard {
                Some(previous) => previous.max(heard),
                None => heard,
            });
        }
        if patch.snr.is_some() {
            self.snr = patch.snr;
        }
        if patch.hops_away.is_some() {
            self.hops_away = patch.hops_away;
        }
        if patch.color.is_some() {
            self.color = patch.color.clone();
        }
        if patch.note.is_some() {
            self.note = patch.note.clone();
        }
    }
}

/// Partial node update produced by the dispatcher
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    pub num: u32,
    pub user: Option<NodeUser>,
    pub position: Option<NodePosition>,
    pub metrics: Option<NodeMetrics>,
    pub last_heard: Option<DateTime<Utc>>,
    pub snr: Option<f32>,
    pub hops_away: Option<u32>,
    pub color: Option<String>,
    pub note: Option<String>,
}

impl NodePatch {
    pub fn new(num: u32) -> Self {
        Self {
            num,
            ..Default::default()
        }
    }

    /// Patch from a handshake node database entry
    pub fn from_node_info(info: &proto::NodeInfo) -> Self {
        Self {
            num: info.num,
            user: info.user.as_ref().map(NodeUser::from),
            position: info.position.as_ref().and_then(NodePosition::from_proto),
            metrics: info.device_metrics.as_ref().map(NodeMetrics::from),
            last_heard: timestamp(info.last_heard),
            snr: (info.snr != 0.0).then_some(info.snr),
            hops_away: info.hops_away,
            color: None,
            note: None,
        }
    }
}

/// Shared map marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointInfo {
    pub id: u32,
    pub from: u32,
    pub name: String,
    pub description: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Expiry as unix seconds, 0 = never
    pub expire: u32,
}

/// Hops reported by a traceroute reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerouteResult {
    /// Node the trace was sent to
    pub destination: u32,
    /// Intermediate hops towards the destination
    pub route: Vec<u32>,
    /// Intermediate hops on the way back
    pub route_back: Vec<u32>,
}

/// State change pushed to the store and the observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeshUpdate {
    Node(NodePatch),
    Channel(ChannelInfo),
    Message {
        item: MessageItem,
        is_direct: bool,
        /// Conversation partner for direct messages, channel index otherwise
        partner: u32,
    },
    Delivery {
        packet_id: u32,
        state: MessageDeliveryState,
    },
    /// Text carried an alert marker
    Alert { from: u32, text: String },
    Waypoint(WaypointInfo),
    Telemetry { from: u32, metrics: NodeMetrics },
    Traceroute(TracerouteResult),
    Neighbors { from: u32, neighbors: Vec<(u32, f32)> },
}

/// Unix seconds to UTC, treating 0 as unknown
pub fn timestamp(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp(i64::from(secs), 0)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length hex string"));
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_ids() {
        assert!(is_broadcast(0xFFFF_FFFF));
        assert!(is_broadcast(0));
        assert!(!is_broadcast(0x1234_5678));
    }

    #[test]
    fn test_channel_from_proto() {
        let channel = proto::Channel {
            index: 1,
            settings: Some(proto::ChannelSettings {
                psk: vec![1],
                name: "ops".to_string(),
                id: 0,
                uplink_enabled: true,
                downlink_enabled: false,
            }),
            role: proto::ChannelRole::Secondary as i32,
        };
        let info = ChannelInfo::from_proto(&channel).unwrap();
        assert_eq!(info.index, 1);
        assert_eq!(info.name, "ops");
        assert_eq!(info.role, ChannelRole::Secondary);
        assert!(info.uplink);
        assert_eq!(info.to_proto(), channel);
    }

    #[test]
    fn test_channel_index_out_of_range() {
        let channel = proto::Channel {
            index: 8,
            settings: None,
            role: 1,
        };
        assert!(ChannelInfo::from_proto(&channel).is_none());
    }

    #[test]
    fn test_node_merge_keeps_known_fields() {
        let mut node = NodeRecord::new(7);
        node.merge(&NodePatch {
            user: Some(NodeUser {
                long_name: "Base Camp".to_string(),
                short_name: "BC".to_string(),
                ..Default::default()
            }),
            snr: Some(4.5),
            ..NodePatch::new(7)
        });
        node.merge(&NodePatch {
            snr: Some(-2.0),
            ..NodePatch::new(7)
        });

        assert_eq!(node.display_name(), "Base Camp");
        assert_eq!(node.snr, Some(-2.0));
    }

    #[test]
    fn test_last_heard_never_moves_backwards() {
        let mut node = NodeRecord::new(1);
        let later = timestamp(2_000).unwrap();
        let earlier = timestamp(1_000).unwrap();
        node.merge(&NodePatch {
            last_heard: Some(later),
            ..NodePatch::new(1)
        });
        node.merge(&NodePatch {
            last_heard: Some(earlier),
            ..NodePatch::new(1)
        });
        assert_eq!(node.last_heard, Some(later));
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        assert_eq!(NodeRecord::new(0xA1B2C3D4).display_name(), "!a1b2c3d4");
    }

    #[test]
    fn test_delivery_state_terminality() {
        assert!(!MessageDeliveryState::Pending.is_terminal());
        assert!(MessageDeliveryState::Acknowledged.is_terminal());
        assert!(MessageDeliveryState::Failed {
            reason: "timeout".to_string(),
            can_retry: true
        }
        .is_terminal());
    }

    #[test]
    fn test_update_serializes_with_kind_tag() {
        let update = MeshUpdate::Delivery {
            packet_id: 9,
            state: MessageDeliveryState::Acknowledged,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"kind\":\"delivery\""));
        assert!(json.contains("\"state\":\"acknowledged\""));
    }
}
