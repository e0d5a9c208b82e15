//! Packet dispatch by application port
//!
//! A decoded [`MeshPacket`] is routed by payload kind and, for decoded data,
//! by [`PortNum`]:
//!
//! | port          | result                                           |
//! |---------------|--------------------------------------------------|
//! | text          | channel or direct message, alert on marker       |
//! | position      | node position                                    |
//! | node info     | node identity                                    |
//! | routing       | delivery state via the tracker                   |
//! | admin         | handed back to the engine (passkey, channels)    |
//! | waypoint      | waypoint                                         |
//! | telemetry     | node metrics                                     |
//! | traceroute    | traceroute result (replies only)                 |
//! | neighbor info | neighbor list                                    |
//!
//! Unknown ports are logged and dropped. Encrypted payloads become a
//! placeholder message when the client settings ask for it.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::delivery::RoutingOutcome;
use crate::model::{
    is_broadcast, timestamp, ChannelInfo, MeshUpdate, MessageDeliveryState, MessageItem,
    NodeMetrics, NodePatch, NodePosition, NodeUser, TracerouteResult, WaypointInfo,
};
use crate::proto::{self, admin_message, mesh_packet, Data, MeshPacket, PortNum};
use crate::state::MeshContext;

/// Alert marker: ASCII bell
pub const ALERT_BELL: char = '\u{7}';

/// Alert marker: bell emoji
pub const ALERT_EMOJI: char = '\u{1F514}';

/// Text shown for packets that could not be decrypted
pub const UNDECODABLE_TEXT: &str = "[encrypted message]";

/// Output of dispatching one packet
#[derive(Debug, Default)]
pub struct Dispatched {
    /// Updates to apply to the mesh context
    pub updates: Vec<MeshUpdate>,
    /// Admin payload addressed to this client
    pub admin: Option<proto::AdminMessage>,
}

/// Routes mesh packets to per-port handlers
#[derive(Debug, Clone)]
pub struct PacketDispatcher {
    ctx: Arc<MeshContext>,
}

impl PacketDispatcher {
    pub fn new(ctx: Arc<MeshContext>) -> Self {
        Self { ctx }
    }

    /// Dispatch one packet received while the local node number is `local_node`
    pub fn dispatch(&self, packet: &MeshPacket, local_node: u32) -> Dispatched {
        let mut out = Dispatched::default();

        if self.ctx.settings().verbose_frame_logging() {
            trace!(
                from = packet.from,
                to = packet.to,
                id = packet.id,
                channel = packet.channel,
                "Mesh packet"
            );
        }

        match &packet.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(data)) => {
                self.dispatch_data(packet, data, local_node, &mut out);
            }
            Some(mesh_packet::PayloadVariant::Encrypted(bytes)) => {
                debug!(from = packet.from, len = bytes.len(), "Undecodable packet");
                push_heard(packet, &mut out);
                if self.ctx.settings().show_undecodable_messages() {
                    let item = MessageItem {
                        packet_id: None,
                        timestamp: packet_time(packet),
                        from: packet.from,
                        to: packet.to,
                        channel: packet.channel,
                        text: UNDECODABLE_TEXT.to_string(),
                        delivery: MessageDeliveryState::None,
                    };
                    out.updates.push(message_update(item, local_node));
                }
            }
            None => trace!(id = packet.id, "Packet without payload"),
        }
        out
    }

    fn dispatch_data(&self, packet: &MeshPacket, data: &Data, local_node: u32, out: &mut Dispatched) {
        let port = match PortNum::try_from(data.portnum) {
            Ok(port) => port,
            Err(_) => {
                debug!(port = data.portnum, from = packet.from, "Dropping packet on unknown port");
                return;
            }
        };

        if matches!(port, PortNum::TextMessageApp | PortNum::NodeinfoApp)
            && packet.id != 0
            && self.ctx.duplicates().check_and_insert(packet.from, packet.id)
        {
            return;
        }

        push_heard(packet, out);

        match port {
            PortNum::TextMessageApp => handle_text(packet, data, local_node, out),
            PortNum::PositionApp => match proto::decode::<proto::Position>(&data.payload) {
                Ok(position) => {
                    if let Some(position) = NodePosition::from_proto(&position) {
                        out.updates.push(MeshUpdate::Node(NodePatch {
                            position: Some(position),
                            ..NodePatch::new(packet.from)
                        }));
                    }
                }
                Err(e) => warn!(error = %e, from = packet.from, "Bad position payload"),
            },
            PortNum::NodeinfoApp => match proto::decode::<proto::User>(&data.payload) {
                Ok(user) => out.updates.push(MeshUpdate::Node(NodePatch {
                    user: Some(NodeUser::from(&user)),
                    ..NodePatch::new(packet.from)
                })),
                Err(e) => warn!(error = %e, from = packet.from, "Bad node info payload"),
            },
            PortNum::RoutingApp => {
                if data.request_id == 0 {
                    return;
                }
                let outcome = RoutingOutcome::from_routing_payload(&data.payload);
                let resolved = self.ctx.tracker().on_routing_result(
                    data.request_id,
                    packet.from,
                    outcome,
                    local_node,
                );
                if let Some(state) = resolved {
                    out.updates.push(MeshUpdate::Delivery {
                        packet_id: data.request_id,
                        state,
                    });
                }
            }
            PortNum::AdminApp => match proto::decode::<proto::AdminMessage>(&data.payload) {
                Ok(admin) => {
                    match &admin.payload_variant {
                        Some(admin_message::PayloadVariant::GetChannelResponse(channel)) => {
                            if let Some(info) = ChannelInfo::from_proto(channel) {
                                out.updates.push(MeshUpdate::Channel(info));
                            }
                        }
                        Some(admin_message::PayloadVariant::GetOwnerResponse(user)) => {
                            out.updates.push(MeshUpdate::Node(NodePatch {
                                user: Some(NodeUser::from(user)),
                                ..NodePatch::new(packet.from)
                            }));
                        }
                        _ => {}
                    }
                    out.admin = Some(admin);
                }
                Err(e) => warn!(error = %e, "Bad admin payload"),
            },
            PortNum::WaypointApp => match proto::decode::<proto::Waypoint>(&data.payload) {
                Ok(wp) => out.updates.push(MeshUpdate::Waypoint(WaypointInfo {
                    id: wp.id,
                    from: packet.from,
                    name: wp.name,
                    description: wp.description,
                    latitude: wp.latitude_i.map(|v| v as f64 * 1e-7),
                    longitude: wp.longitude_i.map(|v| v as f64 * 1e-7),
                    expire: wp.expire,
                })),
                Err(e) => warn!(error = %e, from = packet.from, "Bad waypoint payload"),
            },
            PortNum::TelemetryApp => match proto::decode::<proto::Telemetry>(&data.payload) {
                Ok(telemetry) => {
                    if let Some(metrics) = &telemetry.device_metrics {
                        out.updates.push(MeshUpdate::Telemetry {
                            from: packet.from,
                            metrics: NodeMetrics::from(metrics),
                        });
                    }
                }
                Err(e) => warn!(error = %e, from = packet.from, "Bad telemetry payload"),
            },
            PortNum::TracerouteApp => {
                // Requests relayed through us carry no request id
                if data.request_id == 0 {
                    return;
                }
                match proto::decode::<proto::RouteDiscovery>(&data.payload) {
                    Ok(route) => out.updates.push(MeshUpdate::Traceroute(TracerouteResult {
                        destination: packet.from,
                        route: route.route,
                        route_back: route.route_back,
                    })),
                    Err(e) => warn!(error = %e, from = packet.from, "Bad traceroute payload"),
                }
            }
            PortNum::NeighborinfoApp => match proto::decode::<proto::NeighborInfo>(&data.payload) {
                Ok(info) => out.updates.push(MeshUpdate::Neighbors {
                    from: packet.from,
                    neighbors: info.neighbors.iter().map(|n| (n.node_id, n.snr)).collect(),
                }),
                Err(e) => warn!(error = %e, from = packet.from, "Bad neighbor info payload"),
            },
            PortNum::UnknownApp | PortNum::PrivateApp => {
                debug!(port = data.portnum, from = packet.from, "Ignoring packet");
            }
        }
    }
}

fn handle_text(packet: &MeshPacket, data: &Data, local_node: u32, out: &mut Dispatched) {
    let raw = String::from_utf8_lossy(&data.payload);
    let alert = raw.contains(ALERT_BELL) || raw.contains(ALERT_EMOJI);
    let text: String = raw.chars().filter(|c| *c != ALERT_BELL).collect();

    let item = MessageItem {
        packet_id: Some(packet.id),
        timestamp: packet_time(packet),
        from: packet.from,
        to: packet.to,
        channel: packet.channel,
        text: text.clone(),
        delivery: MessageDeliveryState::None,
    };
    out.updates.push(message_update(item, local_node));

    if alert {
        debug!(from = packet.from, "Alert received");
        out.updates.push(MeshUpdate::Alert {
            from: packet.from,
            text,
        });
    }
}

/// Wrap a message with its conversation routing
pub(crate) fn message_update(item: MessageItem, local_node: u32) -> MeshUpdate {
    let is_direct = !is_broadcast(item.to);
    let partner = if !is_direct {
        item.channel
    } else if item.from == local_node {
        item.to
    } else {
        item.from
    };
    MeshUpdate::Message {
        item,
        is_direct,
        partner,
    }
}

fn push_heard(packet: &MeshPacket, out: &mut Dispatched) {
    if packet.from == 0 {
        return;
    }
    out.updates.push(MeshUpdate::Node(NodePatch {
        last_heard: Some(packet_time(packet)),
        snr: (packet.rx_snr != 0.0).then_some(packet.rx_snr),
        ..NodePatch::new(packet.from)
    }));
}

fn packet_time(packet: &MeshPacket) -> chrono::DateTime<Utc> {
    timestamp(packet.rx_time).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientSettings, BROADCAST_ADDR};
    use crate::collaborators::{NoopObserver, NoopStore};
    use prost::Message;

    const LOCAL: u32 = 0x0000_AAAA;
    const PEER: u32 = 0x0000_BBBB;

    fn dispatcher_with(settings: ClientSettings) -> PacketDispatcher {
        PacketDispatcher::new(Arc::new(MeshContext::new(
            Arc::new(settings),
            Arc::new(NoopStore),
            Arc::new(NoopObserver),
            100,
        )))
    }

    fn dispatcher() -> PacketDispatcher {
        dispatcher_with(ClientSettings::default())
    }

    fn data_packet(from: u32, to: u32, id: u32, port: PortNum, payload: Vec<u8>) -> MeshPacket {
        MeshPacket {
            from,
            to,
            id,
            channel: 0,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                portnum: port as i32,
                payload,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    fn messages(d: &Dispatched) -> Vec<(&MessageItem, bool, u32)> {
        d.updates
            .iter()
            .filter_map(|u| match u {
                MeshUpdate::Message {
                    item,
                    is_direct,
                    partner,
                } => Some((item, *is_direct, *partner)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_broadcast_text_goes_to_channel() {
        let mut packet = data_packet(PEER, BROADCAST_ADDR, 1, PortNum::TextMessageApp, b"hi all".to_vec());
        packet.channel = 2;
        let out = dispatcher().dispatch(&packet, LOCAL);

        let msgs = messages(&out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0.text, "hi all");
        assert!(!msgs[0].1);
        assert_eq!(msgs[0].2, 2);
    }

    #[test]
    fn test_direct_text_partner_is_sender() {
        let packet = data_packet(PEER, LOCAL, 2, PortNum::TextMessageApp, b"psst".to_vec());
        let out = dispatcher().dispatch(&packet, LOCAL);

        let msgs = messages(&out);
        assert!(msgs[0].1);
        assert_eq!(msgs[0].2, PEER);
    }

    #[test]
    fn test_alert_marker_raises_alert() {
        let packet = data_packet(PEER, BROADCAST_ADDR, 3, PortNum::TextMessageApp, "\u{7}fire".as_bytes().to_vec());
        let out = dispatcher().dispatch(&packet, LOCAL);

        assert!(out
            .updates
            .iter()
            .any(|u| matches!(u, MeshUpdate::Alert { from, text } if *from == PEER && text == "fire")));
        assert_eq!(messages(&out)[0].0.text, "fire");
    }

    #[test]
    fn test_duplicate_text_dropped() {
        let d = dispatcher();
        let packet = data_packet(PEER, BROADCAST_ADDR, 4, PortNum::TextMessageApp, b"once".to_vec());
        assert_eq!(messages(&d.dispatch(&packet, LOCAL)).len(), 1);
        assert!(d.dispatch(&packet, LOCAL).updates.is_empty());
    }

    #[test]
    fn test_unknown_port_dropped() {
        let mut packet = data_packet(PEER, LOCAL, 5, PortNum::TextMessageApp, vec![1]);
        if let Some(mesh_packet::PayloadVariant::Decoded(data)) = &mut packet.payload_variant {
            data.portnum = 999;
        }
        let out = dispatcher().dispatch(&packet, LOCAL);
        assert!(out.updates.is_empty());
        assert!(out.admin.is_none());
    }

    #[test]
    fn test_encrypted_placeholder_respects_setting() {
        let packet = MeshPacket {
            from: PEER,
            to: BROADCAST_ADDR,
            id: 6,
            channel: 1,
            payload_variant: Some(mesh_packet::PayloadVariant::Encrypted(vec![0xDE, 0xAD])),
            ..Default::default()
        };

        let shown = dispatcher().dispatch(&packet, LOCAL);
        let msgs = messages(&shown);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0.packet_id, None);

        let hidden = dispatcher_with(ClientSettings {
            show_undecodable: false,
            ..Default::default()
        })
        .dispatch(&packet, LOCAL);
        assert!(messages(&hidden).is_empty());
    }

    #[test]
    fn test_routing_result_resolves_tracked_packet() {
        let d = dispatcher();
        d.ctx.tracker().track(77, PEER);

        let mut packet = data_packet(PEER, LOCAL, 8, PortNum::RoutingApp, vec![0x18, 0x00]);
        if let Some(mesh_packet::PayloadVariant::Decoded(data)) = &mut packet.payload_variant {
            data.request_id = 77;
        }
        let out = d.dispatch(&packet, LOCAL);
        assert!(out.updates.contains(&MeshUpdate::Delivery {
            packet_id: 77,
            state: MessageDeliveryState::Acknowledged,
        }));
    }

    #[test]
    fn test_admin_channel_response() {
        let admin = proto::AdminMessage {
            session_passkey: vec![9, 9],
            payload_variant: Some(admin_message::PayloadVariant::GetChannelResponse(proto::Channel {
                index: 2,
                settings: Some(proto::ChannelSettings {
                    name: "ops".to_string(),
                    ..Default::default()
                }),
                role: proto::ChannelRole::Secondary as i32,
            })),
        };
        let packet = data_packet(LOCAL, LOCAL, 9, PortNum::AdminApp, admin.encode_to_vec());
        let out = dispatcher().dispatch(&packet, LOCAL);

        assert_eq!(out.admin.as_ref().map(|a| a.session_passkey.clone()), Some(vec![9, 9]));
        assert!(out
            .updates
            .iter()
            .any(|u| matches!(u, MeshUpdate::Channel(c) if c.index == 2 && c.name == "ops")));
    }

    #[test]
    fn test_traceroute_only_for_replies() {
        let route = proto::RouteDiscovery {
            route: vec![0x1111, 0x2222],
            ..Default::default()
        };
        let mut packet = data_packet(PEER, LOCAL, 10, PortNum::TracerouteApp, route.encode_to_vec());
        let relayed = dispatcher().dispatch(&packet, LOCAL);
        assert!(!relayed.updates.iter().any(|u| matches!(u, MeshUpdate::Traceroute(_))));

        if let Some(mesh_packet::PayloadVariant::Decoded(data)) = &mut packet.payload_variant {
            data.request_id = 55;
        }
        let reply = dispatcher().dispatch(&packet, LOCAL);
        assert!(reply.updates.contains(&MeshUpdate::Traceroute(TracerouteResult {
            destination: PEER,
            route: vec![0x1111, 0x2222],
            route_back: vec![],
        })));
    }

    #[test]
    fn test_telemetry_metrics() {
        let telemetry = proto::Telemetry {
            time: 0,
            device_metrics: Some(proto::DeviceMetrics {
                battery_level: Some(87),
                ..Default::default()
            }),
        };
        let packet = data_packet(PEER, BROADCAST_ADDR, 11, PortNum::TelemetryApp, telemetry.encode_to_vec());
        let out = dispatcher().dispatch(&packet, LOCAL);
        assert!(out.updates.iter().any(|u| matches!(
            u,
            MeshUpdate::Telemetry { from, metrics } if *from == PEER && metrics.battery_level == Some(87)
        )));
    }
}
