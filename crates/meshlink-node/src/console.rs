//! Console output for mesh updates

use meshlink_radio::model::node_id_string;
use meshlink_radio::{ConnectionState, MeshObserver, MeshUpdate, MessageDeliveryState};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;

/// One JSON line per event
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JsonLine<'a> {
    Update {
        at: chrono::DateTime<chrono::Utc>,
        update: &'a MeshUpdate,
    },
    Connection {
        at: chrono::DateTime<chrono::Utc>,
        state: &'a ConnectionState,
    },
}

/// Prints updates to stdout, as text or JSON lines
pub struct ConsoleObserver {
    json: bool,
    // Keeps lines from concurrent callbacks whole
    out: Mutex<std::io::Stdout>,
}

impl ConsoleObserver {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            out: Mutex::new(std::io::stdout()),
        }
    }

    fn emit(&self, line: &str) {
        let mut out = self.out.lock();
        // Nothing sensible to do when stdout is gone
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }

    fn emit_json(&self, line: &JsonLine<'_>) {
        match serde_json::to_string(line) {
            Ok(s) => self.emit(&s),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
        }
    }
}

impl MeshObserver for ConsoleObserver {
    fn on_update(&self, update: &MeshUpdate) {
        if self.json {
            self.emit_json(&JsonLine::Update {
                at: chrono::Utc::now(),
                update,
            });
        } else if let Some(line) = describe_update(update) {
            self.emit(&line);
        }
    }

    fn on_connection_state(&self, state: &ConnectionState) {
        if self.json {
            self.emit_json(&JsonLine::Connection {
                at: chrono::Utc::now(),
                state,
            });
        } else {
            self.emit(&format!("-- {}", state));
        }
    }
}

/// Human-readable line for an update; `None` for ones not worth printing
pub fn describe_update(update: &MeshUpdate) -> Option<String> {
    let line = match update {
        MeshUpdate::Node(patch) => {
            let name = patch
                .user
                .as_ref()
                .map(|u| format!(" {} ({})", u.long_name, u.short_name))
                .unwrap_or_default();
            format!("node {}{}", node_id_string(patch.num), name)
        }
        MeshUpdate::Channel(channel) => {
            if !channel.is_enabled() {
                return None;
            }
            let name = if channel.name.is_empty() {
                "(default)"
            } else {
                channel.name.as_str()
            };
            format!("channel {}: {} [{:?}]", channel.index, name, channel.role)
        }
        MeshUpdate::Message { item, is_direct, .. } => {
            let target = if *is_direct {
                node_id_string(item.to)
            } else {
                format!("#{}", item.channel)
            };
            format!(
                "[{}] {} -> {}: {}",
                item.timestamp.format("%H:%M:%S"),
                node_id_string(item.from),
                target,
                item.text
            )
        }
        MeshUpdate::Delivery { packet_id, state } => match state {
            MessageDeliveryState::Acknowledged => format!("message {:08x} delivered", packet_id),
            MessageDeliveryState::Failed { reason, .. } => {
                format!("message {:08x} failed: {}", packet_id, reason)
            }
            _ => return None,
        },
        MeshUpdate::Alert { from, text } => {
            format!("ALERT from {}: {}", node_id_string(*from), text)
        }
        MeshUpdate::Waypoint(waypoint) => match (waypoint.latitude, waypoint.longitude) {
            (Some(lat), Some(lon)) => format!(
                "waypoint {} '{}' at {:.5}, {:.5}",
                waypoint.id, waypoint.name, lat, lon
            ),
            _ => format!("waypoint {} '{}'", waypoint.id, waypoint.name),
        },
        MeshUpdate::Traceroute(result) => {
            let hops: Vec<String> = result.route.iter().map(|n| node_id_string(*n)).collect();
            format!(
                "traceroute to {}: {}",
                node_id_string(result.destination),
                if hops.is_empty() {
                    "direct".to_string()
                } else {
                    hops.join(" -> ")
                }
            )
        }
        MeshUpdate::Telemetry { .. } | MeshUpdate::Neighbors { .. } => return None,
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_radio::{ChannelInfo, ChannelRole};

    #[test]
    fn test_delivery_lines() {
        let ok = MeshUpdate::Delivery {
            packet_id: 0xBEEF,
            state: MessageDeliveryState::Acknowledged,
        };
        assert_eq!(
            describe_update(&ok).as_deref(),
            Some("message 0000beef delivered")
        );

        let pending = MeshUpdate::Delivery {
            packet_id: 1,
            state: MessageDeliveryState::Pending,
        };
        assert!(describe_update(&pending).is_none());
    }

    #[test]
    fn test_disabled_channel_hidden() {
        let channel = ChannelInfo {
            index: 3,
            name: String::new(),
            psk: Vec::new(),
            role: ChannelRole::Disabled,
            uplink: false,
            downlink: false,
        };
        assert!(describe_update(&MeshUpdate::Channel(channel)).is_none());
    }

    #[test]
    fn test_json_line_shape() {
        let state = ConnectionState::Connected;
        let line = JsonLine::Connection {
            at: chrono::Utc::now(),
            state: &state,
        };
        let value = serde_json::to_value(&line).unwrap();
        assert_eq!(value["event"], "connection");
        assert_eq!(value["state"]["state"], "connected");
    }
}
