//! Accumulated mesh state
//!
//! [`MeshState`] holds what the client knows about the mesh: nodes, channel
//! slots (ordered by index) and a bounded message history. It is owned by a
//! [`MeshContext`] together with the delivery tracker, the duplicate cache
//! and the injected collaborators. The context outlives individual
//! transport connections, so state and pending deliveries survive
//! reconnects.

use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

use crate::cache::DuplicateCache;
use crate::collaborators::{MeshObserver, MeshStore, NoopObserver, NoopStore, Settings};
use crate::config::ClientSettings;
use crate::delivery::DeliveryTracker;
use crate::model::{ChannelInfo, MeshUpdate, MessageItem, NodePatch, NodeRecord};
use crate::reconnect::ConnectionState;

/// Nodes, channels and recent messages
#[derive(Debug)]
pub struct MeshState {
    nodes: HashMap<u32, NodeRecord>,
    channels: BTreeMap<u8, ChannelInfo>,
    messages: VecDeque<MessageItem>,
    history_limit: usize,
}

impl MeshState {
    pub fn new(history_limit: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            channels: BTreeMap::new(),
            messages: VecDeque::new(),
            history_limit: history_limit.max(1),
        }
    }

    pub fn node(&self, num: u32) -> Option<&NodeRecord> {
        self.nodes.get(&num)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    /// Channels in index order
    pub fn channels(&self) -> impl Iterator<Item = &ChannelInfo> {
        self.channels.values()
    }

    pub fn channel(&self, index: u8) -> Option<&ChannelInfo> {
        self.channels.get(&index)
    }

    /// Messages oldest first
    pub fn messages(&self) -> impl Iterator<Item = &MessageItem> {
        self.messages.iter()
    }

    fn merge_node(&mut self, patch: &NodePatch, settings: &dyn Settings) -> &NodeRecord {
        let node = self
            .nodes
            .entry(patch.num)
            .or_insert_with(|| NodeRecord::new(patch.num));
        node.merge(patch);
        if node.color.is_none() {
            node.color = settings.node_color(patch.num);
        }
        if node.note.is_none() {
            node.note = settings.node_note(patch.num);
        }
        node
    }

    fn push_message(&mut self, item: MessageItem) {
        self.messages.push_back(item);
        while self.messages.len() > self.history_limit {
            self.messages.pop_front();
        }
    }
}

/// Shared state plus collaborators, one per client
pub struct MeshContext {
    state: Mutex<MeshState>,
    tracker: Mutex<DeliveryTracker>,
    duplicates: DuplicateCache,
    settings: Arc<dyn Settings>,
    store: Arc<dyn MeshStore>,
    observer: Arc<dyn MeshObserver>,
}

impl MeshContext {
    pub fn new(
        settings: Arc<dyn Settings>,
        store: Arc<dyn MeshStore>,
        observer: Arc<dyn MeshObserver>,
        history_limit: usize,
    ) -> Self {
        Self {
            state: Mutex::new(MeshState::new(history_limit)),
            tracker: Mutex::new(DeliveryTracker::new()),
            duplicates: DuplicateCache::new(),
            settings,
            store,
            observer,
        }
    }

    /// Context with default settings and no-op collaborators
    pub fn detached() -> Self {
        let settings = ClientSettings::default();
        let history = settings.message_history;
        Self::new(
            Arc::new(settings),
            Arc::new(NoopStore),
            Arc::new(NoopObserver),
            history,
        )
    }

    pub fn state(&self) -> MutexGuard<'_, MeshState> {
        self.state.lock()
    }

    pub fn tracker(&self) -> MutexGuard<'_, DeliveryTracker> {
        self.tracker.lock()
    }

    pub fn duplicates(&self) -> &DuplicateCache {
        &self.duplicates
    }

    pub fn settings(&self) -> &dyn Settings {
        self.settings.as_ref()
    }

    /// Forward a connection state change to the observer
    pub fn notify_connection_state(&self, state: &ConnectionState) {
        self.observer.on_connection_state(state);
    }

    /// Merge an update into the state, persist it, then notify the observer
    pub fn apply(&self, update: MeshUpdate) {
        {
            let mut state = self.state.lock();
            match &update {
                MeshUpdate::Node(patch) => {
                    let node = state.merge_node(patch, self.settings.as_ref());
                    self.store.upsert_node(node);
                }
                MeshUpdate::Telemetry { from, metrics } => {
                    let patch = NodePatch {
                        metrics: Some(*metrics),
                        ..NodePatch::new(*from)
                    };
                    let node = state.merge_node(&patch, self.settings.as_ref());
                    self.store.upsert_node(node);
                }
                MeshUpdate::Channel(channel) => {
                    state.channels.insert(channel.index, channel.clone());
                    self.store.upsert_channel(channel);
                }
                MeshUpdate::Message {
                    item,
                    is_direct,
                    partner,
                } => {
                    state.push_message(item.clone());
                    self.store.upsert_message(item, *is_direct, *partner);
                }
                MeshUpdate::Delivery { packet_id, state: delivery } => {
                    if let Some(item) = state
                        .messages
                        .iter_mut()
                        .rev()
                        .find(|m| m.packet_id == Some(*packet_id))
                    {
                        if !item.delivery.is_terminal() {
                            item.delivery = delivery.clone();
                        }
                    }
                    self.store.update_delivery_state(*packet_id, delivery);
                }
                MeshUpdate::Alert { .. }
                | MeshUpdate::Waypoint(_)
                | MeshUpdate::Traceroute(_)
                | MeshUpdate::Neighbors { .. } => {}
            }
        }
        trace!(?update, "Applied mesh update");
        self.observer.on_update(&update);
    }
}

impl std::fmt::Debug for MeshContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MeshContext")
            .field("nodes", &state.nodes.len())
            .field("channels", &state.channels.len())
            .field("messages", &state.messages.len())
            .field("pending_deliveries", &self.tracker.lock().pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelRole, MessageDeliveryState, NodeUser};
    use chrono::Utc;
    use std::collections::HashMap;

    fn message(packet_id: u32) -> MessageItem {
        MessageItem {
            packet_id: Some(packet_id),
            timestamp: Utc::now(),
            from: 1,
            to: 2,
            channel: 0,
            text: format!("msg {}", packet_id),
            delivery: MessageDeliveryState::Pending,
        }
    }

    #[test]
    fn test_channels_ordered_by_index() {
        let ctx = MeshContext::detached();
        for index in [3u8, 0, 1] {
            ctx.apply(MeshUpdate::Channel(ChannelInfo {
                index,
                name: format!("ch{}", index),
                psk: vec![],
                role: ChannelRole::Secondary,
                uplink: false,
                downlink: false,
            }));
        }
        let order: Vec<u8> = ctx.state().channels().map(|c| c.index).collect();
        assert_eq!(order, vec![0, 1, 3]);
    }

    #[test]
    fn test_history_is_bounded() {
        let ctx = MeshContext::new(
            Arc::new(ClientSettings::default()),
            Arc::new(NoopStore),
            Arc::new(NoopObserver),
            2,
        );
        for id in 1..=3 {
            ctx.apply(MeshUpdate::Message {
                item: message(id),
                is_direct: true,
                partner: 2,
            });
        }
        let ids: Vec<Option<u32>> = ctx.state().messages().map(|m| m.packet_id).collect();
        assert_eq!(ids, vec![Some(2), Some(3)]);
    }

    #[test]
    fn test_delivery_updates_message_once() {
        let ctx = MeshContext::detached();
        ctx.apply(MeshUpdate::Message {
            item: message(5),
            is_direct: true,
            partner: 2,
        });
        ctx.apply(MeshUpdate::Delivery {
            packet_id: 5,
            state: MessageDeliveryState::Acknowledged,
        });
        ctx.apply(MeshUpdate::Delivery {
            packet_id: 5,
            state: MessageDeliveryState::Pending,
        });
        let state = ctx.state();
        let item = state.messages().next().unwrap();
        assert_eq!(item.delivery, MessageDeliveryState::Acknowledged);
    }

    #[test]
    fn test_node_picks_up_settings() {
        let settings = ClientSettings {
            node_colors: HashMap::from([(9, "#ff8800".to_string())]),
            ..Default::default()
        };
        let ctx = MeshContext::new(
            Arc::new(settings),
            Arc::new(NoopStore),
            Arc::new(NoopObserver),
            10,
        );
        ctx.apply(MeshUpdate::Node(NodePatch {
            user: Some(NodeUser {
                long_name: "Ridge".to_string(),
                ..Default::default()
            }),
            ..NodePatch::new(9)
        }));
        let state = ctx.state();
        let node = state.node(9).unwrap();
        assert_eq!(node.color.as_deref(), Some("#ff8800"));
        assert_eq!(node.display_name(), "Ridge");
    }
}
