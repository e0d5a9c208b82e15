//! Interfaces to the host application
//!
//! The engine pushes state outward through three injected services:
//!
//! - [`MeshStore`] - persistence, fire-and-forget
//! - [`Settings`] - read-only client preferences
//! - [`MeshObserver`] - UI state sink for updates and connection state
//!
//! All three are called from the engine's task and must not block.
//! Implementations that do real I/O should hand the work to their own task.

use crate::model::{ChannelInfo, MeshUpdate, MessageDeliveryState, MessageItem, NodeRecord};
use crate::reconnect::ConnectionState;

/// Persistence sink
pub trait MeshStore: Send + Sync {
    fn upsert_node(&self, node: &NodeRecord);

    fn upsert_channel(&self, channel: &ChannelInfo);

    /// `partner` is the peer for direct messages, the channel index otherwise
    fn upsert_message(&self, message: &MessageItem, is_direct: bool, partner: u32);

    fn update_delivery_state(&self, packet_id: u32, state: &MessageDeliveryState);
}

/// Read-only client preferences
pub trait Settings: Send + Sync {
    /// Log every frame at trace level
    fn verbose_frame_logging(&self) -> bool {
        false
    }

    /// Surface encrypted packets as placeholder messages
    fn show_undecodable_messages(&self) -> bool;

    fn node_color(&self, node_num: u32) -> Option<String>;

    fn node_note(&self, node_num: u32) -> Option<String>;
}

/// UI state sink
pub trait MeshObserver: Send + Sync {
    fn on_update(&self, update: &MeshUpdate);

    fn on_connection_state(&self, _state: &ConnectionState) {}
}

/// Store that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl MeshStore for NoopStore {
    fn upsert_node(&self, _node: &NodeRecord) {}
    fn upsert_channel(&self, _channel: &ChannelInfo) {}
    fn upsert_message(&self, _message: &MessageItem, _is_direct: bool, _partner: u32) {}
    fn update_delivery_state(&self, _packet_id: u32, _state: &MessageDeliveryState) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl MeshObserver for NoopObserver {
    fn on_update(&self, _update: &MeshUpdate) {}
}
