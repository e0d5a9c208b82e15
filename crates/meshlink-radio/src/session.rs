//! Per-connection protocol session
//!
//! [`ProtocolSession`] is owned by the engine task for the lifetime of one
//! transport connection and reset at the start of every initialization.
//! Readers outside the task see it through a [`SessionSnapshot`] published
//! on a watch channel.
//!
//! [`InboundBuffer`] bridges the transport's callback context into the
//! engine task: the callback queues each received chunk under a lock, the
//! engine swaps the queue out under the same lock and decodes outside it.
//! Chunks keep their boundaries, which datagram transports rely on.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::model::MeshUpdate;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    /// Config requested, waiting for completion
    Handshaking,
    /// Completion received
    Synced,
    /// Handshake timed out; updates pass through, a late completion still counts
    Unsynced,
}

/// Mutable protocol state for one connection
#[derive(Debug, Default)]
pub struct ProtocolSession {
    /// Local node number, 0 until learned
    pub node_num: u32,
    pub config_complete: bool,
    /// Admin session passkey, empty until issued
    pub passkey: Vec<u8>,
    /// Channel indices the device has answered for
    pub answered_channels: BTreeSet<u8>,
    /// Correlation id of the outstanding config request
    pub config_nonce: u32,
    pub phase: SessionPhase,
    /// Updates held back until the handshake completes
    staged: Vec<MeshUpdate>,
}

impl ProtocolSession {
    /// Forget everything and start a handshake with `nonce`
    pub fn reset(&mut self, nonce: u32) {
        *self = Self {
            config_nonce: nonce,
            phase: SessionPhase::Handshaking,
            ..Self::default()
        };
    }

    /// Restart the handshake without forgetting the node number or passkey
    ///
    /// Channel answers are dropped; a rebooted device may hold other slots.
    pub fn restart_handshake(&mut self, nonce: u32) {
        self.config_nonce = nonce;
        self.config_complete = false;
        self.answered_channels.clear();
        self.phase = SessionPhase::Handshaking;
    }

    /// Hold a node or channel update back while handshaking, or pass it through
    ///
    /// Messages, delivery results and everything else are never held.
    pub fn stage(&mut self, update: MeshUpdate) -> Option<MeshUpdate> {
        let config = matches!(update, MeshUpdate::Node(_) | MeshUpdate::Channel(_));
        if config && self.phase == SessionPhase::Handshaking {
            self.staged.push(update);
            None
        } else {
            Some(update)
        }
    }

    /// Give up waiting for completion; returns the updates held so far
    ///
    /// Does nothing unless handshaking. The nonce is kept so that a late
    /// completion still marks the config complete.
    pub fn abandon_handshake(&mut self) -> Option<Vec<MeshUpdate>> {
        if self.phase != SessionPhase::Handshaking {
            return None;
        }
        self.phase = SessionPhase::Unsynced;
        Some(std::mem::take(&mut self.staged))
    }

    /// Handle a completion id; returns the staged updates on the first match
    pub fn complete(&mut self, id: u32) -> Option<Vec<MeshUpdate>> {
        if id != self.config_nonce || self.config_complete || self.phase == SessionPhase::Idle {
            return None;
        }
        self.config_complete = true;
        self.phase = SessionPhase::Synced;
        Some(std::mem::take(&mut self.staged))
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            node_num: self.node_num,
            config_complete: self.config_complete,
            has_passkey: !self.passkey.is_empty(),
            answered_channels: self.answered_channels.clone(),
            phase: self.phase,
        }
    }
}

/// Read-only view of the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub node_num: u32,
    pub config_complete: bool,
    pub has_passkey: bool,
    pub answered_channels: BTreeSet<u8>,
    pub phase: SessionPhase,
}

impl SessionSnapshot {
    /// Handshake completed and the local node is known
    pub fn is_ready(&self) -> bool {
        self.config_complete && self.node_num != 0
    }
}

/// Receive queue shared between the transport callback and the engine
#[derive(Debug, Clone, Default)]
pub struct InboundBuffer {
    chunks: Arc<Mutex<VecDeque<Bytes>>>,
    notify: Arc<Notify>,
}

impl InboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one received chunk and wake the engine
    pub fn push(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.chunks.lock().push_back(Bytes::copy_from_slice(chunk));
        self.notify.notify_one();
    }

    /// Take every chunk queued so far, oldest first
    pub fn take(&self) -> VecDeque<Bytes> {
        std::mem::take(&mut *self.chunks.lock())
    }

    /// Wait until bytes have been pushed
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn clear(&self) {
        self.chunks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodePatch;

    #[test]
    fn test_reset_clears_everything() {
        let mut session = ProtocolSession {
            node_num: 42,
            config_complete: true,
            passkey: vec![1, 2],
            ..Default::default()
        };
        session.answered_channels.insert(0);
        session.reset(7);

        assert_eq!(session.node_num, 0);
        assert!(!session.config_complete);
        assert!(session.passkey.is_empty());
        assert!(session.answered_channels.is_empty());
        assert_eq!(session.config_nonce, 7);
        assert_eq!(session.phase, SessionPhase::Handshaking);
    }

    #[test]
    fn test_staged_updates_drain_once() {
        let mut session = ProtocolSession::default();
        session.reset(9);

        assert!(session.stage(MeshUpdate::Node(NodePatch::new(1))).is_none());
        assert!(session.stage(MeshUpdate::Node(NodePatch::new(2))).is_none());
        assert_eq!(session.staged_len(), 2);

        assert!(session.complete(8).is_none());
        assert_eq!(session.complete(9).map(|u| u.len()), Some(2));
        assert!(session.complete(9).is_none());

        // After sync, updates pass straight through
        assert!(session.stage(MeshUpdate::Node(NodePatch::new(3))).is_some());
    }

    #[test]
    fn test_deliveries_never_staged() {
        let mut session = ProtocolSession::default();
        session.reset(3);

        let delivery = MeshUpdate::Delivery {
            packet_id: 10,
            state: crate::model::MessageDeliveryState::Acknowledged,
        };
        assert!(session.stage(delivery).is_some());
        assert!(session.stage(MeshUpdate::Alert { from: 1, text: "x".into() }).is_some());
        assert_eq!(session.staged_len(), 0);
    }

    #[test]
    fn test_abandoned_handshake_passes_through() {
        let mut session = ProtocolSession::default();
        session.reset(4);
        assert!(session.stage(MeshUpdate::Node(NodePatch::new(1))).is_none());

        assert_eq!(session.abandon_handshake().map(|u| u.len()), Some(1));
        assert_eq!(session.phase, SessionPhase::Unsynced);
        assert!(session.abandon_handshake().is_none());
        assert!(session.stage(MeshUpdate::Node(NodePatch::new(2))).is_some());

        // Late completion still counts
        assert_eq!(session.complete(4).map(|u| u.len()), Some(0));
        assert!(session.config_complete);
        assert_eq!(session.phase, SessionPhase::Synced);
    }

    #[test]
    fn test_restart_keeps_identity() {
        let mut session = ProtocolSession::default();
        session.reset(1);
        session.node_num = 42;
        session.passkey = vec![9];
        session.answered_channels.insert(0);
        session.complete(1);

        session.restart_handshake(2);
        assert_eq!(session.node_num, 42);
        assert_eq!(session.passkey, vec![9]);
        assert!(session.answered_channels.is_empty());
        assert!(!session.config_complete);
        assert_eq!(session.phase, SessionPhase::Handshaking);
        assert!(session.complete(1).is_none());
        assert!(session.complete(2).is_some());
    }

    #[test]
    fn test_snapshot_readiness() {
        let mut session = ProtocolSession::default();
        session.reset(1);
        session.node_num = 5;
        assert!(!session.snapshot().is_ready());
        session.complete(1);
        assert!(session.snapshot().is_ready());
    }

    #[tokio::test]
    async fn test_inbound_buffer_swap() {
        let buffer = InboundBuffer::new();
        buffer.push(b"ab");
        buffer.push(b"");
        buffer.push(b"cd");
        buffer.notified().await;

        let chunks = buffer.take();
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0][..], b"ab");
        assert_eq!(&chunks[1][..], b"cd");
        assert!(buffer.take().is_empty());
    }
}
