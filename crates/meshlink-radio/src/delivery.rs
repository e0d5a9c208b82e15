//! Delivery tracking
//!
//! Outbound text packets are tracked by packet id until the mesh reports a
//! routing result for them. Routing payloads carry the original id in
//! `Data.request_id` and an error code in field 3 of the routing message.
//!
//! # Acceptance rules
//!
//! | recipient | reporter        | code   | result                  |
//! |-----------|-----------------|--------|-------------------------|
//! | broadcast | any             | none   | acknowledged            |
//! | direct    | destination     | none   | acknowledged            |
//! | direct    | anyone else     | none   | ignored, stays pending  |
//! | any       | any             | other  | failed (reason, retry?) |
//!
//! A direct message is only confirmed by its destination: the local node
//! reports "none" as soon as it has queued the packet, which says nothing
//! about the far end.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::model::{is_broadcast, MessageDeliveryState};
use crate::wire;

/// Field number of the error reason in a routing payload
const ERROR_REASON_FIELD: u32 = 3;

/// Device-reported routing result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOutcome {
    None,
    NoRoute,
    GotNak,
    Timeout,
    NoInterface,
    MaxRetransmit,
    NoChannel,
    TooLarge,
    NoResponse,
    DutyCycleLimit,
    BadRequest,
    NotAuthorized,
    PkiFailed,
    PkiUnknownPubkey,
    AdminBadSessionKey,
    AdminPublicKeyUnauthorized,
    RateLimitExceeded,
}

impl RoutingOutcome {
    /// Map a wire code; unknown codes count as success
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => RoutingOutcome::NoRoute,
            2 => RoutingOutcome::GotNak,
            3 => RoutingOutcome::Timeout,
            4 => RoutingOutcome::NoInterface,
            5 => RoutingOutcome::MaxRetransmit,
            6 => RoutingOutcome::NoChannel,
            7 => RoutingOutcome::TooLarge,
            8 => RoutingOutcome::NoResponse,
            9 => RoutingOutcome::DutyCycleLimit,
            32 => RoutingOutcome::BadRequest,
            33 => RoutingOutcome::NotAuthorized,
            34 => RoutingOutcome::PkiFailed,
            35 => RoutingOutcome::PkiUnknownPubkey,
            36 => RoutingOutcome::AdminBadSessionKey,
            37 => RoutingOutcome::AdminPublicKeyUnauthorized,
            38 => RoutingOutcome::RateLimitExceeded,
            _ => RoutingOutcome::None,
        }
    }

    /// Wire code
    pub fn code(self) -> u32 {
        match self {
            RoutingOutcome::None => 0,
            RoutingOutcome::NoRoute => 1,
            RoutingOutcome::GotNak => 2,
            RoutingOutcome::Timeout => 3,
            RoutingOutcome::NoInterface => 4,
            RoutingOutcome::MaxRetransmit => 5,
            RoutingOutcome::NoChannel => 6,
            RoutingOutcome::TooLarge => 7,
            RoutingOutcome::NoResponse => 8,
            RoutingOutcome::DutyCycleLimit => 9,
            RoutingOutcome::BadRequest => 32,
            RoutingOutcome::NotAuthorized => 33,
            RoutingOutcome::PkiFailed => 34,
            RoutingOutcome::PkiUnknownPubkey => 35,
            RoutingOutcome::AdminBadSessionKey => 36,
            RoutingOutcome::AdminPublicKeyUnauthorized => 37,
            RoutingOutcome::RateLimitExceeded => 38,
        }
    }

    /// Extract the outcome from a serialized routing payload
    ///
    /// Absent or unreadable codes count as success.
    pub fn from_routing_payload(payload: &[u8]) -> Self {
        match wire::find_varint_field(payload, ERROR_REASON_FIELD) {
            Ok(Some(code)) => Self::from_code(code),
            Ok(None) => RoutingOutcome::None,
            Err(e) => {
                debug!(error = %e, "Unreadable routing payload, assuming success");
                RoutingOutcome::None
            }
        }
    }

    pub fn is_success(self) -> bool {
        self == RoutingOutcome::None
    }

    /// Human-readable reason
    pub fn message(self) -> &'static str {
        match self {
            RoutingOutcome::None => "Delivered",
            RoutingOutcome::NoRoute => "No route to destination",
            RoutingOutcome::GotNak => "Rejected by a relay node",
            RoutingOutcome::Timeout => "Timed out waiting for acknowledgment",
            RoutingOutcome::NoInterface => "Radio has no interface to send on",
            RoutingOutcome::MaxRetransmit => "Gave up after maximum retransmissions",
            RoutingOutcome::NoChannel => "Channel not configured on the receiving node",
            RoutingOutcome::TooLarge => "Message too large for the radio",
            RoutingOutcome::NoResponse => "Destination did not respond",
            RoutingOutcome::DutyCycleLimit => "Regional duty cycle limit reached",
            RoutingOutcome::BadRequest => "Request rejected as malformed",
            RoutingOutcome::NotAuthorized => "Not authorized",
            RoutingOutcome::PkiFailed => "Encryption with the destination's key failed",
            RoutingOutcome::PkiUnknownPubkey => "Destination public key unknown",
            RoutingOutcome::AdminBadSessionKey => "Admin session key invalid or expired",
            RoutingOutcome::AdminPublicKeyUnauthorized => "Admin key not authorized on the node",
            RoutingOutcome::RateLimitExceeded => "Rate limit exceeded",
        }
    }

    /// Whether sending the same message again may succeed
    pub fn can_retry(self) -> bool {
        matches!(
            self,
            RoutingOutcome::NoRoute
                | RoutingOutcome::GotNak
                | RoutingOutcome::Timeout
                | RoutingOutcome::MaxRetransmit
                | RoutingOutcome::NoResponse
                | RoutingOutcome::DutyCycleLimit
                | RoutingOutcome::RateLimitExceeded
        )
    }

    /// Delivery state this outcome produces when final
    pub fn to_delivery_state(self) -> MessageDeliveryState {
        if self.is_success() {
            MessageDeliveryState::Acknowledged
        } else {
            MessageDeliveryState::Failed {
                reason: self.message().to_string(),
                can_retry: self.can_retry(),
            }
        }
    }
}

impl std::fmt::Display for RoutingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Pending outbound packets keyed by packet id
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    pending: HashMap<u32, u32>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an outbound packet sent to `to`
    pub fn track(&mut self, packet_id: u32, to: u32) {
        trace!(packet_id, to, "Tracking delivery");
        self.pending.insert(packet_id, to);
    }

    /// Stop tracking a packet that never left the client
    pub fn untrack(&mut self, packet_id: u32) {
        self.pending.remove(&packet_id);
    }

    pub fn is_pending(&self, packet_id: u32) -> bool {
        self.pending.contains_key(&packet_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Apply a routing result
    ///
    /// Returns the new delivery state when the result is final for a
    /// tracked packet, `None` when it is ignored or the packet is unknown.
    pub fn on_routing_result(
        &mut self,
        request_id: u32,
        reporter: u32,
        outcome: RoutingOutcome,
        local_node: u32,
    ) -> Option<MessageDeliveryState> {
        let to = *self.pending.get(&request_id)?;

        if outcome.is_success() && !is_broadcast(to) && reporter != to {
            if reporter == local_node {
                debug!(packet_id = request_id, "Local node accepted direct message");
            } else {
                debug!(packet_id = request_id, reporter, "Relay acknowledged direct message");
            }
            return None;
        }

        self.pending.remove(&request_id);
        let state = outcome.to_delivery_state();
        debug!(packet_id = request_id, reporter, outcome = %outcome, "Delivery resolved");
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BROADCAST_ADDR;

    const LOCAL: u32 = 0x0000_1111;
    const PEER: u32 = 0x0000_2222;

    #[test]
    fn test_code_mapping() {
        assert_eq!(RoutingOutcome::from_code(0), RoutingOutcome::None);
        assert_eq!(RoutingOutcome::from_code(5), RoutingOutcome::MaxRetransmit);
        assert_eq!(RoutingOutcome::from_code(36), RoutingOutcome::AdminBadSessionKey);
        assert_eq!(RoutingOutcome::from_code(99), RoutingOutcome::None);
        assert_eq!(RoutingOutcome::from_code(38).code(), 38);
    }

    #[test]
    fn test_retry_classification() {
        assert!(RoutingOutcome::Timeout.can_retry());
        assert!(RoutingOutcome::MaxRetransmit.can_retry());
        assert!(!RoutingOutcome::TooLarge.can_retry());
        assert!(!RoutingOutcome::PkiUnknownPubkey.can_retry());
        assert!(!RoutingOutcome::NotAuthorized.can_retry());
    }

    #[test]
    fn test_outcome_from_payload() {
        // error_reason = 5
        assert_eq!(
            RoutingOutcome::from_routing_payload(&[0x18, 0x05]),
            RoutingOutcome::MaxRetransmit
        );
        assert_eq!(RoutingOutcome::from_routing_payload(&[]), RoutingOutcome::None);
        // truncated length prefix
        assert_eq!(
            RoutingOutcome::from_routing_payload(&[0x0A, 0x7F]),
            RoutingOutcome::None
        );
    }

    #[test]
    fn test_broadcast_acknowledged_by_sender() {
        let mut tracker = DeliveryTracker::new();
        tracker.track(10, BROADCAST_ADDR);

        let state = tracker.on_routing_result(10, LOCAL, RoutingOutcome::None, LOCAL);
        assert_eq!(state, Some(MessageDeliveryState::Acknowledged));
        assert!(!tracker.is_pending(10));
    }

    #[test]
    fn test_direct_requires_destination() {
        let mut tracker = DeliveryTracker::new();
        tracker.track(11, PEER);

        assert_eq!(
            tracker.on_routing_result(11, LOCAL, RoutingOutcome::None, LOCAL),
            None
        );
        assert!(tracker.is_pending(11));

        assert_eq!(
            tracker.on_routing_result(11, PEER, RoutingOutcome::None, LOCAL),
            Some(MessageDeliveryState::Acknowledged)
        );
        assert!(!tracker.is_pending(11));
    }

    #[test]
    fn test_failure_from_any_reporter() {
        let mut tracker = DeliveryTracker::new();
        tracker.track(12, PEER);

        let state = tracker.on_routing_result(12, LOCAL, RoutingOutcome::MaxRetransmit, LOCAL);
        assert_eq!(
            state,
            Some(MessageDeliveryState::Failed {
                reason: RoutingOutcome::MaxRetransmit.message().to_string(),
                can_retry: true,
            })
        );
    }

    #[test]
    fn test_unknown_request_ignored() {
        let mut tracker = DeliveryTracker::new();
        assert_eq!(
            tracker.on_routing_result(99, PEER, RoutingOutcome::None, LOCAL),
            None
        );
    }

    #[test]
    fn test_terminal_state_not_reapplied() {
        let mut tracker = DeliveryTracker::new();
        tracker.track(13, BROADCAST_ADDR);
        assert!(tracker
            .on_routing_result(13, LOCAL, RoutingOutcome::None, LOCAL)
            .is_some());
        assert!(tracker
            .on_routing_result(13, LOCAL, RoutingOutcome::Timeout, LOCAL)
            .is_none());
    }
}
