//! Lane state tracking
//!
//! Pure functions over lane nonce snapshots. They decide what is pending and
//! reject snapshots that could not have come from a healthy lane pair.
//!
//! For an ordered lane pair, with the source's outbound lane and the
//! destination's inbound lane:
//!
//! ```text
//! latest_received <= last_delivered <= latest_generated
//! ```
//!
//! Messages `(latest_received, latest_generated]` are waiting for delivery
//! or for their delivery to be confirmed back to the source.

use std::collections::BTreeSet;

use crate::error::{RelayError, RelayResult};
use crate::types::{InboundLaneNonce, NonceRange, OutboundLaneData, OutboundLaneNonce};

/// Nonces generated on the source but not yet confirmed as received
pub fn pending_dispatch_range(outbound: &OutboundLaneNonce) -> NonceRange {
    NonceRange::new(
        outbound.latest_received_nonce + 1,
        outbound.latest_generated_nonce,
    )
}

/// Unrewarded relayer records the destination still holds
pub fn pending_confirmation_range(inbound: &InboundLaneNonce) -> NonceRange {
    NonceRange::new(inbound.relayer_range_front, inbound.relayer_range_back)
}

/// Part of `range` the destination has not delivered yet
pub fn undelivered(range: NonceRange, inbound: &InboundLaneNonce) -> NonceRange {
    NonceRange::new(
        range.begin.max(inbound.last_delivered_nonce + 1),
        range.end,
    )
}

/// Whether the source has yet to learn about deliveries
pub fn needs_confirmation(outbound: &OutboundLaneNonce, inbound: &InboundLaneNonce) -> bool {
    outbound.latest_received_nonce < inbound.last_delivered_nonce
}

/// Per-side invariants plus the cross-chain bound
/// `inbound.last_delivered <= outbound.latest_generated`
pub fn check_lane_pair(outbound: &OutboundLaneNonce, inbound: &InboundLaneNonce) -> RelayResult<()> {
    outbound.check()?;
    inbound.check()?;

    if inbound.last_delivered_nonce > outbound.latest_generated_nonce {
        return Err(RelayError::InconsistentRead(format!(
            "destination delivered nonce {} beyond source generated {}",
            inbound.last_delivered_nonce, outbound.latest_generated_nonce
        )));
    }
    Ok(())
}

/// Outbound data read for a proof must carry exactly the proven range
pub fn check_outbound_data(data: &OutboundLaneData, range: NonceRange) -> RelayResult<()> {
    let carried = data.range();
    if carried != range || data.messages.len() as u64 != range.len() {
        return Err(RelayError::InconsistentRead(format!(
            "outbound data carries {} ({} messages), expected {}",
            carried,
            data.messages.len(),
            range
        )));
    }

    for (expected, message) in range.iter().zip(&data.messages) {
        if message.nonce() != expected {
            return Err(RelayError::InconsistentRead(format!(
                "outbound data has gap: nonce {} where {} expected",
                message.nonce(),
                expected
            )));
        }
    }
    Ok(())
}

/// Parallel lane: leaves on the source and which of them the destination
/// has already dispatched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParallelLaneState {
    pub leaf_count: u64,
    pub dispatched: BTreeSet<u64>,
}

impl ParallelLaneState {
    pub fn pending_leaves(&self) -> Vec<u64> {
        (0..self.leaf_count)
            .filter(|index| !self.dispatched.contains(index))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LaneId, Message, MessagePayload};

    fn outbound(received: u64, generated: u64) -> OutboundLaneNonce {
        OutboundLaneNonce {
            latest_received_nonce: received,
            latest_generated_nonce: generated,
        }
    }

    fn inbound(confirmed: u64, delivered: u64, front: u64, back: u64) -> InboundLaneNonce {
        InboundLaneNonce {
            last_confirmed_nonce: confirmed,
            last_delivered_nonce: delivered,
            relayer_range_front: front,
            relayer_range_back: back,
        }
    }

    #[test]
    fn test_pending_dispatch_range() {
        assert_eq!(pending_dispatch_range(&outbound(0, 2)), NonceRange::new(1, 2));
        assert!(pending_dispatch_range(&outbound(2, 2)).is_empty());
    }

    #[test]
    fn test_pending_confirmation_range() {
        assert_eq!(
            pending_confirmation_range(&inbound(0, 2, 1, 1)),
            NonceRange::new(1, 1)
        );
        assert!(pending_confirmation_range(&InboundLaneNonce::default()).is_empty());
    }

    #[test]
    fn test_undelivered_trims_delivered_prefix() {
        let range = NonceRange::new(1, 5);
        assert_eq!(undelivered(range, &inbound(0, 3, 1, 1)), NonceRange::new(4, 5));
        assert!(undelivered(range, &inbound(0, 5, 1, 1)).is_empty());
        assert_eq!(undelivered(range, &InboundLaneNonce::default()), range);
    }

    #[test]
    fn test_needs_confirmation() {
        assert!(needs_confirmation(&outbound(0, 1), &inbound(0, 1, 1, 1)));
        assert!(!needs_confirmation(&outbound(1, 1), &inbound(1, 1, 2, 1)));
    }

    #[test]
    fn test_check_lane_pair() {
        assert!(check_lane_pair(&outbound(0, 2), &inbound(0, 2, 1, 1)).is_ok());
        assert!(matches!(
            check_lane_pair(&outbound(0, 2), &inbound(0, 3, 1, 1)),
            Err(RelayError::InconsistentRead(_))
        ));
        assert!(check_lane_pair(&outbound(3, 2), &InboundLaneNonce::default()).is_err());
    }

    #[test]
    fn test_check_outbound_data() {
        let lane = LaneId::new(1, 0, 2, 0);
        let msg = |n| Message::new(&lane, n, MessagePayload::default());

        let data = OutboundLaneData {
            latest_received_nonce: 0,
            messages: vec![msg(1), msg(2)],
        };
        assert!(check_outbound_data(&data, NonceRange::new(1, 2)).is_ok());
        assert!(check_outbound_data(&data, NonceRange::new(1, 3)).is_err());

        let gapped = OutboundLaneData {
            latest_received_nonce: 0,
            messages: vec![msg(1), msg(3)],
        };
        assert!(check_outbound_data(&gapped, NonceRange::new(1, 3)).is_err());
    }

    #[test]
    fn test_parallel_pending_leaves() {
        let state = ParallelLaneState {
            leaf_count: 4,
            dispatched: [0, 2].into_iter().collect(),
        };
        assert_eq!(state.pending_leaves(), vec![1, 3]);
        assert!(ParallelLaneState::default().pending_leaves().is_empty());
    }
}
