//! Full relay cycles against the in-memory network

mod common;

use alloy::primitives::Bytes;
use bridge_rs::error::RelayError;
use bridge_rs::testing::MockNetwork;
use bridge_rs::types::{MessagePayload, NonceRange};
use lane_relayer::{HeaderSubmissionLocks, LaneKind, LaneRelay, LaneSpec, RelayState};

use common::*;

fn payload(tag: u8) -> MessagePayload {
    MessagePayload {
        encoded: Bytes::from(vec![tag; 4]),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_single_message_delivered_and_confirmed() {
    let (network, pair, mut relay) = committee_lane().await;
    let message = network.send_message("a", pair.outbound, payload(1)).unwrap();

    let report = relay.run_cycle().await.unwrap();

    assert_eq!(report.dispatched, vec![message.encoded_key]);
    assert_eq!(report.confirmed, Some(NonceRange::new(1, 1)));
    assert_eq!(report.header_updates, 2);
    assert_eq!(relay.state(), &RelayState::Idle);

    assert_eq!(
        network.dispatched("b", pair.inbound).unwrap(),
        vec![message.encoded_key]
    );
    let outbound = network.outbound_nonce("a", pair.outbound).unwrap();
    assert_eq!(outbound.latest_received_nonce, 1);
    assert_eq!(outbound.latest_generated_nonce, 1);
}

#[tokio::test]
async fn test_pending_messages_share_one_proof() {
    let (network, pair, mut relay) = committee_lane().await;
    let first = network.send_message("a", pair.outbound, payload(1)).unwrap();
    let second = network.send_message("a", pair.outbound, payload(2)).unwrap();

    let report = relay.run_cycle().await.unwrap();

    assert_eq!(report.dispatched, vec![first.encoded_key, second.encoded_key]);
    assert_eq!(report.confirmed, Some(NonceRange::new(1, 2)));

    let on_b = network.submitted("b");
    assert_eq!(count(&on_b, "receive_messages_proof"), 1);
    assert_eq!(count(&on_b, "import_finalized_header"), 1);
    assert_eq!(
        network.submitted("a"),
        vec!["import_finalized_header", "receive_messages_delivery_proof"]
    );
}

#[tokio::test]
async fn test_committee_rotation_precedes_finality_update() {
    let (network, pair, mut relay) = committee_lane().await;
    network.send_message("a", pair.outbound, payload(1)).unwrap();
    network.advance_beacon_periods("a", 1);

    let report = relay.run_cycle().await.unwrap();

    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(
        network.submitted("b"),
        vec![
            "import_next_sync_committee",
            "import_finalized_header",
            "receive_messages_proof"
        ]
    );
}

#[tokio::test]
async fn test_failed_rotation_blocks_the_finality_update() {
    let (network, pair, mut relay) = committee_lane().await;
    let message = network.send_message("a", pair.outbound, payload(1)).unwrap();
    network.advance_beacon_periods("a", 1);
    network.inject_fault(
        "b",
        "import_next_sync_committee",
        RelayError::TransportFailure("connection reset".into()),
        None,
    );

    let err = relay.run_cycle().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(relay.state(), &RelayState::Idle);
    assert!(network.submitted("b").is_empty());
    assert!(network.dispatched("b", pair.inbound).unwrap().is_empty());

    network.clear_faults();
    let report = relay.run_cycle().await.unwrap();
    assert_eq!(report.dispatched, vec![message.encoded_key]);
    assert_eq!(report.confirmed, Some(NonceRange::new(1, 1)));
}

#[tokio::test]
async fn test_second_cycle_is_idempotent() {
    let (network, pair, mut relay) = committee_lane().await;
    network.send_message("a", pair.outbound, payload(1)).unwrap();

    relay.run_cycle().await.unwrap();
    let report = relay.run_cycle().await.unwrap();

    assert!(report.dispatched.is_empty());
    assert_eq!(report.confirmed, None);
    assert_eq!(count(&network.submitted("b"), "receive_messages_proof"), 1);
    assert_eq!(
        count(&network.submitted("a"), "receive_messages_delivery_proof"),
        1
    );
    assert_eq!(network.dispatched("b", pair.inbound).unwrap().len(), 1);
}

#[tokio::test]
async fn test_stale_delivery_is_skipped() {
    let (network, pair, mut relay) = committee_lane().await;
    let message = network.send_message("a", pair.outbound, payload(1)).unwrap();
    network.inject_fault(
        "b",
        "receive_messages_proof",
        RelayError::StaleState("lane nonce already advanced".into()),
        Some(1),
    );

    let report = relay.run_cycle().await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.confirmed, None);

    let report = relay.run_cycle().await.unwrap();
    assert_eq!(report.dispatched, vec![message.encoded_key]);
    assert_eq!(report.confirmed, Some(NonceRange::new(1, 1)));
}

#[tokio::test]
async fn test_competing_delivery_past_trusted_view_is_skipped() {
    let network = two_chains();
    let lc_b = network.deploy_committee_light_client("b", "a").unwrap();
    let lc_a = network.deploy_committee_light_client("a", "b").unwrap();
    let pair = network.open_lane("a", "b", lc_b, lc_a).unwrap();
    let relay = || {
        LaneRelay::new(
            spec(&pair, LaneKind::Ordered),
            endpoint(&network, "a"),
            endpoint(&network, "b"),
            committee_tracker(&network, "b", "a", lc_b),
            Some(committee_tracker(&network, "a", "b", lc_a)),
            HeaderSubmissionLocks::new(),
            settings(),
        )
    };
    let mut slow = relay().await.unwrap();
    let mut fast = relay().await.unwrap();

    network.send_message("a", pair.outbound, payload(1)).unwrap();
    slow.step().await.unwrap();
    let trusted = slow.step().await.unwrap().clone();
    assert!(matches!(trusted, RelayState::Dispatching { .. }));

    // Another relayer imports a newer header and delivers both messages
    network.send_message("a", pair.outbound, payload(2)).unwrap();
    for _ in 0..3 {
        fast.step().await.unwrap();
    }
    assert!(matches!(fast.state(), RelayState::AwaitingFinality { .. }));
    assert_eq!(network.dispatched("b", pair.inbound).unwrap().len(), 2);

    assert_eq!(slow.step().await.unwrap(), &RelayState::Confirming);
    assert_eq!(count(&network.submitted("b"), "receive_messages_proof"), 1);
}

#[tokio::test]
async fn test_unavailable_finality_defers_confirmation() {
    let (network, pair, mut relay) = committee_lane().await;
    network.send_message("a", pair.outbound, payload(1)).unwrap();
    network.set_finality_lag("b", 50).unwrap();

    let report = relay.run_cycle().await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.confirmed, None);
    assert!(network.submitted("a").is_empty());

    network.set_finality_lag("b", 0).unwrap();
    let report = relay.run_cycle().await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.confirmed, Some(NonceRange::new(1, 1)));
}

#[tokio::test]
async fn test_threshold_lane_uses_commitments() {
    let (network, pair, mut relay) = threshold_lane().await;
    let message = network.send_message("a", pair.outbound, payload(1)).unwrap();

    let report = relay.run_cycle().await.unwrap();

    assert_eq!(report.dispatched, vec![message.encoded_key]);
    assert_eq!(report.confirmed, Some(NonceRange::new(1, 1)));
    assert_eq!(
        network.submitted("b"),
        vec!["import_message_commitment", "receive_messages_proof"]
    );
    assert_eq!(
        network.submitted("a"),
        vec!["import_message_commitment", "receive_messages_delivery_proof"]
    );
}

#[tokio::test]
async fn test_epoch_lane_confirms_once_checkpoint_covers_delivery() {
    let (network, pair, mut relay) = epoch_lane().await;
    let message = network.send_message("a", pair.outbound, payload(1)).unwrap();
    network.mine("a", 2).unwrap();
    network.mine("b", 3).unwrap();

    // The source checkpoint after this cycle predates the delivery on b
    let report = relay.run_cycle().await.unwrap();
    assert_eq!(report.dispatched, vec![message.encoded_key]);
    assert_eq!(report.confirmed, None);

    network.mine("b", 3).unwrap();
    let report = relay.run_cycle().await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.confirmed, Some(NonceRange::new(1, 1)));
    assert_eq!(
        network
            .outbound_nonce("a", pair.outbound)
            .unwrap()
            .latest_received_nonce,
        1
    );
}

#[tokio::test]
async fn test_parallel_lane_dispatches_every_leaf_once() {
    let (network, pair, mut relay) = parallel_lane().await;
    let sent: Vec<_> = (0..3)
        .map(|i| {
            network
                .send_parallel_message("a", pair.outbound, payload(i))
                .unwrap()
        })
        .collect();

    let report = relay.run_cycle().await.unwrap();
    let keys: Vec<_> = sent.iter().map(|m| m.encoded_key).collect();
    assert_eq!(report.dispatched, keys);
    assert_eq!(report.confirmed, None);
    assert_eq!(network.dispatched("b", pair.inbound).unwrap(), keys);

    let fourth = network
        .send_parallel_message("a", pair.outbound, payload(3))
        .unwrap();
    let report = relay.run_cycle().await.unwrap();
    assert_eq!(report.dispatched, vec![fourth.encoded_key]);
    assert_eq!(count(&network.submitted("b"), "receive_message"), 4);
}

#[tokio::test]
async fn test_threshold_parallel_lane_proves_root_by_commitment() {
    let (network, pair, mut relay) = threshold_parallel_lane().await;
    let sent: Vec<_> = (0..2)
        .map(|i| {
            network
                .send_parallel_message("a", pair.outbound, payload(i))
                .unwrap()
        })
        .collect();

    let report = relay.run_cycle().await.unwrap();
    let keys: Vec<_> = sent.iter().map(|m| m.encoded_key).collect();
    assert_eq!(report.dispatched, keys);
    assert_eq!(
        network.submitted("b"),
        vec![
            "import_message_commitment",
            "receive_message",
            "receive_message"
        ]
    );
    assert_eq!(network.dispatched("b", pair.inbound).unwrap(), keys);

    let report = relay.run_cycle().await.unwrap();
    assert!(report.dispatched.is_empty());
}

#[tokio::test]
async fn test_parallel_lane_without_source_committer_is_rejected() {
    let network = two_chains();
    let committer_a = network.deploy_committer("a").unwrap();
    let lc_b = network.deploy_threshold_light_client("b", "a").unwrap();
    let pair = network.open_parallel_lane("a", "b", lc_b).unwrap();

    let result = LaneRelay::new(
        spec(&pair, LaneKind::Parallel),
        endpoint(&network, "a"),
        endpoint(&network, "b"),
        threshold_tracker(&network, "b", "a", lc_b, committer_a),
        None,
        HeaderSubmissionLocks::new(),
        settings(),
    )
    .await;

    assert!(matches!(result.err(), Some(RelayError::InvalidInput(_))));
}

#[tokio::test]
async fn test_ordered_lane_without_reverse_client_is_rejected() {
    let network = MockNetwork::new();
    network.add_chain("a", 1);
    network.add_chain("b", 2);
    let lc_b = network.deploy_committee_light_client("b", "a").unwrap();
    let lc_a = network.deploy_committee_light_client("a", "b").unwrap();
    let pair = network.open_lane("a", "b", lc_b, lc_a).unwrap();

    let result = LaneRelay::new(
        spec(&pair, LaneKind::Ordered),
        endpoint(&network, "a"),
        endpoint(&network, "b"),
        committee_tracker(&network, "b", "a", lc_b),
        None,
        HeaderSubmissionLocks::new(),
        settings(),
    )
    .await;

    assert!(matches!(result.err(), Some(RelayError::InvalidInput(_))));
}

#[tokio::test]
async fn test_mismatched_lane_pair_is_rejected() {
    let network = two_chains();
    let lc_b = network.deploy_committee_light_client("b", "a").unwrap();
    let lc_a = network.deploy_committee_light_client("a", "b").unwrap();
    let first = network.open_lane("a", "b", lc_b, lc_a).unwrap();
    let second = network.open_lane("a", "b", lc_b, lc_a).unwrap();

    let crossed = LaneSpec {
        name: "crossed".to_string(),
        kind: LaneKind::Ordered,
        outbound: first.outbound,
        inbound: second.inbound,
    };
    let result = LaneRelay::new(
        crossed,
        endpoint(&network, "a"),
        endpoint(&network, "b"),
        committee_tracker(&network, "b", "a", lc_b),
        Some(committee_tracker(&network, "a", "b", lc_a)),
        HeaderSubmissionLocks::new(),
        settings(),
    )
    .await;

    assert!(matches!(result.err(), Some(RelayError::InvalidInput(_))));
}
