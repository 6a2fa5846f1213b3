//! Lane fixtures on the in-memory network

#![allow(dead_code)]

use std::sync::Arc;

use alloy::primitives::Address;
use bridge_rs::lightclient::{
    CommitteeTracker, EpochTracker, ForkSchedule, LightClientTracker, ThresholdTracker,
};
use bridge_rs::testing::{LanePair, MockNetwork};
use bridge_rs::RetryConfig;
use lane_relayer::{
    ChainEndpoint, HeaderSubmissionLocks, LaneKind, LaneRelay, LaneSpec, RelaySettings,
};

pub const EPOCH_GAP: u64 = 4;
pub const AUTHORITIES: u64 = 3;

pub fn settings() -> RelaySettings {
    RelaySettings {
        retry: RetryConfig::immediate(2),
        ..RelaySettings::default()
    }
}

pub fn two_chains() -> MockNetwork {
    let network = MockNetwork::new();
    network.add_chain("a", 1);
    network.add_chain("b", 2);
    network
}

pub fn endpoint(network: &MockNetwork, chain: &str) -> ChainEndpoint {
    ChainEndpoint::new(Arc::new(network.chain(chain)))
}

pub fn committee_tracker(
    network: &MockNetwork,
    host: &str,
    source: &str,
    light_client: Address,
) -> Arc<LightClientTracker> {
    Arc::new(LightClientTracker::Committee(CommitteeTracker::new(
        Arc::new(network.beacon(source)),
        Arc::new(network.chain(host)),
        light_client,
        ForkSchedule::testnet(),
    )))
}

pub fn epoch_tracker(
    network: &MockNetwork,
    host: &str,
    source: &str,
    light_client: Address,
) -> Arc<LightClientTracker> {
    Arc::new(LightClientTracker::EpochAuthority(EpochTracker::new(
        Arc::new(network.chain(source)),
        Arc::new(network.chain(host)),
        light_client,
        EPOCH_GAP,
    )))
}

pub fn threshold_tracker(
    network: &MockNetwork,
    host: &str,
    source: &str,
    light_client: Address,
    committer: Address,
) -> Arc<LightClientTracker> {
    Arc::new(LightClientTracker::Threshold(ThresholdTracker::new(
        Arc::new(network.chain(source)),
        Arc::new(network.authority(source)),
        Arc::new(network.chain(host)),
        light_client,
        committer,
    )))
}

pub fn spec(pair: &LanePair, kind: LaneKind) -> LaneSpec {
    LaneSpec {
        name: "a-b".to_string(),
        kind,
        outbound: pair.outbound,
        inbound: pair.inbound,
    }
}

/// Ordered lane a -> b, both directions verified by beacon light clients
pub async fn committee_lane() -> (MockNetwork, LanePair, LaneRelay) {
    let network = two_chains();
    let lc_b = network.deploy_committee_light_client("b", "a").unwrap();
    let lc_a = network.deploy_committee_light_client("a", "b").unwrap();
    let pair = network.open_lane("a", "b", lc_b, lc_a).unwrap();

    let relay = LaneRelay::new(
        spec(&pair, LaneKind::Ordered),
        endpoint(&network, "a"),
        endpoint(&network, "b"),
        committee_tracker(&network, "b", "a", lc_b),
        Some(committee_tracker(&network, "a", "b", lc_a)),
        HeaderSubmissionLocks::new(),
        settings(),
    )
    .await
    .unwrap();

    (network, pair, relay)
}

/// Ordered lane a -> b, both directions verified by epoch light clients
pub async fn epoch_lane() -> (MockNetwork, LanePair, LaneRelay) {
    let network = two_chains();
    let lc_b = network
        .deploy_epoch_light_client("b", "a", EPOCH_GAP, AUTHORITIES)
        .unwrap();
    let lc_a = network
        .deploy_epoch_light_client("a", "b", EPOCH_GAP, AUTHORITIES)
        .unwrap();
    let pair = network.open_lane("a", "b", lc_b, lc_a).unwrap();

    let relay = LaneRelay::new(
        spec(&pair, LaneKind::Ordered),
        endpoint(&network, "a"),
        endpoint(&network, "b"),
        epoch_tracker(&network, "b", "a", lc_b),
        Some(epoch_tracker(&network, "a", "b", lc_a)),
        HeaderSubmissionLocks::new(),
        settings(),
    )
    .await
    .unwrap();

    (network, pair, relay)
}

/// Ordered lane a -> b, both directions verified by signed commitments
pub async fn threshold_lane() -> (MockNetwork, LanePair, LaneRelay) {
    let network = two_chains();
    let committer_a = network.deploy_committer("a").unwrap();
    let committer_b = network.deploy_committer("b").unwrap();
    let lc_b = network.deploy_threshold_light_client("b", "a").unwrap();
    let lc_a = network.deploy_threshold_light_client("a", "b").unwrap();
    let pair = network.open_lane("a", "b", lc_b, lc_a).unwrap();

    let relay = LaneRelay::new(
        spec(&pair, LaneKind::Ordered),
        endpoint(&network, "a").with_committer(committer_a),
        endpoint(&network, "b").with_committer(committer_b),
        threshold_tracker(&network, "b", "a", lc_b, committer_a),
        Some(threshold_tracker(&network, "a", "b", lc_a, committer_b)),
        HeaderSubmissionLocks::new(),
        settings(),
    )
    .await
    .unwrap();

    (network, pair, relay)
}

/// Parallel lane a -> b verified by a beacon light client on b
pub async fn parallel_lane() -> (MockNetwork, LanePair, LaneRelay) {
    let network = two_chains();
    let lc_b = network.deploy_committee_light_client("b", "a").unwrap();
    let pair = network.open_parallel_lane("a", "b", lc_b).unwrap();

    let relay = LaneRelay::new(
        spec(&pair, LaneKind::Parallel),
        endpoint(&network, "a"),
        endpoint(&network, "b"),
        committee_tracker(&network, "b", "a", lc_b),
        None,
        HeaderSubmissionLocks::new(),
        settings(),
    )
    .await
    .unwrap();

    (network, pair, relay)
}

/// Parallel lane a -> b verified by signed commitments on b
pub async fn threshold_parallel_lane() -> (MockNetwork, LanePair, LaneRelay) {
    let network = two_chains();
    let committer_a = network.deploy_committer("a").unwrap();
    let lc_b = network.deploy_threshold_light_client("b", "a").unwrap();
    let pair = network.open_parallel_lane("a", "b", lc_b).unwrap();

    let relay = LaneRelay::new(
        spec(&pair, LaneKind::Parallel),
        endpoint(&network, "a").with_committer(committer_a),
        endpoint(&network, "b"),
        threshold_tracker(&network, "b", "a", lc_b, committer_a),
        None,
        HeaderSubmissionLocks::new(),
        settings(),
    )
    .await
    .unwrap();

    (network, pair, relay)
}

pub fn count(calls: &[String], method: &str) -> usize {
    calls.iter().filter(|m| *m == method).count()
}
