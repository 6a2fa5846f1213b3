//! Lane worker bookkeeping, circuit breaker and shutdown

mod common;

use std::sync::Arc;
use std::time::Duration;

use bridge_rs::error::RelayError;
use bridge_rs::types::MessagePayload;
use bridge_rs::RetryConfig;
use lane_relayer::api::SharedHealth;
use lane_relayer::{CircuitBreakerConfig, LaneWorker};
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

use common::*;

const POLL: Duration = Duration::from_millis(10);

fn retry() -> RetryConfig {
    RetryConfig::new(3, Duration::from_millis(5))
}

#[tokio::test]
async fn test_failures_are_counted_and_reset() {
    let (network, pair, relay) = committee_lane().await;
    network
        .send_message("a", pair.outbound, MessagePayload::default())
        .unwrap();
    network.inject_fault(
        "b",
        "import_finalized_header",
        RelayError::TransportFailure("timeout".into()),
        None,
    );

    let health: SharedHealth = Arc::default();
    let mut worker = LaneWorker::new(relay, POLL, retry(), health.clone());

    assert_err!(worker.run_once().await);
    assert_err!(worker.run_once().await);
    assert_eq!(worker.consecutive_failures(), 2);
    {
        let lanes = health.read().await;
        let lane = &lanes["a-b"];
        assert_eq!(lane.consecutive_failures, 2);
        assert_eq!(lane.cycles, 2);
        assert!(lane.last_error.as_deref().unwrap().contains("timeout"));
        assert!(!lane.circuit_open);
    }

    network.clear_faults();
    let report = assert_ok!(worker.run_once().await);
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(worker.consecutive_failures(), 0);

    let lanes = health.read().await;
    let lane = &lanes["a-b"];
    assert_eq!(lane.consecutive_failures, 0);
    assert_eq!(lane.messages_dispatched, 1);
    assert_eq!(lane.last_error, None);
    assert_eq!(lane.state, "idle");
}

#[tokio::test]
async fn test_circuit_opens_at_threshold() {
    let (network, pair, relay) = committee_lane().await;
    network
        .send_message("a", pair.outbound, MessagePayload::default())
        .unwrap();
    network.inject_fault(
        "b",
        "import_finalized_header",
        RelayError::TransportFailure("timeout".into()),
        None,
    );

    let health: SharedHealth = Arc::default();
    let mut worker = LaneWorker::new(relay, POLL, retry(), health.clone()).with_circuit_breaker(
        CircuitBreakerConfig {
            threshold: 1,
            pause_duration: Duration::from_secs(60),
        },
    );

    assert!(!worker.circuit_open());
    assert_err!(worker.run_once().await);
    assert!(worker.circuit_open());
    assert!(health.read().await["a-b"].circuit_open);
}

#[tokio::test]
async fn test_worker_relays_until_shutdown() {
    let (network, pair, relay) = committee_lane().await;
    let message = network
        .send_message("a", pair.outbound, MessagePayload::default())
        .unwrap();

    let health: SharedHealth = Arc::default();
    let worker = LaneWorker::new(relay, POLL, retry(), health.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let outbound = network.outbound_nonce("a", pair.outbound).unwrap();
            if outbound.latest_received_nonce == 1 {
                break;
            }
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    assert_ok!(delivered);
    assert_eq!(
        network.dispatched("b", pair.inbound).unwrap(),
        vec![message.encoded_key]
    );

    shutdown_tx.send(true).unwrap();
    let stopped = tokio::time::timeout(Duration::from_secs(5), handle).await;
    let joined = assert_ok!(stopped);
    assert_ok!(assert_ok!(joined));
    assert!(health.read().await["a-b"].cycles >= 1);
}
