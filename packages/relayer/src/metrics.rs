//! Prometheus metrics for the lane relayer
//!
//! Exposed on `/metrics` by [`crate::api`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    pub static ref RELAY_CYCLES: CounterVec = register_counter_vec!(
        "relay_cycles_total",
        "Relay cycles run per lane",
        &["lane", "result"]
    ).expect("constant metric name is valid");

    pub static ref HEADER_UPDATES: CounterVec = register_counter_vec!(
        "relay_header_updates_total",
        "Light client header updates imported",
        &["chain"]
    ).expect("constant metric name is valid");

    pub static ref MESSAGES_DISPATCHED: CounterVec = register_counter_vec!(
        "relay_messages_dispatched_total",
        "Messages delivered to the target chain",
        &["lane"]
    ).expect("constant metric name is valid");

    pub static ref CONFIRMATIONS: CounterVec = register_counter_vec!(
        "relay_confirmations_total",
        "Delivery confirmations accepted by the source chain",
        &["lane"]
    ).expect("constant metric name is valid");

    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relay_errors_total",
        "Failed relay cycles by error kind",
        &["lane", "kind"]
    ).expect("constant metric name is valid");

    pub static ref LANE_STATE: GaugeVec = register_gauge_vec!(
        "relay_lane_state",
        "Current relay state (0 idle, 1 syncing header, 2 dispatching, 3 awaiting finality, 4 confirming)",
        &["lane"]
    ).expect("constant metric name is valid");

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "relay_consecutive_failures",
        "Consecutive failed cycles (circuit breaker)",
        &["lane"]
    ).expect("constant metric name is valid");

    pub static ref UP: Gauge = register_gauge!(
        "relay_up",
        "Whether the relayer is up and running"
    ).expect("constant metric name is valid");
}

pub fn record_cycle(lane: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    RELAY_CYCLES.with_label_values(&[lane, result]).inc();
}

pub fn record_header_update(chain: &str) {
    HEADER_UPDATES.with_label_values(&[chain]).inc();
}

pub fn record_dispatched(lane: &str, count: usize) {
    MESSAGES_DISPATCHED
        .with_label_values(&[lane])
        .inc_by(count as f64);
}

pub fn record_confirmation(lane: &str) {
    CONFIRMATIONS.with_label_values(&[lane]).inc();
}

/// Record a failed cycle under the error's kind label
pub fn record_error(lane: &str, kind: &str) {
    ERRORS.with_label_values(&[lane, kind]).inc();
}

pub fn set_lane_state(lane: &str, code: u8) {
    LANE_STATE.with_label_values(&[lane]).set(f64::from(code));
}

/// Update consecutive failures (circuit breaker)
pub fn set_consecutive_failures(lane: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[lane])
        .set(f64::from(count));
}
