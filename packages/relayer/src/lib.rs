//! Lane relayer
//!
//! Keeps message lanes between EVM chains moving: imports source headers
//! into the target's light client, delivers messages with proofs against
//! the imported state and confirms deliveries back to the source.
//!
//! Chain access, proofs and light-client tracking live in `bridge-rs`; this
//! crate holds configuration, the per-lane state machine
//! ([`orchestrator`]), the scheduler ([`manager`]), metrics and the HTTP API.

pub mod api;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod orchestrator;

pub use config::Config;
pub use manager::{CircuitBreakerConfig, LaneWorker, RelayManager};
pub use orchestrator::{
    ChainEndpoint, CycleReport, CycleSnapshot, HeaderSubmissionLocks, LaneKind, LaneRelay,
    LaneSpec, ProofStyle, RelaySettings, RelayState,
};
