//! In-memory chain simulator
//!
//! Stands in for real chains, beacon nodes and authority signers so the
//! relay can be driven end to end in tests.
//!
//! ## Submodules
//!
//! - `network` - shared world: chains, blocks, state snapshots, fault injection
//! - `chain` - `ChainGateway` over one simulated chain
//! - `lanes` - ordered and parallel lane contracts with proof verification
//! - `consensus` - light client contracts, beacon node and authority signer

pub mod chain;
pub mod consensus;
pub mod lanes;
pub mod network;

pub use chain::MockChain;
pub use consensus::{committee_root, mock_committee, mock_signature, MockAuthority, MockBeacon};
pub use network::{CallRecord, LanePair, MockNetwork, RELAYER, SLOTS_PER_PERIOD};
