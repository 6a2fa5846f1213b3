//! bridge-rs: shared library for the message lane relayer
//!
//! Everything that is not orchestration lives here:
//!
//! - **Types** - lane ids, messages, nonce bookkeeping, block headers
//! - **Hash** - storage keys and message hashes matching the lane contracts
//! - **Lane** - pure nonce-range arithmetic
//! - **Proof** - storage proofs, commitment proofs, parallel lane merkle proofs
//! - **Light clients** - committee, epoch-authority and threshold trackers
//! - **Gateway** - chain, beacon node and authority signer access
//! - **Retry** - error classification driven backoff
//! - **Testing** - in-memory chain simulator
//!
//! ## Feature Flags
//!
//! - `testing` - enable the chain simulator for downstream tests

pub mod error;
pub mod gateway;
pub mod hash;
pub mod lane;
pub mod lightclient;
pub mod proof;
pub mod retry;
pub mod types;

// Simulator (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{ErrorClass, RelayError, RelayResult};
pub use gateway::{
    AuthoritySigner, BeaconApi, ChainGateway, ContractCall, LaneEvent, TxOptions, TxReceipt,
};
pub use lightclient::{
    ConsensusKind, FinalizedHeaderState, HeaderUpdate, LightClientHandle, LightClientTracker,
    SyncOutcome,
};
pub use proof::{Proof, StorageProof};
pub use retry::{with_retry, RetryConfig};
pub use types::{
    BlockHeader, BlockTag, InboundLaneData, InboundLaneNonce, LaneId, Message, MessagePayload,
    NonceRange, OutboundLaneData, OutboundLaneNonce,
};
