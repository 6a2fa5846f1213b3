//! Proof codec
//!
//! Builds the proofs a destination contract verifies against the source
//! state it trusts:
//!
//! - [`storage`] - trie proofs of lane contract slots (`eth_getProof`)
//! - [`commitment`] - chain/lane committer merkle paths
//! - [`merkle`] - message inclusion in a parallel lane's tree
//!
//! Every proof is tagged with the source block it was built against and is
//! submitted at most once.

pub mod commitment;
pub mod merkle;
pub mod storage;

use alloy::primitives::{Bytes, B256};

pub use commitment::{build_commitment_proof, CommitmentProof, MessageProof};
pub use merkle::{build_inclusion_proof, verify_inclusion, IncrementalMerkleTree};
pub use storage::{
    build_delivery_proof, build_lane_root_proof, build_message_proof, DeliveryStorageProof,
    MessageStorageProof, ParallelLaneStorageProof,
};

/// Inclusion of one message in a parallel lane tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionProof {
    pub root: B256,
    pub index: u64,
    pub path: Vec<B256>,
}

/// Storage proofs by lane side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProof {
    Messages(MessageStorageProof),
    Delivery(DeliveryStorageProof),
    LaneRoot(ParallelLaneStorageProof),
}

/// Any proof the relay submits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proof {
    Storage(StorageProof),
    Commitment(CommitmentProof),
    Inclusion(InclusionProof),
}

impl Proof {
    /// Source block the proof was built against; `None` for inclusion proofs,
    /// which are relative to a lane root instead
    pub fn block_number(&self) -> Option<u64> {
        match self {
            Proof::Storage(StorageProof::Messages(p)) => Some(p.block_number),
            Proof::Storage(StorageProof::Delivery(p)) => Some(p.block_number),
            Proof::Storage(StorageProof::LaneRoot(p)) => Some(p.block_number),
            Proof::Commitment(p) => Some(p.block_number),
            Proof::Inclusion(_) => None,
        }
    }

    /// Wire encoding passed to the verifying contract
    pub fn encode(&self) -> Bytes {
        match self {
            Proof::Storage(StorageProof::Messages(p)) => p.encode(),
            Proof::Storage(StorageProof::Delivery(p)) => p.encode(),
            Proof::Storage(StorageProof::LaneRoot(p)) => p.encode(),
            Proof::Commitment(p) => p.encode(),
            Proof::Inclusion(p) => {
                use alloy::sol_types::SolValue;
                p.path.clone().abi_encode().into()
            }
        }
    }
}
