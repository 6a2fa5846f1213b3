//! Hierarchical commitment proofs
//!
//! A chain committer commits to one lane committer per bridged chain, and
//! each lane committer commits to its lanes:
//!
//! ```text
//! chain root
//! └── lane committer root   (leaf `bridged_chain_position`)
//!     └── lane commitment   (leaf `lane_position`)
//! ```
//!
//! The proof and the root it is checked against must come from the same
//! block. Both paths are verified locally before anything is submitted.

use alloy::primitives::{Address, Bytes, B256};
use alloy::sol;
use alloy::sol_types::SolValue;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};
use crate::gateway::ChainGateway;
use crate::proof::merkle::compute_root;
use crate::types::BlockTag;

sol! {
    struct MessageSingleProof {
        bytes32 root;
        bytes32[] proof;
    }

    struct SolMessageProof {
        MessageSingleProof chainProof;
        MessageSingleProof laneProof;
    }
}

/// A leaf (`root`) and its sibling path
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SingleProof {
    pub root: B256,
    pub proof: Vec<B256>,
}

/// Result of `ChainMessageCommitter.prove(chainPos, lanePos)`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageProof {
    /// Lane committer root and its path to the chain root
    pub chain_proof: SingleProof,
    /// Lane commitment and its path to the lane committer root
    pub lane_proof: SingleProof,
}

impl MessageProof {
    /// `abi.encode(tuple(tuple(bytes32,bytes32[]),tuple(bytes32,bytes32[])))`
    pub fn encode(&self) -> Bytes {
        self.to_sol().abi_encode().into()
    }

    pub fn to_sol(&self) -> SolMessageProof {
        SolMessageProof {
            chainProof: MessageSingleProof {
                root: self.chain_proof.root,
                proof: self.chain_proof.proof.clone(),
            },
            laneProof: MessageSingleProof {
                root: self.lane_proof.root,
                proof: self.lane_proof.proof.clone(),
            },
        }
    }

    pub fn from_sol(proof: SolMessageProof) -> Self {
        Self {
            chain_proof: SingleProof {
                root: proof.chainProof.root,
                proof: proof.chainProof.proof,
            },
            lane_proof: SingleProof {
                root: proof.laneProof.root,
                proof: proof.laneProof.proof,
            },
        }
    }

    pub fn decode(data: &[u8]) -> RelayResult<Self> {
        let proof = SolMessageProof::abi_decode(data, true)
            .map_err(|e| RelayError::InvalidInput(format!("message proof: {}", e)))?;
        Ok(Self::from_sol(proof))
    }

    /// Both paths lead to `chain_root`
    pub fn verify(&self, chain_root: B256, chain_position: u32, lane_position: u32) -> bool {
        let lane_committer_root = compute_root(
            self.lane_proof.root,
            lane_position as u64,
            &self.lane_proof.proof,
        );
        if lane_committer_root != self.chain_proof.root {
            return false;
        }
        compute_root(
            self.chain_proof.root,
            chain_position as u64,
            &self.chain_proof.proof,
        ) == chain_root
    }
}

/// A message proof together with the root and block it was checked at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentProof {
    pub block_number: u64,
    pub chain_root: B256,
    pub proof: MessageProof,
}

impl CommitmentProof {
    pub fn encode(&self) -> Bytes {
        self.proof.encode()
    }
}

/// Read `commitment()` and `prove()` at `block` and cross-check them.
///
/// A mismatch is re-read up to `max_reads` times in total, then reported as
/// `InconsistentRead`.
pub async fn build_commitment_proof(
    gateway: &dyn ChainGateway,
    chain_committer: Address,
    bridged_chain_position: u32,
    lane_position: u32,
    block: u64,
    max_reads: u32,
) -> RelayResult<CommitmentProof> {
    let at = BlockTag::Number(block);
    let mut last_error = None;

    for attempt in 1..=max_reads.max(1) {
        let chain_root = gateway.commitment(chain_committer, at).await?;
        let proof = gateway
            .prove_commitment(chain_committer, bridged_chain_position, lane_position, at)
            .await?;

        match check(&proof, chain_root, bridged_chain_position, lane_position) {
            Ok(()) => {
                debug!(
                    chain = gateway.name(),
                    block,
                    chain_root = %chain_root,
                    "Built commitment proof"
                );
                return Ok(CommitmentProof {
                    block_number: block,
                    chain_root,
                    proof,
                });
            }
            Err(e) => {
                warn!(attempt, block, error = %e, "Commitment proof does not match root, re-reading");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        RelayError::InconsistentRead(format!("no commitment proof read at {}", block))
    }))
}

fn check(
    proof: &MessageProof,
    chain_root: B256,
    chain_position: u32,
    lane_position: u32,
) -> RelayResult<()> {
    let lane_committer_root =
        compute_root(proof.lane_proof.root, lane_position as u64, &proof.lane_proof.proof);
    if lane_committer_root != proof.chain_proof.root {
        return Err(RelayError::InconsistentRead(format!(
            "lane path yields {}, chain proof leaf is {}",
            lane_committer_root, proof.chain_proof.root
        )));
    }

    let computed = compute_root(
        proof.chain_proof.root,
        chain_position as u64,
        &proof.chain_proof.proof,
    );
    if computed != chain_root {
        return Err(RelayError::InconsistentRead(format!(
            "proof yields chain root {}, commitment() returned {}",
            computed, chain_root
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::keccak256_concat;
    use crate::proof::merkle::IncrementalMerkleTree;

    fn leaf(tag: u8) -> B256 {
        keccak256_concat(&[&[tag]])
    }

    fn sample() -> (B256, MessageProof) {
        // lane committer with 3 lanes, chain committer with 2 bridged chains
        let lanes = IncrementalMerkleTree::from_leaves([leaf(1), leaf(2), leaf(3)]);
        let chains = IncrementalMerkleTree::from_leaves([leaf(9), lanes.root()]);

        let proof = MessageProof {
            chain_proof: SingleProof {
                root: lanes.root(),
                proof: chains.proof(1).unwrap(),
            },
            lane_proof: SingleProof {
                root: leaf(3),
                proof: lanes.proof(2).unwrap(),
            },
        };
        (chains.root(), proof)
    }

    #[test]
    fn test_verify_hierarchical_proof() {
        let (root, proof) = sample();
        assert!(proof.verify(root, 1, 2));
        assert!(!proof.verify(root, 0, 2));
        assert!(!proof.verify(root, 1, 1));
        assert!(check(&proof, root, 1, 2).is_ok());
        assert!(matches!(
            check(&proof, leaf(0), 1, 2),
            Err(RelayError::InconsistentRead(_))
        ));
    }

    #[test]
    fn test_encode_decode() {
        let (_, proof) = sample();
        let decoded = MessageProof::decode(&proof.encode()).unwrap();
        assert_eq!(decoded, proof);
    }
}
