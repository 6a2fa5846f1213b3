//! Storage (trie) proofs of lane contract state
//!
//! Every builder issues a single `get_proof` call at the requested block so
//! that all slots come from the same state root.

use alloy::primitives::{Address, Bytes, B256};
use alloy::sol;
use alloy::sol_types::SolValue;
use tracing::debug;

use crate::error::{RelayError, RelayResult};
use crate::gateway::{AccountProof, ChainGateway};
use crate::hash::{
    message_key, relayer_keys, slot_key, LANE_IDENTIFY_SLOT, LANE_NONCE_SLOT, LANE_ROOT_SLOT,
};
use crate::types::NonceRange;

sol! {
    /// Outbound lane messages proof
    struct MessagesProof {
        bytes[] accountProof;
        bytes[] laneIDProof;
        bytes[] laneNonceProof;
        bytes[][] laneMessagesProof;
    }

    /// Inbound lane delivery proof
    struct MessagesDeliveryProof {
        bytes[] accountProof;
        bytes[] laneNonceProof;
        bytes[][] laneRelayersProof;
    }

    /// Parallel outbound lane root proof
    struct LaneRootProof {
        bytes[] accountProof;
        bytes[] laneRootProof;
    }
}

/// Proof of `[identity, nonce, message(begin..=end)]` of an outbound lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStorageProof {
    pub block_number: u64,
    pub range: NonceRange,
    pub account_proof: Vec<Bytes>,
    pub lane_id_proof: Vec<Bytes>,
    pub lane_nonce_proof: Vec<Bytes>,
    pub lane_messages_proof: Vec<Vec<Bytes>>,
}

impl MessageStorageProof {
    /// `abi.encode(tuple(bytes[],bytes[],bytes[],bytes[][]))`
    pub fn encode(&self) -> Bytes {
        MessagesProof {
            accountProof: self.account_proof.clone(),
            laneIDProof: self.lane_id_proof.clone(),
            laneNonceProof: self.lane_nonce_proof.clone(),
            laneMessagesProof: self.lane_messages_proof.clone(),
        }
        .abi_encode()
        .into()
    }
}

/// Proof of `[nonce, relayer(front..=back)]` of an inbound lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryStorageProof {
    pub block_number: u64,
    pub relayer_range: NonceRange,
    pub account_proof: Vec<Bytes>,
    pub lane_nonce_proof: Vec<Bytes>,
    /// Two entries per relayer record
    pub lane_relayers_proof: Vec<Vec<Bytes>>,
}

impl DeliveryStorageProof {
    /// `abi.encode(tuple(bytes[],bytes[],bytes[][]))`
    pub fn encode(&self) -> Bytes {
        MessagesDeliveryProof {
            accountProof: self.account_proof.clone(),
            laneNonceProof: self.lane_nonce_proof.clone(),
            laneRelayersProof: self.lane_relayers_proof.clone(),
        }
        .abi_encode()
        .into()
    }
}

/// Proof of a parallel outbound lane's merkle root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelLaneStorageProof {
    pub block_number: u64,
    /// The proven root value
    pub lane_root: B256,
    pub account_proof: Vec<Bytes>,
    pub lane_root_proof: Vec<Bytes>,
}

impl ParallelLaneStorageProof {
    /// `abi.encode(tuple(bytes[],bytes[]))`
    pub fn encode(&self) -> Bytes {
        LaneRootProof {
            accountProof: self.account_proof.clone(),
            laneRootProof: self.lane_root_proof.clone(),
        }
        .abi_encode()
        .into()
    }
}

fn slot_proof(proof: &AccountProof, key: B256, block: u64) -> RelayResult<Vec<Bytes>> {
    proof.slot(key).map(|p| p.proof.clone()).ok_or_else(|| {
        RelayError::InconsistentRead(format!(
            "proof for {} at block {} is missing slot {}",
            proof.address, block, key
        ))
    })
}

async fn fetch(
    gateway: &dyn ChainGateway,
    account: Address,
    keys: &[B256],
    block: u64,
) -> RelayResult<AccountProof> {
    let proof = gateway.get_proof(account, keys, block).await?;
    if proof.address != account {
        return Err(RelayError::InconsistentRead(format!(
            "requested proof for {}, got {}",
            account, proof.address
        )));
    }
    debug!(
        chain = gateway.name(),
        account = %account,
        block,
        keys = keys.len(),
        "Fetched storage proof"
    );
    Ok(proof)
}

/// Prove messages `range` of `outbound_lane` at `block`
pub async fn build_message_proof(
    gateway: &dyn ChainGateway,
    outbound_lane: Address,
    range: NonceRange,
    block: u64,
) -> RelayResult<MessageStorageProof> {
    if range.is_empty() {
        return Err(RelayError::InvalidInput(format!(
            "empty message range {}",
            range
        )));
    }

    let id_key = slot_key(LANE_IDENTIFY_SLOT);
    let nonce_key = slot_key(LANE_NONCE_SLOT);
    let message_keys: Vec<B256> = range.iter().map(message_key).collect();

    let mut keys = vec![id_key, nonce_key];
    keys.extend_from_slice(&message_keys);

    let proof = fetch(gateway, outbound_lane, &keys, block).await?;

    let lane_messages_proof = message_keys
        .iter()
        .map(|key| slot_proof(&proof, *key, block))
        .collect::<RelayResult<Vec<_>>>()?;

    Ok(MessageStorageProof {
        block_number: block,
        range,
        lane_id_proof: slot_proof(&proof, id_key, block)?,
        lane_nonce_proof: slot_proof(&proof, nonce_key, block)?,
        account_proof: proof.account_proof,
        lane_messages_proof,
    })
}

/// Prove relayer records `relayer_range` of `inbound_lane` at `block`
pub async fn build_delivery_proof(
    gateway: &dyn ChainGateway,
    inbound_lane: Address,
    relayer_range: NonceRange,
    block: u64,
) -> RelayResult<DeliveryStorageProof> {
    let nonce_key = slot_key(LANE_NONCE_SLOT);
    let relayer_keys: Vec<B256> = relayer_range.iter().flat_map(relayer_keys).collect();

    let mut keys = vec![nonce_key];
    keys.extend_from_slice(&relayer_keys);

    let proof = fetch(gateway, inbound_lane, &keys, block).await?;

    let lane_relayers_proof = relayer_keys
        .iter()
        .map(|key| slot_proof(&proof, *key, block))
        .collect::<RelayResult<Vec<_>>>()?;

    Ok(DeliveryStorageProof {
        block_number: block,
        relayer_range,
        lane_nonce_proof: slot_proof(&proof, nonce_key, block)?,
        account_proof: proof.account_proof,
        lane_relayers_proof,
    })
}

/// Prove the merkle root of a parallel outbound lane at `block`
pub async fn build_lane_root_proof(
    gateway: &dyn ChainGateway,
    outbound_lane: Address,
    block: u64,
) -> RelayResult<ParallelLaneStorageProof> {
    let root_key = slot_key(LANE_ROOT_SLOT);
    let proof = fetch(gateway, outbound_lane, &[root_key], block).await?;

    let slot = proof.slot(root_key).ok_or_else(|| {
        RelayError::InconsistentRead(format!("proof is missing lane root slot at {}", block))
    })?;

    Ok(ParallelLaneStorageProof {
        block_number: block,
        lane_root: B256::from(slot.value.to_be_bytes::<32>()),
        lane_root_proof: slot.proof.clone(),
        account_proof: proof.account_proof,
    })
}
