//! Simulated light clients and consensus data sources
//!
//! Signatures are not real BLS or ECDSA. A committee is identified by the
//! root over its keys and an authority signature is a deterministic function
//! of the commitment, which is enough to exercise every acceptance rule the
//! relay depends on.

use std::collections::BTreeMap;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use super::network::{MockNetwork, World, SLOTS_PER_PERIOD};
use crate::error::{RelayError, RelayResult};
use crate::gateway::{AuthoritySigner, BeaconApi};
use crate::hash::keccak256_concat;
use crate::lightclient::committee::{
    BeaconBlockHeader, Bootstrap, ExecutionPayloadHeader, FinalityUpdate, FinalizedHeaderUpdate,
    LightClientHeader, LightClientUpdate, SyncAggregate, SyncCommittee,
    SyncCommitteePeriodUpdate,
};
use crate::lightclient::epoch::check_header_chain;
use crate::lightclient::fork::period_of_slot;
use crate::lightclient::threshold::{Commitment, SignedCommitment};
use crate::lightclient::{ConsensusKind, ConsensusState, FinalizedHeaderState};
use crate::types::{BlockHeader, BlockTag};

const COMMITTEE_SIZE: u64 = 512;

/// What a destination light client lets lanes verify against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Anchor {
    /// Storage proofs of the source state after this block
    StateAt(u64),
    /// Commitment proofs against this chain committer root
    MessageRoot(B256),
}

#[derive(Debug, Clone)]
pub(crate) enum LightClientSim {
    Committee {
        source: String,
        finalized_slot: u64,
        block_number: u64,
        /// Known sync committee roots by period
        roots: BTreeMap<u64, B256>,
    },
    Epoch {
        source: String,
        checkpoint: u64,
        authorities_len: u64,
        epoch_gap: u64,
    },
    Threshold {
        source: String,
        committer: Address,
        block_number: u64,
        merkle_root: B256,
        nonce: u64,
    },
}

impl LightClientSim {
    pub fn kind(&self) -> ConsensusKind {
        match self {
            LightClientSim::Committee { .. } => ConsensusKind::Committee,
            LightClientSim::Epoch { .. } => ConsensusKind::EpochAuthority,
            LightClientSim::Threshold { .. } => ConsensusKind::Threshold,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            LightClientSim::Committee { source, .. }
            | LightClientSim::Epoch { source, .. }
            | LightClientSim::Threshold { source, .. } => source,
        }
    }

    pub fn state(&self) -> FinalizedHeaderState {
        match self {
            LightClientSim::Committee {
                finalized_slot,
                block_number,
                roots,
                ..
            } => {
                let period = period_of_slot(*finalized_slot);
                FinalizedHeaderState {
                    finalized_position: *finalized_slot,
                    execution_block_number: *block_number,
                    consensus: ConsensusState::Committee {
                        period,
                        sync_committee_root: roots.get(&period).copied().unwrap_or_default(),
                    },
                }
            }
            LightClientSim::Epoch {
                checkpoint,
                authorities_len,
                epoch_gap,
                ..
            } => FinalizedHeaderState {
                finalized_position: *checkpoint,
                execution_block_number: *checkpoint,
                consensus: ConsensusState::EpochAuthority {
                    authority_set_epoch: checkpoint / (*epoch_gap).max(1),
                    authorities_len: *authorities_len,
                },
            },
            LightClientSim::Threshold {
                block_number,
                merkle_root,
                nonce,
                ..
            } => FinalizedHeaderState {
                finalized_position: *block_number,
                execution_block_number: *block_number,
                consensus: ConsensusState::Threshold {
                    authority_nonce: *nonce,
                    message_root: *merkle_root,
                },
            },
        }
    }

    pub fn anchor(&self) -> Anchor {
        match self {
            LightClientSim::Committee { block_number, .. } => Anchor::StateAt(*block_number),
            LightClientSim::Epoch { checkpoint, .. } => Anchor::StateAt(*checkpoint),
            LightClientSim::Threshold { merkle_root, .. } => Anchor::MessageRoot(*merkle_root),
        }
    }

    /// Root of the sync committee of `period`, if imported
    pub fn sync_committee_root(&self, period: u64) -> Option<B256> {
        match self {
            LightClientSim::Committee { roots, .. } => roots.get(&period).copied(),
            _ => None,
        }
    }
}

// ============================================================================
// Committees and Signatures
// ============================================================================

/// Deterministic sync committee of `chain` for `period`
pub fn mock_committee(chain: &str, period: u64) -> SyncCommittee {
    let key = |tag: &[u8], index: u64| {
        let hash = keccak256_concat(&[
            chain.as_bytes(),
            tag,
            &period.to_be_bytes(),
            &index.to_be_bytes(),
        ]);
        let mut bytes = hash.to_vec();
        bytes.extend_from_slice(&hash[..16]);
        Bytes::from(bytes)
    };

    SyncCommittee {
        pubkeys: (0..COMMITTEE_SIZE).map(|i| key(b"pubkey", i)).collect(),
        aggregate_pubkey: key(b"aggregate", 0),
    }
}

pub fn committee_root(committee: &SyncCommittee) -> B256 {
    let mut parts: Vec<&[u8]> = committee.pubkeys.iter().map(|k| k.as_ref()).collect();
    parts.push(committee.aggregate_pubkey.as_ref());
    keccak256_concat(&parts)
}

/// Signature the simulated authority set produces over `commitment`
pub fn mock_signature(commitment: &Commitment) -> Bytes {
    let digest = keccak256_concat(&[
        &commitment.block_number.to_be_bytes(),
        commitment.message_root.as_slice(),
        &commitment.nonce.to_be_bytes(),
    ]);
    let mut signature = digest.to_vec();
    signature.extend_from_slice(digest.as_slice());
    signature.push(0x1b);
    Bytes::from(signature)
}

// ============================================================================
// Light Client Calls
// ============================================================================

fn light_client<'a>(
    world: &'a World,
    chain: &str,
    address: Address,
) -> Result<&'a LightClientSim, String> {
    world
        .chain(chain)
        .map_err(|e| e.to_string())?
        .state
        .light_clients
        .get(&address)
        .ok_or_else(|| format!("no light client {}", address))
}

fn light_client_mut<'a>(
    world: &'a mut World,
    chain: &str,
    address: Address,
) -> Result<&'a mut LightClientSim, String> {
    world
        .chain_mut(chain)
        .map_err(|e| e.to_string())?
        .state
        .light_clients
        .get_mut(&address)
        .ok_or_else(|| format!("no light client {}", address))
}

/// Signature committee must be the known committee of the finalized
/// header's period
fn check_signature_committee(
    roots: &BTreeMap<u64, B256>,
    update: &FinalizedHeaderUpdate,
) -> Result<(), String> {
    let period = period_of_slot(update.finalized_slot());
    let expected = roots
        .get(&period)
        .ok_or_else(|| format!("unknown sync committee for period {}", period))?;
    if committee_root(&update.signature_sync_committee) != *expected {
        return Err("invalid signature: committee mismatch".to_string());
    }
    Ok(())
}

/// `BeaconLightClient.import_finalized_header`
pub(crate) fn import_finalized_header(
    world: &mut World,
    chain: &str,
    address: Address,
    update: &FinalizedHeaderUpdate,
) -> Result<(), String> {
    let LightClientSim::Committee {
        source,
        finalized_slot,
        roots,
        ..
    } = light_client(world, chain, address)?
    else {
        return Err("invalid light client kind".to_string());
    };

    let slot = update.finalized_slot();
    if slot <= *finalized_slot {
        return Err(format!("!new: slot {} not after {}", slot, finalized_slot));
    }
    if !roots.contains_key(&update.signature_period()) {
        return Err(format!(
            "unknown sync committee for signature period {}",
            update.signature_period()
        ));
    }
    check_signature_committee(roots, update)?;

    let execution = &update.finalized_header.execution;
    let source = world.chain(source).map_err(|e| e.to_string())?;
    let block = source.block(execution.block_number).map_err(|e| e.to_string())?;
    if block.hash != execution.block_hash {
        return Err("invalid execution payload: block hash mismatch".to_string());
    }

    let number = execution.block_number;
    if let LightClientSim::Committee {
        finalized_slot,
        block_number,
        ..
    } = light_client_mut(world, chain, address)?
    {
        *finalized_slot = slot;
        *block_number = number;
    }
    Ok(())
}

/// `BeaconLightClient.import_next_sync_committee`
pub(crate) fn import_next_sync_committee(
    world: &mut World,
    chain: &str,
    address: Address,
    header_update: &FinalizedHeaderUpdate,
    committee_update: &SyncCommitteePeriodUpdate,
) -> Result<(), String> {
    let LightClientSim::Committee { source, roots, .. } = light_client(world, chain, address)?
    else {
        return Err("invalid light client kind".to_string());
    };

    check_signature_committee(roots, header_update)?;
    let period = period_of_slot(header_update.finalized_slot());
    if roots.contains_key(&(period + 1)) {
        return Err(format!(
            "sync committee for period {} already imported",
            period + 1
        ));
    }

    let next = &committee_update.next_sync_committee;
    if *next != mock_committee(source, period + 1) {
        return Err("invalid next sync committee branch".to_string());
    }
    let root = committee_root(next);

    if let LightClientSim::Committee { roots, .. } = light_client_mut(world, chain, address)? {
        roots.insert(period + 1, root);
    }
    Ok(())
}

/// `EpochLightClient.import_finalized_epoch_header`
pub(crate) fn import_epoch_headers(
    world: &mut World,
    chain: &str,
    address: Address,
    headers: &[BlockHeader],
) -> Result<(), String> {
    let LightClientSim::Epoch {
        source,
        checkpoint,
        authorities_len,
        epoch_gap,
    } = light_client(world, chain, address)?
    else {
        return Err("invalid light client kind".to_string());
    };

    let first = headers
        .first()
        .map(|h| h.number)
        .ok_or_else(|| "invalid headers: empty".to_string())?;
    if first <= *checkpoint {
        return Err(format!("!new: checkpoint {} not after {}", first, checkpoint));
    }
    if first != checkpoint + epoch_gap {
        return Err(format!(
            "invalid checkpoint {}: expected {}",
            first,
            checkpoint + epoch_gap
        ));
    }
    if headers.len() as u64 != authorities_len / 2 + 1 {
        return Err(format!(
            "invalid headers: {} given, {} required",
            headers.len(),
            authorities_len / 2 + 1
        ));
    }
    check_header_chain(headers, first).map_err(|e| format!("invalid headers: {}", e))?;

    let source = world.chain(source).map_err(|e| e.to_string())?;
    for header in headers {
        let canonical = source.block(header.number).map_err(|e| e.to_string())?;
        if canonical.hash != header.hash {
            return Err(format!("invalid signature on header {}", header.number));
        }
    }

    if let LightClientSim::Epoch { checkpoint, .. } = light_client_mut(world, chain, address)? {
        *checkpoint = first;
    }
    Ok(())
}

/// `EcdsaLightClient.import_message_commitment`
pub(crate) fn import_message_commitment(
    world: &mut World,
    chain: &str,
    address: Address,
    signed: &SignedCommitment,
) -> Result<(), String> {
    let LightClientSim::Threshold {
        source,
        committer,
        block_number,
        nonce,
        ..
    } = light_client(world, chain, address)?
    else {
        return Err("invalid light client kind".to_string());
    };

    let commitment = &signed.commitment;
    if commitment.block_number <= *block_number {
        return Err(format!(
            "!new: commitment at {} not after {}",
            commitment.block_number, block_number
        ));
    }
    if commitment.nonce != *nonce {
        return Err(format!(
            "invalid nonce {}: expected {}",
            commitment.nonce, nonce
        ));
    }
    let expected = mock_signature(commitment);
    if signed.signatures.is_empty() || signed.signatures.iter().any(|s| *s != expected) {
        return Err("invalid signature".to_string());
    }

    let source_name = source.clone();
    let committer = *committer;
    let source = world.chain(&source_name).map_err(|e| e.to_string())?;
    if source.committer != Some(committer) {
        return Err("invalid committer".to_string());
    }
    let root = source
        .state_at(BlockTag::Number(commitment.block_number))
        .map_err(|e| e.to_string())?
        .committer()
        .root();
    if root != commitment.message_root {
        return Err("invalid message root".to_string());
    }

    if let LightClientSim::Threshold {
        block_number,
        merkle_root,
        nonce,
        ..
    } = light_client_mut(world, chain, address)?
    {
        *block_number = commitment.block_number;
        *merkle_root = commitment.message_root;
        *nonce += 1;
    }
    *world.authority_nonces.entry(source_name).or_insert(0) += 1;
    Ok(())
}

// ============================================================================
// Beacon Node
// ============================================================================

/// Beacon light-client API of one simulated chain.
///
/// Execution block `n` sits at beacon slot `offset + n`.
pub struct MockBeacon {
    network: MockNetwork,
    chain: String,
}

fn light_client_header(slot: u64, block: &BlockHeader) -> LightClientHeader {
    LightClientHeader {
        beacon: BeaconBlockHeader {
            slot,
            proposer_index: slot % COMMITTEE_SIZE,
            parent_root: B256::from(U256::from(slot.saturating_sub(1))),
            state_root: block.state_root,
            body_root: block.hash,
        },
        execution: ExecutionPayloadHeader {
            parent_hash: block.parent_hash,
            fee_recipient: block.coinbase,
            state_root: block.state_root,
            receipts_root: block.receipts_root,
            logs_bloom: block.logs_bloom.clone(),
            block_number: block.number,
            gas_limit: block.gas_limit,
            gas_used: block.gas_used,
            timestamp: block.timestamp,
            extra_data: Bytes::new(),
            block_hash: block.hash,
            transactions_root: block.transactions_root,
            ..Default::default()
        },
        execution_branch: vec![B256::ZERO; 4],
    }
}

fn sync_aggregate() -> SyncAggregate {
    SyncAggregate {
        sync_committee_bits: Bytes::from(vec![0xffu8; 64]),
        sync_committee_signature: Bytes::from(vec![0xaau8; 96]),
    }
}

impl MockBeacon {
    pub(crate) fn new(network: MockNetwork, chain: &str) -> Self {
        Self {
            network,
            chain: chain.to_string(),
        }
    }

    /// Fail on an injected fault, otherwise run `f` on the world
    fn read<T>(&self, method: &str, f: impl FnOnce(&World) -> RelayResult<T>) -> RelayResult<T> {
        let mut world = self.network.lock();
        if let Some(error) = world.take_fault(&self.chain, method) {
            return Err(error);
        }
        f(&world)
    }
}

#[async_trait]
impl BeaconApi for MockBeacon {
    async fn get_finality_update(&self) -> RelayResult<FinalityUpdate> {
        self.read("get_finality_update", |world| {
            let chain = world.chain(&self.chain)?;
            let block = chain.block(chain.finalized())?;
            let slot = world.slot_offset(&self.chain) + block.number;
            let header = light_client_header(slot, block);
            Ok(FinalityUpdate {
                attested_header: header.clone(),
                finalized_header: header,
                finality_branch: vec![B256::ZERO; 6],
                sync_aggregate: sync_aggregate(),
                signature_slot: slot + 1,
            })
        })
    }

    async fn get_sync_committee_period_update(
        &self,
        period: u64,
    ) -> RelayResult<LightClientUpdate> {
        self.read("get_sync_committee_period_update", |world| {
            let chain = world.chain(&self.chain)?;
            let offset = world.slot_offset(&self.chain);
            let current = period_of_slot(offset + chain.finalized());
            if period > current {
                return Err(RelayError::MissingDependency(format!(
                    "no sync committee update for period {} (current {})",
                    period, current
                )));
            }

            let slot = period * SLOTS_PER_PERIOD + 1;
            let block = chain.block(slot.saturating_sub(offset).min(chain.finalized()))?;
            let header = light_client_header(slot, block);
            Ok(LightClientUpdate {
                attested_header: header.clone(),
                next_sync_committee: mock_committee(&self.chain, period + 1),
                next_sync_committee_branch: vec![B256::ZERO; 5],
                finalized_header: header,
                finality_branch: vec![B256::ZERO; 6],
                sync_aggregate: sync_aggregate(),
                signature_slot: slot + 1,
            })
        })
    }

    async fn get_bootstrap(&self, block_root: B256) -> RelayResult<Bootstrap> {
        self.read("get_bootstrap", |world| {
            let slot: u64 = U256::from_be_bytes(block_root.0)
                .try_into()
                .map_err(|_| RelayError::MissingDependency(format!("unknown block root {}", block_root)))?;
            let chain = world.chain(&self.chain)?;
            let offset = world.slot_offset(&self.chain);
            let block = chain.block(slot.saturating_sub(offset).min(chain.head()))?;
            Ok(Bootstrap {
                header: light_client_header(slot, block),
                current_sync_committee: mock_committee(&self.chain, period_of_slot(slot)),
                current_sync_committee_branch: vec![B256::ZERO; 5],
            })
        })
    }

    async fn get_beacon_block_root(&self, slot: u64) -> RelayResult<B256> {
        self.read("get_beacon_block_root", |_| Ok(B256::from(U256::from(slot))))
    }
}

// ============================================================================
// Authority Signer
// ============================================================================

/// Authority set of one simulated chain
pub struct MockAuthority {
    network: MockNetwork,
    chain: String,
}

impl MockAuthority {
    pub(crate) fn new(network: MockNetwork, chain: &str) -> Self {
        Self {
            network,
            chain: chain.to_string(),
        }
    }
}

#[async_trait]
impl AuthoritySigner for MockAuthority {
    async fn authority_nonce(&self, _block_hash: B256) -> RelayResult<u64> {
        let mut world = self.network.lock();
        if let Some(error) = world.take_fault(&self.chain, "authority_nonce") {
            return Err(error);
        }
        Ok(world.authority_nonces.get(&self.chain).copied().unwrap_or(0))
    }

    async fn sign_commitment(&self, commitment: &Commitment) -> RelayResult<Vec<Bytes>> {
        let mut world = self.network.lock();
        if let Some(error) = world.take_fault(&self.chain, "sign_commitment") {
            return Err(error);
        }
        if world.withheld_signatures.contains(&self.chain) {
            return Ok(Vec::new());
        }
        Ok(vec![mock_signature(commitment)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_committee_is_deterministic() {
        let a = mock_committee("a", 10);
        assert_eq!(a.pubkeys.len(), 512);
        assert!(a.pubkeys.iter().all(|k| k.len() == 48));
        assert_eq!(committee_root(&a), committee_root(&mock_committee("a", 10)));
        assert_ne!(committee_root(&a), committee_root(&mock_committee("a", 11)));
        assert_ne!(committee_root(&a), committee_root(&mock_committee("b", 10)));
    }

    #[test]
    fn test_threshold_state_and_anchor() {
        let lc = LightClientSim::Threshold {
            source: "a".to_string(),
            committer: Address::ZERO,
            block_number: 7,
            merkle_root: B256::repeat_byte(3),
            nonce: 2,
        };
        assert_eq!(lc.kind(), ConsensusKind::Threshold);
        assert_eq!(lc.anchor(), Anchor::MessageRoot(B256::repeat_byte(3)));
        assert_eq!(
            lc.state().consensus,
            ConsensusState::Threshold {
                authority_nonce: 2,
                message_root: B256::repeat_byte(3)
            }
        );
    }

    #[tokio::test]
    async fn test_bootstrap_round_trips_block_root() {
        let network = MockNetwork::new();
        network.add_chain("a", 1);
        let beacon = network.beacon("a");

        let slot = 3 * SLOTS_PER_PERIOD + 5;
        let root = beacon.get_beacon_block_root(slot).await.unwrap();
        let bootstrap = beacon.get_bootstrap(root).await.unwrap();
        assert_eq!(bootstrap.header.beacon.slot, slot);
        assert_eq!(bootstrap.current_sync_committee, mock_committee("a", 3));
    }

    #[tokio::test]
    async fn test_future_period_update_is_missing() {
        let network = MockNetwork::new();
        network.add_chain("a", 1);
        let beacon = network.beacon("a");

        let finality = beacon.get_finality_update().await.unwrap();
        let current = period_of_slot(finality.finalized_header.beacon.slot);
        assert!(beacon.get_sync_committee_period_update(current).await.is_ok());
        assert!(matches!(
            beacon.get_sync_committee_period_update(current + 1).await,
            Err(RelayError::MissingDependency(_))
        ));
    }
}
