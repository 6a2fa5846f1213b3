//! In-memory multi-chain world
//!
//! Each chain keeps its block headers and a snapshot of all contract state
//! after every block, so reads and storage proofs can be served at any
//! historical height. Every successful transaction mines exactly one block.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use alloy::primitives::{address, Address, Bytes, B256, U256};

use super::chain::MockChain;
use super::consensus::{committee_root, mock_committee, LightClientSim, MockAuthority, MockBeacon};
use super::lanes::{
    inbound_commitment, outbound_commitment, InboundLaneSim, OutboundLaneSim,
    ParallelInboundSim, ParallelOutboundSim, Remote,
};
use crate::error::{RelayError, RelayResult};
use crate::hash::keccak256_concat;
use crate::lightclient::fork::{period_of_slot, EPOCHS_PER_SYNC_COMMITTEE_PERIOD, SLOTS_PER_EPOCH};
use crate::proof::commitment::{MessageProof, SingleProof};
use crate::proof::merkle::IncrementalMerkleTree;
use crate::types::{
    BlockHeader, BlockTag, InboundLaneNonce, LaneId, Message, MessagePayload, OutboundLaneNonce,
};

/// Account every simulated transaction is sent from
pub const RELAYER: Address = address!("5252525252525252525252525252525252525252");

pub const SLOTS_PER_PERIOD: u64 = SLOTS_PER_EPOCH * EPOCHS_PER_SYNC_COMMITTEE_PERIOD;

/// Beacon slot of execution block 0 until shifted by a test
pub const DEFAULT_SLOT_OFFSET: u64 = 10 * SLOTS_PER_PERIOD;

// ============================================================================
// Contract State
// ============================================================================

/// All contract state of one chain at one block
#[derive(Debug, Clone, Default)]
pub(crate) struct Contracts {
    pub outbound: BTreeMap<Address, OutboundLaneSim>,
    pub inbound: BTreeMap<Address, InboundLaneSim>,
    pub parallel_outbound: BTreeMap<Address, ParallelOutboundSim>,
    pub parallel_inbound: BTreeMap<Address, ParallelInboundSim>,
    pub light_clients: BTreeMap<Address, LightClientSim>,
}

impl Contracts {
    /// Storage word of `account` at `key`; `None` for unknown accounts
    pub fn storage(&self, account: Address, key: B256) -> Option<U256> {
        if let Some(lane) = self.outbound.get(&account) {
            return Some(lane.storage(key));
        }
        if let Some(lane) = self.inbound.get(&account) {
            return Some(lane.storage(key));
        }
        if let Some(lane) = self.parallel_outbound.get(&account) {
            return Some(lane.storage(key));
        }
        if self.parallel_inbound.contains_key(&account)
            || self.light_clients.contains_key(&account)
        {
            return Some(U256::ZERO);
        }
        None
    }

    /// Chain committer over lane commitments: one lane committer per bridged
    /// chain position, leaves indexed by lane position. A parallel lane
    /// commits to its merkle root.
    pub fn committer(&self) -> CommitterTree {
        let mut leaves: BTreeMap<u32, BTreeMap<u32, B256>> = BTreeMap::new();
        for lane in self.outbound.values() {
            leaves
                .entry(lane.lane_id.bridged_chain_position)
                .or_default()
                .insert(lane.lane_id.this_lane_position, outbound_commitment(&lane.data()));
        }
        for lane in self.inbound.values() {
            leaves
                .entry(lane.lane_id.bridged_chain_position)
                .or_default()
                .insert(lane.lane_id.this_lane_position, inbound_commitment(&lane.data()));
        }
        for lane in self.parallel_outbound.values() {
            leaves
                .entry(lane.lane_id.bridged_chain_position)
                .or_default()
                .insert(lane.lane_id.this_lane_position, lane.tree.root());
        }

        let mut lane_trees = BTreeMap::new();
        for (chain_position, lanes) in leaves {
            let width = lanes.keys().max().map(|p| p + 1).unwrap_or(0);
            let tree = IncrementalMerkleTree::from_leaves(
                (0..width).map(|p| lanes.get(&p).copied().unwrap_or(B256::ZERO)),
            );
            lane_trees.insert(chain_position, tree);
        }

        let width = lane_trees.keys().max().map(|p| p + 1).unwrap_or(0);
        let chain_tree = IncrementalMerkleTree::from_leaves((0..width).map(|p| {
            lane_trees
                .get(&p)
                .map(IncrementalMerkleTree::root)
                .unwrap_or(B256::ZERO)
        }));

        CommitterTree {
            chain_tree,
            lane_trees,
        }
    }
}

pub(crate) struct CommitterTree {
    chain_tree: IncrementalMerkleTree,
    lane_trees: BTreeMap<u32, IncrementalMerkleTree>,
}

impl CommitterTree {
    pub fn root(&self) -> B256 {
        self.chain_tree.root()
    }

    pub fn prove(&self, chain_position: u32, lane_position: u32) -> RelayResult<MessageProof> {
        let lanes = self.lane_trees.get(&chain_position).ok_or_else(|| {
            RelayError::InvalidInput(format!("no lane committer at position {}", chain_position))
        })?;
        let leaf = lanes
            .leaves()
            .get(lane_position as usize)
            .copied()
            .ok_or_else(|| {
                RelayError::InvalidInput(format!("no lane at position {}", lane_position))
            })?;

        Ok(MessageProof {
            chain_proof: SingleProof {
                root: lanes.root(),
                proof: self.chain_tree.proof(chain_position as u64)?,
            },
            lane_proof: SingleProof {
                root: leaf,
                proof: lanes.proof(lane_position as u64)?,
            },
        })
    }
}

// ============================================================================
// Chains
// ============================================================================

pub(crate) struct ChainState {
    pub name: String,
    pub position: u32,
    pub finality_lag: u64,
    pub committer: Option<Address>,
    pub blocks: Vec<BlockHeader>,
    /// `snapshots[n]` is the state after block `n`
    pub snapshots: Vec<Contracts>,
    /// Live state, equal to the last snapshot between transactions
    pub state: Contracts,
    next_lane_position: u32,
}

fn mock_header(chain: &str, number: u64, parent_hash: B256) -> BlockHeader {
    BlockHeader {
        hash: keccak256_concat(&[chain.as_bytes(), b"block", &number.to_be_bytes()]),
        parent_hash,
        state_root: keccak256_concat(&[chain.as_bytes(), b"state", &number.to_be_bytes()]),
        logs_bloom: Bytes::from(vec![0u8; 256]),
        number,
        gas_limit: 30_000_000,
        timestamp: 1_700_000_000 + number * 12,
        ..Default::default()
    }
}

impl ChainState {
    fn new(name: &str, position: u32) -> Self {
        Self {
            name: name.to_string(),
            position,
            finality_lag: 0,
            committer: None,
            blocks: vec![mock_header(name, 0, B256::ZERO)],
            snapshots: vec![Contracts::default()],
            state: Contracts::default(),
            next_lane_position: 0,
        }
    }

    pub fn head(&self) -> u64 {
        (self.blocks.len() - 1) as u64
    }

    pub fn finalized(&self) -> u64 {
        self.head().saturating_sub(self.finality_lag)
    }

    pub fn resolve(&self, tag: BlockTag) -> RelayResult<u64> {
        match tag {
            BlockTag::Latest => Ok(self.head()),
            BlockTag::Finalized => Ok(self.finalized()),
            BlockTag::Number(n) if n <= self.head() => Ok(n),
            BlockTag::Number(n) => Err(RelayError::MissingDependency(format!(
                "{}: block {} beyond head {}",
                self.name,
                n,
                self.head()
            ))),
        }
    }

    pub fn block(&self, number: u64) -> RelayResult<&BlockHeader> {
        self.blocks.get(number as usize).ok_or_else(|| {
            RelayError::MissingDependency(format!("{}: no block {}", self.name, number))
        })
    }

    pub fn state_at(&self, tag: BlockTag) -> RelayResult<&Contracts> {
        let number = self.resolve(tag)?;
        self.snapshots.get(number as usize).ok_or_else(|| {
            RelayError::MissingDependency(format!("{}: no state at {}", self.name, number))
        })
    }

    /// Seal the live state into a new block
    pub fn mine(&mut self) -> u64 {
        let number = self.head() + 1;
        let parent = self.blocks[self.blocks.len() - 1].hash;
        self.blocks.push(mock_header(&self.name, number, parent));
        self.snapshots.push(self.state.clone());
        number
    }

    fn allocate_lane_position(&mut self) -> u32 {
        let position = self.next_lane_position;
        self.next_lane_position += 1;
        position
    }
}

// ============================================================================
// World
// ============================================================================

/// A submission attempt seen by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub chain: String,
    pub method: String,
    pub success: bool,
}

struct Fault {
    chain: String,
    method: String,
    error: RelayError,
    remaining: Option<u32>,
}

#[derive(Default)]
pub(crate) struct World {
    pub chains: BTreeMap<String, ChainState>,
    /// Beacon slot of execution block 0, per chain
    pub slot_offsets: BTreeMap<String, u64>,
    /// Nonce the authority set of a chain expects next
    pub authority_nonces: BTreeMap<String, u64>,
    /// Chains whose authority set currently returns no signatures
    pub withheld_signatures: BTreeSet<String>,
    pub calls: Vec<CallRecord>,
    faults: Vec<Fault>,
    next_address: u64,
}

impl World {
    pub fn chain(&self, name: &str) -> RelayResult<&ChainState> {
        self.chains
            .get(name)
            .ok_or_else(|| RelayError::InvalidInput(format!("unknown chain '{}'", name)))
    }

    pub fn chain_mut(&mut self, name: &str) -> RelayResult<&mut ChainState> {
        self.chains
            .get_mut(name)
            .ok_or_else(|| RelayError::InvalidInput(format!("unknown chain '{}'", name)))
    }

    pub fn slot_offset(&self, chain: &str) -> u64 {
        self.slot_offsets
            .get(chain)
            .copied()
            .unwrap_or(DEFAULT_SLOT_OFFSET)
    }

    /// Consume a matching injected fault, if any
    pub fn take_fault(&mut self, chain: &str, method: &str) -> Option<RelayError> {
        let index = self
            .faults
            .iter()
            .position(|f| f.chain == chain && f.method == method)?;
        let error = self.faults[index].error.clone();
        match self.faults[index].remaining {
            Some(n) if n <= 1 => {
                self.faults.remove(index);
            }
            Some(n) => self.faults[index].remaining = Some(n - 1),
            None => {}
        }
        Some(error)
    }

    fn allocate_address(&mut self) -> Address {
        self.next_address += 1;
        let mut bytes = [0u8; 20];
        bytes[0] = 0xc0;
        bytes[12..].copy_from_slice(&self.next_address.to_be_bytes());
        Address::from(bytes)
    }
}

// ============================================================================
// Network Handle
// ============================================================================

/// Addresses of a freshly opened lane pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanePair {
    /// Coordinates of the outbound side
    pub lane_id: LaneId,
    pub outbound: Address,
    pub inbound: Address,
}

/// Shared handle to the simulated chains
#[derive(Clone, Default)]
pub struct MockNetwork {
    world: Arc<Mutex<World>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a chain at `position` and return its gateway
    pub fn add_chain(&self, name: &str, position: u32) -> MockChain {
        self.lock()
            .chains
            .insert(name.to_string(), ChainState::new(name, position));
        self.chain(name)
    }

    pub fn chain(&self, name: &str) -> MockChain {
        MockChain::new(self.clone(), name)
    }

    pub fn beacon(&self, chain: &str) -> MockBeacon {
        MockBeacon::new(self.clone(), chain)
    }

    pub fn authority(&self, chain: &str) -> MockAuthority {
        MockAuthority::new(self.clone(), chain)
    }

    pub fn set_finality_lag(&self, chain: &str, lag: u64) -> RelayResult<()> {
        self.lock().chain_mut(chain)?.finality_lag = lag;
        Ok(())
    }

    /// Mine `blocks` empty blocks
    pub fn mine(&self, chain: &str, blocks: u64) -> RelayResult<u64> {
        let mut world = self.lock();
        let state = world.chain_mut(chain)?;
        for _ in 0..blocks {
            state.mine();
        }
        Ok(state.head())
    }

    pub fn head(&self, chain: &str) -> RelayResult<u64> {
        Ok(self.lock().chain(chain)?.head())
    }

    /// Move the beacon chain of `chain` forward by whole sync committee periods
    pub fn advance_beacon_periods(&self, chain: &str, periods: u64) {
        let mut world = self.lock();
        let offset = world.slot_offset(chain) + periods * SLOTS_PER_PERIOD;
        world.slot_offsets.insert(chain.to_string(), offset);
    }

    /// Fail the next `times` calls of `method` on `chain` (every call when
    /// `None`). `method` is a contract call name or a gateway read name.
    pub fn inject_fault(&self, chain: &str, method: &str, error: RelayError, times: Option<u32>) {
        self.lock().faults.push(Fault {
            chain: chain.to_string(),
            method: method.to_string(),
            error,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Hand the authority set of `chain` over to a new nonce without telling
    /// any light client
    pub fn rotate_authorities(&self, chain: &str) {
        *self
            .lock()
            .authority_nonces
            .entry(chain.to_string())
            .or_insert(0) += 1;
    }

    /// Make the authority set of `chain` sign nothing until released
    pub fn withhold_signatures(&self, chain: &str, withheld: bool) {
        let mut world = self.lock();
        if withheld {
            world.withheld_signatures.insert(chain.to_string());
        } else {
            world.withheld_signatures.remove(chain);
        }
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Methods successfully submitted to `chain`, in order
    pub fn submitted(&self, chain: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.chain == chain && c.success)
            .map(|c| c.method.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Deployment
    // ------------------------------------------------------------------

    pub fn deploy_committer(&self, chain: &str) -> RelayResult<Address> {
        let mut world = self.lock();
        let address = world.allocate_address();
        let state = world.chain_mut(chain)?;
        state.committer = Some(address);
        state.mine();
        Ok(address)
    }

    /// Beacon light client on `host` tracking `source`, initialised at the
    /// source's current finalized block
    pub fn deploy_committee_light_client(&self, host: &str, source: &str) -> RelayResult<Address> {
        let mut world = self.lock();
        let address = world.allocate_address();
        let finalized = world.chain(source)?.finalized();
        let slot = world.slot_offset(source) + finalized;
        let period = period_of_slot(slot);

        let mut roots = BTreeMap::new();
        roots.insert(period, committee_root(&mock_committee(source, period)));

        let state = world.chain_mut(host)?;
        state.state.light_clients.insert(
            address,
            LightClientSim::Committee {
                source: source.to_string(),
                finalized_slot: slot,
                block_number: finalized,
                roots,
            },
        );
        state.mine();
        Ok(address)
    }

    /// Epoch light client on `host` tracking `source`, checkpointed at block 0
    pub fn deploy_epoch_light_client(
        &self,
        host: &str,
        source: &str,
        epoch_gap: u64,
        authorities_len: u64,
    ) -> RelayResult<Address> {
        let mut world = self.lock();
        let address = world.allocate_address();
        world.chain(source)?;
        let state = world.chain_mut(host)?;
        state.state.light_clients.insert(
            address,
            LightClientSim::Epoch {
                source: source.to_string(),
                checkpoint: 0,
                authorities_len,
                epoch_gap,
            },
        );
        state.mine();
        Ok(address)
    }

    /// Threshold light client on `host` verifying commitments of `source`'s
    /// chain committer
    pub fn deploy_threshold_light_client(&self, host: &str, source: &str) -> RelayResult<Address> {
        let mut world = self.lock();
        let address = world.allocate_address();
        let committer = world.chain(source)?.committer.ok_or_else(|| {
            RelayError::InvalidInput(format!("{} has no chain committer", source))
        })?;
        world.authority_nonces.entry(source.to_string()).or_insert(0);

        let state = world.chain_mut(host)?;
        state.state.light_clients.insert(
            address,
            LightClientSim::Threshold {
                source: source.to_string(),
                committer,
                block_number: 0,
                merkle_root: B256::ZERO,
                nonce: 0,
            },
        );
        state.mine();
        Ok(address)
    }

    /// Open an ordered lane `source -> target`.
    ///
    /// `light_client` is hosted on `target` and tracks `source`;
    /// `reverse_light_client` is hosted on `source` and tracks `target`.
    pub fn open_lane(
        &self,
        source: &str,
        target: &str,
        light_client: Address,
        reverse_light_client: Address,
    ) -> RelayResult<LanePair> {
        let mut world = self.lock();
        let outbound = world.allocate_address();
        let inbound = world.allocate_address();

        let (source_position, source_lane) = {
            let chain = world.chain_mut(source)?;
            (chain.position, chain.allocate_lane_position())
        };
        let (target_position, target_lane) = {
            let chain = world.chain_mut(target)?;
            (chain.position, chain.allocate_lane_position())
        };

        let lane_id = LaneId::new(source_position, source_lane, target_position, target_lane);

        let chain = world.chain_mut(source)?;
        chain.state.outbound.insert(
            outbound,
            OutboundLaneSim::new(
                lane_id,
                Remote {
                    chain: target.to_string(),
                    lane: inbound,
                    light_client: reverse_light_client,
                },
            ),
        );
        chain.mine();

        let chain = world.chain_mut(target)?;
        chain.state.inbound.insert(
            inbound,
            InboundLaneSim::new(
                lane_id.counterpart(),
                Remote {
                    chain: source.to_string(),
                    lane: outbound,
                    light_client,
                },
            ),
        );
        chain.mine();

        Ok(LanePair {
            lane_id,
            outbound,
            inbound,
        })
    }

    /// Open a parallel lane `source -> target` verified by `light_client`
    /// on `target`
    pub fn open_parallel_lane(
        &self,
        source: &str,
        target: &str,
        light_client: Address,
    ) -> RelayResult<LanePair> {
        let mut world = self.lock();
        let outbound = world.allocate_address();
        let inbound = world.allocate_address();

        let (source_position, source_lane) = {
            let chain = world.chain_mut(source)?;
            (chain.position, chain.allocate_lane_position())
        };
        let (target_position, target_lane) = {
            let chain = world.chain_mut(target)?;
            (chain.position, chain.allocate_lane_position())
        };
        let lane_id = LaneId::new(source_position, source_lane, target_position, target_lane);

        let chain = world.chain_mut(source)?;
        chain
            .state
            .parallel_outbound
            .insert(outbound, ParallelOutboundSim::new(lane_id));
        chain.mine();

        let chain = world.chain_mut(target)?;
        chain.state.parallel_inbound.insert(
            inbound,
            ParallelInboundSim::new(
                lane_id.counterpart(),
                Remote {
                    chain: source.to_string(),
                    lane: outbound,
                    light_client,
                },
            ),
        );
        chain.mine();

        Ok(LanePair {
            lane_id,
            outbound,
            inbound,
        })
    }

    // ------------------------------------------------------------------
    // User actions
    // ------------------------------------------------------------------

    /// Send a message through an ordered outbound lane (one block)
    pub fn send_message(
        &self,
        chain: &str,
        outbound: Address,
        payload: MessagePayload,
    ) -> RelayResult<Message> {
        let mut world = self.lock();
        let state = world.chain_mut(chain)?;
        let lane = state.state.outbound.get_mut(&outbound).ok_or_else(|| {
            RelayError::InvalidInput(format!("no outbound lane {} on {}", outbound, chain))
        })?;
        let message = lane.send(payload);
        state.mine();
        Ok(message)
    }

    /// Send a message through a parallel outbound lane (one block)
    pub fn send_parallel_message(
        &self,
        chain: &str,
        outbound: Address,
        payload: MessagePayload,
    ) -> RelayResult<Message> {
        let mut world = self.lock();
        let state = world.chain_mut(chain)?;
        let lane = state.state.parallel_outbound.get_mut(&outbound).ok_or_else(|| {
            RelayError::InvalidInput(format!("no parallel lane {} on {}", outbound, chain))
        })?;
        let message = lane.send(payload);
        state.mine();
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn outbound_nonce(&self, chain: &str, lane: Address) -> RelayResult<OutboundLaneNonce> {
        let world = self.lock();
        world
            .chain(chain)?
            .state
            .outbound
            .get(&lane)
            .map(OutboundLaneSim::nonce)
            .ok_or_else(|| RelayError::InvalidInput(format!("no outbound lane {}", lane)))
    }

    pub fn inbound_nonce(&self, chain: &str, lane: Address) -> RelayResult<InboundLaneNonce> {
        let world = self.lock();
        world
            .chain(chain)?
            .state
            .inbound
            .get(&lane)
            .map(InboundLaneSim::nonce)
            .ok_or_else(|| RelayError::InvalidInput(format!("no inbound lane {}", lane)))
    }

    /// Encoded keys dispatched by an inbound lane (ordered or parallel), in
    /// execution order
    pub fn dispatched(&self, chain: &str, lane: Address) -> RelayResult<Vec<U256>> {
        let world = self.lock();
        let state = &world.chain(chain)?.state;
        if let Some(inbound) = state.inbound.get(&lane) {
            return Ok(inbound.dispatched.clone());
        }
        state
            .parallel_inbound
            .get(&lane)
            .map(|l| l.dispatched.clone())
            .ok_or_else(|| RelayError::InvalidInput(format!("no inbound lane {}", lane)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mining_links_headers_and_snapshots() {
        let network = MockNetwork::new();
        network.add_chain("a", 0);
        assert_eq!(network.mine("a", 3).unwrap(), 3);

        let world = network.lock();
        let chain = world.chain("a").unwrap();
        assert_eq!(chain.snapshots.len(), 4);
        for n in 1..=3 {
            assert_eq!(chain.blocks[n].parent_hash, chain.blocks[n - 1].hash);
        }
    }

    #[test]
    fn test_fault_is_consumed() {
        let network = MockNetwork::new();
        network.inject_fault(
            "a",
            "get_proof",
            RelayError::TransportFailure("connection reset".into()),
            Some(1),
        );

        let mut world = network.lock();
        assert!(world.take_fault("a", "get_proof").is_some());
        assert!(world.take_fault("a", "get_proof").is_none());
    }

    #[test]
    fn test_lane_positions_are_distinct() {
        let network = MockNetwork::new();
        network.add_chain("a", 1);
        network.add_chain("b", 2);
        let first = network
            .open_lane("a", "b", Address::ZERO, Address::ZERO)
            .unwrap();
        let second = network
            .open_lane("b", "a", Address::ZERO, Address::ZERO)
            .unwrap();

        assert_eq!(first.lane_id, LaneId::new(1, 0, 2, 0));
        assert_eq!(second.lane_id, LaneId::new(2, 1, 1, 1));
        assert_ne!(first.outbound, second.inbound);
    }
}
