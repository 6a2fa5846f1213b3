//! Simulated lane contracts
//!
//! Storage layout mirrors the slots the proof codec reads:
//!
//! ```text
//! slot 0              lane identity (encoded key of nonce 0)
//! slot 1              outbound: received << 64 | generated
//!                     inbound:  confirmed << 192 | delivered << 128 | front << 64 | back
//!                     parallel outbound: merkle root
//! message_key(n)      outbound: message hash of nonce n
//! relayer_keys(i)     inbound: [relayer, begin << 64 | end]
//! ```
//!
//! Storage proofs are one self-describing node per slot; verification
//! re-reads the source snapshot at the trusted block.

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::SolValue;

use super::consensus::Anchor;
use super::network::{ChainState, Contracts, World, RELAYER};
use crate::gateway::{contracts, LaneEvent};
use crate::hash::{
    message_key, relayer_keys, slot_key, LANE_IDENTIFY_SLOT, LANE_NONCE_SLOT, LANE_ROOT_SLOT,
};
use crate::lane::check_outbound_data;
use crate::proof::commitment::MessageProof;
use crate::proof::merkle::{verify_inclusion, IncrementalMerkleTree};
use crate::proof::storage::{LaneRootProof, MessagesDeliveryProof, MessagesProof};
use crate::types::{
    DeliveredMessages, InboundLaneData, InboundLaneNonce, LaneId, Message, MessagePayload,
    OutboundLaneData, OutboundLaneNonce, UnrewardedRelayer,
};

sol! {
    struct MockTrieNode {
        string chain;
        address account;
        uint64 block;
        bytes32 key;
        bytes32 value;
    }
}

/// The other side of a lane and the light client that verifies it
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Remote {
    pub chain: String,
    pub lane: Address,
    pub light_client: Address,
}

fn word(value: u64) -> U256 {
    U256::from(value)
}

fn b256_word(value: B256) -> U256 {
    U256::from_be_bytes(value.0)
}

fn address_word(value: Address) -> U256 {
    U256::from_be_slice(value.as_slice())
}

// ============================================================================
// Ordered Lanes
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct OutboundLaneSim {
    pub lane_id: LaneId,
    pub latest_received: u64,
    pub latest_generated: u64,
    /// Messages not yet confirmed, by nonce
    pub messages: BTreeMap<u64, Message>,
    pub remote: Remote,
}

impl OutboundLaneSim {
    pub fn new(lane_id: LaneId, remote: Remote) -> Self {
        Self {
            lane_id,
            latest_received: 0,
            latest_generated: 0,
            messages: BTreeMap::new(),
            remote,
        }
    }

    pub fn send(&mut self, payload: MessagePayload) -> Message {
        self.latest_generated += 1;
        let message = Message::new(&self.lane_id, self.latest_generated, payload);
        self.messages.insert(self.latest_generated, message.clone());
        message
    }

    pub fn nonce(&self) -> OutboundLaneNonce {
        OutboundLaneNonce {
            latest_received_nonce: self.latest_received,
            latest_generated_nonce: self.latest_generated,
        }
    }

    pub fn data(&self) -> OutboundLaneData {
        OutboundLaneData {
            latest_received_nonce: self.latest_received,
            messages: self.messages.values().cloned().collect(),
        }
    }

    pub fn storage(&self, key: B256) -> U256 {
        if key == slot_key(LANE_IDENTIFY_SLOT) {
            return self.lane_id.encoded_key(0);
        }
        if key == slot_key(LANE_NONCE_SLOT) {
            return (word(self.latest_received) << 64) | word(self.latest_generated);
        }
        self.messages
            .iter()
            .find(|(nonce, _)| message_key(**nonce) == key)
            .map(|(_, message)| b256_word(message.hash()))
            .unwrap_or(U256::ZERO)
    }

    /// Accept a proven delivery record
    fn confirm(&mut self, data: &InboundLaneData) -> Result<Vec<LaneEvent>, String> {
        let delivered = data.last_delivered_nonce;
        if delivered <= self.latest_received {
            return Err(format!(
                "!new: delivery up to {} already confirmed",
                delivered
            ));
        }
        if delivered > self.latest_generated {
            return Err(format!(
                "invalid delivery: {} beyond generated {}",
                delivered, self.latest_generated
            ));
        }

        let begin = self.latest_received + 1;
        self.latest_received = delivered;
        self.messages.retain(|nonce, _| *nonce > delivered);
        Ok(vec![LaneEvent::MessagesDelivered {
            begin,
            end: delivered,
        }])
    }
}

#[derive(Debug, Clone)]
pub(crate) struct InboundLaneSim {
    pub lane_id: LaneId,
    pub last_confirmed: u64,
    pub last_delivered: u64,
    /// Unrewarded relayer records, indexed `front..=back`
    pub relayers: BTreeMap<u64, UnrewardedRelayer>,
    pub front: u64,
    pub back: u64,
    pub dispatched: Vec<U256>,
    pub remote: Remote,
}

impl InboundLaneSim {
    pub fn new(lane_id: LaneId, remote: Remote) -> Self {
        Self {
            lane_id,
            last_confirmed: 0,
            last_delivered: 0,
            relayers: BTreeMap::new(),
            front: 1,
            back: 0,
            dispatched: Vec::new(),
            remote,
        }
    }

    pub fn nonce(&self) -> InboundLaneNonce {
        InboundLaneNonce {
            last_confirmed_nonce: self.last_confirmed,
            last_delivered_nonce: self.last_delivered,
            relayer_range_front: self.front,
            relayer_range_back: self.back,
        }
    }

    pub fn data(&self) -> InboundLaneData {
        InboundLaneData {
            relayers: self.relayers.values().cloned().collect(),
            last_confirmed_nonce: self.last_confirmed,
            last_delivered_nonce: self.last_delivered,
        }
    }

    pub fn storage(&self, key: B256) -> U256 {
        if key == slot_key(LANE_IDENTIFY_SLOT) {
            return self.lane_id.encoded_key(0);
        }
        if key == slot_key(LANE_NONCE_SLOT) {
            return (word(self.last_confirmed) << 192)
                | (word(self.last_delivered) << 128)
                | (word(self.front) << 64)
                | word(self.back);
        }
        for (index, record) in &self.relayers {
            let [first, second] = relayer_keys(*index);
            if key == first {
                return address_word(record.relayer);
            }
            if key == second {
                return (word(record.messages.begin) << 64) | word(record.messages.end);
            }
        }
        U256::ZERO
    }

    /// Drop relayer records the source has confirmed
    fn prune(&mut self, latest_received: u64) -> Result<(), String> {
        if latest_received <= self.last_confirmed {
            return Ok(());
        }
        if latest_received > self.last_delivered {
            return Err(format!(
                "invalid received nonce {} beyond delivered {}",
                latest_received, self.last_delivered
            ));
        }

        while self.front <= self.back {
            let Some(record) = self.relayers.get_mut(&self.front) else {
                break;
            };
            if record.messages.end <= latest_received {
                self.relayers.remove(&self.front);
                self.front += 1;
            } else {
                record.messages.begin = record.messages.begin.max(latest_received + 1);
                break;
            }
        }
        self.last_confirmed = latest_received;
        Ok(())
    }

    /// Dispatch the undelivered suffix of a proven batch
    fn deliver(
        &mut self,
        data: &OutboundLaneData,
        message_count: u64,
        relayer: Address,
    ) -> Result<Vec<LaneEvent>, String> {
        if message_count != data.messages.len() as u64 {
            return Err(format!(
                "invalid delivery size {} for {} messages",
                message_count,
                data.messages.len()
            ));
        }
        let range = data.range();
        check_outbound_data(data, range).map_err(|e| format!("invalid batch: {}", e))?;
        if data.messages.iter().any(|m| m.lane() != self.lane_id.counterpart()) {
            return Err("invalid batch: message from another lane".to_string());
        }

        self.prune(data.latest_received_nonce)?;

        if range.is_empty() || range.end <= self.last_delivered {
            return Err(format!(
                "!new: messages up to {} already delivered",
                self.last_delivered
            ));
        }
        if range.begin > self.last_delivered + 1 {
            return Err(format!(
                "nonce gap: batch starts at {}, last delivered {}",
                range.begin, self.last_delivered
            ));
        }

        let first = self.last_delivered + 1;
        let mut events = Vec::new();
        for message in data.messages.iter().filter(|m| m.nonce() >= first) {
            self.dispatched.push(message.encoded_key);
            events.push(LaneEvent::MessageDispatched {
                encoded_key: message.encoded_key,
                dispatch_result: true,
            });
        }

        self.last_delivered = range.end;
        self.back += 1;
        self.relayers.insert(
            self.back,
            UnrewardedRelayer {
                relayer,
                messages: DeliveredMessages {
                    begin: first,
                    end: range.end,
                },
            },
        );
        Ok(events)
    }
}

// ============================================================================
// Parallel Lanes
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct ParallelOutboundSim {
    pub lane_id: LaneId,
    pub tree: IncrementalMerkleTree,
    pub messages: Vec<Message>,
}

impl ParallelOutboundSim {
    pub fn new(lane_id: LaneId) -> Self {
        Self {
            lane_id,
            tree: IncrementalMerkleTree::new(),
            messages: Vec::new(),
        }
    }

    /// Leaf index is the message nonce
    pub fn send(&mut self, payload: MessagePayload) -> Message {
        let message = Message::new(&self.lane_id, self.tree.len(), payload);
        self.tree.append(message.hash());
        self.messages.push(message.clone());
        message
    }

    pub fn storage(&self, key: B256) -> U256 {
        if key == slot_key(LANE_ROOT_SLOT) {
            return b256_word(self.tree.root());
        }
        U256::ZERO
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ParallelInboundSim {
    pub lane_id: LaneId,
    pub dones: BTreeSet<B256>,
    pub dispatched: Vec<U256>,
    pub remote: Remote,
}

impl ParallelInboundSim {
    pub fn new(lane_id: LaneId, remote: Remote) -> Self {
        Self {
            lane_id,
            dones: BTreeSet::new(),
            dispatched: Vec::new(),
            remote,
        }
    }
}

// ============================================================================
// Commitments and Proof Nodes
// ============================================================================

pub(crate) fn outbound_commitment(data: &OutboundLaneData) -> B256 {
    keccak256(contracts::OutboundLaneData::from(data).abi_encode())
}

pub(crate) fn inbound_commitment(data: &InboundLaneData) -> B256 {
    keccak256(contracts::InboundLaneData::from(data).abi_encode())
}

pub(crate) fn trie_node(chain: &str, account: Address, block: u64, key: B256, value: U256) -> Bytes {
    MockTrieNode {
        chain: chain.to_string(),
        account,
        block,
        key,
        value: B256::from(value.to_be_bytes::<32>()),
    }
    .abi_encode()
    .into()
}

fn decode_node(
    source: &ChainState,
    nodes: &[Bytes],
    account: Address,
    block: u64,
    key: B256,
) -> Result<MockTrieNode, String> {
    let node = nodes
        .first()
        .ok_or_else(|| "invalid proof: empty node list".to_string())?;
    let node = MockTrieNode::abi_decode(node, true)
        .map_err(|_| "invalid proof: malformed node".to_string())?;

    if node.chain != source.name || node.account != account || node.block != block || node.key != key
    {
        return Err(format!(
            "invalid proof: node for {}/{} at {} does not match {}/{} at {}",
            node.chain, node.account, node.block, source.name, account, block
        ));
    }
    Ok(node)
}

fn snapshot(source: &ChainState, block: u64) -> Result<&Contracts, String> {
    source
        .snapshots
        .get(block as usize)
        .ok_or_else(|| format!("invalid proof: no source state at {}", block))
}

/// Check a single-slot proof against the source snapshot at `block`
fn proven_value(
    source: &ChainState,
    nodes: &[Bytes],
    account: Address,
    block: u64,
    key: B256,
) -> Result<U256, String> {
    let node = decode_node(source, nodes, account, block, key)?;
    let actual = snapshot(source, block)?
        .storage(account, key)
        .ok_or_else(|| format!("invalid proof: no account {}", account))?;

    if b256_word(node.value) != actual {
        return Err("invalid proof: value not in trusted state".to_string());
    }
    Ok(actual)
}

/// Account nodes carry a zero key and only attest that the account exists
fn check_account(
    source: &ChainState,
    nodes: &[Bytes],
    account: Address,
    block: u64,
) -> Result<(), String> {
    decode_node(source, nodes, account, block, B256::ZERO)?;
    snapshot(source, block)?
        .storage(account, B256::ZERO)
        .map(|_| ())
        .ok_or_else(|| format!("invalid proof: no account {}", account))
}

fn trusted_anchor(world: &World, chain: &str, remote: &Remote) -> Result<Anchor, String> {
    world
        .chain(chain)
        .map_err(|e| e.to_string())?
        .state
        .light_clients
        .get(&remote.light_client)
        .map(|lc| lc.anchor())
        .ok_or_else(|| format!("invalid light client {}", remote.light_client))
}

fn source_chain<'a>(world: &'a World, remote: &Remote) -> Result<&'a ChainState, String> {
    world.chain(&remote.chain).map_err(|e| e.to_string())
}

// ============================================================================
// Lane Calls
// ============================================================================

/// `InboundLane.receive_messages_proof`
pub(crate) fn receive_messages_proof(
    world: &mut World,
    chain: &str,
    inbound: Address,
    data: &OutboundLaneData,
    proof: &Bytes,
    message_count: u64,
) -> Result<Vec<LaneEvent>, String> {
    let lane = world
        .chain(chain)
        .map_err(|e| e.to_string())?
        .state
        .inbound
        .get(&inbound)
        .cloned()
        .ok_or_else(|| format!("no inbound lane {}", inbound))?;

    match trusted_anchor(world, chain, &lane.remote)? {
        Anchor::StateAt(block) => {
            let source = source_chain(world, &lane.remote)?;
            let proof = MessagesProof::abi_decode(proof, true)
                .map_err(|_| "invalid proof: malformed messages proof".to_string())?;
            let outbound = lane.remote.lane;

            check_account(source, &proof.accountProof, outbound, block)?;

            let identity = proven_value(
                source,
                &proof.laneIDProof,
                outbound,
                block,
                slot_key(LANE_IDENTIFY_SLOT),
            )?;
            if identity != lane.lane_id.counterpart().encoded_key(0) {
                return Err("invalid proof: lane identity mismatch".to_string());
            }

            let nonce = proven_value(
                source,
                &proof.laneNonceProof,
                outbound,
                block,
                slot_key(LANE_NONCE_SLOT),
            )?;
            if nonce.as_limbs()[1] != data.latest_received_nonce {
                return Err("invalid proof: latest received nonce mismatch".to_string());
            }

            if proof.laneMessagesProof.len() != data.messages.len() {
                return Err("invalid proof: message proof count mismatch".to_string());
            }
            for (message, nodes) in data.messages.iter().zip(&proof.laneMessagesProof) {
                let stored = proven_value(source, nodes, outbound, block, message_key(message.nonce()))?;
                if stored != b256_word(message.hash()) {
                    return Err(format!(
                        "invalid proof: message {} not in trusted state",
                        message.nonce()
                    ));
                }
            }
        }
        Anchor::MessageRoot(root) => {
            let proof = MessageProof::decode(proof)
                .map_err(|_| "invalid proof: malformed message proof".to_string())?;
            if proof.lane_proof.root != outbound_commitment(data) {
                return Err("invalid proof: lane commitment mismatch".to_string());
            }
            if !proof.verify(
                root,
                lane.lane_id.this_chain_position,
                lane.lane_id.bridged_lane_position,
            ) {
                return Err("invalid proof: commitment path does not reach root".to_string());
            }
        }
    }

    let state = &mut world.chain_mut(chain).map_err(|e| e.to_string())?.state;
    let lane = state
        .inbound
        .get_mut(&inbound)
        .ok_or_else(|| format!("no inbound lane {}", inbound))?;
    lane.deliver(data, message_count, RELAYER)
}

/// `OutboundLane.receive_messages_delivery_proof`
pub(crate) fn receive_messages_delivery_proof(
    world: &mut World,
    chain: &str,
    outbound: Address,
    data: &InboundLaneData,
    proof: &Bytes,
) -> Result<Vec<LaneEvent>, String> {
    let lane = world
        .chain(chain)
        .map_err(|e| e.to_string())?
        .state
        .outbound
        .get(&outbound)
        .cloned()
        .ok_or_else(|| format!("no outbound lane {}", outbound))?;

    match trusted_anchor(world, chain, &lane.remote)? {
        Anchor::StateAt(block) => {
            let target = source_chain(world, &lane.remote)?;
            let proof = MessagesDeliveryProof::abi_decode(proof, true)
                .map_err(|_| "invalid proof: malformed delivery proof".to_string())?;
            let inbound = lane.remote.lane;

            check_account(target, &proof.accountProof, inbound, block)?;

            let nonce = proven_value(
                target,
                &proof.laneNonceProof,
                inbound,
                block,
                slot_key(LANE_NONCE_SLOT),
            )?;
            let limbs = nonce.as_limbs();
            let (back, front, delivered, confirmed) = (limbs[0], limbs[1], limbs[2], limbs[3]);
            if delivered != data.last_delivered_nonce || confirmed != data.last_confirmed_nonce {
                return Err("invalid proof: inbound nonce mismatch".to_string());
            }

            let records = (back + 1).saturating_sub(front);
            if data.relayers.len() as u64 != records
                || proof.laneRelayersProof.len() as u64 != records * 2
            {
                return Err("invalid proof: relayer record count mismatch".to_string());
            }

            for (i, (index, relayer)) in (front..=back).zip(&data.relayers).enumerate() {
                let [first, second] = relayer_keys(index);
                let who = proven_value(target, &proof.laneRelayersProof[2 * i], inbound, block, first)?;
                let span =
                    proven_value(target, &proof.laneRelayersProof[2 * i + 1], inbound, block, second)?;
                let expected_span =
                    (word(relayer.messages.begin) << 64) | word(relayer.messages.end);
                if who != address_word(relayer.relayer) || span != expected_span {
                    return Err(format!("invalid proof: relayer record {} mismatch", index));
                }
            }
        }
        Anchor::MessageRoot(root) => {
            let proof = MessageProof::decode(proof)
                .map_err(|_| "invalid proof: malformed message proof".to_string())?;
            if proof.lane_proof.root != inbound_commitment(data) {
                return Err("invalid proof: lane commitment mismatch".to_string());
            }
            if !proof.verify(
                root,
                lane.lane_id.this_chain_position,
                lane.lane_id.bridged_lane_position,
            ) {
                return Err("invalid proof: commitment path does not reach root".to_string());
            }
        }
    }

    let state = &mut world.chain_mut(chain).map_err(|e| e.to_string())?.state;
    let lane = state
        .outbound
        .get_mut(&outbound)
        .ok_or_else(|| format!("no outbound lane {}", outbound))?;
    lane.confirm(data)
}

/// `ParallelInboundLane.receive_message`
pub(crate) fn receive_message(
    world: &mut World,
    chain: &str,
    inbound: Address,
    lane_root: B256,
    lane_proof: &Bytes,
    message: &Message,
    message_proof: &[B256],
) -> Result<Vec<LaneEvent>, String> {
    let lane = world
        .chain(chain)
        .map_err(|e| e.to_string())?
        .state
        .parallel_inbound
        .get(&inbound)
        .cloned()
        .ok_or_else(|| format!("no parallel inbound lane {}", inbound))?;

    match trusted_anchor(world, chain, &lane.remote)? {
        Anchor::StateAt(block) => {
            let source = source_chain(world, &lane.remote)?;
            let proof = LaneRootProof::abi_decode(lane_proof, true)
                .map_err(|_| "invalid proof: malformed lane root proof".to_string())?;
            check_account(source, &proof.accountProof, lane.remote.lane, block)?;
            let root = proven_value(
                source,
                &proof.laneRootProof,
                lane.remote.lane,
                block,
                slot_key(LANE_ROOT_SLOT),
            )?;
            if root != b256_word(lane_root) {
                return Err("invalid proof: lane root mismatch".to_string());
            }
        }
        Anchor::MessageRoot(root) => {
            let proof = MessageProof::decode(lane_proof)
                .map_err(|_| "invalid proof: malformed message proof".to_string())?;
            if proof.lane_proof.root != lane_root {
                return Err("invalid proof: lane root mismatch".to_string());
            }
            if !proof.verify(
                root,
                lane.lane_id.this_chain_position,
                lane.lane_id.bridged_lane_position,
            ) {
                return Err("invalid proof: commitment path does not reach root".to_string());
            }
        }
    }

    if message.lane() != lane.lane_id.counterpart() {
        return Err("invalid message: wrong lane".to_string());
    }
    let hash = message.hash();
    if !verify_inclusion(lane_root, hash, message.nonce(), message_proof) {
        return Err("invalid proof: message not in lane root".to_string());
    }
    if lane.dones.contains(&hash) {
        return Err(format!("message {} already dispatched", message.nonce()));
    }

    let state = &mut world.chain_mut(chain).map_err(|e| e.to_string())?.state;
    let lane = state
        .parallel_inbound
        .get_mut(&inbound)
        .ok_or_else(|| format!("no parallel inbound lane {}", inbound))?;
    lane.dones.insert(hash);
    lane.dispatched.push(message.encoded_key);
    Ok(vec![LaneEvent::MessageDispatched {
        encoded_key: message.encoded_key,
        dispatch_result: true,
    }])
}
