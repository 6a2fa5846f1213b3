//! Lane, committer and light client contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings, plus conversions
//! between the generated types and the library's own types.

#![allow(clippy::too_many_arguments)]

use alloy::primitives::{Bytes, U256};
use alloy::sol;

use crate::error::{RelayError, RelayResult};
use crate::lightclient::committee as beacon;
use crate::lightclient::threshold;
use crate::types as domain;

sol! {
    // ------------------------------------------------------------------
    // Lanes
    // ------------------------------------------------------------------

    struct MessagePayload {
        address source;
        address target;
        bytes encoded;
    }

    struct Message {
        uint256 encoded_key;
        MessagePayload payload;
    }

    struct OutboundLaneData {
        uint64 latest_received_nonce;
        Message[] messages;
    }

    struct DeliveredMessages {
        uint64 begin;
        uint64 end;
    }

    struct UnrewardedRelayer {
        address relayer;
        DeliveredMessages messages;
    }

    struct InboundLaneData {
        UnrewardedRelayer[] relayers;
        uint64 last_confirmed_nonce;
        uint64 last_delivered_nonce;
    }

    /// Source side of an ordered lane
    #[sol(rpc)]
    contract OutboundLane {
        function getLaneInfo() external view returns (uint32, uint32, uint32, uint32);
        function outboundLaneNonce() external view returns (uint64 latest_received_nonce, uint64 latest_generated_nonce);
        function data() external view returns (OutboundLaneData memory);
        function receive_messages_delivery_proof(InboundLaneData calldata inboundLaneData, bytes calldata messagesProof) external;

        event MessageAccepted(uint64 indexed nonce, address source, address target, bytes encoded);
        event MessagesDelivered(uint64 indexed begin, uint64 indexed end);
    }

    /// Destination side of an ordered lane
    #[sol(rpc)]
    contract InboundLane {
        function getLaneInfo() external view returns (uint32, uint32, uint32, uint32);
        function inboundLaneNonce() external view returns (uint64 last_confirmed_nonce, uint64 last_delivered_nonce, uint64 relayer_range_front, uint64 relayer_range_back);
        function data() external view returns (InboundLaneData memory);
        function receive_messages_proof(OutboundLaneData calldata outboundLaneData, bytes calldata messagesProof, uint256 delivery_size) external;

        event MessageDispatched(uint256 indexed encoded_key, bool dispatch_result, bytes returndata);
    }

    /// Source side of a parallel lane: an incremental merkle tree of message hashes
    #[sol(rpc)]
    contract ParallelOutboundLane {
        function commitment() external view returns (bytes32);
        function message_size() external view returns (uint64);

        event MessageAccepted(uint256 indexed encoded_key, address source, address target, bytes encoded, bytes32 root);
    }

    /// Destination side of a parallel lane
    #[sol(rpc)]
    contract ParallelInboundLane {
        function dones(bytes32 msg_hash) external view returns (bool);
        function receive_message(bytes32 outlane_commitment, bytes calldata lane_proof, Message calldata message, bytes32[] calldata message_proof) external;

        event MessageDispatched(uint256 indexed encoded_key, bool dispatch_result, bytes returndata);
    }

    // ------------------------------------------------------------------
    // Commitment tree
    // ------------------------------------------------------------------

    struct MessageSingleProof {
        bytes32 root;
        bytes32[] proof;
    }

    struct MessageProof {
        MessageSingleProof chainProof;
        MessageSingleProof laneProof;
    }

    #[sol(rpc)]
    contract ChainMessageCommitter {
        function commitment() external view returns (bytes32);
        function prove(uint256 chain_pos, uint256 lane_pos) external view returns (MessageProof memory);
    }

    // ------------------------------------------------------------------
    // Beacon light client
    // ------------------------------------------------------------------

    struct BeaconBlockHeader {
        uint64 slot;
        uint64 proposer_index;
        bytes32 parent_root;
        bytes32 state_root;
        bytes32 body_root;
    }

    struct ExecutionPayloadHeader {
        bytes32 parent_hash;
        address fee_recipient;
        bytes32 state_root;
        bytes32 receipts_root;
        bytes32 logs_bloom;
        bytes32 prev_randao;
        uint64 block_number;
        uint64 gas_limit;
        uint64 gas_used;
        uint64 timestamp;
        bytes32 extra_data;
        uint256 base_fee_per_gas;
        bytes32 block_hash;
        bytes32 transactions_root;
        bytes32 withdrawals_root;
    }

    struct LightClientHeader {
        BeaconBlockHeader beacon;
        ExecutionPayloadHeader execution;
        bytes32[] execution_branch;
    }

    struct SyncCommittee {
        bytes[512] pubkeys;
        bytes aggregate_pubkey;
    }

    struct SyncAggregate {
        bytes32[2] sync_committee_bits;
        bytes sync_committee_signature;
    }

    struct FinalizedHeaderUpdate {
        LightClientHeader attested_header;
        SyncCommittee signature_sync_committee;
        LightClientHeader finalized_header;
        bytes32[] finality_branch;
        SyncAggregate sync_aggregate;
        bytes4 fork_version;
        uint64 signature_slot;
    }

    struct SyncCommitteePeriodUpdate {
        SyncCommittee next_sync_committee;
        bytes32[] next_sync_committee_branch;
    }

    #[sol(rpc)]
    contract BeaconLightClient {
        function finalized_header() external view returns (BeaconBlockHeader memory);
        function block_number() external view returns (uint256);
        function sync_committee_roots(uint64 period) external view returns (bytes32);
        function import_finalized_header(FinalizedHeaderUpdate calldata update) external;
        function import_next_sync_committee(FinalizedHeaderUpdate calldata header_update, SyncCommitteePeriodUpdate calldata sc_update) external;
    }

    // ------------------------------------------------------------------
    // Epoch (Parlia) light client
    // ------------------------------------------------------------------

    struct BSCHeader {
        bytes32 parent_hash;
        bytes32 uncle_hash;
        address coinbase;
        bytes32 state_root;
        bytes32 transactions_root;
        bytes32 receipts_root;
        bytes log_bloom;
        uint256 difficulty;
        uint256 number;
        uint64 gas_limit;
        uint64 gas_used;
        uint64 timestamp;
        bytes extra_data;
        bytes32 mix_digest;
        bytes8 nonce;
    }

    struct StoredBlockHeader {
        bytes32 parent_hash;
        bytes32 state_root;
        bytes32 transactions_root;
        bytes32 receipts_root;
        uint256 number;
        uint256 timestamp;
        bytes32 hash;
    }

    #[sol(rpc)]
    contract EpochLightClient {
        function finalized_checkpoint() external view returns (StoredBlockHeader memory);
        function length_of_finalized_authorities() external view returns (uint256);
        function import_finalized_epoch_header(BSCHeader[] calldata headers) external;
    }

    // ------------------------------------------------------------------
    // Threshold-signature light client
    // ------------------------------------------------------------------

    struct Commitment {
        uint32 block_number;
        bytes32 message_root;
        uint256 nonce;
    }

    #[sol(rpc)]
    contract EcdsaLightClient {
        function block_number() external view returns (uint256);
        function merkle_root() external view returns (bytes32);
        function nonce() external view returns (uint256);
        function import_message_commitment(Commitment calldata commitment, bytes[] calldata signatures) external;
    }
}

// ============================================================================
// Conversions
// ============================================================================

pub fn u256_to_u64(value: U256, what: &str) -> RelayResult<u64> {
    u64::try_from(value)
        .map_err(|_| RelayError::InconsistentRead(format!("{} {} does not fit in u64", what, value)))
}

impl From<&domain::Message> for Message {
    fn from(m: &domain::Message) -> Self {
        Message {
            encoded_key: m.encoded_key,
            payload: MessagePayload {
                source: m.payload.source,
                target: m.payload.target,
                encoded: m.payload.encoded.clone(),
            },
        }
    }
}

impl From<Message> for domain::Message {
    fn from(m: Message) -> Self {
        domain::Message {
            encoded_key: m.encoded_key,
            payload: domain::MessagePayload {
                source: m.payload.source,
                target: m.payload.target,
                encoded: m.payload.encoded,
            },
        }
    }
}

impl From<&domain::OutboundLaneData> for OutboundLaneData {
    fn from(d: &domain::OutboundLaneData) -> Self {
        OutboundLaneData {
            latest_received_nonce: d.latest_received_nonce,
            messages: d.messages.iter().map(Message::from).collect(),
        }
    }
}

impl From<OutboundLaneData> for domain::OutboundLaneData {
    fn from(d: OutboundLaneData) -> Self {
        domain::OutboundLaneData {
            latest_received_nonce: d.latest_received_nonce,
            messages: d.messages.into_iter().map(domain::Message::from).collect(),
        }
    }
}

impl From<&domain::InboundLaneData> for InboundLaneData {
    fn from(d: &domain::InboundLaneData) -> Self {
        InboundLaneData {
            relayers: d
                .relayers
                .iter()
                .map(|r| UnrewardedRelayer {
                    relayer: r.relayer,
                    messages: DeliveredMessages {
                        begin: r.messages.begin,
                        end: r.messages.end,
                    },
                })
                .collect(),
            last_confirmed_nonce: d.last_confirmed_nonce,
            last_delivered_nonce: d.last_delivered_nonce,
        }
    }
}

impl From<InboundLaneData> for domain::InboundLaneData {
    fn from(d: InboundLaneData) -> Self {
        domain::InboundLaneData {
            relayers: d
                .relayers
                .into_iter()
                .map(|r| domain::UnrewardedRelayer {
                    relayer: r.relayer,
                    messages: domain::DeliveredMessages {
                        begin: r.messages.begin,
                        end: r.messages.end,
                    },
                })
                .collect(),
            last_confirmed_nonce: d.last_confirmed_nonce,
            last_delivered_nonce: d.last_delivered_nonce,
        }
    }
}

impl From<&beacon::BeaconBlockHeader> for BeaconBlockHeader {
    fn from(h: &beacon::BeaconBlockHeader) -> Self {
        BeaconBlockHeader {
            slot: h.slot,
            proposer_index: h.proposer_index,
            parent_root: h.parent_root,
            state_root: h.state_root,
            body_root: h.body_root,
        }
    }
}

impl From<&beacon::CompactLightClientHeader> for LightClientHeader {
    fn from(h: &beacon::CompactLightClientHeader) -> Self {
        let e = &h.execution;
        LightClientHeader {
            beacon: BeaconBlockHeader::from(&h.beacon),
            execution: ExecutionPayloadHeader {
                parent_hash: e.parent_hash,
                fee_recipient: e.fee_recipient,
                state_root: e.state_root,
                receipts_root: e.receipts_root,
                logs_bloom: e.logs_bloom,
                prev_randao: e.prev_randao,
                block_number: e.block_number,
                gas_limit: e.gas_limit,
                gas_used: e.gas_used,
                timestamp: e.timestamp,
                extra_data: e.extra_data,
                base_fee_per_gas: e.base_fee_per_gas,
                block_hash: e.block_hash,
                transactions_root: e.transactions_root,
                withdrawals_root: e.withdrawals_root,
            },
            execution_branch: h.execution_branch.clone(),
        }
    }
}

pub fn sync_committee(committee: &beacon::SyncCommittee) -> RelayResult<SyncCommittee> {
    let count = committee.pubkeys.len();
    let pubkeys: [Bytes; 512] = committee.pubkeys.clone().try_into().map_err(|_| {
        RelayError::InvalidInput(format!("sync committee has {} pubkeys, expected 512", count))
    })?;
    Ok(SyncCommittee {
        pubkeys,
        aggregate_pubkey: committee.aggregate_pubkey.clone(),
    })
}

pub fn finalized_header_update(
    update: &beacon::FinalizedHeaderUpdate,
) -> RelayResult<FinalizedHeaderUpdate> {
    Ok(FinalizedHeaderUpdate {
        attested_header: LightClientHeader::from(&update.attested_header),
        signature_sync_committee: sync_committee(&update.signature_sync_committee)?,
        finalized_header: LightClientHeader::from(&update.finalized_header),
        finality_branch: update.finality_branch.clone(),
        sync_aggregate: SyncAggregate {
            sync_committee_bits: update.sync_committee_bits,
            sync_committee_signature: update.sync_committee_signature.clone(),
        },
        fork_version: update.fork_version,
        signature_slot: update.signature_slot,
    })
}

pub fn sync_committee_period_update(
    update: &beacon::SyncCommitteePeriodUpdate,
) -> RelayResult<SyncCommitteePeriodUpdate> {
    Ok(SyncCommitteePeriodUpdate {
        next_sync_committee: sync_committee(&update.next_sync_committee)?,
        next_sync_committee_branch: update.next_sync_committee_branch.clone(),
    })
}

impl From<&domain::BlockHeader> for BSCHeader {
    fn from(h: &domain::BlockHeader) -> Self {
        BSCHeader {
            parent_hash: h.parent_hash,
            uncle_hash: h.uncle_hash,
            coinbase: h.coinbase,
            state_root: h.state_root,
            transactions_root: h.transactions_root,
            receipts_root: h.receipts_root,
            log_bloom: h.logs_bloom.clone(),
            difficulty: h.difficulty,
            number: U256::from(h.number),
            gas_limit: h.gas_limit,
            gas_used: h.gas_used,
            timestamp: h.timestamp,
            extra_data: h.extra_data.clone(),
            mix_digest: h.mix_digest,
            nonce: h.nonce,
        }
    }
}

pub fn commitment(c: &threshold::Commitment) -> RelayResult<Commitment> {
    let block_number = u32::try_from(c.block_number).map_err(|_| {
        RelayError::InvalidInput(format!("block number {} does not fit in u32", c.block_number))
    })?;
    Ok(Commitment {
        block_number,
        message_root: c.message_root,
        nonce: U256::from(c.nonce),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    #[test]
    fn test_message_conversion_roundtrip() {
        let lane = domain::LaneId::new(1, 0, 2, 0);
        let message = domain::Message::new(
            &lane,
            3,
            domain::MessagePayload {
                source: Address::repeat_byte(1),
                target: Address::repeat_byte(2),
                encoded: Bytes::from(vec![0xde, 0xad]),
            },
        );

        let back = domain::Message::from(Message::from(&message));
        assert_eq!(back, message);
        assert_eq!(back.nonce(), 3);
    }

    #[test]
    fn test_sync_committee_requires_full_set() {
        let short = beacon::SyncCommittee {
            pubkeys: vec![Bytes::from(vec![0u8; 48]); 4],
            aggregate_pubkey: Bytes::from(vec![0u8; 48]),
        };
        assert!(sync_committee(&short).is_err());

        let full = beacon::SyncCommittee {
            pubkeys: vec![Bytes::from(vec![0u8; 48]); 512],
            aggregate_pubkey: Bytes::from(vec![0u8; 48]),
        };
        assert!(sync_committee(&full).is_ok());
    }

    #[test]
    fn test_commitment_block_number_bound() {
        let c = threshold::Commitment {
            block_number: u64::from(u32::MAX) + 1,
            message_root: Default::default(),
            nonce: 0,
        };
        assert!(commitment(&c).is_err());
    }
}
