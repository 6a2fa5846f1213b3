//! Chain gateway interfaces
//!
//! Everything the relay needs from a chain goes through [`ChainGateway`]:
//! storage proofs, headers, contract reads and transaction submission.
//! Beacon-chain light-client data and authority signatures come from
//! [`BeaconApi`] and [`AuthoritySigner`].
//!
//! Implementations:
//! - [`evm::EvmGateway`] - alloy contract bindings + raw JSON-RPC
//! - [`beacon::BeaconClient`] - beacon node REST API
//! - [`authority::AuthorityClient`] - authority signer service
//! - `testing::MockChain` (feature `testing`) - in-memory simulator

pub mod authority;
pub mod beacon;
pub mod contracts;
pub mod evm;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RelayResult;
use crate::lightclient::committee::{
    Bootstrap, FinalityUpdate, FinalizedHeaderUpdate, LightClientUpdate,
    SyncCommitteePeriodUpdate,
};
use crate::lightclient::threshold::{Commitment, SignedCommitment};
use crate::lightclient::{FinalizedHeaderState, LightClientHandle};
use crate::proof::commitment::MessageProof;
use crate::types::{
    BlockHeader, BlockTag, InboundLaneData, InboundLaneNonce, LaneId, Message, OutboundLaneData,
    OutboundLaneNonce,
};

// ============================================================================
// Proof Responses
// ============================================================================

/// One entry of an `eth_getProof` storage proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSlotProof {
    pub key: U256,
    pub value: U256,
    pub proof: Vec<Bytes>,
}

/// `eth_getProof` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountProof {
    pub address: Address,
    pub account_proof: Vec<Bytes>,
    #[serde(default)]
    pub storage_hash: B256,
    pub storage_proof: Vec<StorageSlotProof>,
}

impl AccountProof {
    /// Proof entry for `key`, if the node returned one
    pub fn slot(&self, key: B256) -> Option<&StorageSlotProof> {
        let key = U256::from_be_bytes(key.0);
        self.storage_proof.iter().find(|p| p.key == key)
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Every contract call the relay submits
#[derive(Debug, Clone, PartialEq)]
pub enum ContractCall {
    /// `BeaconLightClient.import_finalized_header(update)`
    ImportFinalizedHeader {
        light_client: Address,
        update: Box<FinalizedHeaderUpdate>,
    },
    /// `BeaconLightClient.import_next_sync_committee(header_update, sc_update)`
    ImportNextSyncCommittee {
        light_client: Address,
        header_update: Box<FinalizedHeaderUpdate>,
        committee_update: Box<SyncCommitteePeriodUpdate>,
    },
    /// `EpochLightClient.import_finalized_epoch_header(headers)`
    ImportEpochHeaders {
        light_client: Address,
        headers: Vec<BlockHeader>,
    },
    /// `EcdsaLightClient.import_message_commitment(commitment, signatures)`
    ImportMessageCommitment {
        light_client: Address,
        signed: SignedCommitment,
    },
    /// `InboundLane.receive_messages_proof(outboundData, proof, count)`
    ReceiveMessagesProof {
        inbound_lane: Address,
        outbound_data: OutboundLaneData,
        proof: Bytes,
        message_count: u64,
    },
    /// `OutboundLane.receive_messages_delivery_proof(inboundData, proof)`
    ReceiveMessagesDeliveryProof {
        outbound_lane: Address,
        inbound_data: InboundLaneData,
        proof: Bytes,
    },
    /// `ParallelInboundLane.receive_message(laneRoot, laneProof, message, messageProof)`
    ReceiveMessage {
        inbound_lane: Address,
        lane_root: B256,
        lane_proof: Bytes,
        message: Message,
        message_proof: Vec<B256>,
    },
}

impl ContractCall {
    /// Short name for logs and metrics
    pub fn method(&self) -> &'static str {
        match self {
            ContractCall::ImportFinalizedHeader { .. } => "import_finalized_header",
            ContractCall::ImportNextSyncCommittee { .. } => "import_next_sync_committee",
            ContractCall::ImportEpochHeaders { .. } => "import_finalized_epoch_header",
            ContractCall::ImportMessageCommitment { .. } => "import_message_commitment",
            ContractCall::ReceiveMessagesProof { .. } => "receive_messages_proof",
            ContractCall::ReceiveMessagesDeliveryProof { .. } => {
                "receive_messages_delivery_proof"
            }
            ContractCall::ReceiveMessage { .. } => "receive_message",
        }
    }

    /// Contract the call is sent to
    pub fn target(&self) -> Address {
        match self {
            ContractCall::ImportFinalizedHeader { light_client, .. }
            | ContractCall::ImportNextSyncCommittee { light_client, .. }
            | ContractCall::ImportEpochHeaders { light_client, .. }
            | ContractCall::ImportMessageCommitment { light_client, .. } => *light_client,
            ContractCall::ReceiveMessagesProof { inbound_lane, .. }
            | ContractCall::ReceiveMessage { inbound_lane, .. } => *inbound_lane,
            ContractCall::ReceiveMessagesDeliveryProof { outbound_lane, .. } => *outbound_lane,
        }
    }
}

/// Per-submission options
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    /// Explicit gas limit; estimated when unset
    pub gas_limit: Option<u64>,
}

/// Lane events decoded from a receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneEvent {
    /// A message was executed on the destination
    MessageDispatched {
        encoded_key: U256,
        dispatch_result: bool,
    },
    /// The source accepted a delivery proof for `[begin, end]`
    MessagesDelivered { begin: u64, end: u64 },
}

/// Confirmed transaction receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub success: bool,
    pub events: Vec<LaneEvent>,
}

// ============================================================================
// Gateway Traits
// ============================================================================

/// Access to one chain: reads, proofs and submissions
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Chain name used in logs
    fn name(&self) -> &str;

    /// Latest or finalized block number
    async fn block_number(&self, tag: BlockTag) -> RelayResult<u64>;

    async fn get_block(&self, tag: BlockTag) -> RelayResult<BlockHeader>;

    /// Account and storage proofs for `keys` of `account` at `block`
    async fn get_proof(&self, account: Address, keys: &[B256], block: u64)
        -> RelayResult<AccountProof>;

    /// Submit a call and wait for its receipt.
    ///
    /// Reverts are classified with `RelayError::from_rpc_message`, so a
    /// replayed submission comes back as `StaleState`.
    async fn send_transaction(&self, call: ContractCall, options: &TxOptions)
        -> RelayResult<TxReceipt>;

    // Ordered lanes

    async fn outbound_lane_nonce(&self, lane: Address, at: BlockTag)
        -> RelayResult<OutboundLaneNonce>;

    async fn inbound_lane_nonce(&self, lane: Address, at: BlockTag)
        -> RelayResult<InboundLaneNonce>;

    async fn outbound_lane_data(&self, lane: Address, at: BlockTag)
        -> RelayResult<OutboundLaneData>;

    async fn inbound_lane_data(&self, lane: Address, at: BlockTag)
        -> RelayResult<InboundLaneData>;

    async fn lane_info(&self, lane: Address) -> RelayResult<LaneId>;

    // Commitment tree

    async fn commitment(&self, committer: Address, at: BlockTag) -> RelayResult<B256>;

    async fn prove_commitment(
        &self,
        chain_committer: Address,
        bridged_chain_position: u32,
        lane_position: u32,
        at: BlockTag,
    ) -> RelayResult<MessageProof>;

    // Parallel lanes

    /// Lane root and leaf count of a parallel outbound lane
    async fn parallel_lane_root(&self, lane: Address, at: BlockTag) -> RelayResult<(B256, u64)>;

    /// All messages accepted by a parallel outbound lane up to `block`,
    /// in leaf order
    async fn parallel_lane_messages(&self, lane: Address, up_to_block: u64)
        -> RelayResult<Vec<Message>>;

    async fn parallel_message_dispatched(&self, lane: Address, message_hash: B256)
        -> RelayResult<bool>;

    // Light clients

    async fn finalized_header_state(&self, client: &LightClientHandle)
        -> RelayResult<FinalizedHeaderState>;

    async fn sync_committee_root(&self, light_client: Address, period: u64) -> RelayResult<B256>;
}

/// Beacon node light-client API
#[async_trait]
pub trait BeaconApi: Send + Sync {
    async fn get_finality_update(&self) -> RelayResult<FinalityUpdate>;

    /// Sync committee period update for `period`; `MissingDependency` when
    /// the node has none yet
    async fn get_sync_committee_period_update(&self, period: u64)
        -> RelayResult<LightClientUpdate>;

    async fn get_bootstrap(&self, block_root: B256) -> RelayResult<Bootstrap>;

    async fn get_beacon_block_root(&self, slot: u64) -> RelayResult<B256>;
}

/// Authority set signing service for threshold-signature light clients
#[async_trait]
pub trait AuthoritySigner: Send + Sync {
    /// Nonce the authority set expects at `block_hash`
    async fn authority_nonce(&self, block_hash: B256) -> RelayResult<u64>;

    /// Collect authority signatures over `commitment`
    async fn sign_commitment(&self, commitment: &Commitment) -> RelayResult<Vec<Bytes>>;
}
