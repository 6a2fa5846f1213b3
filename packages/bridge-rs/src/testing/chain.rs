//! [`ChainGateway`] over one simulated chain

use std::sync::MutexGuard;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;

use super::consensus::{
    import_epoch_headers, import_finalized_header, import_message_commitment,
    import_next_sync_committee,
};
use super::lanes::{receive_message, receive_messages_delivery_proof, receive_messages_proof, trie_node};
use super::network::{CallRecord, Contracts, MockNetwork, World};
use crate::error::{RelayError, RelayResult};
use crate::gateway::{
    AccountProof, ChainGateway, ContractCall, LaneEvent, StorageSlotProof, TxOptions, TxReceipt,
};
use crate::hash::keccak256_concat;
use crate::lightclient::{FinalizedHeaderState, LightClientHandle};
use crate::proof::commitment::MessageProof;
use crate::types::{
    BlockHeader, BlockTag, InboundLaneData, InboundLaneNonce, LaneId, Message, OutboundLaneData,
    OutboundLaneNonce,
};

/// Gateway to one chain of a [`MockNetwork`]
#[derive(Clone)]
pub struct MockChain {
    network: MockNetwork,
    name: String,
}

impl MockChain {
    pub(crate) fn new(network: MockNetwork, name: &str) -> Self {
        Self {
            network,
            name: name.to_string(),
        }
    }

    pub fn network(&self) -> &MockNetwork {
        &self.network
    }

    /// Lock the world, failing first on an injected fault for `method`
    fn enter(&self, method: &str) -> RelayResult<MutexGuard<'_, World>> {
        let mut world = self.network.lock();
        match world.take_fault(&self.name, method) {
            Some(error) => Err(error),
            None => Ok(world),
        }
    }

    fn read<T>(
        &self,
        method: &str,
        at: BlockTag,
        f: impl FnOnce(&Contracts) -> Option<T>,
    ) -> RelayResult<T> {
        let world = self.enter(method)?;
        let state = world.chain(&self.name)?.state_at(at)?;
        f(state).ok_or_else(|| {
            RelayError::InvalidInput(format!("{}: {} target not deployed", self.name, method))
        })
    }
}

fn execute(world: &mut World, chain: &str, call: &ContractCall) -> Result<Vec<LaneEvent>, String> {
    match call {
        ContractCall::ImportFinalizedHeader {
            light_client,
            update,
        } => import_finalized_header(world, chain, *light_client, update).map(|_| Vec::new()),
        ContractCall::ImportNextSyncCommittee {
            light_client,
            header_update,
            committee_update,
        } => import_next_sync_committee(world, chain, *light_client, header_update, committee_update)
            .map(|_| Vec::new()),
        ContractCall::ImportEpochHeaders {
            light_client,
            headers,
        } => import_epoch_headers(world, chain, *light_client, headers).map(|_| Vec::new()),
        ContractCall::ImportMessageCommitment {
            light_client,
            signed,
        } => import_message_commitment(world, chain, *light_client, signed).map(|_| Vec::new()),
        ContractCall::ReceiveMessagesProof {
            inbound_lane,
            outbound_data,
            proof,
            message_count,
        } => receive_messages_proof(
            world,
            chain,
            *inbound_lane,
            outbound_data,
            proof,
            *message_count,
        ),
        ContractCall::ReceiveMessagesDeliveryProof {
            outbound_lane,
            inbound_data,
            proof,
        } => receive_messages_delivery_proof(world, chain, *outbound_lane, inbound_data, proof),
        ContractCall::ReceiveMessage {
            inbound_lane,
            lane_root,
            lane_proof,
            message,
            message_proof,
        } => receive_message(
            world,
            chain,
            *inbound_lane,
            *lane_root,
            lane_proof,
            message,
            message_proof,
        ),
    }
}

#[async_trait]
impl ChainGateway for MockChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn block_number(&self, tag: BlockTag) -> RelayResult<u64> {
        self.enter("block_number")?.chain(&self.name)?.resolve(tag)
    }

    async fn get_block(&self, tag: BlockTag) -> RelayResult<BlockHeader> {
        let world = self.enter("get_block")?;
        let chain = world.chain(&self.name)?;
        chain.block(chain.resolve(tag)?).cloned()
    }

    async fn get_proof(
        &self,
        account: Address,
        keys: &[B256],
        block: u64,
    ) -> RelayResult<AccountProof> {
        let world = self.enter("get_proof")?;
        let state = world.chain(&self.name)?.state_at(BlockTag::Number(block))?;

        let mut storage_proof = Vec::with_capacity(keys.len());
        for key in keys {
            let value = state.storage(account, *key).ok_or_else(|| {
                RelayError::MissingDependency(format!(
                    "{}: no account {} at {}",
                    self.name, account, block
                ))
            })?;
            storage_proof.push(StorageSlotProof {
                key: U256::from_be_bytes(key.0),
                value,
                proof: vec![trie_node(&self.name, account, block, *key, value)],
            });
        }

        Ok(AccountProof {
            address: account,
            account_proof: vec![trie_node(&self.name, account, block, B256::ZERO, U256::ZERO)],
            storage_hash: B256::ZERO,
            storage_proof,
        })
    }

    async fn send_transaction(
        &self,
        call: ContractCall,
        _options: &TxOptions,
    ) -> RelayResult<TxReceipt> {
        let method = call.method();
        let mut world = self.network.lock();

        let record = |world: &mut World, success: bool| {
            world.calls.push(CallRecord {
                chain: self.name.clone(),
                method: method.to_string(),
                success,
            });
        };

        if let Some(error) = world.take_fault(&self.name, method) {
            record(&mut *world, false);
            return Err(error);
        }

        // a reverted call leaves no state behind
        let before = world.chain(&self.name)?.state.clone();
        let nonces = world.authority_nonces.clone();

        match execute(&mut *world, &self.name, &call) {
            Ok(events) => {
                let block_number = world.chain_mut(&self.name)?.mine();
                record(&mut *world, true);
                Ok(TxReceipt {
                    tx_hash: keccak256_concat(&[
                        self.name.as_bytes(),
                        b"tx",
                        &block_number.to_be_bytes(),
                    ]),
                    block_number,
                    success: true,
                    events,
                })
            }
            Err(reason) => {
                world.chain_mut(&self.name)?.state = before;
                world.authority_nonces = nonces;
                record(&mut *world, false);
                Err(RelayError::from_rpc_message(&format!(
                    "execution reverted: {}",
                    reason
                )))
            }
        }
    }

    async fn outbound_lane_nonce(
        &self,
        lane: Address,
        at: BlockTag,
    ) -> RelayResult<OutboundLaneNonce> {
        self.read("outbound_lane_nonce", at, |s| s.outbound.get(&lane).map(|l| l.nonce()))
    }

    async fn inbound_lane_nonce(&self, lane: Address, at: BlockTag) -> RelayResult<InboundLaneNonce> {
        self.read("inbound_lane_nonce", at, |s| s.inbound.get(&lane).map(|l| l.nonce()))
    }

    async fn outbound_lane_data(
        &self,
        lane: Address,
        at: BlockTag,
    ) -> RelayResult<OutboundLaneData> {
        self.read("outbound_lane_data", at, |s| s.outbound.get(&lane).map(|l| l.data()))
    }

    async fn inbound_lane_data(&self, lane: Address, at: BlockTag) -> RelayResult<InboundLaneData> {
        self.read("inbound_lane_data", at, |s| s.inbound.get(&lane).map(|l| l.data()))
    }

    async fn lane_info(&self, lane: Address) -> RelayResult<LaneId> {
        self.read("lane_info", BlockTag::Latest, |s| {
            s.outbound
                .get(&lane)
                .map(|l| l.lane_id)
                .or_else(|| s.inbound.get(&lane).map(|l| l.lane_id))
                .or_else(|| s.parallel_outbound.get(&lane).map(|l| l.lane_id))
                .or_else(|| s.parallel_inbound.get(&lane).map(|l| l.lane_id))
        })
    }

    async fn commitment(&self, committer: Address, at: BlockTag) -> RelayResult<B256> {
        let world = self.enter("commitment")?;
        let chain = world.chain(&self.name)?;
        if chain.committer != Some(committer) {
            return Err(RelayError::InvalidInput(format!(
                "{}: no chain committer at {}",
                self.name, committer
            )));
        }
        Ok(chain.state_at(at)?.committer().root())
    }

    async fn prove_commitment(
        &self,
        chain_committer: Address,
        bridged_chain_position: u32,
        lane_position: u32,
        at: BlockTag,
    ) -> RelayResult<MessageProof> {
        let world = self.enter("prove_commitment")?;
        let chain = world.chain(&self.name)?;
        if chain.committer != Some(chain_committer) {
            return Err(RelayError::InvalidInput(format!(
                "{}: no chain committer at {}",
                self.name, chain_committer
            )));
        }
        chain
            .state_at(at)?
            .committer()
            .prove(bridged_chain_position, lane_position)
    }

    async fn parallel_lane_root(&self, lane: Address, at: BlockTag) -> RelayResult<(B256, u64)> {
        self.read("parallel_lane_root", at, |s| {
            s.parallel_outbound
                .get(&lane)
                .map(|l| (l.tree.root(), l.tree.len()))
        })
    }

    async fn parallel_lane_messages(
        &self,
        lane: Address,
        up_to_block: u64,
    ) -> RelayResult<Vec<Message>> {
        self.read("parallel_lane_messages", BlockTag::Number(up_to_block), |s| {
            s.parallel_outbound.get(&lane).map(|l| l.messages.clone())
        })
    }

    async fn parallel_message_dispatched(
        &self,
        lane: Address,
        message_hash: B256,
    ) -> RelayResult<bool> {
        self.read("parallel_message_dispatched", BlockTag::Latest, |s| {
            s.parallel_inbound
                .get(&lane)
                .map(|l| l.dones.contains(&message_hash))
        })
    }

    async fn finalized_header_state(
        &self,
        client: &LightClientHandle,
    ) -> RelayResult<FinalizedHeaderState> {
        let world = self.enter("finalized_header_state")?;
        let lc = world
            .chain(&self.name)?
            .state
            .light_clients
            .get(&client.address)
            .ok_or_else(|| {
                RelayError::InvalidInput(format!("{}: no light client {}", self.name, client.address))
            })?;
        if lc.kind() != client.kind {
            return Err(RelayError::InvalidInput(format!(
                "{}: light client {} is {}, not {}",
                self.name,
                client.address,
                lc.kind(),
                client.kind
            )));
        }
        Ok(lc.state())
    }

    async fn sync_committee_root(&self, light_client: Address, period: u64) -> RelayResult<B256> {
        let world = self.enter("sync_committee_root")?;
        let lc = world
            .chain(&self.name)?
            .state
            .light_clients
            .get(&light_client)
            .ok_or_else(|| {
                RelayError::InvalidInput(format!("{}: no light client {}", self.name, light_client))
            })?;
        Ok(lc.sync_committee_root(period).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessagePayload;

    #[tokio::test]
    async fn test_reads_at_historical_block() {
        let network = MockNetwork::new();
        let a = network.add_chain("a", 1);
        network.add_chain("b", 2);
        let lanes = network
            .open_lane("a", "b", Address::ZERO, Address::ZERO)
            .unwrap();

        let before = a.block_number(BlockTag::Latest).await.unwrap();
        network
            .send_message("a", lanes.outbound, MessagePayload::default())
            .unwrap();

        let then = a
            .outbound_lane_nonce(lanes.outbound, BlockTag::Number(before))
            .await
            .unwrap();
        let now = a
            .outbound_lane_nonce(lanes.outbound, BlockTag::Latest)
            .await
            .unwrap();
        assert_eq!(then.latest_generated_nonce, 0);
        assert_eq!(now.latest_generated_nonce, 1);
    }

    #[tokio::test]
    async fn test_reverted_call_is_recorded_and_mines_nothing() {
        let network = MockNetwork::new();
        network.add_chain("a", 1);
        let b = network.add_chain("b", 2);
        let lanes = network
            .open_lane("a", "b", Address::ZERO, Address::ZERO)
            .unwrap();
        let head = b.block_number(BlockTag::Latest).await.unwrap();

        let call = ContractCall::ReceiveMessagesDeliveryProof {
            outbound_lane: lanes.inbound,
            inbound_data: InboundLaneData::default(),
            proof: Default::default(),
        };
        assert!(b.send_transaction(call, &TxOptions::default()).await.is_err());
        assert_eq!(b.block_number(BlockTag::Latest).await.unwrap(), head);
        assert_eq!(network.calls().last().map(|c| c.success), Some(false));
    }

    #[tokio::test]
    async fn test_get_proof_missing_account() {
        let network = MockNetwork::new();
        let a = network.add_chain("a", 1);
        let result = a.get_proof(Address::repeat_byte(9), &[B256::ZERO], 0).await;
        assert!(matches!(result, Err(RelayError::MissingDependency(_))));
    }

    #[tokio::test]
    async fn test_read_fault_is_injected() {
        let network = MockNetwork::new();
        let a = network.add_chain("a", 1);
        network.inject_fault(
            "a",
            "block_number",
            RelayError::TransportFailure("connection reset".to_string()),
            Some(1),
        );
        assert!(a.block_number(BlockTag::Latest).await.is_err());
        assert!(a.block_number(BlockTag::Latest).await.is_ok());
    }
}
