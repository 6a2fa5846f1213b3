//! EVM chain gateway
//!
//! Contract reads and submissions go through alloy's generated bindings;
//! `eth_getProof` and full block headers are fetched with raw JSON-RPC.

use std::time::Duration;

use alloy::{
    eips::BlockId,
    network::{EthereumWallet, TransactionBuilder},
    primitives::{Address, Bytes, B256, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::{Filter, Log, TransactionRequest},
    signers::local::PrivateKeySigner,
    sol_types::{SolCall, SolEvent},
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::contracts::{
    self, u256_to_u64, BeaconLightClient, ChainMessageCommitter, EcdsaLightClient,
    EpochLightClient, InboundLane, OutboundLane, ParallelInboundLane, ParallelOutboundLane,
};
use super::{AccountProof, ChainGateway, ContractCall, LaneEvent, TxOptions, TxReceipt};
use crate::error::{RelayError, RelayResult};
use crate::lightclient::epoch::DEFAULT_EPOCH_GAP;
use crate::lightclient::fork::period_of_slot;
use crate::lightclient::{ConsensusKind, ConsensusState, FinalizedHeaderState, LightClientHandle};
use crate::proof::commitment::{MessageProof, SingleProof};
use crate::types::{
    BlockHeader, BlockTag, InboundLaneData, InboundLaneNonce, LaneId, Message, MessagePayload,
    OutboundLaneData, OutboundLaneNonce,
};

/// EVM RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// EVM RPC error
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}

/// EVM gateway configuration
#[derive(Clone)]
pub struct EvmGatewayConfig {
    /// Chain name for logs
    pub name: String,
    /// RPC URL (e.g., "http://localhost:8545")
    pub rpc_url: String,
    /// Relayer key, required for submissions
    pub private_key: Option<String>,
    /// First block scanned when replaying parallel lane messages
    pub log_start_block: u64,
    /// Maximum block range per `eth_getLogs` query
    pub max_log_range: u64,
    /// Checkpoint spacing of epoch light clients hosted on this chain
    pub epoch_gap: u64,
}

impl std::fmt::Debug for EvmGatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmGatewayConfig")
            .field("name", &self.name)
            .field("rpc_url", &self.rpc_url)
            .field(
                "private_key",
                &self.private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("log_start_block", &self.log_start_block)
            .field("max_log_range", &self.max_log_range)
            .field("epoch_gap", &self.epoch_gap)
            .finish()
    }
}

impl EvmGatewayConfig {
    pub fn new(name: impl Into<String>, rpc_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rpc_url: rpc_url.into(),
            private_key: None,
            log_start_block: 0,
            max_log_range: 10_000,
            epoch_gap: DEFAULT_EPOCH_GAP,
        }
    }
}

pub struct EvmGateway {
    name: String,
    rpc_url: String,
    provider: RootProvider<Http<Client>>,
    http: reqwest::Client,
    signer: Option<PrivateKeySigner>,
    /// Held while a transaction is filled and broadcast; lanes sharing this
    /// gateway share one account nonce
    send_lock: tokio::sync::Mutex<()>,
    log_start_block: u64,
    max_log_range: u64,
    epoch_gap: u64,
}

fn rpc_error(e: impl std::fmt::Display) -> RelayError {
    RelayError::from_rpc_message(&e.to_string())
}

fn block_id(tag: BlockTag) -> BlockId {
    match tag {
        BlockTag::Latest => BlockId::latest(),
        BlockTag::Finalized => BlockId::finalized(),
        BlockTag::Number(n) => BlockId::number(n),
    }
}

impl EvmGateway {
    pub fn new(config: EvmGatewayConfig) -> RelayResult<Self> {
        let url = config
            .rpc_url
            .parse()
            .map_err(|e| RelayError::InvalidInput(format!("Invalid RPC URL: {}", e)))?;
        let provider = ProviderBuilder::new().on_http(url);

        let signer = match &config.private_key {
            Some(key) => Some(
                key.parse::<PrivateKeySigner>()
                    .map_err(|e| RelayError::InvalidInput(format!("Invalid private key: {}", e)))?,
            ),
            None => None,
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        info!(
            chain = %config.name,
            rpc_url = %config.rpc_url,
            signer = ?signer.as_ref().map(|s| s.address()),
            "Created EVM gateway"
        );

        Ok(Self {
            name: config.name,
            rpc_url: config.rpc_url,
            provider,
            http,
            signer,
            send_lock: tokio::sync::Mutex::new(()),
            log_start_block: config.log_start_block,
            max_log_range: config.max_log_range.max(1),
            epoch_gap: config.epoch_gap,
        })
    }

    /// Signer address (None if read-only)
    pub fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    async fn rpc<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> RelayResult<Option<T>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .json::<RpcResponse<T>>()
            .await?;

        if let Some(error) = response.error {
            return Err(RelayError::from_rpc_error(
                Some(i64::from(error.code)),
                &format!("{} error {}: {}", method, error.code, error.message),
            ));
        }
        Ok(response.result)
    }

    /// Encode a contract call into (target, calldata)
    fn encode_call(call: &ContractCall) -> RelayResult<(Address, Vec<u8>)> {
        let data = match call {
            ContractCall::ImportFinalizedHeader { update, .. } => {
                BeaconLightClient::import_finalized_headerCall {
                    update: contracts::finalized_header_update(update)?,
                }
                .abi_encode()
            }
            ContractCall::ImportNextSyncCommittee {
                header_update,
                committee_update,
                ..
            } => BeaconLightClient::import_next_sync_committeeCall {
                header_update: contracts::finalized_header_update(header_update)?,
                sc_update: contracts::sync_committee_period_update(committee_update)?,
            }
            .abi_encode(),
            ContractCall::ImportEpochHeaders { headers, .. } => {
                EpochLightClient::import_finalized_epoch_headerCall {
                    headers: headers.iter().map(contracts::BSCHeader::from).collect(),
                }
                .abi_encode()
            }
            ContractCall::ImportMessageCommitment { signed, .. } => {
                EcdsaLightClient::import_message_commitmentCall {
                    commitment: contracts::commitment(&signed.commitment)?,
                    signatures: signed.signatures.clone(),
                }
                .abi_encode()
            }
            ContractCall::ReceiveMessagesProof {
                outbound_data,
                proof,
                message_count,
                ..
            } => InboundLane::receive_messages_proofCall {
                outboundLaneData: contracts::OutboundLaneData::from(outbound_data),
                messagesProof: proof.clone(),
                delivery_size: U256::from(*message_count),
            }
            .abi_encode(),
            ContractCall::ReceiveMessagesDeliveryProof {
                inbound_data,
                proof,
                ..
            } => OutboundLane::receive_messages_delivery_proofCall {
                inboundLaneData: contracts::InboundLaneData::from(inbound_data),
                messagesProof: proof.clone(),
            }
            .abi_encode(),
            ContractCall::ReceiveMessage {
                lane_root,
                lane_proof,
                message,
                message_proof,
                ..
            } => ParallelInboundLane::receive_messageCall {
                outlane_commitment: *lane_root,
                lane_proof: lane_proof.clone(),
                message: contracts::Message::from(message),
                message_proof: message_proof.clone(),
            }
            .abi_encode(),
        };
        Ok((call.target(), data))
    }

    fn decode_events(logs: &[Log]) -> Vec<LaneEvent> {
        let mut events = Vec::new();
        for log in logs {
            if let Ok(decoded) = log.log_decode::<InboundLane::MessageDispatched>() {
                events.push(LaneEvent::MessageDispatched {
                    encoded_key: decoded.inner.data.encoded_key,
                    dispatch_result: decoded.inner.data.dispatch_result,
                });
            } else if let Ok(decoded) = log.log_decode::<OutboundLane::MessagesDelivered>() {
                events.push(LaneEvent::MessagesDelivered {
                    begin: decoded.inner.data.begin,
                    end: decoded.inner.data.end,
                });
            }
        }
        events
    }
}

#[async_trait]
impl ChainGateway for EvmGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn block_number(&self, tag: BlockTag) -> RelayResult<u64> {
        match tag {
            BlockTag::Number(n) => Ok(n),
            BlockTag::Latest => self.provider.get_block_number().await.map_err(rpc_error),
            BlockTag::Finalized => Ok(self.get_block(BlockTag::Finalized).await?.number),
        }
    }

    async fn get_block(&self, tag: BlockTag) -> RelayResult<BlockHeader> {
        self.rpc::<BlockHeader>(
            "eth_getBlockByNumber",
            serde_json::json!([tag.to_rpc(), false]),
        )
        .await?
        .ok_or_else(|| RelayError::MissingDependency(format!("{}: no block {}", self.name, tag)))
    }

    async fn get_proof(
        &self,
        account: Address,
        keys: &[B256],
        block: u64,
    ) -> RelayResult<AccountProof> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.rpc::<AccountProof>(
            "eth_getProof",
            serde_json::json!([account, keys, BlockTag::Number(block).to_rpc()]),
        )
        .await?
        .ok_or_else(|| {
            RelayError::MissingDependency(format!("{}: no proof at block {}", self.name, block))
        })
    }

    async fn send_transaction(
        &self,
        call: ContractCall,
        options: &TxOptions,
    ) -> RelayResult<TxReceipt> {
        let signer = self.signer.clone().ok_or_else(|| {
            RelayError::InvalidInput(format!("{}: no signer configured", self.name))
        })?;
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(
                self.rpc_url
                    .parse()
                    .map_err(|e| RelayError::InvalidInput(format!("Invalid RPC URL: {}", e)))?,
            );

        let method = call.method();
        let (to, data) = Self::encode_call(&call)?;
        let mut tx = TransactionRequest::default()
            .with_to(to)
            .with_input(Bytes::from(data));
        if let Some(gas) = options.gas_limit {
            tx = tx.with_gas_limit(gas);
        }

        debug!(chain = %self.name, method, to = %to, "Submitting transaction");

        let pending_tx = {
            let _nonce_guard = self.send_lock.lock().await;
            provider.send_transaction(tx).await.map_err(rpc_error)?
        };
        let tx_hash = *pending_tx.tx_hash();
        info!(chain = %self.name, method, tx_hash = %tx_hash, "Transaction sent, waiting for confirmation");

        let receipt = pending_tx.get_receipt().await.map_err(rpc_error)?;

        if !receipt.status() {
            warn!(chain = %self.name, method, tx_hash = %tx_hash, "Transaction reverted");
            return Err(RelayError::ProofRejected(format!(
                "{} reverted in {}",
                method, tx_hash
            )));
        }

        Ok(TxReceipt {
            tx_hash,
            block_number: receipt.block_number.unwrap_or_default(),
            success: true,
            events: Self::decode_events(receipt.inner.logs()),
        })
    }

    async fn outbound_lane_nonce(
        &self,
        lane: Address,
        at: BlockTag,
    ) -> RelayResult<OutboundLaneNonce> {
        let contract = OutboundLane::new(lane, &self.provider);
        let nonce = contract
            .outboundLaneNonce()
            .block(block_id(at))
            .call()
            .await
            .map_err(rpc_error)?;
        Ok(OutboundLaneNonce {
            latest_received_nonce: nonce.latest_received_nonce,
            latest_generated_nonce: nonce.latest_generated_nonce,
        })
    }

    async fn inbound_lane_nonce(
        &self,
        lane: Address,
        at: BlockTag,
    ) -> RelayResult<InboundLaneNonce> {
        let contract = InboundLane::new(lane, &self.provider);
        let nonce = contract
            .inboundLaneNonce()
            .block(block_id(at))
            .call()
            .await
            .map_err(rpc_error)?;
        Ok(InboundLaneNonce {
            last_confirmed_nonce: nonce.last_confirmed_nonce,
            last_delivered_nonce: nonce.last_delivered_nonce,
            relayer_range_front: nonce.relayer_range_front,
            relayer_range_back: nonce.relayer_range_back,
        })
    }

    async fn outbound_lane_data(
        &self,
        lane: Address,
        at: BlockTag,
    ) -> RelayResult<OutboundLaneData> {
        let contract = OutboundLane::new(lane, &self.provider);
        let data = contract
            .data()
            .block(block_id(at))
            .call()
            .await
            .map_err(rpc_error)?;
        Ok(OutboundLaneData::from(data._0))
    }

    async fn inbound_lane_data(&self, lane: Address, at: BlockTag) -> RelayResult<InboundLaneData> {
        let contract = InboundLane::new(lane, &self.provider);
        let data = contract
            .data()
            .block(block_id(at))
            .call()
            .await
            .map_err(rpc_error)?;
        Ok(InboundLaneData::from(data._0))
    }

    async fn lane_info(&self, lane: Address) -> RelayResult<LaneId> {
        let contract = OutboundLane::new(lane, &self.provider);
        let info = contract.getLaneInfo().call().await.map_err(rpc_error)?;
        Ok(LaneId::new(info._0, info._1, info._2, info._3))
    }

    async fn commitment(&self, committer: Address, at: BlockTag) -> RelayResult<B256> {
        let contract = ChainMessageCommitter::new(committer, &self.provider);
        let root = contract
            .commitment()
            .block(block_id(at))
            .call()
            .await
            .map_err(rpc_error)?;
        Ok(root._0)
    }

    async fn prove_commitment(
        &self,
        chain_committer: Address,
        bridged_chain_position: u32,
        lane_position: u32,
        at: BlockTag,
    ) -> RelayResult<MessageProof> {
        let contract = ChainMessageCommitter::new(chain_committer, &self.provider);
        let proof = contract
            .prove(
                U256::from(bridged_chain_position),
                U256::from(lane_position),
            )
            .block(block_id(at))
            .call()
            .await
            .map_err(rpc_error)?
            ._0;
        Ok(MessageProof {
            chain_proof: SingleProof {
                root: proof.chainProof.root,
                proof: proof.chainProof.proof,
            },
            lane_proof: SingleProof {
                root: proof.laneProof.root,
                proof: proof.laneProof.proof,
            },
        })
    }

    async fn parallel_lane_root(&self, lane: Address, at: BlockTag) -> RelayResult<(B256, u64)> {
        let contract = ParallelOutboundLane::new(lane, &self.provider);
        let root = contract
            .commitment()
            .block(block_id(at))
            .call()
            .await
            .map_err(rpc_error)?;
        let size = contract
            .message_size()
            .block(block_id(at))
            .call()
            .await
            .map_err(rpc_error)?;
        Ok((root._0, size._0))
    }

    async fn parallel_lane_messages(
        &self,
        lane: Address,
        up_to_block: u64,
    ) -> RelayResult<Vec<Message>> {
        let mut messages = Vec::new();
        let mut from_block = self.log_start_block;

        while from_block <= up_to_block {
            let to_block = (from_block + self.max_log_range - 1).min(up_to_block);
            let filter = Filter::new()
                .address(lane)
                .event_signature(ParallelOutboundLane::MessageAccepted::SIGNATURE_HASH)
                .from_block(from_block)
                .to_block(to_block);

            let logs = self.provider.get_logs(&filter).await.map_err(rpc_error)?;
            for log in logs {
                let decoded = log
                    .log_decode::<ParallelOutboundLane::MessageAccepted>()
                    .map_err(|e| RelayError::InconsistentRead(format!("MessageAccepted: {}", e)))?;
                let event = decoded.inner.data;
                messages.push(Message {
                    encoded_key: event.encoded_key,
                    payload: MessagePayload {
                        source: event.source,
                        target: event.target,
                        encoded: event.encoded,
                    },
                });
            }
            from_block = to_block + 1;
        }

        messages.sort_by_key(|m| m.nonce());
        for (index, message) in messages.iter().enumerate() {
            if message.nonce() != index as u64 {
                return Err(RelayError::InconsistentRead(format!(
                    "{}: parallel lane log replay has leaf {} at position {}",
                    self.name,
                    message.nonce(),
                    index
                )));
            }
        }

        debug!(chain = %self.name, lane = %lane, up_to_block, count = messages.len(), "Replayed parallel lane messages");
        Ok(messages)
    }

    async fn parallel_message_dispatched(
        &self,
        lane: Address,
        message_hash: B256,
    ) -> RelayResult<bool> {
        let contract = ParallelInboundLane::new(lane, &self.provider);
        let done = contract.dones(message_hash).call().await.map_err(rpc_error)?;
        Ok(done._0)
    }

    async fn finalized_header_state(
        &self,
        client: &LightClientHandle,
    ) -> RelayResult<FinalizedHeaderState> {
        match client.kind {
            ConsensusKind::Committee => {
                let lc = BeaconLightClient::new(client.address, &self.provider);
                let header = lc.finalized_header().call().await.map_err(rpc_error)?._0;
                let block_number = lc.block_number().call().await.map_err(rpc_error)?._0;
                let period = period_of_slot(header.slot);
                let root = lc
                    .sync_committee_roots(period)
                    .call()
                    .await
                    .map_err(rpc_error)?
                    ._0;
                Ok(FinalizedHeaderState {
                    finalized_position: header.slot,
                    execution_block_number: u256_to_u64(block_number, "block_number")?,
                    consensus: ConsensusState::Committee {
                        period,
                        sync_committee_root: root,
                    },
                })
            }
            ConsensusKind::EpochAuthority => {
                let lc = EpochLightClient::new(client.address, &self.provider);
                let checkpoint = lc.finalized_checkpoint().call().await.map_err(rpc_error)?._0;
                let len = lc
                    .length_of_finalized_authorities()
                    .call()
                    .await
                    .map_err(rpc_error)?
                    ._0;
                let number = u256_to_u64(checkpoint.number, "checkpoint number")?;
                Ok(FinalizedHeaderState {
                    finalized_position: number,
                    execution_block_number: number,
                    consensus: ConsensusState::EpochAuthority {
                        authority_set_epoch: number / self.epoch_gap.max(1),
                        authorities_len: u256_to_u64(len, "authorities length")?,
                    },
                })
            }
            ConsensusKind::Threshold => {
                let lc = EcdsaLightClient::new(client.address, &self.provider);
                let block_number = lc.block_number().call().await.map_err(rpc_error)?._0;
                let root = lc.merkle_root().call().await.map_err(rpc_error)?._0;
                let nonce = lc.nonce().call().await.map_err(rpc_error)?._0;
                let block_number = u256_to_u64(block_number, "block_number")?;
                Ok(FinalizedHeaderState {
                    finalized_position: block_number,
                    execution_block_number: block_number,
                    consensus: ConsensusState::Threshold {
                        authority_nonce: u256_to_u64(nonce, "nonce")?,
                        message_root: root,
                    },
                })
            }
        }
    }

    async fn sync_committee_root(&self, light_client: Address, period: u64) -> RelayResult<B256> {
        let lc = BeaconLightClient::new(light_client, &self.provider);
        let root = lc
            .sync_committee_roots(period)
            .call()
            .await
            .map_err(rpc_error)?;
        Ok(root._0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_debug_redacts_key() {
        let mut config = EvmGatewayConfig::new("sepolia", "http://localhost:8545");
        config.private_key = Some("0xdeadbeef".to_string());
        let debug = format!("{:?}", config);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("deadbeef"));
    }

    #[test]
    fn test_gateway_rejects_bad_url() {
        let config = EvmGatewayConfig::new("bad", "not a url");
        assert!(matches!(
            EvmGateway::new(config),
            Err(RelayError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_encode_call_targets() {
        let call = ContractCall::ReceiveMessagesProof {
            inbound_lane: Address::repeat_byte(7),
            outbound_data: OutboundLaneData::default(),
            proof: Bytes::new(),
            message_count: 0,
        };
        let (to, data) = EvmGateway::encode_call(&call).unwrap();
        assert_eq!(to, Address::repeat_byte(7));
        assert_eq!(data[..4], InboundLane::receive_messages_proofCall::SELECTOR);
    }

    #[test]
    fn test_rpc_response_error_shape() {
        let response: RpcResponse<String> = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "header not found" }
        }))
        .unwrap();
        assert!(response.result.is_none());
        let error = response.error.unwrap();
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "header not found");
    }
}
