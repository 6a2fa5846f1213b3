//! Message delivery leg

use std::collections::BTreeSet;

use alloy::primitives::{Bytes, B256, U256};
use bridge_rs::error::{RelayError, RelayResult};
use bridge_rs::gateway::{ChainGateway, ContractCall, LaneEvent, TxReceipt};
use bridge_rs::lane::{
    check_lane_pair, check_outbound_data, pending_dispatch_range, undelivered, ParallelLaneState,
};
use bridge_rs::lightclient::FinalizedHeaderState;
use bridge_rs::proof::{
    build_commitment_proof, build_lane_root_proof, build_message_proof, verify_inclusion,
    IncrementalMerkleTree, InclusionProof, Proof, StorageProof,
};
use bridge_rs::retry::with_retry;
use bridge_rs::types::{BlockTag, Message, NonceRange, OutboundLaneNonce};
use tracing::{debug, info};

use super::{CycleSnapshot, LaneRelay, ProofStyle};

/// A delivery accepted by the target chain
#[derive(Debug)]
pub(super) struct Delivery {
    /// Target block of the (last) accepted submission
    pub block_number: u64,
    pub keys: Vec<U256>,
}

fn dispatched_keys(receipt: &TxReceipt) -> Vec<U256> {
    receipt
        .events
        .iter()
        .filter_map(|event| match event {
            LaneEvent::MessageDispatched { encoded_key, .. } => Some(*encoded_key),
            _ => None,
        })
        .collect()
}

impl LaneRelay {
    /// Submit `call` to `gateway`. A stale rejection means someone already
    /// applied it and yields `None`.
    pub(super) async fn submit(
        &self,
        gateway: &dyn ChainGateway,
        call: ContractCall,
    ) -> RelayResult<Option<TxReceipt>> {
        let method = call.method();
        let tx = &self.settings.tx;

        let result = with_retry(&self.settings.retry, method, move |_| {
            gateway.send_transaction(call.clone(), tx)
        })
        .await;

        match result {
            Ok(receipt) if !receipt.success => Err(RelayError::ProofRejected(format!(
                "{} on {} reverted in tx {}",
                method,
                gateway.name(),
                receipt.tx_hash
            ))),
            Ok(receipt) => {
                info!(
                    lane = %self.lane.name,
                    chain = gateway.name(),
                    method,
                    tx_hash = %receipt.tx_hash,
                    block = receipt.block_number,
                    "Submission confirmed"
                );
                Ok(Some(receipt))
            }
            Err(e) if e.is_noop() => {
                info!(
                    lane = %self.lane.name,
                    chain = gateway.name(),
                    method,
                    reason = %e,
                    "Already applied, skipping"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Outbound nonces at the trusted source block, inbound nonces at the
    /// target's head. `head` is the source's latest outbound view; a target
    /// that delivered past the trusted view but not past `head` was served by
    /// another relayer from a newer header and yields `StaleState`.
    pub(super) async fn snapshot(
        &self,
        trusted: &FinalizedHeaderState,
        head: &OutboundLaneNonce,
    ) -> RelayResult<CycleSnapshot> {
        let retry = &self.settings.retry;
        let source = self.source.gateway.as_ref();
        let target = self.target.gateway.as_ref();
        let (outbound_lane, inbound_lane) = (self.lane.outbound, self.lane.inbound);
        let at = BlockTag::Number(trusted.execution_block_number);

        let outbound = with_retry(retry, "outbound_lane_nonce", move |_| {
            source.outbound_lane_nonce(outbound_lane, at)
        })
        .await?;
        let inbound = with_retry(retry, "inbound_lane_nonce", move |_| {
            target.inbound_lane_nonce(inbound_lane, BlockTag::Latest)
        })
        .await?;
        if inbound.last_delivered_nonce > outbound.latest_generated_nonce
            && inbound.last_delivered_nonce <= head.latest_generated_nonce
        {
            return Err(RelayError::StaleState(format!(
                "target delivered {} beyond trusted source view ({} generated at block {})",
                inbound.last_delivered_nonce,
                outbound.latest_generated_nonce,
                trusted.execution_block_number
            )));
        }
        check_lane_pair(&outbound, &inbound)?;

        Ok(CycleSnapshot {
            trusted: *trusted,
            outbound,
            inbound,
        })
    }

    async fn message_proof(&self, range: NonceRange, block: u64) -> RelayResult<Bytes> {
        let retry = &self.settings.retry;
        let source = self.source.gateway.as_ref();
        let outbound_lane = self.lane.outbound;

        let proof = match ProofStyle::for_consensus(self.forward.kind()) {
            ProofStyle::Storage => {
                let proof = with_retry(retry, "message proof", move |_| {
                    build_message_proof(source, outbound_lane, range, block)
                })
                .await?;
                Proof::Storage(StorageProof::Messages(proof))
            }
            ProofStyle::Commitment => {
                let committer = self.source.require_committer()?;
                let (chain, lane) = (
                    self.lane_id.bridged_chain_position,
                    self.lane_id.this_lane_position,
                );
                let reads = self.settings.commitment_reads;
                let proof = with_retry(retry, "commitment proof", move |_| {
                    build_commitment_proof(source, committer, chain, lane, block, reads)
                })
                .await?;
                Proof::Commitment(proof)
            }
        };
        Ok(proof.encode())
    }

    /// Prove the parallel lane's merkle root against the trusted source view
    async fn lane_root_proof(&self, root: B256, block: u64) -> RelayResult<Bytes> {
        let retry = &self.settings.retry;
        let source = self.source.gateway.as_ref();
        let outbound_lane = self.lane.outbound;

        let proof = match ProofStyle::for_consensus(self.forward.kind()) {
            ProofStyle::Storage => {
                let lane_root = with_retry(retry, "lane root proof", move |_| {
                    build_lane_root_proof(source, outbound_lane, block)
                })
                .await?;
                if lane_root.lane_root != root {
                    return Err(RelayError::InconsistentRead(format!(
                        "proven lane root {} differs from read root {} at {}",
                        lane_root.lane_root, root, block
                    )));
                }
                Proof::Storage(StorageProof::LaneRoot(lane_root))
            }
            ProofStyle::Commitment => {
                let committer = self.source.require_committer()?;
                let (chain, lane) = (
                    self.lane_id.bridged_chain_position,
                    self.lane_id.this_lane_position,
                );
                let reads = self.settings.commitment_reads;
                let proof = with_retry(retry, "lane root commitment proof", move |_| {
                    build_commitment_proof(source, committer, chain, lane, block, reads)
                })
                .await?;
                // a parallel lane commits to its merkle root
                if proof.proof.lane_proof.root != root {
                    return Err(RelayError::InconsistentRead(format!(
                        "committed lane root {} differs from read root {} at {}",
                        proof.proof.lane_proof.root, root, block
                    )));
                }
                Proof::Commitment(proof)
            }
        };
        Ok(proof.encode())
    }

    /// Deliver every message the target's light client can verify and the
    /// target has not executed yet, in one proof
    pub(super) async fn dispatch_ordered(
        &self,
        trusted: &FinalizedHeaderState,
    ) -> RelayResult<Option<Delivery>> {
        let retry = &self.settings.retry;
        let source = self.source.gateway.as_ref();
        let outbound_lane = self.lane.outbound;

        let head = with_retry(retry, "outbound_lane_nonce", move |_| {
            source.outbound_lane_nonce(outbound_lane, BlockTag::Latest)
        })
        .await?;
        if pending_dispatch_range(&head).is_empty() {
            debug!(lane = %self.lane.name, "No messages waiting on the source");
            return Ok(None);
        }

        let snapshot = match self.snapshot(trusted, &head).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_noop() => {
                debug!(
                    lane = %self.lane.name,
                    reason = %e,
                    "Trusted source view is behind, skipping delivery"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let range = pending_dispatch_range(&snapshot.outbound);
        let fresh = undelivered(range, &snapshot.inbound);
        if fresh.is_empty() {
            debug!(
                lane = %self.lane.name,
                %range,
                delivered = snapshot.inbound.last_delivered_nonce,
                trusted_block = trusted.execution_block_number,
                "Nothing deliverable from the trusted source state"
            );
            return Ok(None);
        }

        // The proof carries the whole unconfirmed range; the target skips
        // what it already executed.
        let block = trusted.execution_block_number;
        let data = with_retry(retry, "outbound_lane_data", move |_| {
            source.outbound_lane_data(outbound_lane, BlockTag::Number(block))
        })
        .await?;
        check_outbound_data(&data, range)?;

        let proof = self.message_proof(range, block).await?;

        info!(
            lane = %self.lane.name,
            %range,
            new = %fresh,
            block,
            "Delivering messages"
        );

        let call = ContractCall::ReceiveMessagesProof {
            inbound_lane: self.lane.inbound,
            message_count: data.messages.len() as u64,
            outbound_data: data,
            proof,
        };
        let receipt = self.submit(self.target.gateway.as_ref(), call).await?;

        Ok(receipt.map(|receipt| Delivery {
            block_number: receipt.block_number,
            keys: dispatched_keys(&receipt),
        }))
    }

    /// Deliver every leaf of a parallel lane the target has not executed,
    /// one submission per message
    pub(super) async fn dispatch_parallel(
        &self,
        trusted: &FinalizedHeaderState,
    ) -> RelayResult<Option<Delivery>> {
        let retry = &self.settings.retry;
        let source = self.source.gateway.as_ref();
        let target = self.target.gateway.as_ref();
        let (outbound_lane, inbound_lane) = (self.lane.outbound, self.lane.inbound);
        let block = trusted.execution_block_number;

        let (root, count) = with_retry(retry, "parallel_lane_root", move |_| {
            source.parallel_lane_root(outbound_lane, BlockTag::Number(block))
        })
        .await?;
        if count == 0 {
            return Ok(None);
        }

        let messages = with_retry(retry, "parallel_lane_messages", move |_| {
            source.parallel_lane_messages(outbound_lane, block)
        })
        .await?;
        let tree = IncrementalMerkleTree::from_leaves(messages.iter().map(Message::hash));
        if tree.len() != count || tree.root() != root {
            return Err(RelayError::InconsistentRead(format!(
                "rebuilt lane tree ({} leaves, root {}) does not match source ({} leaves, root {}) at {}",
                tree.len(),
                tree.root(),
                count,
                root,
                block
            )));
        }

        let mut lane = ParallelLaneState {
            leaf_count: count,
            dispatched: BTreeSet::new(),
        };
        for (index, message) in messages.iter().enumerate() {
            let hash = message.hash();
            let done = with_retry(retry, "parallel_message_dispatched", move |_| {
                target.parallel_message_dispatched(inbound_lane, hash)
            })
            .await?;
            if done {
                lane.dispatched.insert(index as u64);
            }
        }

        let pending = lane.pending_leaves();
        if pending.is_empty() {
            debug!(lane = %self.lane.name, leaves = count, "All leaves dispatched");
            return Ok(None);
        }

        let lane_proof = self.lane_root_proof(root, block).await?;

        info!(
            lane = %self.lane.name,
            pending = pending.len(),
            leaves = count,
            block,
            "Delivering parallel messages"
        );

        let mut delivery: Option<Delivery> = None;
        for index in pending {
            let message = &messages[index as usize];
            if message.nonce() != index {
                return Err(RelayError::InconsistentRead(format!(
                    "leaf {} carries message {}",
                    index,
                    message.nonce()
                )));
            }

            let inclusion = InclusionProof {
                root,
                index,
                path: tree.proof(index)?,
            };
            if !verify_inclusion(inclusion.root, message.hash(), inclusion.index, &inclusion.path) {
                return Err(RelayError::InconsistentRead(format!(
                    "inclusion path for leaf {} does not reach {}",
                    index, root
                )));
            }

            let call = ContractCall::ReceiveMessage {
                inbound_lane,
                lane_root: root,
                lane_proof: lane_proof.clone(),
                message: message.clone(),
                message_proof: inclusion.path,
            };
            if let Some(receipt) = self.submit(target, call).await? {
                let entry = delivery.get_or_insert(Delivery {
                    block_number: receipt.block_number,
                    keys: Vec::new(),
                });
                entry.block_number = receipt.block_number;
                entry.keys.extend(dispatched_keys(&receipt));
            }
        }

        Ok(delivery)
    }
}
