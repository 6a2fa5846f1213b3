//! Finality wait and delivery confirmation leg

use alloy::primitives::Bytes;
use bridge_rs::error::{RelayError, RelayResult};
use bridge_rs::gateway::{ContractCall, LaneEvent};
use bridge_rs::lane::{needs_confirmation, pending_confirmation_range};
use bridge_rs::lightclient::{ConsensusKind, SyncOutcome};
use bridge_rs::proof::{build_commitment_proof, build_delivery_proof, Proof, StorageProof};
use bridge_rs::retry::with_retry;
use bridge_rs::types::{BlockTag, NonceRange};
use tracing::{debug, info};

use super::{sync_light_client, LaneRelay, ProofStyle};

impl LaneRelay {
    /// Poll the target's finalized head until it covers `submitted_at`.
    ///
    /// Returns `false` when retries run out first; the confirmation is then
    /// picked up by a later cycle.
    pub(super) async fn await_finality(&self, submitted_at: u64) -> RelayResult<bool> {
        let target = self.target.gateway.as_ref();

        let result = with_retry(&self.settings.retry, "finality", move |_| async move {
            let finalized = target.block_number(BlockTag::Finalized).await?;
            if finalized >= submitted_at {
                Ok(finalized)
            } else {
                Err(RelayError::MissingDependency(format!(
                    "{} finalized head {} behind delivery block {}",
                    target.name(),
                    finalized,
                    submitted_at
                )))
            }
        })
        .await;

        match result {
            Ok(finalized) => {
                debug!(lane = %self.lane.name, submitted_at, finalized, "Delivery finalized");
                Ok(true)
            }
            Err(RelayError::MissingDependency(reason)) => {
                info!(lane = %self.lane.name, %reason, "Delivery not final yet, confirming later");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn delivery_proof(
        &self,
        kind: ConsensusKind,
        relayers: NonceRange,
        block: u64,
    ) -> RelayResult<Bytes> {
        let retry = &self.settings.retry;
        let target = self.target.gateway.as_ref();
        let inbound_lane = self.lane.inbound;

        let proof = match ProofStyle::for_consensus(kind) {
            ProofStyle::Storage => {
                let proof = with_retry(retry, "delivery proof", move |_| {
                    build_delivery_proof(target, inbound_lane, relayers, block)
                })
                .await?;
                Proof::Storage(StorageProof::Delivery(proof))
            }
            ProofStyle::Commitment => {
                let committer = self.target.require_committer()?;
                let inbound_id = self.lane_id.counterpart();
                let (chain, lane) = (
                    inbound_id.bridged_chain_position,
                    inbound_id.this_lane_position,
                );
                let reads = self.settings.commitment_reads;
                let proof = with_retry(retry, "commitment proof", move |_| {
                    build_commitment_proof(target, committer, chain, lane, block, reads)
                })
                .await?;
                Proof::Commitment(proof)
            }
        };
        Ok(proof.encode())
    }

    /// Prove the target's unrewarded deliveries back to the source.
    ///
    /// Returns the number of header updates imported and the confirmed
    /// nonces, if any.
    pub(super) async fn confirm(&self) -> RelayResult<(u32, Option<NonceRange>)> {
        let Some(reverse) = self.reverse.as_deref() else {
            return Ok((0, None));
        };

        let retry = &self.settings.retry;
        let source = self.source.gateway.as_ref();
        let target = self.target.gateway.as_ref();
        let (outbound_lane, inbound_lane) = (self.lane.outbound, self.lane.inbound);

        let outbound = with_retry(retry, "outbound_lane_nonce", move |_| {
            source.outbound_lane_nonce(outbound_lane, BlockTag::Latest)
        })
        .await?;
        let head = with_retry(retry, "inbound_lane_nonce", move |_| {
            target.inbound_lane_nonce(inbound_lane, BlockTag::Latest)
        })
        .await?;
        if !needs_confirmation(&outbound, &head) {
            debug!(
                lane = %self.lane.name,
                received = outbound.latest_received_nonce,
                "Nothing to confirm"
            );
            return Ok((0, None));
        }

        let outcome = sync_light_client(&self.locks, source, reverse, &self.settings).await?;
        let advanced = u32::from(matches!(outcome, SyncOutcome::Advanced { .. }));
        let block = outcome.state().execution_block_number;

        let inbound = with_retry(retry, "inbound_lane_nonce", move |_| {
            target.inbound_lane_nonce(inbound_lane, BlockTag::Number(block))
        })
        .await?;
        inbound.check()?;

        let relayers = pending_confirmation_range(&inbound);
        if !needs_confirmation(&outbound, &inbound) || relayers.is_empty() {
            debug!(
                lane = %self.lane.name,
                trusted_block = block,
                delivered = inbound.last_delivered_nonce,
                "Deliveries not yet in the state the source trusts"
            );
            return Ok((advanced, None));
        }

        let data = with_retry(retry, "inbound_lane_data", move |_| {
            target.inbound_lane_data(inbound_lane, BlockTag::Number(block))
        })
        .await?;
        let proof = self.delivery_proof(reverse.kind(), relayers, block).await?;
        let delivered = NonceRange::new(
            outbound.latest_received_nonce + 1,
            inbound.last_delivered_nonce,
        );

        info!(
            lane = %self.lane.name,
            %delivered,
            %relayers,
            block,
            "Confirming deliveries"
        );

        let call = ContractCall::ReceiveMessagesDeliveryProof {
            outbound_lane,
            inbound_data: data,
            proof,
        };
        let Some(receipt) = self.submit(source, call).await? else {
            return Ok((advanced, None));
        };

        let confirmed = receipt
            .events
            .iter()
            .find_map(|event| match event {
                LaneEvent::MessagesDelivered { begin, end } => Some(NonceRange::new(*begin, *end)),
                _ => None,
            })
            .unwrap_or(delivered);
        Ok((advanced, Some(confirmed)))
    }
}
