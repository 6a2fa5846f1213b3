//! Threshold-signature light client tracker (ECDSA authority set)
//!
//! The authority set signs `{block_number, message_root, nonce}` for a
//! finalized source block; the destination light client accepts it when the
//! nonce matches the one it has recorded and enough authorities signed.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256};
use tracing::{debug, info};

use super::{ConsensusState, FinalizedHeaderState, LightClientHandle};
use crate::error::{RelayError, RelayResult};
use crate::gateway::{AuthoritySigner, ChainGateway, ContractCall, TxOptions};
use crate::types::BlockTag;

/// Message commitment signed by the authority set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment {
    pub block_number: u64,
    pub message_root: B256,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCommitment {
    pub commitment: Commitment,
    pub signatures: Vec<Bytes>,
}

pub struct ThresholdTracker {
    source: Arc<dyn ChainGateway>,
    signer: Arc<dyn AuthoritySigner>,
    destination: Arc<dyn ChainGateway>,
    handle: LightClientHandle,
    chain_committer: Address,
}

impl ThresholdTracker {
    pub fn new(
        source: Arc<dyn ChainGateway>,
        signer: Arc<dyn AuthoritySigner>,
        destination: Arc<dyn ChainGateway>,
        light_client: Address,
        chain_committer: Address,
    ) -> Self {
        Self {
            source,
            signer,
            destination,
            handle: LightClientHandle::threshold(light_client),
            chain_committer,
        }
    }

    pub fn handle(&self) -> &LightClientHandle {
        &self.handle
    }

    pub async fn recorded_state(&self) -> RelayResult<FinalizedHeaderState> {
        self.destination.finalized_header_state(&self.handle).await
    }

    fn recorded_parts(recorded: &FinalizedHeaderState) -> RelayResult<(u64, B256)> {
        match recorded.consensus {
            ConsensusState::Threshold {
                authority_nonce,
                message_root,
            } => Ok((authority_nonce, message_root)),
            _ => Err(RelayError::InvalidInput(
                "threshold tracker given a non-threshold light client state".to_string(),
            )),
        }
    }

    pub async fn needs_update(&self, recorded: &FinalizedHeaderState) -> RelayResult<bool> {
        let (_, recorded_root) = Self::recorded_parts(recorded)?;
        let number = self.source.block_number(BlockTag::Finalized).await?;
        if number <= recorded.finalized_position {
            return Ok(false);
        }
        let root = self
            .source
            .commitment(self.chain_committer, BlockTag::Number(number))
            .await?;
        Ok(root != recorded_root)
    }

    pub async fn build_header_update(
        &self,
        recorded: &FinalizedHeaderState,
    ) -> RelayResult<SignedCommitment> {
        let (recorded_nonce, recorded_root) = Self::recorded_parts(recorded)?;

        let header = self.source.get_block(BlockTag::Finalized).await?;
        if header.number <= recorded.finalized_position {
            return Err(RelayError::StaleState(format!(
                "source finalized block {} not newer than recorded {}",
                header.number, recorded.finalized_position
            )));
        }

        let message_root = self
            .source
            .commitment(self.chain_committer, BlockTag::Number(header.number))
            .await?;
        if message_root == recorded_root {
            return Err(RelayError::StaleState(format!(
                "message root unchanged at block {}",
                header.number
            )));
        }

        let nonce = self.signer.authority_nonce(header.hash).await?;
        if nonce != recorded_nonce {
            return Err(RelayError::MissingDependency(format!(
                "authority nonce {} at block {} differs from recorded {}",
                nonce, header.number, recorded_nonce
            )));
        }

        let commitment = Commitment {
            block_number: header.number,
            message_root,
            nonce,
        };
        let signatures = self.signer.sign_commitment(&commitment).await?;
        if signatures.is_empty() {
            return Err(RelayError::MissingDependency(format!(
                "no authority signatures for block {}",
                header.number
            )));
        }

        debug!(
            source = self.source.name(),
            block_number = header.number,
            message_root = %message_root,
            signatures = signatures.len(),
            "Built signed message commitment"
        );

        Ok(SignedCommitment {
            commitment,
            signatures,
        })
    }

    pub async fn submit_header_update(
        &self,
        signed: SignedCommitment,
        options: &TxOptions,
    ) -> RelayResult<FinalizedHeaderState> {
        let block_number = signed.commitment.block_number;
        let call = ContractCall::ImportMessageCommitment {
            light_client: self.handle.address,
            signed,
        };
        let receipt = self.destination.send_transaction(call, options).await?;

        info!(
            chain = self.destination.name(),
            block_number,
            tx_hash = %receipt.tx_hash,
            "Imported message commitment"
        );

        self.recorded_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightclient::{LightClientTracker, SyncOutcome};
    use crate::testing::MockNetwork;
    use crate::types::MessagePayload;

    /// Threshold light client on b tracking a, with one message waiting on a
    fn setup() -> (MockNetwork, LightClientTracker) {
        let network = MockNetwork::new();
        network.add_chain("a", 1);
        network.add_chain("b", 2);
        let committer = network.deploy_committer("a").unwrap();
        let lc = network.deploy_threshold_light_client("b", "a").unwrap();
        let pair = network.open_lane("a", "b", lc, Address::ZERO).unwrap();
        network
            .send_message("a", pair.outbound, MessagePayload::default())
            .unwrap();

        let tracker = LightClientTracker::Threshold(ThresholdTracker::new(
            Arc::new(network.chain("a")),
            Arc::new(network.authority("a")),
            Arc::new(network.chain("b")),
            lc,
            committer,
        ));
        (network, tracker)
    }

    #[tokio::test]
    async fn test_commitment_imported() {
        let (network, tracker) = setup();

        let outcome = tracker.sync(&TxOptions::default()).await.unwrap();
        let SyncOutcome::Advanced { previous, current } = outcome else {
            panic!("expected the light client to advance");
        };
        assert!(current.finalized_position > previous.finalized_position);
        assert_eq!(network.submitted("b"), vec!["import_message_commitment"]);
    }

    #[tokio::test]
    async fn test_stale_authority_set_is_refused() {
        let (network, tracker) = setup();
        network.rotate_authorities("a");

        let err = tracker.sync(&TxOptions::default()).await.unwrap_err();
        assert!(matches!(err, RelayError::MissingDependency(_)));
        assert!(err.to_string().contains("authority nonce"));
        assert!(network.submitted("b").is_empty());
    }

    #[tokio::test]
    async fn test_missing_signatures_are_refused() {
        let (network, tracker) = setup();
        network.withhold_signatures("a", true);

        let err = tracker.sync(&TxOptions::default()).await.unwrap_err();
        assert!(matches!(err, RelayError::MissingDependency(_)));
        assert!(network.submitted("b").is_empty());

        network.withhold_signatures("a", false);
        let outcome = tracker.sync(&TxOptions::default()).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Advanced { .. }));
        assert_eq!(network.submitted("b"), vec!["import_message_commitment"]);
    }
}
