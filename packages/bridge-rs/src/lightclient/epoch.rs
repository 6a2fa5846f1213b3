//! Epoch-rotation light client tracker (Parlia-style authority handoff)
//!
//! The destination light client holds a finalized checkpoint `N` and the
//! size `L` of the authority set elected at `N`. The next checkpoint is
//! `N + EPOCH_GAP`; it is final once `L / 2` further headers sit on top of
//! it, so an update carries the `L / 2 + 1` contiguous headers
//! `N + EPOCH_GAP ..= N + EPOCH_GAP + L / 2`.

use std::sync::Arc;

use alloy::primitives::Address;
use tracing::{debug, info};

use super::{ConsensusState, FinalizedHeaderState, LightClientHandle};
use crate::error::{RelayError, RelayResult};
use crate::gateway::{ChainGateway, ContractCall, TxOptions};
use crate::types::{BlockHeader, BlockTag};

/// Blocks between authority-set checkpoints
pub const DEFAULT_EPOCH_GAP: u64 = 200;

/// Headers proving the next checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochUpdate {
    pub headers: Vec<BlockHeader>,
}

impl EpochUpdate {
    pub fn checkpoint(&self) -> Option<u64> {
        self.headers.first().map(|h| h.number)
    }
}

/// Block numbers of the headers needed to move past checkpoint `checkpoint`
pub fn required_headers(checkpoint: u64, authorities_len: u64, epoch_gap: u64) -> (u64, u64) {
    let first = checkpoint + epoch_gap;
    (first, first + authorities_len / 2)
}

/// Headers must be numbered `first, first+1, ...` and each must name the
/// previous one as its parent
pub fn check_header_chain(headers: &[BlockHeader], first: u64) -> RelayResult<()> {
    for (i, header) in headers.iter().enumerate() {
        let expected = first + i as u64;
        if header.number != expected {
            return Err(RelayError::InconsistentRead(format!(
                "header {} returned for block {}",
                header.number, expected
            )));
        }
        if i > 0 && header.parent_hash != headers[i - 1].hash {
            return Err(RelayError::InconsistentRead(format!(
                "header {} parent {} does not link to {}",
                header.number,
                header.parent_hash,
                headers[i - 1].hash
            )));
        }
    }
    Ok(())
}

pub struct EpochTracker {
    source: Arc<dyn ChainGateway>,
    destination: Arc<dyn ChainGateway>,
    handle: LightClientHandle,
    epoch_gap: u64,
}

impl EpochTracker {
    pub fn new(
        source: Arc<dyn ChainGateway>,
        destination: Arc<dyn ChainGateway>,
        light_client: Address,
        epoch_gap: u64,
    ) -> Self {
        Self {
            source,
            destination,
            handle: LightClientHandle::epoch(light_client),
            epoch_gap,
        }
    }

    pub fn handle(&self) -> &LightClientHandle {
        &self.handle
    }

    pub async fn recorded_state(&self) -> RelayResult<FinalizedHeaderState> {
        self.destination.finalized_header_state(&self.handle).await
    }

    fn authorities_len(recorded: &FinalizedHeaderState) -> RelayResult<u64> {
        match recorded.consensus {
            ConsensusState::EpochAuthority {
                authorities_len, ..
            } => Ok(authorities_len),
            _ => Err(RelayError::InvalidInput(
                "epoch tracker given a non-epoch light client state".to_string(),
            )),
        }
    }

    pub async fn needs_update(&self, recorded: &FinalizedHeaderState) -> RelayResult<bool> {
        let len = Self::authorities_len(recorded)?;
        let (_, last) = required_headers(recorded.finalized_position, len, self.epoch_gap);
        let head = self.source.block_number(BlockTag::Latest).await?;
        Ok(head >= last)
    }

    pub async fn build_header_update(
        &self,
        recorded: &FinalizedHeaderState,
    ) -> RelayResult<EpochUpdate> {
        let len = Self::authorities_len(recorded)?;
        let (first, last) = required_headers(recorded.finalized_position, len, self.epoch_gap);

        let head = self.source.block_number(BlockTag::Latest).await?;
        if head < last {
            return Err(RelayError::StaleState(format!(
                "source head {} has not reached {} (next checkpoint {})",
                head, last, first
            )));
        }

        let mut headers = Vec::with_capacity((last - first + 1) as usize);
        for number in first..=last {
            headers.push(self.source.get_block(BlockTag::Number(number)).await?);
        }
        check_header_chain(&headers, first)?;

        debug!(
            source = self.source.name(),
            checkpoint = first,
            headers = headers.len(),
            "Built epoch header update"
        );

        Ok(EpochUpdate { headers })
    }

    pub async fn submit_header_update(
        &self,
        update: EpochUpdate,
        options: &TxOptions,
    ) -> RelayResult<FinalizedHeaderState> {
        let checkpoint = update.checkpoint();
        let call = ContractCall::ImportEpochHeaders {
            light_client: self.handle.address,
            headers: update.headers,
        };
        let receipt = self.destination.send_transaction(call, options).await?;

        info!(
            chain = self.destination.name(),
            checkpoint = ?checkpoint,
            tx_hash = %receipt.tx_hash,
            "Imported finalized epoch header"
        );

        self.recorded_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    fn chain(first: u64, count: u64) -> Vec<BlockHeader> {
        let mut headers: Vec<BlockHeader> = Vec::new();
        for i in 0..count {
            let parent_hash = headers.last().map(|h| h.hash).unwrap_or_default();
            headers.push(BlockHeader {
                number: first + i,
                hash: B256::with_last_byte((first + i) as u8),
                parent_hash,
                ..Default::default()
            });
        }
        headers
    }

    #[test]
    fn test_required_headers() {
        // 21 authorities -> 10 confirmations on top of the checkpoint
        assert_eq!(required_headers(400, 21, 200), (600, 610));
        assert_eq!(required_headers(0, 1, 200), (200, 200));
    }

    #[test]
    fn test_header_chain_accepts_linked_headers() {
        let headers = chain(600, 11);
        assert!(check_header_chain(&headers, 600).is_ok());
    }

    #[test]
    fn test_header_chain_rejects_gap() {
        let mut headers = chain(600, 5);
        headers.remove(2);
        assert!(matches!(
            check_header_chain(&headers, 600),
            Err(RelayError::InconsistentRead(_))
        ));
    }

    #[test]
    fn test_header_chain_rejects_broken_parent_link() {
        let mut headers = chain(600, 5);
        headers[3].parent_hash = B256::repeat_byte(0xee);
        assert!(matches!(
            check_header_chain(&headers, 600),
            Err(RelayError::InconsistentRead(_))
        ));
    }
}
