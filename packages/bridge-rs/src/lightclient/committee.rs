//! Beacon sync-committee light client tracker
//!
//! Keeps a destination-hosted beacon light client in step with the source's
//! beacon chain. A finality update can only be verified by the light client
//! once it knows the committee of the signature period, so every missing
//! committee between the recorded period and the new signature period is
//! rotated in first, oldest first.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, FixedBytes, B256, U256};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::fork::{period_of_slot, ForkSchedule};
use super::ssz::{extra_data_root, logs_bloom_root};
use super::{ConsensusState, FinalizedHeaderState, LightClientHandle};
use crate::error::{RelayError, RelayResult};
use crate::gateway::{BeaconApi, ChainGateway, ContractCall, TxOptions};
use crate::types::{decimal, u256_decimal};

// ============================================================================
// Beacon API Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BeaconBlockHeader {
    #[serde(with = "decimal")]
    pub slot: u64,
    #[serde(with = "decimal")]
    pub proposer_index: u64,
    pub parent_root: B256,
    pub state_root: B256,
    pub body_root: B256,
}

/// Execution payload header as served by the beacon API
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionPayloadHeader {
    pub parent_hash: B256,
    pub fee_recipient: Address,
    pub state_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bytes,
    pub prev_randao: B256,
    #[serde(with = "decimal")]
    pub block_number: u64,
    #[serde(with = "decimal")]
    pub gas_limit: u64,
    #[serde(with = "decimal")]
    pub gas_used: u64,
    #[serde(with = "decimal")]
    pub timestamp: u64,
    pub extra_data: Bytes,
    #[serde(with = "u256_decimal")]
    pub base_fee_per_gas: U256,
    pub block_hash: B256,
    pub transactions_root: B256,
    #[serde(default)]
    pub withdrawals_root: B256,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LightClientHeader {
    pub beacon: BeaconBlockHeader,
    pub execution: ExecutionPayloadHeader,
    pub execution_branch: Vec<B256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCommittee {
    pub pubkeys: Vec<Bytes>,
    pub aggregate_pubkey: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncAggregate {
    /// 512-bit participation bitvector
    pub sync_committee_bits: Bytes,
    pub sync_committee_signature: Bytes,
}

impl SyncAggregate {
    /// Split the 64-byte bitvector into two `bytes32` words
    pub fn split_bits(&self) -> RelayResult<[B256; 2]> {
        let bits = self.sync_committee_bits.as_ref();
        if bits.len() != 64 {
            return Err(RelayError::InvalidInput(format!(
                "sync committee bits are {} bytes, expected 64",
                bits.len()
            )));
        }
        Ok([B256::from_slice(&bits[..32]), B256::from_slice(&bits[32..])])
    }
}

/// `/eth/v1/beacon/light_client/finality_update`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FinalityUpdate {
    pub attested_header: LightClientHeader,
    pub finalized_header: LightClientHeader,
    pub finality_branch: Vec<B256>,
    pub sync_aggregate: SyncAggregate,
    #[serde(with = "decimal")]
    pub signature_slot: u64,
}

/// `/eth/v1/beacon/light_client/updates` entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LightClientUpdate {
    pub attested_header: LightClientHeader,
    pub next_sync_committee: SyncCommittee,
    pub next_sync_committee_branch: Vec<B256>,
    pub finalized_header: LightClientHeader,
    pub finality_branch: Vec<B256>,
    pub sync_aggregate: SyncAggregate,
    #[serde(with = "decimal")]
    pub signature_slot: u64,
}

/// `/eth/v1/beacon/light_client/bootstrap/{block_root}`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bootstrap {
    pub header: LightClientHeader,
    pub current_sync_committee: SyncCommittee,
    pub current_sync_committee_branch: Vec<B256>,
}

// ============================================================================
// Light Client Payloads
// ============================================================================

/// Execution header with `logs_bloom` and `extra_data` replaced by their SSZ
/// roots, the form the light client hashes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactExecutionHeader {
    pub parent_hash: B256,
    pub fee_recipient: Address,
    pub state_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: B256,
    pub prev_randao: B256,
    pub block_number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: B256,
    pub base_fee_per_gas: U256,
    pub block_hash: B256,
    pub transactions_root: B256,
    pub withdrawals_root: B256,
}

impl CompactExecutionHeader {
    pub fn from_payload_header(header: &ExecutionPayloadHeader) -> RelayResult<Self> {
        Ok(Self {
            parent_hash: header.parent_hash,
            fee_recipient: header.fee_recipient,
            state_root: header.state_root,
            receipts_root: header.receipts_root,
            logs_bloom: logs_bloom_root(&header.logs_bloom)?,
            prev_randao: header.prev_randao,
            block_number: header.block_number,
            gas_limit: header.gas_limit,
            gas_used: header.gas_used,
            timestamp: header.timestamp,
            extra_data: extra_data_root(&header.extra_data)?,
            base_fee_per_gas: header.base_fee_per_gas,
            block_hash: header.block_hash,
            transactions_root: header.transactions_root,
            withdrawals_root: header.withdrawals_root,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactLightClientHeader {
    pub beacon: BeaconBlockHeader,
    pub execution: CompactExecutionHeader,
    pub execution_branch: Vec<B256>,
}

impl CompactLightClientHeader {
    pub fn from_header(header: &LightClientHeader) -> RelayResult<Self> {
        Ok(Self {
            beacon: header.beacon.clone(),
            execution: CompactExecutionHeader::from_payload_header(&header.execution)?,
            execution_branch: header.execution_branch.clone(),
        })
    }
}

/// Argument of `import_finalized_header`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedHeaderUpdate {
    pub attested_header: CompactLightClientHeader,
    pub signature_sync_committee: SyncCommittee,
    pub finalized_header: CompactLightClientHeader,
    pub finality_branch: Vec<B256>,
    /// Participation bits split at the 32-byte boundary
    pub sync_committee_bits: [B256; 2],
    pub sync_committee_signature: Bytes,
    pub fork_version: FixedBytes<4>,
    pub signature_slot: u64,
}

impl FinalizedHeaderUpdate {
    pub fn finalized_slot(&self) -> u64 {
        self.finalized_header.beacon.slot
    }

    pub fn signature_period(&self) -> u64 {
        period_of_slot(self.signature_slot)
    }
}

/// Second argument of `import_next_sync_committee`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCommitteePeriodUpdate {
    pub next_sync_committee: SyncCommittee,
    pub next_sync_committee_branch: Vec<B256>,
}

/// Rotation importing the committee of `period + 1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitteeRotation {
    pub period: u64,
    pub header_update: FinalizedHeaderUpdate,
    pub committee_update: SyncCommitteePeriodUpdate,
}

/// Rotations (in period order) followed by the finality update.
///
/// `finality` is `None` when the committee gap was larger than one batch;
/// the remaining rotations and the finality update follow next sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitteeUpdate {
    pub rotations: Vec<CommitteeRotation>,
    pub finality: Option<FinalizedHeaderUpdate>,
}

/// Committee rotations built and submitted per sync
pub const DEFAULT_MAX_ROTATIONS: usize = 8;

// ============================================================================
// Tracker
// ============================================================================

pub struct CommitteeTracker {
    beacon: Arc<dyn BeaconApi>,
    destination: Arc<dyn ChainGateway>,
    handle: LightClientHandle,
    forks: ForkSchedule,
    max_rotations: usize,
}

impl CommitteeTracker {
    pub fn new(
        beacon: Arc<dyn BeaconApi>,
        destination: Arc<dyn ChainGateway>,
        light_client: Address,
        forks: ForkSchedule,
    ) -> Self {
        Self {
            beacon,
            destination,
            handle: LightClientHandle::committee(light_client),
            forks,
            max_rotations: DEFAULT_MAX_ROTATIONS,
        }
    }

    pub fn with_max_rotations(mut self, max_rotations: usize) -> Self {
        self.max_rotations = max_rotations.max(1);
        self
    }

    pub fn handle(&self) -> &LightClientHandle {
        &self.handle
    }

    pub async fn recorded_state(&self) -> RelayResult<FinalizedHeaderState> {
        self.destination.finalized_header_state(&self.handle).await
    }

    pub async fn needs_update(&self, recorded: &FinalizedHeaderState) -> RelayResult<bool> {
        let finality = self.beacon.get_finality_update().await?;
        Ok(finality.finalized_header.beacon.slot > recorded.finalized_position)
    }

    pub async fn build_header_update(
        &self,
        recorded: &FinalizedHeaderState,
    ) -> RelayResult<CommitteeUpdate> {
        let finality = self.beacon.get_finality_update().await?;
        let finalized_slot = finality.finalized_header.beacon.slot;

        if finalized_slot <= recorded.finalized_position {
            return Err(RelayError::StaleState(format!(
                "beacon finalized slot {} not newer than recorded {}",
                finalized_slot, recorded.finalized_position
            )));
        }

        let recorded_period = match recorded.consensus {
            ConsensusState::Committee { period, .. } => period,
            _ => period_of_slot(recorded.finalized_position),
        };
        let signature_period = period_of_slot(finality.signature_slot);

        let mut rotations = Vec::new();
        let mut truncated = false;
        for period in recorded_period..signature_period {
            let next_root = self
                .destination
                .sync_committee_root(self.handle.address, period + 1)
                .await?;
            if next_root != B256::ZERO {
                debug!(period = period + 1, "Sync committee already known");
                continue;
            }
            if rotations.len() == self.max_rotations {
                truncated = true;
                break;
            }

            let update = self.beacon.get_sync_committee_period_update(period).await?;
            let header_update = self
                .finalized_header_update(
                    &update.attested_header,
                    &update.finalized_header,
                    &update.finality_branch,
                    &update.sync_aggregate,
                    update.signature_slot,
                )
                .await?;

            rotations.push(CommitteeRotation {
                period,
                header_update,
                committee_update: SyncCommitteePeriodUpdate {
                    next_sync_committee: update.next_sync_committee,
                    next_sync_committee_branch: update.next_sync_committee_branch,
                },
            });
        }

        let finality = if truncated {
            info!(
                recorded_period,
                signature_period,
                rotations = rotations.len(),
                "Committee gap exceeds one batch, deferring finality update"
            );
            None
        } else {
            Some(
                self.finalized_header_update(
                    &finality.attested_header,
                    &finality.finalized_header,
                    &finality.finality_branch,
                    &finality.sync_aggregate,
                    finality.signature_slot,
                )
                .await?,
            )
        };

        debug!(
            recorded_period,
            signature_period,
            rotations = rotations.len(),
            finalized_slot,
            "Built committee header update"
        );

        Ok(CommitteeUpdate {
            rotations,
            finality,
        })
    }

    /// Assemble the light client payload for one finalized header.
    ///
    /// The signing committee is the current committee of the finalized
    /// header, taken from its bootstrap.
    async fn finalized_header_update(
        &self,
        attested: &LightClientHeader,
        finalized: &LightClientHeader,
        finality_branch: &[B256],
        sync_aggregate: &SyncAggregate,
        signature_slot: u64,
    ) -> RelayResult<FinalizedHeaderUpdate> {
        let block_root = self
            .beacon
            .get_beacon_block_root(finalized.beacon.slot)
            .await?;
        let bootstrap = self.beacon.get_bootstrap(block_root).await?;

        Ok(FinalizedHeaderUpdate {
            attested_header: CompactLightClientHeader::from_header(attested)?,
            signature_sync_committee: bootstrap.current_sync_committee,
            finalized_header: CompactLightClientHeader::from_header(finalized)?,
            finality_branch: finality_branch.to_vec(),
            sync_committee_bits: sync_aggregate.split_bits()?,
            sync_committee_signature: sync_aggregate.sync_committee_signature.clone(),
            fork_version: self.forks.version_for_slot(signature_slot)?,
            signature_slot,
        })
    }

    /// Submit rotations in order, then the finality update.
    ///
    /// A rotation the light client already has is skipped; any other
    /// rotation failure stops before the finality update.
    pub async fn submit_header_update(
        &self,
        update: CommitteeUpdate,
        options: &TxOptions,
    ) -> RelayResult<FinalizedHeaderState> {
        for rotation in update.rotations {
            let period = rotation.period;
            let call = ContractCall::ImportNextSyncCommittee {
                light_client: self.handle.address,
                header_update: Box::new(rotation.header_update),
                committee_update: Box::new(rotation.committee_update),
            };

            match self.destination.send_transaction(call, options).await {
                Ok(receipt) => {
                    info!(
                        chain = self.destination.name(),
                        period = period + 1,
                        tx_hash = %receipt.tx_hash,
                        "Imported next sync committee"
                    );
                }
                Err(e) if e.is_noop() => {
                    debug!(period = period + 1, "Sync committee imported concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        let Some(finality) = update.finality else {
            return self.recorded_state().await;
        };
        let slot = finality.finalized_slot();
        let call = ContractCall::ImportFinalizedHeader {
            light_client: self.handle.address,
            update: Box::new(finality),
        };
        let receipt = self.destination.send_transaction(call, options).await?;

        info!(
            chain = self.destination.name(),
            slot,
            tx_hash = %receipt.tx_hash,
            "Imported finalized beacon header"
        );

        self.recorded_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_bits() {
        let mut bits = vec![0xffu8; 32];
        bits.extend_from_slice(&[0x01u8; 32]);
        let aggregate = SyncAggregate {
            sync_committee_bits: bits.into(),
            sync_committee_signature: Bytes::new(),
        };

        let [first, second] = aggregate.split_bits().unwrap();
        assert_eq!(first, B256::repeat_byte(0xff));
        assert_eq!(second, B256::repeat_byte(0x01));

        let short = SyncAggregate {
            sync_committee_bits: vec![0u8; 63].into(),
            sync_committee_signature: Bytes::new(),
        };
        assert!(short.split_bits().is_err());
    }

    #[test]
    fn test_finality_update_from_beacon_json() {
        let header = serde_json::json!({
            "beacon": {
                "slot": "8256",
                "proposer_index": "7",
                "parent_root": format!("0x{}", "01".repeat(32)),
                "state_root": format!("0x{}", "02".repeat(32)),
                "body_root": format!("0x{}", "03".repeat(32))
            },
            "execution": {
                "parent_hash": format!("0x{}", "04".repeat(32)),
                "fee_recipient": "0x0000000000000000000000000000000000000000",
                "state_root": format!("0x{}", "05".repeat(32)),
                "receipts_root": format!("0x{}", "06".repeat(32)),
                "logs_bloom": format!("0x{}", "00".repeat(256)),
                "prev_randao": format!("0x{}", "07".repeat(32)),
                "block_number": "120",
                "gas_limit": "30000000",
                "gas_used": "0",
                "timestamp": "1700000000",
                "extra_data": "0x",
                "base_fee_per_gas": "7",
                "block_hash": format!("0x{}", "08".repeat(32)),
                "transactions_root": format!("0x{}", "09".repeat(32)),
                "withdrawals_root": format!("0x{}", "0a".repeat(32))
            },
            "execution_branch": []
        });
        let json = serde_json::json!({
            "attested_header": header.clone(),
            "finalized_header": header,
            "finality_branch": [],
            "sync_aggregate": {
                "sync_committee_bits": format!("0x{}", "ff".repeat(64)),
                "sync_committee_signature": format!("0x{}", "aa".repeat(96))
            },
            "signature_slot": "8258"
        });

        let update: FinalityUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(update.signature_slot, 8258);
        assert_eq!(update.finalized_header.beacon.slot, 8256);
        assert_eq!(update.finalized_header.execution.block_number, 120);
        assert_eq!(update.finalized_header.execution.base_fee_per_gas, U256::from(7));

        let compact = CompactLightClientHeader::from_header(&update.finalized_header).unwrap();
        assert_eq!(compact.execution.block_number, 120);
        assert_ne!(compact.execution.logs_bloom, B256::ZERO);
    }

    #[tokio::test]
    async fn test_long_committee_gap_is_split_into_batches() {
        use crate::testing::MockNetwork;

        let network = MockNetwork::new();
        network.add_chain("a", 1);
        network.add_chain("b", 2);
        let lc = network.deploy_committee_light_client("b", "a").unwrap();
        network.mine("a", 1).unwrap();
        network.advance_beacon_periods("a", 5);

        let tracker = CommitteeTracker::new(
            Arc::new(network.beacon("a")),
            Arc::new(network.chain("b")),
            lc,
            ForkSchedule::testnet(),
        )
        .with_max_rotations(2);
        let options = TxOptions::default();
        let initial = tracker.recorded_state().await.unwrap();

        let mut batches = Vec::new();
        let mut state = initial;
        for _ in 0..3 {
            let update = tracker.build_header_update(&state).await.unwrap();
            batches.push((update.rotations.len(), update.finality.is_some()));
            state = tracker.submit_header_update(update, &options).await.unwrap();
        }

        assert_eq!(batches, vec![(2, false), (2, false), (1, true)]);
        assert!(state.finalized_position > initial.finalized_position);

        let submitted = network.submitted("b");
        assert_eq!(
            submitted
                .iter()
                .filter(|m| *m == "import_next_sync_committee")
                .count(),
            5
        );
        assert_eq!(submitted.last().map(String::as_str), Some("import_finalized_header"));
    }
}
