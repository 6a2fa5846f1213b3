//! Light client trackers
//!
//! A destination chain trusts a source chain's state only through the light
//! client it hosts for that source. The trackers here read what the light
//! client has recorded, decide whether the source has moved on, build the
//! consensus-specific header update and submit it.
//!
//! Three consensus models are supported, behind one [`LightClientTracker`]:
//!
//! | Kind | Source evidence | Update payload |
//! |---|---|---|
//! | Committee | beacon finality update | finalized header + committee rotations |
//! | EpochAuthority | execution headers | `L/2+1` headers past the next checkpoint |
//! | Threshold | authority signatures | signed `{block, message_root, nonce}` |

pub mod committee;
pub mod epoch;
pub mod fork;
pub mod ssz;
pub mod threshold;

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256};
use tracing::{debug, info};

use crate::error::{RelayError, RelayResult};
use crate::gateway::TxOptions;

pub use committee::{CommitteeTracker, CommitteeUpdate};
pub use epoch::{EpochTracker, EpochUpdate};
pub use fork::ForkSchedule;
pub use threshold::{SignedCommitment, ThresholdTracker};

/// Consensus model of a source chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsensusKind {
    Committee,
    EpochAuthority,
    Threshold,
}

impl ConsensusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusKind::Committee => "committee",
            ConsensusKind::EpochAuthority => "epoch",
            ConsensusKind::Threshold => "threshold",
        }
    }
}

impl fmt::Display for ConsensusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsensusKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "committee" | "beacon" => Ok(ConsensusKind::Committee),
            "epoch" | "parlia" => Ok(ConsensusKind::EpochAuthority),
            "threshold" | "ecdsa" => Ok(ConsensusKind::Threshold),
            other => Err(RelayError::InvalidInput(format!(
                "unknown consensus kind '{}'",
                other
            ))),
        }
    }
}

/// A light client contract and the consensus model it verifies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightClientHandle {
    pub address: Address,
    pub kind: ConsensusKind,
}

impl LightClientHandle {
    pub fn committee(address: Address) -> Self {
        Self {
            address,
            kind: ConsensusKind::Committee,
        }
    }

    pub fn epoch(address: Address) -> Self {
        Self {
            address,
            kind: ConsensusKind::EpochAuthority,
        }
    }

    pub fn threshold(address: Address) -> Self {
        Self {
            address,
            kind: ConsensusKind::Threshold,
        }
    }
}

/// Consensus-specific part of the recorded state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusState {
    Committee {
        period: u64,
        sync_committee_root: B256,
    },
    EpochAuthority {
        authority_set_epoch: u64,
        authorities_len: u64,
    },
    Threshold {
        authority_nonce: u64,
        message_root: B256,
    },
}

/// What a destination light client currently trusts about its source.
///
/// Only ever produced by reading the light client; positions never go
/// backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizedHeaderState {
    /// Beacon slot (committee) or block number (others)
    pub finalized_position: u64,
    /// Source execution block whose state proofs verify against it
    pub execution_block_number: u64,
    pub consensus: ConsensusState,
}

/// Header update for any consensus kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderUpdate {
    Committee(CommitteeUpdate),
    EpochAuthority(EpochUpdate),
    Threshold(SignedCommitment),
}

impl HeaderUpdate {
    pub fn kind(&self) -> ConsensusKind {
        match self {
            HeaderUpdate::Committee(_) => ConsensusKind::Committee,
            HeaderUpdate::EpochAuthority(_) => ConsensusKind::EpochAuthority,
            HeaderUpdate::Threshold(_) => ConsensusKind::Threshold,
        }
    }
}

/// Result of a sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing newer to import
    UpToDate(FinalizedHeaderState),
    /// A header update was imported
    Advanced {
        previous: FinalizedHeaderState,
        current: FinalizedHeaderState,
    },
}

impl SyncOutcome {
    /// State the destination trusts after the sync
    pub fn state(&self) -> &FinalizedHeaderState {
        match self {
            SyncOutcome::UpToDate(state) => state,
            SyncOutcome::Advanced { current, .. } => current,
        }
    }
}

/// Tracker for one destination-hosted light client
pub enum LightClientTracker {
    Committee(CommitteeTracker),
    EpochAuthority(EpochTracker),
    Threshold(ThresholdTracker),
}

impl LightClientTracker {
    pub fn handle(&self) -> &LightClientHandle {
        match self {
            LightClientTracker::Committee(t) => t.handle(),
            LightClientTracker::EpochAuthority(t) => t.handle(),
            LightClientTracker::Threshold(t) => t.handle(),
        }
    }

    pub fn kind(&self) -> ConsensusKind {
        self.handle().kind
    }

    pub async fn recorded_state(&self) -> RelayResult<FinalizedHeaderState> {
        match self {
            LightClientTracker::Committee(t) => t.recorded_state().await,
            LightClientTracker::EpochAuthority(t) => t.recorded_state().await,
            LightClientTracker::Threshold(t) => t.recorded_state().await,
        }
    }

    pub async fn needs_update(&self, recorded: &FinalizedHeaderState) -> RelayResult<bool> {
        match self {
            LightClientTracker::Committee(t) => t.needs_update(recorded).await,
            LightClientTracker::EpochAuthority(t) => t.needs_update(recorded).await,
            LightClientTracker::Threshold(t) => t.needs_update(recorded).await,
        }
    }

    /// Build the next update; `StaleState` when the source has nothing newer
    pub async fn build_header_update(
        &self,
        recorded: &FinalizedHeaderState,
    ) -> RelayResult<HeaderUpdate> {
        match self {
            LightClientTracker::Committee(t) => {
                t.build_header_update(recorded).await.map(HeaderUpdate::Committee)
            }
            LightClientTracker::EpochAuthority(t) => t
                .build_header_update(recorded)
                .await
                .map(HeaderUpdate::EpochAuthority),
            LightClientTracker::Threshold(t) => {
                t.build_header_update(recorded).await.map(HeaderUpdate::Threshold)
            }
        }
    }

    /// Submit `update` and return the state the light client records after it
    pub async fn submit_header_update(
        &self,
        update: HeaderUpdate,
        options: &TxOptions,
    ) -> RelayResult<FinalizedHeaderState> {
        match (self, update) {
            (LightClientTracker::Committee(t), HeaderUpdate::Committee(u)) => {
                t.submit_header_update(u, options).await
            }
            (LightClientTracker::EpochAuthority(t), HeaderUpdate::EpochAuthority(u)) => {
                t.submit_header_update(u, options).await
            }
            (LightClientTracker::Threshold(t), HeaderUpdate::Threshold(u)) => {
                t.submit_header_update(u, options).await
            }
            (tracker, update) => Err(RelayError::InvalidInput(format!(
                "{} update submitted to {} light client",
                update.kind(),
                tracker.kind()
            ))),
        }
    }

    /// Bring the light client up to the source's latest finalized state.
    ///
    /// Stale results (nothing newer, or another task got there first) are
    /// reported as [`SyncOutcome::UpToDate`].
    pub async fn sync(&self, options: &TxOptions) -> RelayResult<SyncOutcome> {
        let previous = self.recorded_state().await?;

        if !self.needs_update(&previous).await? {
            debug!(
                light_client = %self.handle().address,
                position = previous.finalized_position,
                "Light client up to date"
            );
            return Ok(SyncOutcome::UpToDate(previous));
        }

        let update = match self.build_header_update(&previous).await {
            Ok(update) => update,
            Err(e) if e.is_noop() => {
                debug!(error = %e, "Header update not needed");
                return Ok(SyncOutcome::UpToDate(previous));
            }
            Err(e) => return Err(e),
        };

        let current = match self.submit_header_update(update, options).await {
            Ok(state) => state,
            Err(e) if e.is_noop() => {
                debug!(error = %e, "Header update already imported");
                return Ok(SyncOutcome::UpToDate(self.recorded_state().await?));
            }
            Err(e) => return Err(e),
        };

        if current.finalized_position < previous.finalized_position {
            return Err(RelayError::InconsistentRead(format!(
                "light client position went backwards: {} -> {}",
                previous.finalized_position, current.finalized_position
            )));
        }

        info!(
            light_client = %self.handle().address,
            kind = %self.kind(),
            from = previous.finalized_position,
            to = current.finalized_position,
            execution_block = current.execution_block_number,
            "Light client advanced"
        );

        Ok(SyncOutcome::Advanced { previous, current })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consensus_kind_parsing() {
        assert_eq!("committee".parse::<ConsensusKind>().unwrap(), ConsensusKind::Committee);
        assert_eq!("Parlia".parse::<ConsensusKind>().unwrap(), ConsensusKind::EpochAuthority);
        assert_eq!("ecdsa".parse::<ConsensusKind>().unwrap(), ConsensusKind::Threshold);
        assert!("pow".parse::<ConsensusKind>().is_err());
    }
}
