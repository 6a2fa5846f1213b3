//! Relay orchestrator
//!
//! One [`LaneRelay`] drives a single lane through an explicit state machine:
//!
//! ```text
//! Idle -> SyncingHeader -> Dispatching -> AwaitingFinality -> Confirming -> Idle
//! ```
//!
//! Every step re-reads chain state, so a cycle interrupted at any point can
//! simply be restarted from `Idle`. Replayed submissions come back from the
//! chain as stale and are treated as already done.
//!
//! Parallel lanes stop after `Dispatching`; they have no confirmation leg.
//!
//! Header submissions to a light client are serialized across lanes through
//! [`HeaderSubmissionLocks`].

mod confirm;
mod dispatch;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, U256};
use bridge_rs::error::{RelayError, RelayResult};
use bridge_rs::gateway::{ChainGateway, TxOptions};
use bridge_rs::lightclient::{ConsensusKind, FinalizedHeaderState, LightClientTracker, SyncOutcome};
use bridge_rs::retry::{with_retry, RetryConfig};
use bridge_rs::types::{InboundLaneNonce, LaneId, NonceRange, OutboundLaneNonce};
use tracing::{debug, info};

use crate::metrics;

/// Message ordering of a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneKind {
    /// Nonce-ordered lane with a delivery confirmation leg
    Ordered,
    /// Merkle-tree lane, messages delivered individually in any order
    Parallel,
}

impl FromStr for LaneKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ordered" => Ok(LaneKind::Ordered),
            "parallel" => Ok(LaneKind::Parallel),
            other => Err(RelayError::InvalidInput(format!(
                "unknown lane kind '{}', expected ordered or parallel",
                other
            ))),
        }
    }
}

/// How messages of a lane are proven to the light client on the other side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStyle {
    /// Storage proofs against a trusted block
    Storage,
    /// Chain-committer merkle proofs against a signed message root
    Commitment,
}

impl ProofStyle {
    pub fn for_consensus(kind: ConsensusKind) -> Self {
        match kind {
            ConsensusKind::Committee | ConsensusKind::EpochAuthority => ProofStyle::Storage,
            ConsensusKind::Threshold => ProofStyle::Commitment,
        }
    }
}

/// A chain as seen by one lane
#[derive(Clone)]
pub struct ChainEndpoint {
    pub gateway: Arc<dyn ChainGateway>,
    /// Chain message committer, needed when this chain is proven by
    /// commitment
    pub committer: Option<Address>,
}

impl ChainEndpoint {
    pub fn new(gateway: Arc<dyn ChainGateway>) -> Self {
        Self {
            gateway,
            committer: None,
        }
    }

    pub fn with_committer(mut self, committer: Address) -> Self {
        self.committer = Some(committer);
        self
    }

    pub fn name(&self) -> &str {
        self.gateway.name()
    }

    fn require_committer(&self) -> RelayResult<Address> {
        self.committer.ok_or_else(|| {
            RelayError::InvalidInput(format!(
                "{} is proven by commitment but has no chain committer configured",
                self.name()
            ))
        })
    }
}

/// Contract addresses of one lane
#[derive(Debug, Clone)]
pub struct LaneSpec {
    pub name: String,
    pub kind: LaneKind,
    /// Outbound lane on the source chain
    pub outbound: Address,
    /// Inbound lane on the target chain
    pub inbound: Address,
}

/// Tunables shared by every step
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub retry: RetryConfig,
    pub tx: TxOptions,
    /// Reads of a commitment root and its proof before giving up on a mismatch
    pub commitment_reads: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            tx: TxOptions::default(),
            commitment_reads: 3,
        }
    }
}

/// Where a lane is in its relay cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    SyncingHeader,
    Dispatching { trusted: FinalizedHeaderState },
    AwaitingFinality { submitted_at: u64 },
    Confirming,
}

impl RelayState {
    pub fn name(&self) -> &'static str {
        match self {
            RelayState::Idle => "idle",
            RelayState::SyncingHeader => "syncing_header",
            RelayState::Dispatching { .. } => "dispatching",
            RelayState::AwaitingFinality { .. } => "awaiting_finality",
            RelayState::Confirming => "confirming",
        }
    }

    /// Gauge value for `relay_lane_state`
    pub fn code(&self) -> u8 {
        match self {
            RelayState::Idle => 0,
            RelayState::SyncingHeader => 1,
            RelayState::Dispatching { .. } => 2,
            RelayState::AwaitingFinality { .. } => 3,
            RelayState::Confirming => 4,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Both lane ends read once for a dispatch decision.
///
/// The outbound side is read at the block the target's light client trusts,
/// the inbound side at the target's latest block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSnapshot {
    pub trusted: FinalizedHeaderState,
    pub outbound: OutboundLaneNonce,
    pub inbound: InboundLaneNonce,
}

/// What one full cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Header updates imported on either side
    pub header_updates: u32,
    /// Encoded keys of messages delivered, in order
    pub dispatched: Vec<U256>,
    /// Nonces the source learned were delivered
    pub confirmed: Option<NonceRange>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.header_updates == 0 && self.dispatched.is_empty() && self.confirmed.is_none()
    }
}

/// Per-light-client mutexes guarding header submission.
///
/// Keyed by (hosting chain, light client address); several lanes verified by
/// the same light client share one guard.
#[derive(Clone, Default)]
pub struct HeaderSubmissionLocks {
    inner: Arc<Mutex<HashMap<(String, Address), Arc<tokio::sync::Mutex<()>>>>>,
}

impl HeaderSubmissionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, chain: &str, light_client: Address) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry((chain.to_string(), light_client))
            .or_default()
            .clone()
    }
}

/// Bring `tracker`, hosted on `host`, up to date while holding its guard
pub async fn sync_light_client(
    locks: &HeaderSubmissionLocks,
    host: &dyn ChainGateway,
    tracker: &LightClientTracker,
    settings: &RelaySettings,
) -> RelayResult<SyncOutcome> {
    let guard = locks.lock_for(host.name(), tracker.handle().address);
    let _held = guard.lock().await;

    let outcome = with_retry(&settings.retry, "header sync", move |_| {
        tracker.sync(&settings.tx)
    })
    .await?;

    if let SyncOutcome::Advanced { previous, current } = &outcome {
        metrics::record_header_update(host.name());
        info!(
            chain = host.name(),
            light_client = %tracker.handle().address,
            from = previous.execution_block_number,
            to = current.execution_block_number,
            "Light client advanced"
        );
    }
    Ok(outcome)
}

/// Relay of one lane between a source and a target chain
pub struct LaneRelay {
    lane: LaneSpec,
    lane_id: LaneId,
    source: ChainEndpoint,
    target: ChainEndpoint,
    /// Light client on the target tracking the source
    forward: Arc<LightClientTracker>,
    /// Light client on the source tracking the target (ordered lanes)
    reverse: Option<Arc<LightClientTracker>>,
    locks: HeaderSubmissionLocks,
    settings: RelaySettings,
    state: RelayState,
    report: CycleReport,
}

impl LaneRelay {
    /// Resolve the lane coordinates and check that the configuration can
    /// relay this lane
    pub async fn new(
        lane: LaneSpec,
        source: ChainEndpoint,
        target: ChainEndpoint,
        forward: Arc<LightClientTracker>,
        reverse: Option<Arc<LightClientTracker>>,
        locks: HeaderSubmissionLocks,
        settings: RelaySettings,
    ) -> RelayResult<Self> {
        let lane_id = source.gateway.lane_info(lane.outbound).await?;
        let inbound_id = target.gateway.lane_info(lane.inbound).await?;
        if inbound_id != lane_id.counterpart() {
            return Err(RelayError::InvalidInput(format!(
                "lane {}: inbound {} is lane {}, expected {}",
                lane.name,
                lane.inbound,
                inbound_id,
                lane_id.counterpart()
            )));
        }

        match lane.kind {
            LaneKind::Ordered => {
                let reverse = reverse.as_ref().ok_or_else(|| {
                    RelayError::InvalidInput(format!(
                        "ordered lane {} needs a reverse light client",
                        lane.name
                    ))
                })?;
                if ProofStyle::for_consensus(forward.kind()) == ProofStyle::Commitment {
                    source.require_committer()?;
                }
                if ProofStyle::for_consensus(reverse.kind()) == ProofStyle::Commitment {
                    target.require_committer()?;
                }
            }
            LaneKind::Parallel => {
                if ProofStyle::for_consensus(forward.kind()) == ProofStyle::Commitment {
                    source.require_committer()?;
                }
            }
        }

        info!(
            lane = %lane.name,
            kind = ?lane.kind,
            lane_id = %lane_id,
            source = source.name(),
            target = target.name(),
            "Lane relay ready"
        );

        Ok(Self {
            lane,
            lane_id,
            source,
            target,
            forward,
            reverse,
            locks,
            settings,
            state: RelayState::Idle,
            report: CycleReport::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.lane.name
    }

    pub fn lane_id(&self) -> LaneId {
        self.lane_id
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Advance the state machine by one transition
    pub async fn step(&mut self) -> RelayResult<&RelayState> {
        let next = match &self.state {
            RelayState::Idle => RelayState::SyncingHeader,
            RelayState::SyncingHeader => {
                let outcome = sync_light_client(
                    &self.locks,
                    self.target.gateway.as_ref(),
                    &self.forward,
                    &self.settings,
                )
                .await?;
                if matches!(outcome, SyncOutcome::Advanced { .. }) {
                    self.report.header_updates += 1;
                }
                RelayState::Dispatching {
                    trusted: *outcome.state(),
                }
            }
            RelayState::Dispatching { trusted } => {
                let trusted = *trusted;
                let dispatched = match self.lane.kind {
                    LaneKind::Ordered => self.dispatch_ordered(&trusted).await?,
                    LaneKind::Parallel => self.dispatch_parallel(&trusted).await?,
                };
                let next = match (&dispatched, self.lane.kind) {
                    (_, LaneKind::Parallel) => RelayState::Idle,
                    (Some(delivery), LaneKind::Ordered) => RelayState::AwaitingFinality {
                        submitted_at: delivery.block_number,
                    },
                    (None, LaneKind::Ordered) => RelayState::Confirming,
                };
                if let Some(delivery) = dispatched {
                    metrics::record_dispatched(&self.lane.name, delivery.keys.len());
                    self.report.dispatched.extend(delivery.keys);
                }
                next
            }
            RelayState::AwaitingFinality { submitted_at } => {
                let submitted_at = *submitted_at;
                if self.await_finality(submitted_at).await? {
                    RelayState::Confirming
                } else {
                    RelayState::Idle
                }
            }
            RelayState::Confirming => {
                let (advanced, confirmed) = self.confirm().await?;
                self.report.header_updates += advanced;
                if let Some(range) = confirmed {
                    metrics::record_confirmation(&self.lane.name);
                    self.report.confirmed = Some(range);
                }
                RelayState::Idle
            }
        };

        debug!(lane = %self.lane.name, from = %self.state, to = %next, "Relay state transition");
        metrics::set_lane_state(&self.lane.name, next.code());
        self.state = next;
        Ok(&self.state)
    }

    /// Run transitions from `Idle` until the lane is back in `Idle`.
    ///
    /// On error the lane is reset to `Idle`; the next cycle starts over from
    /// fresh reads.
    pub async fn run_cycle(&mut self) -> RelayResult<CycleReport> {
        self.state = RelayState::Idle;
        self.report = CycleReport::default();

        loop {
            match self.step().await {
                Ok(RelayState::Idle) => break,
                Ok(_) => {}
                Err(e) => {
                    self.state = RelayState::Idle;
                    metrics::set_lane_state(&self.lane.name, RelayState::Idle.code());
                    return Err(e);
                }
            }
        }

        Ok(std::mem::take(&mut self.report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_rs::lightclient::ConsensusState;

    #[test]
    fn test_lane_kind_parse() {
        assert_eq!("ordered".parse::<LaneKind>().unwrap(), LaneKind::Ordered);
        assert_eq!("Parallel".parse::<LaneKind>().unwrap(), LaneKind::Parallel);
        assert!("fifo".parse::<LaneKind>().is_err());
    }

    #[test]
    fn test_proof_style_by_consensus() {
        assert_eq!(
            ProofStyle::for_consensus(ConsensusKind::Committee),
            ProofStyle::Storage
        );
        assert_eq!(
            ProofStyle::for_consensus(ConsensusKind::EpochAuthority),
            ProofStyle::Storage
        );
        assert_eq!(
            ProofStyle::for_consensus(ConsensusKind::Threshold),
            ProofStyle::Commitment
        );
    }

    #[test]
    fn test_state_codes_are_distinct() {
        let states = [
            RelayState::Idle,
            RelayState::SyncingHeader,
            RelayState::Dispatching {
                trusted: FinalizedHeaderState {
                    finalized_position: 1,
                    execution_block_number: 1,
                    consensus: ConsensusState::EpochAuthority {
                        authority_set_epoch: 0,
                        authorities_len: 3,
                    },
                },
            },
            RelayState::AwaitingFinality { submitted_at: 1 },
            RelayState::Confirming,
        ];
        let mut codes: Vec<u8> = states.iter().map(RelayState::code).collect();
        codes.dedup();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_locks_shared_per_light_client() {
        let locks = HeaderSubmissionLocks::new();
        let a = locks.lock_for("b", Address::repeat_byte(1));
        let same = locks.lock_for("b", Address::repeat_byte(1));
        let other = locks.lock_for("c", Address::repeat_byte(1));

        assert!(Arc::ptr_eq(&a, &same));
        assert!(!Arc::ptr_eq(&a, &other));

        let _held = a.lock().await;
        assert!(same.try_lock().is_err());
        assert!(other.try_lock().is_ok());
    }
}
