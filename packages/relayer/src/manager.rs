//! Lane scheduler
//!
//! Builds one [`LaneRelay`] per configured lane and runs each in its own
//! task. Every task polls its lane, backs off after failures and pauses
//! behind a circuit breaker when failures pile up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use bridge_rs::gateway::authority::AuthorityClient;
use bridge_rs::gateway::beacon::BeaconClient;
use bridge_rs::gateway::evm::{EvmGateway, EvmGatewayConfig};
use bridge_rs::gateway::ChainGateway;
use bridge_rs::lightclient::{
    CommitteeTracker, ConsensusKind, EpochTracker, ForkSchedule, LightClientTracker,
    ThresholdTracker,
};
use bridge_rs::retry::RetryConfig;
use eyre::{eyre, Result, WrapErr};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::api::SharedHealth;
use crate::config::{ChainConfig, Config};
use crate::metrics;
use crate::orchestrator::{
    ChainEndpoint, CycleReport, HeaderSubmissionLocks, LaneRelay, LaneSpec, RelaySettings,
};

/// Circuit breaker configuration for lane workers
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before pausing
    pub threshold: u32,
    /// How long to pause when circuit breaker trips
    pub pause_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            pause_duration: Duration::from_secs(300),
        }
    }
}

/// Drives one lane relay in a poll loop
pub struct LaneWorker {
    relay: LaneRelay,
    poll_interval: Duration,
    retry: RetryConfig,
    circuit_breaker: CircuitBreakerConfig,
    consecutive_failures: u32,
    cycles: u64,
    health: SharedHealth,
}

impl LaneWorker {
    pub fn new(
        relay: LaneRelay,
        poll_interval: Duration,
        retry: RetryConfig,
        health: SharedHealth,
    ) -> Self {
        Self {
            relay,
            poll_interval,
            retry,
            circuit_breaker: CircuitBreakerConfig::default(),
            consecutive_failures: 0,
            cycles: 0,
            health,
        }
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn circuit_open(&self) -> bool {
        self.consecutive_failures >= self.circuit_breaker.threshold
    }

    /// Run one relay cycle and record its outcome
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        self.cycles += 1;
        let name = self.relay.name().to_string();

        let result = self.relay.run_cycle().await;
        match &result {
            Ok(report) => {
                self.consecutive_failures = 0;
                metrics::record_cycle(&name, true);
                if !report.is_idle() {
                    info!(
                        lane = %name,
                        header_updates = report.header_updates,
                        dispatched = report.dispatched.len(),
                        confirmed = ?report.confirmed,
                        "Relay cycle complete"
                    );
                }
            }
            Err(e) => {
                self.consecutive_failures += 1;
                metrics::record_cycle(&name, false);
                metrics::record_error(&name, e.kind());
            }
        }
        metrics::set_consecutive_failures(&name, self.consecutive_failures);

        let mut health = self.health.write().await;
        let entry = health.entry(name).or_default();
        entry.state = self.relay.state().name().to_string();
        entry.cycles = self.cycles;
        entry.consecutive_failures = self.consecutive_failures;
        entry.circuit_open = self.circuit_open();
        match &result {
            Ok(report) => {
                entry.messages_dispatched += report.dispatched.len() as u64;
                entry.last_error = None;
            }
            Err(e) => entry.last_error = Some(e.to_string()),
        }
        drop(health);

        Ok(result?)
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let name = self.relay.name().to_string();
        info!(
            lane = %name,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Lane worker starting poll loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Log every 12 cycles to show the worker is alive
            if self.cycles % 12 == 0 {
                info!(
                    lane = %name,
                    cycle = self.cycles,
                    state = %self.relay.state(),
                    failures = self.consecutive_failures,
                    "Lane worker heartbeat"
                );
            }

            let wait = if self.circuit_open() {
                warn!(
                    lane = %name,
                    failures = self.consecutive_failures,
                    pause_secs = self.circuit_breaker.pause_duration.as_secs(),
                    "Circuit breaker tripped, pausing lane"
                );
                let pause = self.circuit_breaker.pause_duration;
                self.consecutive_failures = 0;
                pause
            } else {
                let result = tokio::select! {
                    result = self.run_once() => result,
                    _ = shutdown.changed() => break,
                };
                match result {
                    Ok(_) => self.poll_interval,
                    Err(e) => {
                        let backoff = self.retry.backoff_for_attempt(self.consecutive_failures);
                        error!(
                            lane = %name,
                            error = %e,
                            consecutive_failures = self.consecutive_failures,
                            next_backoff_secs = backoff.as_secs(),
                            "Relay cycle failed, will retry with backoff"
                        );
                        backoff.max(self.poll_interval)
                    }
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(lane = %name, "Shutdown signal received, stopping lane worker");
        Ok(())
    }
}

/// Gateways, light-client trackers and relays built from configuration
pub struct RelayManager {
    workers: Vec<LaneWorker>,
}

impl RelayManager {
    pub fn from_workers(workers: Vec<LaneWorker>) -> Self {
        Self { workers }
    }

    pub fn lanes(&self) -> usize {
        self.workers.len()
    }

    pub async fn new(config: &Config, health: SharedHealth) -> Result<Self> {
        let forks = config.fork_schedule()?;
        let retry = RetryConfig::new(
            config.relayer.retry_attempts,
            Duration::from_millis(config.relayer.retry_delay_ms),
        );
        let settings = RelaySettings {
            retry: retry.clone(),
            ..RelaySettings::default()
        };
        let poll_interval = Duration::from_millis(config.relayer.poll_interval_ms);

        let mut gateways: HashMap<String, Arc<dyn ChainGateway>> = HashMap::new();
        for chain in &config.chains {
            let gateway = EvmGateway::new(EvmGatewayConfig {
                private_key: Some(config.private_key.clone()),
                log_start_block: chain.log_start_block,
                epoch_gap: config.relayer.epoch_gap,
                ..EvmGatewayConfig::new(&chain.name, &chain.rpc_url)
            })
            .wrap_err_with(|| format!("Failed to create gateway for {}", chain.name))?;
            gateways.insert(chain.name.clone(), Arc::new(gateway));
        }

        let mut builder = TrackerBuilder {
            gateways: &gateways,
            forks,
            epoch_gap: config.relayer.epoch_gap,
            trackers: HashMap::new(),
        };
        let locks = HeaderSubmissionLocks::new();
        let mut workers = Vec::with_capacity(config.lanes.len());

        for lane in &config.lanes {
            let source = config
                .chain(&lane.source)
                .ok_or_else(|| eyre!("lane {}: unknown chain {}", lane.name, lane.source))?;
            let target = config
                .chain(&lane.target)
                .ok_or_else(|| eyre!("lane {}: unknown chain {}", lane.name, lane.target))?;

            let forward = builder.tracker(target, source, lane.light_client)?;
            let reverse = lane
                .reverse_light_client
                .map(|lc| builder.tracker(source, target, lc))
                .transpose()?;

            let relay = LaneRelay::new(
                LaneSpec {
                    name: lane.name.clone(),
                    kind: lane.kind,
                    outbound: lane.outbound,
                    inbound: lane.inbound,
                },
                builder.endpoint(source)?,
                builder.endpoint(target)?,
                forward,
                reverse,
                locks.clone(),
                settings.clone(),
            )
            .await
            .wrap_err_with(|| format!("Failed to set up lane {}", lane.name))?;

            let lane_id = relay.lane_id();
            if lane_id.this_chain_position != source.position
                || lane_id.bridged_chain_position != target.position
            {
                return Err(eyre!(
                    "lane {} is {} on chain, but {} and {} are configured at positions {} and {}",
                    lane.name,
                    lane_id,
                    source.name,
                    target.name,
                    source.position,
                    target.position
                ));
            }

            workers.push(LaneWorker::new(relay, poll_interval, retry.clone(), health.clone()));
        }

        info!(
            chains = config.chains.len(),
            lanes = workers.len(),
            light_clients = builder.trackers.len(),
            "Relay manager initialized"
        );
        Ok(Self { workers })
    }

    /// Run every lane worker until shutdown
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tasks = JoinSet::new();
        for worker in self.workers {
            tasks.spawn(worker.run(shutdown.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Lane worker stopped with error"),
                Err(e) => error!(error = %e, "Lane worker panicked"),
            }
        }
        Ok(())
    }
}

/// Shares one tracker per (hosting chain, light client)
struct TrackerBuilder<'a> {
    gateways: &'a HashMap<String, Arc<dyn ChainGateway>>,
    forks: ForkSchedule,
    epoch_gap: u64,
    trackers: HashMap<(String, Address), Arc<LightClientTracker>>,
}

impl TrackerBuilder<'_> {
    fn gateway(&self, chain: &ChainConfig) -> Result<Arc<dyn ChainGateway>> {
        self.gateways
            .get(&chain.name)
            .cloned()
            .ok_or_else(|| eyre!("no gateway for {}", chain.name))
    }

    fn endpoint(&self, chain: &ChainConfig) -> Result<ChainEndpoint> {
        let endpoint = ChainEndpoint::new(self.gateway(chain)?);
        Ok(match chain.chain_committer {
            Some(committer) => endpoint.with_committer(committer),
            None => endpoint,
        })
    }

    /// Tracker for `light_client` on `host` verifying `source`
    fn tracker(
        &mut self,
        host: &ChainConfig,
        source: &ChainConfig,
        light_client: Address,
    ) -> Result<Arc<LightClientTracker>> {
        let key = (host.name.clone(), light_client);
        if let Some(tracker) = self.trackers.get(&key) {
            return Ok(tracker.clone());
        }

        let destination = self.gateway(host)?;
        let tracker = match source.consensus {
            ConsensusKind::Committee => {
                let url = source
                    .beacon_url
                    .as_deref()
                    .ok_or_else(|| eyre!("{} has no beacon URL", source.name))?;
                LightClientTracker::Committee(CommitteeTracker::new(
                    Arc::new(BeaconClient::new(url)?),
                    destination,
                    light_client,
                    self.forks.clone(),
                ))
            }
            ConsensusKind::EpochAuthority => LightClientTracker::EpochAuthority(EpochTracker::new(
                self.gateway(source)?,
                destination,
                light_client,
                self.epoch_gap,
            )),
            ConsensusKind::Threshold => {
                let url = source
                    .signer_url
                    .as_deref()
                    .ok_or_else(|| eyre!("{} has no signer URL", source.name))?;
                let committer = source
                    .chain_committer
                    .ok_or_else(|| eyre!("{} has no chain committer", source.name))?;
                LightClientTracker::Threshold(ThresholdTracker::new(
                    self.gateway(source)?,
                    Arc::new(AuthorityClient::new(url)?),
                    destination,
                    light_client,
                    committer,
                ))
            }
        };

        info!(
            host = %host.name,
            source = %source.name,
            %light_client,
            kind = %source.consensus,
            "Tracking light client"
        );
        let tracker = Arc::new(tracker);
        self.trackers.insert(key, tracker.clone());
        Ok(tracker)
    }
}
