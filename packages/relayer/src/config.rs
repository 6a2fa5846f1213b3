use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use alloy::primitives::Address;
use bridge_rs::lightclient::{ConsensusKind, ForkSchedule};
use eyre::{eyre, Result, WrapErr};

use crate::orchestrator::LaneKind;

/// Main configuration for the relayer
#[derive(Clone)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    pub lanes: Vec<LaneConfig>,
    pub relayer: RelayerConfig,
    /// Key used for every submission
    pub private_key: String,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("chains", &self.chains)
            .field("lanes", &self.lanes)
            .field("relayer", &self.relayer)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// One chain the relayer talks to
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Name used in logs, metrics and lane references
    pub name: String,
    pub rpc_url: String,
    /// How light clients on other chains verify this chain
    pub consensus: ConsensusKind,
    /// Chain position in the lane identifiers
    pub position: u32,
    /// Chain message committer (threshold chains)
    pub chain_committer: Option<Address>,
    /// Beacon node REST endpoint (committee chains)
    pub beacon_url: Option<String>,
    /// Authority signer service (threshold chains)
    pub signer_url: Option<String>,
    /// First block replayed for parallel lane messages
    pub log_start_block: u64,
}

/// One lane to relay
#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub name: String,
    pub source: String,
    pub target: String,
    pub kind: LaneKind,
    /// Outbound lane contract on the source
    pub outbound: Address,
    /// Inbound lane contract on the target
    pub inbound: Address,
    /// Light client on the target verifying the source
    pub light_client: Address,
    /// Light client on the source verifying the target (ordered lanes)
    pub reverse_light_client: Option<Address>,
}

/// Scheduling and retry settings
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub poll_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub epoch_gap: u64,
    pub fork_schedule: String,
    pub api_port: u16,
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_epoch_gap() -> u64 {
    bridge_rs::lightclient::epoch::DEFAULT_EPOCH_GAP
}

fn default_fork_schedule() -> String {
    "test".to_string()
}

fn default_api_port() -> u16 {
    9090
}

/// Validate an RPC URL: must be http(s) with a host
pub fn validate_rpc_url(url_str: &str, name: &str) -> Result<()> {
    let parsed =
        url::Url::parse(url_str).map_err(|e| eyre!("{} must be a valid URL: {}", name, e))?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(eyre!(
            "{} must use http:// or https:// scheme, got {}",
            name,
            scheme
        ));
    }

    if parsed.host_str().is_none() {
        return Err(eyre!("{} must have a host component", name));
    }

    if scheme == "http" {
        tracing::warn!("{} uses unencrypted http://, use https:// in production", name);
    }

    Ok(())
}

fn parse_address(value: &str, name: &str) -> Result<Address> {
    Address::from_str(value.trim()).map_err(|e| eyre!("{} must be a hex address: {}", name, e))
}

/// Variable source: the process environment, or a map in tests
struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn required(&self, key: &str) -> Result<String> {
        (self.0)(key).ok_or_else(|| eyre!("{} environment variable is required", key))
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parsed_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.optional(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn count(&self, key: &str) -> Result<usize> {
        self.required(key)?
            .trim()
            .parse()
            .wrap_err_with(|| format!("{} must be a number", key))
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build and validate a configuration from `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(lookup);

        let chain_count = vars.count("CHAINS_COUNT")?;
        let mut chains = Vec::with_capacity(chain_count);
        for i in 1..=chain_count {
            let prefix = format!("CHAIN_{}", i);
            let key = |field: &str| format!("{}_{}", prefix, field);

            let consensus = vars
                .required(&key("CONSENSUS"))?
                .parse::<ConsensusKind>()
                .map_err(|e| eyre!("{}: {}", key("CONSENSUS"), e))?;
            let position = vars
                .required(&key("POSITION"))?
                .trim()
                .parse()
                .wrap_err_with(|| format!("{} must be a u32", key("POSITION")))?;
            let chain_committer = vars
                .optional(&key("CHAIN_COMMITTER"))
                .map(|v| parse_address(&v, &key("CHAIN_COMMITTER")))
                .transpose()?;

            chains.push(ChainConfig {
                name: vars
                    .optional(&key("NAME"))
                    .unwrap_or_else(|| format!("chain_{}", i)),
                rpc_url: vars.required(&key("RPC_URL"))?,
                consensus,
                position,
                chain_committer,
                beacon_url: vars.optional(&key("BEACON_URL")),
                signer_url: vars.optional(&key("SIGNER_URL")),
                log_start_block: vars.parsed_or(&key("LOG_START_BLOCK"), 0),
            });
        }

        let lane_count = vars.count("LANES_COUNT")?;
        let mut lanes = Vec::with_capacity(lane_count);
        for i in 1..=lane_count {
            let prefix = format!("LANE_{}", i);
            let key = |field: &str| format!("{}_{}", prefix, field);

            let source = vars.required(&key("SOURCE"))?;
            let target = vars.required(&key("TARGET"))?;
            let kind = vars
                .optional(&key("KIND"))
                .map(|v| v.parse::<LaneKind>())
                .transpose()
                .map_err(|e| eyre!("{}: {}", key("KIND"), e))?
                .unwrap_or(LaneKind::Ordered);
            let reverse_light_client = vars
                .optional(&key("REVERSE_LIGHT_CLIENT"))
                .map(|v| parse_address(&v, &key("REVERSE_LIGHT_CLIENT")))
                .transpose()?;

            lanes.push(LaneConfig {
                name: vars
                    .optional(&key("NAME"))
                    .unwrap_or_else(|| format!("{}-{}-{}", source, target, i)),
                outbound: parse_address(&vars.required(&key("OUTBOUND"))?, &key("OUTBOUND"))?,
                inbound: parse_address(&vars.required(&key("INBOUND"))?, &key("INBOUND"))?,
                light_client: parse_address(
                    &vars.required(&key("LIGHT_CLIENT"))?,
                    &key("LIGHT_CLIENT"),
                )?,
                reverse_light_client,
                source,
                target,
                kind,
            });
        }

        let relayer = RelayerConfig {
            poll_interval_ms: vars.parsed_or("POLL_INTERVAL_MS", default_poll_interval()),
            retry_attempts: vars.parsed_or("RETRY_ATTEMPTS", default_retry_attempts()),
            retry_delay_ms: vars.parsed_or("RETRY_DELAY_MS", default_retry_delay()),
            epoch_gap: vars.parsed_or("EPOCH_GAP", default_epoch_gap()),
            fork_schedule: vars
                .optional("FORK_SCHEDULE")
                .unwrap_or_else(default_fork_schedule),
            api_port: vars.parsed_or("API_PORT", default_api_port()),
        };

        let config = Config {
            chains,
            lanes,
            relayer,
            private_key: vars.required("RELAYER_PRIVATE_KEY")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.name == name)
    }

    pub fn fork_schedule(&self) -> Result<ForkSchedule> {
        self.relayer
            .fork_schedule
            .parse()
            .map_err(|e| eyre!("FORK_SCHEDULE: {}", e))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            return Err(eyre!("at least one chain must be configured"));
        }
        if self.lanes.is_empty() {
            return Err(eyre!("at least one lane must be configured"));
        }

        let mut names = HashSet::new();
        let mut positions = HashSet::new();
        for chain in &self.chains {
            if !names.insert(chain.name.as_str()) {
                return Err(eyre!("duplicate chain name {}", chain.name));
            }
            if !positions.insert(chain.position) {
                return Err(eyre!(
                    "chain {} reuses position {}",
                    chain.name,
                    chain.position
                ));
            }

            validate_rpc_url(&chain.rpc_url, &format!("{} RPC URL", chain.name))?;

            match chain.consensus {
                ConsensusKind::Committee => {
                    let url = chain.beacon_url.as_deref().ok_or_else(|| {
                        eyre!("committee chain {} needs a beacon URL", chain.name)
                    })?;
                    validate_rpc_url(url, &format!("{} beacon URL", chain.name))?;
                }
                ConsensusKind::Threshold => {
                    let url = chain.signer_url.as_deref().ok_or_else(|| {
                        eyre!("threshold chain {} needs a signer URL", chain.name)
                    })?;
                    validate_rpc_url(url, &format!("{} signer URL", chain.name))?;
                    if chain.chain_committer.is_none() {
                        return Err(eyre!(
                            "threshold chain {} needs a chain committer",
                            chain.name
                        ));
                    }
                }
                ConsensusKind::EpochAuthority => {}
            }
        }

        let mut lane_names = HashSet::new();
        for lane in &self.lanes {
            if !lane_names.insert(lane.name.as_str()) {
                return Err(eyre!("duplicate lane name {}", lane.name));
            }
            let source = self
                .chain(&lane.source)
                .ok_or_else(|| eyre!("lane {}: unknown source chain {}", lane.name, lane.source))?;
            let target = self
                .chain(&lane.target)
                .ok_or_else(|| eyre!("lane {}: unknown target chain {}", lane.name, lane.target))?;
            if source.name == target.name {
                return Err(eyre!("lane {}: source and target are both {}", lane.name, source.name));
            }

            if lane.kind == LaneKind::Ordered && lane.reverse_light_client.is_none() {
                return Err(eyre!(
                    "ordered lane {} needs a reverse light client on {}",
                    lane.name,
                    source.name
                ));
            }
        }

        if self.private_key.len() != 66 || !self.private_key.starts_with("0x") {
            return Err(eyre!(
                "RELAYER_PRIVATE_KEY must be 66 chars (0x + 64 hex chars)"
            ));
        }

        if self.relayer.poll_interval_ms == 0 {
            return Err(eyre!("POLL_INTERVAL_MS must be positive"));
        }
        if self.relayer.epoch_gap == 0 {
            return Err(eyre!("EPOCH_GAP must be positive"));
        }
        self.fork_schedule()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    fn base_vars() -> HashMap<String, String> {
        let pairs = [
            ("CHAINS_COUNT", "2"),
            ("CHAIN_1_NAME", "goerli"),
            ("CHAIN_1_RPC_URL", "https://goerli.example.org"),
            ("CHAIN_1_CONSENSUS", "committee"),
            ("CHAIN_1_POSITION", "0"),
            ("CHAIN_1_BEACON_URL", "https://beacon.example.org"),
            ("CHAIN_2_NAME", "bsc"),
            ("CHAIN_2_RPC_URL", "https://bsc.example.org"),
            ("CHAIN_2_CONSENSUS", "parlia"),
            ("CHAIN_2_POSITION", "1"),
            ("LANES_COUNT", "1"),
            ("LANE_1_SOURCE", "goerli"),
            ("LANE_1_TARGET", "bsc"),
            ("LANE_1_OUTBOUND", "0x1111111111111111111111111111111111111111"),
            ("LANE_1_INBOUND", "0x2222222222222222222222222222222222222222"),
            ("LANE_1_LIGHT_CLIENT", "0x3333333333333333333333333333333333333333"),
            ("LANE_1_REVERSE_LIGHT_CLIENT", "0x4444444444444444444444444444444444444444"),
            ("RELAYER_PRIVATE_KEY", KEY),
        ];
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(vars: &HashMap<String, String>) -> Result<Config> {
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_poll_interval(), 5000);
        assert_eq!(default_retry_attempts(), 5);
        assert_eq!(default_retry_delay(), 2000);
        assert_eq!(default_epoch_gap(), 200);
        assert_eq!(default_api_port(), 9090);
    }

    #[test]
    fn test_load_indexed_chains_and_lanes() {
        let config = load(&base_vars()).unwrap();

        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.chains[1].consensus, ConsensusKind::EpochAuthority);
        assert_eq!(config.chains[1].position, 1);

        let lane = &config.lanes[0];
        assert_eq!(lane.name, "goerli-bsc-1");
        assert_eq!(lane.kind, LaneKind::Ordered);
        assert_eq!(lane.outbound, Address::repeat_byte(0x11));
        assert_eq!(lane.reverse_light_client, Some(Address::repeat_byte(0x44)));
        assert_eq!(config.relayer.poll_interval_ms, 5000);
    }

    #[test]
    fn test_missing_required_variable() {
        let mut vars = base_vars();
        vars.remove("LANE_1_INBOUND");
        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("LANE_1_INBOUND"), "{}", err);
    }

    #[test]
    fn test_committee_chain_requires_beacon_url() {
        let mut vars = base_vars();
        vars.remove("CHAIN_1_BEACON_URL");
        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("beacon URL"), "{}", err);
    }

    #[test]
    fn test_threshold_chain_requires_committer() {
        let mut vars = base_vars();
        vars.insert("CHAIN_2_CONSENSUS".into(), "threshold".into());
        vars.insert("CHAIN_2_SIGNER_URL".into(), "https://signer.example.org".into());
        assert!(load(&vars).is_err());

        vars.insert(
            "CHAIN_2_CHAIN_COMMITTER".into(),
            "0x5555555555555555555555555555555555555555".into(),
        );
        assert!(load(&vars).is_ok());
    }

    #[test]
    fn test_ordered_lane_requires_reverse_light_client() {
        let mut vars = base_vars();
        vars.remove("LANE_1_REVERSE_LIGHT_CLIENT");
        assert!(load(&vars).is_err());

        vars.insert("LANE_1_KIND".into(), "parallel".into());
        assert!(load(&vars).is_ok());
    }

    #[test]
    fn test_parallel_lane_from_threshold_chain() {
        let mut vars = base_vars();
        vars.insert("LANE_1_KIND".into(), "parallel".into());
        vars.insert("CHAIN_1_CONSENSUS".into(), "threshold".into());
        vars.insert("CHAIN_1_SIGNER_URL".into(), "https://signer.example.org".into());
        vars.insert(
            "CHAIN_1_CHAIN_COMMITTER".into(),
            "0x5555555555555555555555555555555555555555".into(),
        );

        let config = load(&vars).unwrap();
        assert_eq!(config.lanes[0].kind, LaneKind::Parallel);
        assert_eq!(config.chains[0].consensus, ConsensusKind::Threshold);
    }

    #[test]
    fn test_lane_must_reference_known_chains() {
        let mut vars = base_vars();
        vars.insert("LANE_1_TARGET".into(), "polygon".into());
        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("unknown target chain"), "{}", err);
    }

    #[test]
    fn test_duplicate_positions_rejected() {
        let mut vars = base_vars();
        vars.insert("CHAIN_2_POSITION".into(), "0".into());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_invalid_fork_schedule_rejected() {
        let mut vars = base_vars();
        vars.insert("FORK_SCHEDULE".into(), "epoch:zz".into());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_validate_rpc_url() {
        assert!(validate_rpc_url("https://rpc.example.org", "rpc").is_ok());
        assert!(validate_rpc_url("http://localhost:8545", "rpc").is_ok());
        assert!(validate_rpc_url("ws://localhost:8546", "rpc").is_err());
        assert!(validate_rpc_url("not a url", "rpc").is_err());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let config = load(&base_vars()).unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(KEY));
    }
}
