//! Fork version schedule
//!
//! The sync aggregate signature domain depends on the fork active at the
//! signature slot's epoch.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::FixedBytes;

use crate::error::{RelayError, RelayResult};

pub const SLOTS_PER_EPOCH: u64 = 32;
pub const EPOCHS_PER_SYNC_COMMITTEE_PERIOD: u64 = 256;

/// Sync committee period containing `slot`
pub fn period_of_slot(slot: u64) -> u64 {
    slot / SLOTS_PER_EPOCH / EPOCHS_PER_SYNC_COMMITTEE_PERIOD
}

pub fn epoch_of_slot(slot: u64) -> u64 {
    slot / SLOTS_PER_EPOCH
}

/// Fork activation epochs and their versions
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForkSchedule {
    /// Sorted by activation epoch, ascending
    forks: Vec<(u64, FixedBytes<4>)>,
}

impl ForkSchedule {
    pub fn new(mut forks: Vec<(u64, FixedBytes<4>)>) -> Self {
        forks.sort_by_key(|(epoch, _)| *epoch);
        Self { forks }
    }

    /// Goerli-style test network schedule
    pub fn testnet() -> Self {
        Self::new(vec![
            (0, FixedBytes([0x00, 0x00, 0x10, 0x20])),
            (36660, FixedBytes([0x01, 0x00, 0x10, 0x20])),
            (112260, FixedBytes([0x02, 0x00, 0x10, 0x20])),
            (162304, FixedBytes([0x03, 0x00, 0x10, 0x20])),
        ])
    }

    pub fn is_empty(&self) -> bool {
        self.forks.is_empty()
    }

    /// Version active at `epoch`
    pub fn version_at_epoch(&self, epoch: u64) -> RelayResult<FixedBytes<4>> {
        self.forks
            .iter()
            .rev()
            .find(|(activation, _)| *activation <= epoch)
            .map(|(_, version)| *version)
            .ok_or_else(|| {
                RelayError::InvalidInput(format!("no fork config for epoch {}", epoch))
            })
    }

    /// Version used to verify a signature made at `signature_slot`
    pub fn version_for_slot(&self, signature_slot: u64) -> RelayResult<FixedBytes<4>> {
        self.version_at_epoch(epoch_of_slot(signature_slot))
    }
}

impl FromStr for ForkSchedule {
    type Err = RelayError;

    /// `test`, or a comma separated list of `epoch:0xversion`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("test") || s.eq_ignore_ascii_case("testnet") {
            return Ok(Self::testnet());
        }

        let mut forks = Vec::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (epoch, version) = entry.split_once(':').ok_or_else(|| {
                RelayError::InvalidInput(format!("fork entry '{}' is not epoch:version", entry))
            })?;
            let epoch: u64 = epoch.trim().parse().map_err(|e| {
                RelayError::InvalidInput(format!("fork epoch '{}': {}", epoch, e))
            })?;
            let version: FixedBytes<4> = version.trim().parse().map_err(|e| {
                RelayError::InvalidInput(format!("fork version '{}': {}", version, e))
            })?;
            forks.push((epoch, version));
        }

        if forks.is_empty() {
            return Err(RelayError::InvalidInput("empty fork schedule".to_string()));
        }
        Ok(Self::new(forks))
    }
}

impl fmt::Display for ForkSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .forks
            .iter()
            .map(|(epoch, version)| format!("{}:{}", epoch, version))
            .collect();
        f.write_str(&entries.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_of_slot() {
        assert_eq!(period_of_slot(0), 0);
        assert_eq!(period_of_slot(8191), 0);
        assert_eq!(period_of_slot(8192), 1);
        assert_eq!(period_of_slot(8192 * 5 + 17), 5);
    }

    #[test]
    fn test_testnet_versions_by_epoch() {
        let forks = ForkSchedule::testnet();
        assert_eq!(forks.version_at_epoch(0).unwrap(), FixedBytes([0, 0, 0x10, 0x20]));
        assert_eq!(
            forks.version_at_epoch(36659).unwrap(),
            FixedBytes([0, 0, 0x10, 0x20])
        );
        assert_eq!(
            forks.version_at_epoch(36660).unwrap(),
            FixedBytes([1, 0, 0x10, 0x20])
        );
        assert_eq!(
            forks.version_at_epoch(112260).unwrap(),
            FixedBytes([2, 0, 0x10, 0x20])
        );
        assert_eq!(
            forks.version_for_slot(162304 * 32).unwrap(),
            FixedBytes([3, 0, 0x10, 0x20])
        );
    }

    #[test]
    fn test_missing_fork_config() {
        let forks = ForkSchedule::new(vec![(100, FixedBytes([9, 0, 0, 0]))]);
        assert!(forks.version_at_epoch(99).is_err());
        assert!(ForkSchedule::default().version_at_epoch(0).is_err());
    }

    #[test]
    fn test_parse_schedule() {
        let parsed: ForkSchedule = "0:0x00000001, 10:0x00000002".parse().unwrap();
        assert_eq!(parsed.version_at_epoch(9).unwrap(), FixedBytes([0, 0, 0, 1]));
        assert_eq!(parsed.version_at_epoch(10).unwrap(), FixedBytes([0, 0, 0, 2]));

        assert_eq!("test".parse::<ForkSchedule>().unwrap(), ForkSchedule::testnet());
        assert!("garbage".parse::<ForkSchedule>().is_err());
        assert!("".parse::<ForkSchedule>().is_err());
    }
}
