//! Common types for message lanes
//!
//! Lane coordinates, messages, nonce bookkeeping structs and block headers
//! shared by the proof codec, the trackers and the gateways.

use std::fmt;

use alloy::primitives::{Address, Bytes, B256, B64, U256};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

// ============================================================================
// Lane Coordinates
// ============================================================================

/// Position coordinates identifying a directional lane.
///
/// Packed into the upper bits of a message's encoded key:
///
/// ```text
/// | 64 bits | this chain (32) | this lane (32) | bridged chain (32) | bridged lane (32) | nonce (64) |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LaneId {
    pub this_chain_position: u32,
    pub this_lane_position: u32,
    pub bridged_chain_position: u32,
    pub bridged_lane_position: u32,
}

impl LaneId {
    pub fn new(
        this_chain_position: u32,
        this_lane_position: u32,
        bridged_chain_position: u32,
        bridged_lane_position: u32,
    ) -> Self {
        Self {
            this_chain_position,
            this_lane_position,
            bridged_chain_position,
            bridged_lane_position,
        }
    }

    /// Encoded message key for `nonce` on this lane
    pub fn encoded_key(&self, nonce: u64) -> U256 {
        let hi = ((self.this_chain_position as u64) << 32) | self.this_lane_position as u64;
        let lo = ((self.bridged_chain_position as u64) << 32) | self.bridged_lane_position as u64;
        U256::from_limbs([nonce, lo, hi, 0])
    }

    /// Split an encoded key into lane coordinates and nonce
    pub fn decode_key(key: U256) -> (LaneId, u64) {
        let limbs = key.as_limbs();
        let lane = LaneId {
            this_chain_position: (limbs[2] >> 32) as u32,
            this_lane_position: limbs[2] as u32,
            bridged_chain_position: (limbs[1] >> 32) as u32,
            bridged_lane_position: limbs[1] as u32,
        };
        (lane, limbs[0])
    }

    /// The same lane seen from the other chain
    pub fn counterpart(&self) -> LaneId {
        LaneId {
            this_chain_position: self.bridged_chain_position,
            this_lane_position: self.bridged_lane_position,
            bridged_chain_position: self.this_chain_position,
            bridged_lane_position: self.this_lane_position,
        }
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.this_chain_position,
            self.this_lane_position,
            self.bridged_chain_position,
            self.bridged_lane_position
        )
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Application payload carried by a message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    pub source: Address,
    pub target: Address,
    pub encoded: Bytes,
}

/// A message with its lane-assigned key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub encoded_key: U256,
    pub payload: MessagePayload,
}

impl Message {
    pub fn new(lane: &LaneId, nonce: u64, payload: MessagePayload) -> Self {
        Self {
            encoded_key: lane.encoded_key(nonce),
            payload,
        }
    }

    /// Nonce (ordered lanes) or leaf index (parallel lanes)
    pub fn nonce(&self) -> u64 {
        LaneId::decode_key(self.encoded_key).1
    }

    pub fn lane(&self) -> LaneId {
        LaneId::decode_key(self.encoded_key).0
    }

    /// Content hash used as storage value and merkle leaf
    pub fn hash(&self) -> B256 {
        crate::hash::message_hash(self)
    }
}

// ============================================================================
// Nonce Bookkeeping
// ============================================================================

/// Inclusive nonce (or leaf index) range. Empty when `begin > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonceRange {
    pub begin: u64,
    pub end: u64,
}

impl NonceRange {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub fn empty() -> Self {
        Self { begin: 1, end: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.begin > self.end
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end - self.begin + 1
        }
    }

    pub fn contains(&self, nonce: u64) -> bool {
        !self.is_empty() && nonce >= self.begin && nonce <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> {
        self.begin..=self.end
    }
}

impl fmt::Display for NonceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "[]")
        } else {
            write!(f, "[{}, {}]", self.begin, self.end)
        }
    }
}

/// `outboundLaneNonce()` of a source lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutboundLaneNonce {
    pub latest_received_nonce: u64,
    pub latest_generated_nonce: u64,
}

impl OutboundLaneNonce {
    pub fn check(&self) -> RelayResult<()> {
        if self.latest_received_nonce > self.latest_generated_nonce {
            return Err(RelayError::InconsistentRead(format!(
                "outbound lane received nonce {} ahead of generated {}",
                self.latest_received_nonce, self.latest_generated_nonce
            )));
        }
        Ok(())
    }
}

/// `inboundLaneNonce()` of a destination lane.
///
/// The relayer range indexes unrewarded relayer records, each covering a
/// contiguous run of delivered nonces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundLaneNonce {
    pub last_confirmed_nonce: u64,
    pub last_delivered_nonce: u64,
    pub relayer_range_front: u64,
    pub relayer_range_back: u64,
}

impl Default for InboundLaneNonce {
    fn default() -> Self {
        Self {
            last_confirmed_nonce: 0,
            last_delivered_nonce: 0,
            relayer_range_front: 1,
            relayer_range_back: 0,
        }
    }
}

impl InboundLaneNonce {
    pub fn check(&self) -> RelayResult<()> {
        let ordered = self.last_confirmed_nonce <= self.last_delivered_nonce
            && self.relayer_range_front <= self.relayer_range_back + 1;
        if !ordered {
            return Err(RelayError::InconsistentRead(format!(
                "inbound lane nonces out of order: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// `data()` of an outbound lane: undelivered-or-unconfirmed messages
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutboundLaneData {
    pub latest_received_nonce: u64,
    pub messages: Vec<Message>,
}

impl OutboundLaneData {
    /// Range spanned by the carried messages
    pub fn range(&self) -> NonceRange {
        match (self.messages.first(), self.messages.last()) {
            (Some(first), Some(last)) => NonceRange::new(first.nonce(), last.nonce()),
            _ => NonceRange::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeliveredMessages {
    pub begin: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnrewardedRelayer {
    pub relayer: Address,
    pub messages: DeliveredMessages,
}

/// `data()` of an inbound lane: the delivery record proven back to the source
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InboundLaneData {
    pub relayers: Vec<UnrewardedRelayer>,
    pub last_confirmed_nonce: u64,
    pub last_delivered_nonce: u64,
}

// ============================================================================
// Blocks
// ============================================================================

/// Block selector for reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Finalized,
    Number(u64),
}

impl BlockTag {
    /// JSON-RPC block parameter
    pub fn to_rpc(&self) -> String {
        match self {
            BlockTag::Latest => "latest".to_string(),
            BlockTag::Finalized => "finalized".to_string(),
            BlockTag::Number(n) => format!("0x{:x}", n),
        }
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockTag::Number(n) => write!(f, "{}", n),
            other => f.write_str(&other.to_rpc()),
        }
    }
}

/// Execution-layer block header as returned by `eth_getBlockByNumber`.
///
/// Carries every field the epoch light client needs to replay validator
/// election data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub hash: B256,
    pub parent_hash: B256,
    #[serde(rename = "sha3Uncles")]
    pub uncle_hash: B256,
    #[serde(rename = "miner")]
    pub coinbase: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bytes,
    pub difficulty: U256,
    #[serde(with = "quantity")]
    pub number: u64,
    #[serde(with = "quantity")]
    pub gas_limit: u64,
    #[serde(with = "quantity")]
    pub gas_used: u64,
    #[serde(with = "quantity")]
    pub timestamp: u64,
    pub extra_data: Bytes,
    #[serde(rename = "mixHash")]
    pub mix_digest: B256,
    pub nonce: B64,
}

// ============================================================================
// Serde helpers
// ============================================================================

/// u64 encoded as a hex (`"0x1a"`) or decimal (`"26"`) string, or a number.
/// Serializes as hex.
pub mod quantity {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{:x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => parse(&s).map_err(de::Error::custom),
        }
    }

    pub fn parse(s: &str) -> Result<u64, String> {
        match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).map_err(|e| format!("{}: {}", s, e)),
            None => s.parse().map_err(|e| format!("{}: {}", s, e)),
        }
    }
}

/// Same as [`quantity`] but serializes as a decimal string (beacon API style)
pub mod decimal {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        super::quantity::deserialize(deserializer)
    }
}

/// U256 as a decimal string (beacon API style); hex accepted on input
pub mod u256_decimal {
    use alloy::primitives::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        let parsed = match s.strip_prefix("0x") {
            Some(hex) => U256::from_str_radix(hex, 16),
            None => U256::from_str_radix(&s, 10),
        };
        parsed.map_err(|e| de::Error::custom(format!("{}: {}", s, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_key_layout() {
        // this chain 1, this lane 2, bridged chain 0, bridged lane 3, nonce 1
        let lane = LaneId::new(1, 2, 0, 3);
        let key = lane.encoded_key(1);
        assert_eq!(
            format!("{:#066x}", key),
            "0x0000000000000000000000010000000200000000000000030000000000000001"
        );

        let (decoded, nonce) = LaneId::decode_key(key);
        assert_eq!(decoded, lane);
        assert_eq!(nonce, 1);
    }

    #[test]
    fn test_counterpart() {
        let lane = LaneId::new(1, 2, 0, 3);
        assert_eq!(lane.counterpart(), LaneId::new(0, 3, 1, 2));
        assert_eq!(lane.counterpart().counterpart(), lane);
    }

    #[test]
    fn test_nonce_range() {
        let range = NonceRange::new(3, 5);
        assert_eq!(range.len(), 3);
        assert!(range.contains(4));
        assert!(!range.contains(6));
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![3, 4, 5]);

        let empty = NonceRange::new(6, 5);
        assert!(empty.is_empty());
        assert_eq!(empty.len(), 0);
        assert!(!empty.contains(5));
        assert_eq!(empty.to_string(), "[]");
    }

    #[test]
    fn test_lane_nonce_checks() {
        assert!(OutboundLaneNonce {
            latest_received_nonce: 2,
            latest_generated_nonce: 5
        }
        .check()
        .is_ok());
        assert!(OutboundLaneNonce {
            latest_received_nonce: 6,
            latest_generated_nonce: 5
        }
        .check()
        .is_err());

        assert!(InboundLaneNonce::default().check().is_ok());
        let broken = InboundLaneNonce {
            last_confirmed_nonce: 0,
            last_delivered_nonce: 3,
            relayer_range_front: 4,
            relayer_range_back: 1,
        };
        assert!(broken.check().is_err());
    }

    #[test]
    fn test_quantity_parsing() {
        assert_eq!(quantity::parse("0x1a").unwrap(), 26);
        assert_eq!(quantity::parse("26").unwrap(), 26);
        assert!(quantity::parse("0xzz").is_err());
    }

    #[test]
    fn test_block_header_from_rpc_json() {
        let json = serde_json::json!({
            "hash": format!("0x{}", "11".repeat(32)),
            "parentHash": format!("0x{}", "22".repeat(32)),
            "sha3Uncles": format!("0x{}", "33".repeat(32)),
            "miner": "0x0000000000000000000000000000000000000001",
            "stateRoot": format!("0x{}", "44".repeat(32)),
            "transactionsRoot": format!("0x{}", "55".repeat(32)),
            "receiptsRoot": format!("0x{}", "66".repeat(32)),
            "logsBloom": "0x00",
            "difficulty": "0x2",
            "number": "0xc8",
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x0",
            "timestamp": "0x64",
            "extraData": "0x",
            "mixHash": format!("0x{}", "00".repeat(32)),
            "nonce": "0x0000000000000000",
            "transactions": []
        });

        let header: BlockHeader = serde_json::from_value(json).unwrap();
        assert_eq!(header.number, 200);
        assert_eq!(header.timestamp, 100);
        assert_eq!(header.difficulty, U256::from(2));
    }
}
