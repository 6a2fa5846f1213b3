//! Hash computation for lane storage keys and message identities
//!
//! These functions mirror the storage layout and hashing of the lane
//! contracts so that proofs can be requested for exactly the slots the
//! destination verifier recomputes.
//!
//! ## Storage layout
//!
//! - slot 0: lane identity (packed positions)
//! - slot 1: lane nonce struct
//! - slot 2: `mapping(uint256 => ...)` of messages (outbound) or unrewarded
//!   relayer records (inbound, two words per record)
//!
//! Parallel outbound lanes keep their incremental merkle root at slot 1.

use alloy::primitives::{Address, B256, U256};
use tiny_keccak::{Hasher, Keccak};

use crate::types::{Message, MessagePayload};

pub const LANE_IDENTIFY_SLOT: u64 = 0;
pub const LANE_NONCE_SLOT: u64 = 1;
pub const LANE_MESSAGE_SLOT: u64 = 2;
pub const LANE_ROOT_SLOT: u64 = 1;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// keccak256 over the concatenation of several byte strings
pub fn keccak256_concat(parts: &[&[u8]]) -> B256 {
    let mut hasher = Keccak::v256();
    for part in parts {
        hasher.update(part);
    }
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    B256::from(output)
}

/// Left-pad a u64 into a 32-byte word
pub fn u64_to_bytes32(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..32].copy_from_slice(&value.to_be_bytes());
    word
}

/// Convert an EVM address to bytes32 (left-padded with zeros)
pub fn address_to_bytes32(addr: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..32].copy_from_slice(addr.as_slice());
    word
}

/// Storage key of a plain slot
pub fn slot_key(slot: u64) -> B256 {
    B256::from(u64_to_bytes32(slot))
}

// ============================================================================
// Storage Keys
// ============================================================================

/// Storage key of entry `n` in the lane's message mapping:
/// `keccak256(abi.encode(n, LANE_MESSAGE_SLOT))`
pub fn message_key(n: u64) -> B256 {
    keccak256_concat(&[&u64_to_bytes32(n), &u64_to_bytes32(LANE_MESSAGE_SLOT)])
}

/// The two storage words of unrewarded relayer record `n`
pub fn relayer_keys(n: u64) -> [B256; 2] {
    let first = message_key(n);
    let second = U256::from_be_bytes(first.0).wrapping_add(U256::from(1u64));
    [first, B256::from(second.to_be_bytes::<32>())]
}

// ============================================================================
// Message Hashes
// ============================================================================

/// `keccak256("MessagePayload(address source,address target,bytes encoded)")`
pub fn payload_typehash() -> B256 {
    B256::from(keccak256(
        b"MessagePayload(address source,address target,bytes encoded)",
    ))
}

/// ```solidity
/// keccak256(abi.encode(PAYLOAD_TYPEHASH, source, target, keccak256(encoded)))
/// ```
pub fn payload_hash(payload: &MessagePayload) -> B256 {
    let encoded_hash = keccak256(&payload.encoded);
    keccak256_concat(&[
        payload_typehash().as_slice(),
        &address_to_bytes32(&payload.source),
        &address_to_bytes32(&payload.target),
        &encoded_hash,
    ])
}

/// ```solidity
/// keccak256(abi.encode(encodedKey, hash(payload)))
/// ```
///
/// This is the value stored in the outbound lane's message mapping and the
/// leaf of parallel lane trees.
pub fn message_hash(message: &Message) -> B256 {
    keccak256_concat(&[
        &message.encoded_key.to_be_bytes::<32>(),
        payload_hash(&message.payload).as_slice(),
    ])
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LaneId;
    use std::collections::HashSet;

    #[test]
    fn test_keccak256_empty() {
        assert_eq!(
            bytes32_to_hex(&keccak256(b"")),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_message_key_derivation() {
        // keccak256(abi.encode(uint256(0), uint256(2)))
        let mut preimage = [0u8; 64];
        preimage[63] = 2;
        assert_eq!(message_key(0).0, keccak256(&preimage));

        let keys: HashSet<B256> = (1..=5).map(message_key).collect();
        assert_eq!(keys.len(), 5);
        assert!(!keys.contains(&slot_key(LANE_IDENTIFY_SLOT)));
        assert!(!keys.contains(&slot_key(LANE_NONCE_SLOT)));
    }

    #[test]
    fn test_relayer_keys_are_adjacent_and_distinct() {
        let mut all = HashSet::new();
        for n in 1..=5u64 {
            let [first, second] = relayer_keys(n);
            assert_eq!(first, message_key(n));
            let a = U256::from_be_bytes(first.0);
            let b = U256::from_be_bytes(second.0);
            assert_eq!(b, a + U256::from(1u64));
            assert!(all.insert(first));
            assert!(all.insert(second));
        }
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn test_payload_typehash() {
        assert_eq!(
            payload_typehash().0,
            keccak256(b"MessagePayload(address source,address target,bytes encoded)")
        );
    }

    #[test]
    fn test_message_hash_depends_on_key_and_payload() {
        let lane = LaneId::new(1, 0, 0, 0);
        let payload = MessagePayload {
            source: Address::repeat_byte(0x11),
            target: Address::repeat_byte(0x22),
            encoded: Default::default(),
        };

        let m1 = Message::new(&lane, 1, payload.clone());
        let m2 = Message::new(&lane, 2, payload.clone());
        assert_ne!(message_hash(&m1), message_hash(&m2));

        let mut other = payload;
        other.encoded = vec![0x01].into();
        let m1b = Message::new(&lane, 1, other);
        assert_ne!(message_hash(&m1), message_hash(&m1b));

        // Deterministic
        assert_eq!(message_hash(&m1), m1.hash());
    }
}
