//! SSZ `hash_tree_root` for the two execution header fields the beacon
//! light client stores as roots instead of raw bytes.

use alloy::primitives::B256;
use sha2::{Digest, Sha256};

use crate::error::{RelayError, RelayResult};

const BYTES_PER_CHUNK: usize = 32;

/// `logs_bloom` is an SSZ `ByteVector[256]`
pub const LOGS_BLOOM_SIZE: usize = 256;

/// `extra_data` is an SSZ `ByteList[32]`
pub const MAX_EXTRA_DATA_BYTES: usize = 32;

fn sha256_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn pack(bytes: &[u8]) -> Vec<[u8; 32]> {
    bytes
        .chunks(BYTES_PER_CHUNK)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word[..chunk.len()].copy_from_slice(chunk);
            word
        })
        .collect()
}

/// Merkleize `chunks` padded with zero chunks up to `limit` (rounded up to a
/// power of two)
fn merkleize(chunks: &[[u8; 32]], limit: usize) -> [u8; 32] {
    let width = limit.max(1).next_power_of_two();
    let mut level: Vec<[u8; 32]> = chunks.to_vec();
    level.resize(width, [0u8; 32]);

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| sha256_pair(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

fn mix_in_length(root: [u8; 32], length: usize) -> [u8; 32] {
    let mut len_word = [0u8; 32];
    len_word[..8].copy_from_slice(&(length as u64).to_le_bytes());
    sha256_pair(&root, &len_word)
}

/// `hash_tree_root` of a fixed `ByteVector[N]`
pub fn hash_byte_vector(bytes: &[u8], size: usize) -> RelayResult<B256> {
    if bytes.len() != size {
        return Err(RelayError::InvalidInput(format!(
            "byte vector of {} bytes, expected {}",
            bytes.len(),
            size
        )));
    }
    let limit = size.div_ceil(BYTES_PER_CHUNK);
    Ok(B256::from(merkleize(&pack(bytes), limit)))
}

/// `hash_tree_root` of a `ByteList[max]`
pub fn hash_byte_list(bytes: &[u8], max: usize) -> RelayResult<B256> {
    if bytes.len() > max {
        return Err(RelayError::InvalidInput(format!(
            "byte list of {} bytes exceeds limit {}",
            bytes.len(),
            max
        )));
    }
    let limit = max.div_ceil(BYTES_PER_CHUNK);
    let root = merkleize(&pack(bytes), limit);
    Ok(B256::from(mix_in_length(root, bytes.len())))
}

pub fn logs_bloom_root(logs_bloom: &[u8]) -> RelayResult<B256> {
    hash_byte_vector(logs_bloom, LOGS_BLOOM_SIZE)
}

pub fn extra_data_root(extra_data: &[u8]) -> RelayResult<B256> {
    hash_byte_list(extra_data, MAX_EXTRA_DATA_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha256(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    #[test]
    fn test_zero_bloom_root() {
        // 8 zero chunks -> three levels of zero hashes
        let z1 = sha256(&[0u8; 64]);
        let z2 = sha256(&[z1, z1].concat());
        let z3 = sha256(&[z2, z2].concat());

        let root = logs_bloom_root(&[0u8; 256]).unwrap();
        assert_eq!(root.0, z3);
    }

    #[test]
    fn test_bloom_requires_exact_size() {
        assert!(logs_bloom_root(&[0u8; 255]).is_err());
        assert!(logs_bloom_root(&[0u8; 257]).is_err());
    }

    #[test]
    fn test_empty_extra_data_root() {
        // single zero chunk mixed with length 0
        let expected = sha256(&[0u8; 64]);
        assert_eq!(extra_data_root(&[]).unwrap().0, expected);
    }

    #[test]
    fn test_extra_data_length_mix_in() {
        let data = [0xabu8; 5];
        let mut chunk = [0u8; 32];
        chunk[..5].copy_from_slice(&data);
        let mut len = [0u8; 32];
        len[0] = 5;
        let expected = sha256(&[chunk, len].concat());

        assert_eq!(extra_data_root(&data).unwrap().0, expected);
        assert!(extra_data_root(&[0u8; 33]).is_err());
    }
}
