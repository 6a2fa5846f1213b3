//! Binary keccak merkle tree
//!
//! Nodes are `keccak256(left ++ right)`. A level with an odd number of nodes
//! pairs its last node with itself. A single leaf is its own root and has an
//! empty path.

use alloy::primitives::B256;

use crate::error::{RelayError, RelayResult};
use crate::hash::keccak256_concat;

fn hash_pair(left: &B256, right: &B256) -> B256 {
    keccak256_concat(&[left.as_slice(), right.as_slice()])
}

/// Append-only merkle tree over message hashes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalMerkleTree {
    leaves: Vec<B256>,
}

impl IncrementalMerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_leaves(leaves: impl IntoIterator<Item = B256>) -> Self {
        Self {
            leaves: leaves.into_iter().collect(),
        }
    }

    pub fn append(&mut self, leaf: B256) -> u64 {
        self.leaves.push(leaf);
        (self.leaves.len() - 1) as u64
    }

    pub fn len(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn leaves(&self) -> &[B256] {
        &self.leaves
    }

    /// Root of the tree; zero for an empty tree
    pub fn root(&self) -> B256 {
        if self.leaves.is_empty() {
            return B256::ZERO;
        }

        let mut level = self.leaves.clone();
        while level.len() > 1 {
            level = next_level(&level);
        }
        level[0]
    }

    /// Sibling path for the leaf at `index`, bottom-up
    pub fn proof(&self, index: u64) -> RelayResult<Vec<B256>> {
        if index >= self.len() {
            return Err(RelayError::InvalidInput(format!(
                "leaf index {} out of range for tree of {}",
                index,
                self.len()
            )));
        }

        let mut path = Vec::new();
        let mut level = self.leaves.clone();
        let mut idx = index as usize;

        while level.len() > 1 {
            let sibling = if idx % 2 == 0 {
                level.get(idx + 1).copied().unwrap_or(level[idx])
            } else {
                level[idx - 1]
            };
            path.push(sibling);
            level = next_level(&level);
            idx /= 2;
        }

        Ok(path)
    }
}

fn next_level(level: &[B256]) -> Vec<B256> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            [single] => hash_pair(single, single),
            _ => unreachable!("chunks(2) yields one or two nodes"),
        })
        .collect()
}

/// Recompute the root from a leaf, its index and its sibling path
pub fn compute_root(leaf: B256, index: u64, path: &[B256]) -> B256 {
    let mut node = leaf;
    let mut idx = index;
    for sibling in path {
        node = if idx % 2 == 0 {
            hash_pair(&node, sibling)
        } else {
            hash_pair(sibling, &node)
        };
        idx /= 2;
    }
    node
}

/// Standard sibling-path inclusion check
pub fn verify_inclusion(root: B256, leaf: B256, index: u64, path: &[B256]) -> bool {
    compute_root(leaf, index, path) == root
}

/// Root and path proving `new_leaf` appended after `known_leaves`.
///
/// `known_leaves` are the leaf hashes already in the destination's tree, in
/// index order.
pub fn build_inclusion_proof(known_leaves: &[B256], new_leaf: B256) -> (B256, Vec<B256>) {
    let mut tree = IncrementalMerkleTree::from_leaves(known_leaves.iter().copied());
    let index = tree.append(new_leaf);
    let path = tree.proof(index).unwrap_or_default();
    (tree.root(), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(i: u64) -> B256 {
        keccak256_concat(&[&i.to_be_bytes()])
    }

    #[test]
    fn test_single_leaf_is_root() {
        let (root, path) = build_inclusion_proof(&[], leaf(0));
        assert_eq!(root, leaf(0));
        assert!(path.is_empty());
        assert!(verify_inclusion(root, leaf(0), 0, &path));
    }

    #[test]
    fn test_inclusion_proofs_verify() {
        for k in [1u64, 2, 3, 5, 8] {
            let known: Vec<B256> = (0..k - 1).map(leaf).collect();
            let (root, path) = build_inclusion_proof(&known, leaf(k - 1));

            assert!(
                verify_inclusion(root, leaf(k - 1), k - 1, &path),
                "k = {}",
                k
            );

            // Every leaf, not just the appended one
            let tree = IncrementalMerkleTree::from_leaves((0..k).map(leaf));
            assert_eq!(tree.root(), root);
            for i in 0..k {
                let p = tree.proof(i).unwrap();
                assert!(verify_inclusion(root, leaf(i), i, &p), "k = {}, i = {}", k, i);
            }
        }
    }

    #[test]
    fn test_wrong_leaf_or_index_fails() {
        let tree = IncrementalMerkleTree::from_leaves((0..5).map(leaf));
        let root = tree.root();
        let path = tree.proof(2).unwrap();

        assert!(!verify_inclusion(root, leaf(3), 2, &path));
        assert!(!verify_inclusion(root, leaf(2), 3, &path));
        assert!(tree.proof(5).is_err());
    }

    #[test]
    fn test_two_leaf_root() {
        let tree = IncrementalMerkleTree::from_leaves([leaf(0), leaf(1)]);
        assert_eq!(tree.root(), hash_pair(&leaf(0), &leaf(1)));
    }

    #[test]
    fn test_empty_tree_root_is_zero() {
        assert_eq!(IncrementalMerkleTree::new().root(), B256::ZERO);
    }
}
