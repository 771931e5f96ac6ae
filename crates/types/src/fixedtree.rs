//! Fixed merkle tree over operation and state hashes.
//!
//! The manifest commits to the operations and states of a block through the
//! roots of two fixed trees. Trees are written to block storage as their leaf
//! nodes, one per line, so a reader can rebuild the root and produce
//! inclusion proofs (used by suffrage proofs).
//!
//! # Performance
//!
//! - Tree construction: O(n) hashes for n leaves
//! - Proof generation: O(log n)
//! - Proof verification: O(log n) hashes

use crate::Hash;
use serde::{Deserialize, Serialize};

/// Hint written on the first line of an encoded tree.
pub const FIXED_TREE_HINT: &str = "fixedtree-v0.0.1";

/// A leaf of a fixed tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTreeNode {
    /// Position in the tree (0-based).
    pub index: u64,
    /// Key of the leaf (operation fact hash or state key).
    pub key: String,
    /// Leaf hash.
    pub hash: Hash,
}

/// Inclusion proof for one leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTreeProof {
    /// Leaf the proof is for.
    pub node: FixedTreeNode,
    /// Sibling hashes from leaf to root.
    pub siblings: Vec<Hash>,
}

impl FixedTreeProof {
    /// Verify the leaf is included under `root`.
    pub fn verify(&self, root: &Hash) -> bool {
        let mut current = self.node.hash;
        let mut index = self.node.index;

        for sibling in &self.siblings {
            current = if index % 2 == 0 {
                hash_pair(&current, sibling)
            } else {
                hash_pair(sibling, &current)
            };
            index /= 2;
        }

        current == *root
    }
}

/// A complete fixed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedTree {
    nodes: Vec<FixedTreeNode>,
    levels: Vec<Vec<Hash>>,
}

#[inline]
fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    Hash::from_bytes(&data)
}

/// Build every level bottom-up, padding the leaf level to a power of two.
fn build_levels(leaves: &[Hash]) -> Vec<Vec<Hash>> {
    if leaves.is_empty() {
        return vec![vec![Hash::ZERO]];
    }

    let n = leaves.len().next_power_of_two();
    let mut level = leaves.to_vec();
    level.resize(n, Hash::ZERO);

    let mut levels = vec![level];
    while levels[levels.len() - 1].len() > 1 {
        let prev = &levels[levels.len() - 1];
        let next = prev
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
        levels.push(next);
    }
    levels
}

impl FixedTree {
    /// Build a tree from `(key, hash)` leaves in order.
    pub fn new(leaves: Vec<(String, Hash)>) -> Self {
        let nodes: Vec<FixedTreeNode> = leaves
            .into_iter()
            .enumerate()
            .map(|(i, (key, hash))| FixedTreeNode {
                index: i as u64,
                key,
                hash,
            })
            .collect();

        Self::build(nodes)
    }

    /// Rebuild a tree from decoded nodes; indices must be `0..n` in order.
    pub fn from_nodes(nodes: Vec<FixedTreeNode>) -> Result<Self, String> {
        for (i, node) in nodes.iter().enumerate() {
            if node.index != i as u64 {
                return Err(format!("wrong index, {} at position {}", node.index, i));
            }
        }
        Ok(Self::build(nodes))
    }

    fn build(nodes: Vec<FixedTreeNode>) -> Self {
        let leaves: Vec<Hash> = nodes.iter().map(|n| n.hash).collect();
        let levels = build_levels(&leaves);
        Self { nodes, levels }
    }

    /// Merkle root; [`Hash::ZERO`] for an empty tree.
    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(Hash::ZERO)
    }

    /// Leaves.
    pub fn nodes(&self) -> &[FixedTreeNode] {
        &self.nodes
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no leaves.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inclusion proof of the leaf with `key`.
    pub fn proof(&self, key: &str) -> Option<FixedTreeProof> {
        let node = self.nodes.iter().find(|n| n.key == key)?.clone();

        let mut idx = node.index as usize;
        let mut siblings = Vec::with_capacity(self.levels.len());
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            siblings.push(level[sibling]);
            idx /= 2;
        }

        Some(FixedTreeProof { node, siblings })
    }
}
