//! Block manifest, block items and the block map.
//!
//! A block on disk is a set of item files (proposal, operations, states,
//! their trees and the voteproofs that finalized it) plus a signed
//! [`BlockMap`] listing each item's checksum.

use crate::signing::block_map_message;
use crate::{Hash, Height, LocalNode, NetworkId, NodeSign, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Header of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Block height.
    pub height: Height,
    /// Manifest hash of the previous block; `None` at genesis.
    pub previous: Option<Hash>,
    /// Proposal fact hash.
    pub proposal: Hash,
    /// Root of the operations tree.
    pub operations_tree: Option<Hash>,
    /// Root of the states tree.
    pub states_tree: Option<Hash>,
    /// Hash of the suffrage state, when the block changed the suffrage.
    pub suffrage: Option<Hash>,
    /// Unix milliseconds the proposal was made.
    pub proposed_at: u64,
}

impl Manifest {
    /// Content hash; the block hash voted on in ACCEPT ballots.
    pub fn hash(&self) -> Hash {
        Hash::of_json(b"manifest", self)
    }

    /// Structural validity.
    pub fn is_valid(&self) -> Result<(), ValidationError> {
        if self.height.is_nil() {
            return Err(ValidationError::invalid("manifest", "nil height"));
        }
        match (self.height == Height::GENESIS, self.previous) {
            (true, Some(_)) => Err(ValidationError::invalid(
                "manifest",
                "genesis manifest has previous",
            )),
            (false, None) => Err(ValidationError::invalid("manifest", "empty previous")),
            _ => Ok(()),
        }
    }
}

/// Kind of block item file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockItemType {
    /// The block map itself.
    Map,
    /// Proposal sign fact.
    Proposal,
    /// Operations, one per line.
    Operations,
    /// Operations tree nodes, one per line.
    OperationsTree,
    /// States, one per line.
    States,
    /// States tree nodes, one per line.
    StatesTree,
    /// INIT and ACCEPT voteproofs, one per line.
    Voteproofs,
}

impl BlockItemType {
    /// Every item type listed in a block map.
    pub const ITEMS: [BlockItemType; 6] = [
        BlockItemType::Proposal,
        BlockItemType::Operations,
        BlockItemType::OperationsTree,
        BlockItemType::States,
        BlockItemType::StatesTree,
        BlockItemType::Voteproofs,
    ];

    /// File stem.
    pub fn name(&self) -> &'static str {
        match self {
            BlockItemType::Map => "map",
            BlockItemType::Proposal => "proposal",
            BlockItemType::Operations => "operations",
            BlockItemType::OperationsTree => "operations_tree",
            BlockItemType::States => "states",
            BlockItemType::StatesTree => "states_tree",
            BlockItemType::Voteproofs => "voteproofs",
        }
    }

    /// Encoded as one record per line.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            BlockItemType::Operations
                | BlockItemType::OperationsTree
                | BlockItemType::States
                | BlockItemType::StatesTree
                | BlockItemType::Voteproofs
        )
    }

    /// Stored gzip-compressed.
    pub fn is_compressed(&self) -> bool {
        matches!(
            self,
            BlockItemType::Operations
                | BlockItemType::OperationsTree
                | BlockItemType::States
                | BlockItemType::StatesTree
        )
    }
}

impl fmt::Display for BlockItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Entry of a block map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapItem {
    /// SHA-256 hex of the on-disk file.
    pub checksum: String,
    /// Number of records (lines) in the file.
    pub count: u64,
    /// Whether the file is gzip-compressed.
    pub compressed: bool,
}

/// Signed index of a block's items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMap {
    /// Manifest.
    pub manifest: Manifest,
    /// Items by type.
    pub items: BTreeMap<BlockItemType, BlockMapItem>,
    /// Writer signature.
    pub sign: Option<NodeSign>,
}

#[derive(Serialize)]
struct BlockMapSignBody<'a> {
    manifest: &'a Manifest,
    items: &'a BTreeMap<BlockItemType, BlockMapItem>,
}

impl BlockMap {
    /// Unsigned map for `manifest`.
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            items: BTreeMap::new(),
            sign: None,
        }
    }

    /// Block height.
    pub fn height(&self) -> Height {
        self.manifest.height
    }

    /// Content hash of manifest and items.
    pub fn hash(&self) -> Hash {
        Hash::of_json(
            b"block_map",
            &BlockMapSignBody {
                manifest: &self.manifest,
                items: &self.items,
            },
        )
    }

    /// Record an item.
    pub fn set_item(&mut self, t: BlockItemType, item: BlockMapItem) {
        self.items.insert(t, item);
    }

    /// Item entry.
    pub fn item(&self, t: BlockItemType) -> Option<&BlockMapItem> {
        self.items.get(&t)
    }

    /// Sign as the local node.
    pub fn sign(&mut self, local: &LocalNode, network_id: &NetworkId) {
        let message = block_map_message(network_id, &self.hash());
        self.sign = Some(NodeSign {
            node: local.address().clone(),
            signer: local.public_key(),
            signature: local.sign(&message),
        });
    }

    /// Manifest, item set and signature.
    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), ValidationError> {
        self.manifest.is_valid()?;

        if self.items.contains_key(&BlockItemType::Map) {
            return Err(ValidationError::invalid("block map", "map lists itself"));
        }
        for t in [BlockItemType::Proposal, BlockItemType::Voteproofs] {
            if !self.items.contains_key(&t) {
                return Err(ValidationError::invalid(
                    "block map",
                    format!("missing {t} item"),
                ));
            }
        }
        for (t, item) in &self.items {
            if item.checksum.is_empty() {
                return Err(ValidationError::invalid(
                    "block map",
                    format!("empty checksum of {t}"),
                ));
            }
            if item.compressed != t.is_compressed() {
                return Err(ValidationError::invalid(
                    "block map",
                    format!("wrong compression of {t}"),
                ));
            }
        }
        match (
            self.manifest.operations_tree.is_some(),
            self.items.contains_key(&BlockItemType::OperationsTree),
        ) {
            (true, false) | (false, true) => {
                return Err(ValidationError::invalid(
                    "block map",
                    "operations tree does not match manifest",
                ))
            }
            _ => {}
        }

        let Some(sign) = &self.sign else {
            return Err(ValidationError::invalid("block map", "not signed"));
        };
        if !sign
            .signer
            .verify(&block_map_message(network_id, &self.hash()), &sign.signature)
        {
            return Err(ValidationError::Signature {
                what: "block map",
                node: sign.node.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyPair, NodeAddress};

    fn map() -> BlockMap {
        let mut m = BlockMap::new(Manifest {
            height: Height(3),
            previous: Some(Hash::from_bytes(b"prev")),
            proposal: Hash::from_bytes(b"proposal"),
            operations_tree: None,
            states_tree: None,
            suffrage: None,
            proposed_at: 1,
        });
        for t in [BlockItemType::Proposal, BlockItemType::Voteproofs] {
            m.set_item(
                t,
                BlockMapItem {
                    checksum: "abc".into(),
                    count: 1,
                    compressed: false,
                },
            );
        }
        m
    }

    #[test]
    fn test_signed_map_is_valid() {
        let network = NetworkId::new("test");
        let local = LocalNode::new(NodeAddress::new("n0"), KeyPair::from_seed(&[1; 32]));

        let mut m = map();
        assert!(m.is_valid(&network).is_err());

        m.sign(&local, &network);
        assert!(m.is_valid(&network).is_ok());

        m.items.get_mut(&BlockItemType::Proposal).unwrap().checksum = "changed".into();
        assert!(m.is_valid(&network).is_err());
    }

    #[test]
    fn test_item_type_flags() {
        assert!(BlockItemType::States.is_compressed());
        assert!(BlockItemType::Voteproofs.is_list());
        assert!(!BlockItemType::Voteproofs.is_compressed());
        assert!(!BlockItemType::Proposal.is_list());
    }
}
