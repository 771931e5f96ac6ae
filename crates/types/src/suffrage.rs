//! Suffrage membership and expel operations.
//!
//! A [`Suffrage`] is the set of consensus nodes eligible to vote at a height.
//! [`ExpelOperation`]s remove unresponsive nodes; they travel inside ballots
//! and are ratified by a suffrage-confirm vote.

use crate::signing::expel_message;
use crate::{Hash, Height, LocalNode, NetworkId, NodeAddress, PublicKey, Signature, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A consensus node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Node address.
    pub address: NodeAddress,
    /// Key the node signs with.
    pub public_key: PublicKey,
}

impl Node {
    /// Create a node.
    pub fn new(address: NodeAddress, public_key: PublicKey) -> Self {
        Self {
            address,
            public_key,
        }
    }
}

/// Consensus nodes of a height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suffrage {
    nodes: Vec<Node>,
}

impl Suffrage {
    /// Create a suffrage, rejecting empty and duplicated members.
    pub fn new(nodes: Vec<Node>) -> Result<Self, ValidationError> {
        if nodes.is_empty() {
            return Err(ValidationError::invalid("suffrage", "empty nodes"));
        }

        let mut seen = HashSet::with_capacity(nodes.len());
        for node in &nodes {
            if !seen.insert(&node.address) {
                return Err(ValidationError::invalid(
                    "suffrage",
                    format!("duplicated node {}", node.address),
                ));
            }
        }

        Ok(Self { nodes })
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Never true for a constructed suffrage.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Members in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Find a member.
    pub fn get(&self, address: &NodeAddress) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.address == address)
    }

    /// Whether `address` is a member.
    pub fn exists(&self, address: &NodeAddress) -> bool {
        self.get(address).is_some()
    }

    /// Whether `address` is a member signing with `public_key`.
    pub fn exists_public_key(&self, address: &NodeAddress, public_key: &PublicKey) -> bool {
        self.get(address)
            .map(|n| &n.public_key == public_key)
            .unwrap_or(false)
    }
}

/// A signature by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSign {
    /// Signing node.
    pub node: NodeAddress,
    /// Key used.
    pub signer: PublicKey,
    /// Signature.
    pub signature: Signature,
}

/// What to expel and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpelFact {
    /// Node to remove.
    pub node: NodeAddress,
    /// Human readable reason.
    pub reason: String,
    /// First height the operation is valid for.
    pub valid_start: Height,
    /// Last height the operation is valid for.
    pub valid_end: Height,
}

impl ExpelFact {
    /// Content hash of the fact.
    pub fn hash(&self) -> Hash {
        Hash::of_json(b"expel_fact", self)
    }

    /// Structural validity.
    pub fn is_valid(&self) -> Result<(), ValidationError> {
        if self.valid_start.is_nil() || self.valid_end < self.valid_start {
            return Err(ValidationError::invalid(
                "expel fact",
                format!(
                    "wrong valid range, {}..{}",
                    self.valid_start, self.valid_end
                ),
            ));
        }
        Ok(())
    }

    /// Whether the operation may be applied at `height`.
    pub fn is_valid_at(&self, height: Height) -> bool {
        height >= self.valid_start && height <= self.valid_end
    }
}

/// Suffrage expel operation, signed by one or more nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpelOperation {
    /// Fact.
    pub fact: ExpelFact,
    /// Signatures over the fact hash.
    pub signs: Vec<NodeSign>,
}

impl ExpelOperation {
    /// Create an unsigned operation.
    pub fn new(fact: ExpelFact) -> Self {
        Self {
            fact,
            signs: Vec::new(),
        }
    }

    /// Fact hash; the identity used by ballot facts.
    pub fn fact_hash(&self) -> Hash {
        self.fact.hash()
    }

    /// Expelled node.
    pub fn expelled(&self) -> &NodeAddress {
        &self.fact.node
    }

    /// Add (or replace) the local signature.
    pub fn sign(&mut self, local: &LocalNode, network_id: &NetworkId) {
        let message = expel_message(network_id, &self.fact.hash());
        let sign = NodeSign {
            node: local.address().clone(),
            signer: local.public_key(),
            signature: local.sign(&message),
        };

        self.signs.retain(|s| &s.node != local.address());
        self.signs.push(sign);
    }

    /// Fact validity plus every signature.
    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), ValidationError> {
        self.fact.is_valid()?;

        if self.signs.is_empty() {
            return Err(ValidationError::invalid("expel operation", "empty signs"));
        }

        let message = expel_message(network_id, &self.fact.hash());
        for sign in &self.signs {
            if sign.node == self.fact.node {
                return Err(ValidationError::invalid(
                    "expel operation",
                    "expelled node signed its own expel",
                ));
            }
            if !sign.signer.verify(&message, &sign.signature) {
                return Err(ValidationError::Signature {
                    what: "expel operation",
                    node: sign.node.clone(),
                });
            }
        }
        Ok(())
    }

    /// Every signer must be a suffrage member with a matching key.
    pub fn is_valid_with_suffrage(&self, suffrage: &Suffrage) -> Result<(), ValidationError> {
        if !suffrage.exists(&self.fact.node) {
            return Err(ValidationError::NotInSuffrage(self.fact.node.clone()));
        }
        for sign in &self.signs {
            if !suffrage.exists_public_key(&sign.node, &sign.signer) {
                return Err(ValidationError::NotInSuffrage(sign.node.clone()));
            }
        }
        Ok(())
    }
}
