//! Operations and proposals.

use crate::signing::proposal_message;
use crate::{Hash, LocalNode, NetworkId, NodeAddress, NodeSign, Point, ValidationError};
use serde::{Deserialize, Serialize};

/// An operation included in a block.
///
/// The body is opaque to consensus; only the hashes matter for trees and
/// duplicate checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Hash of the operation (fact plus signatures).
    pub hash: Hash,
    /// Hash of the fact.
    pub fact_hash: Hash,
    /// Opaque body.
    pub body: String,
}

impl Operation {
    /// Create an operation from an opaque body.
    pub fn new(body: impl Into<String>) -> Self {
        let body = body.into();
        let fact_hash = Hash::from_parts(&[b"operation_fact", body.as_bytes()]);
        let hash = Hash::from_parts(&[b"operation", fact_hash.as_bytes()]);
        Self {
            hash,
            fact_hash,
            body,
        }
    }
}

/// What a proposer proposes for a point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalFact {
    /// Point proposed for.
    pub point: Point,
    /// Proposer node.
    pub proposer: NodeAddress,
    /// Block the proposal builds on; `None` at genesis.
    pub previous_block: Option<Hash>,
    /// `(operation hash, fact hash)` pairs, in block order.
    pub operations: Vec<(Hash, Hash)>,
    /// Unix milliseconds of the proposal.
    pub proposed_at: u64,
}

impl ProposalFact {
    /// Content hash, referenced by ballot facts and the manifest.
    pub fn hash(&self) -> Hash {
        Hash::of_json(b"proposal_fact", self)
    }
}

/// A proposal signed by its proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalSignFact {
    /// Fact.
    pub fact: ProposalFact,
    /// Proposer signature.
    pub sign: NodeSign,
}

impl ProposalSignFact {
    /// Sign `fact` as the local node.
    pub fn new(fact: ProposalFact, local: &LocalNode, network_id: &NetworkId) -> Self {
        let signature = local.sign(&proposal_message(network_id, &fact.hash()));
        Self {
            fact,
            sign: NodeSign {
                node: local.address().clone(),
                signer: local.public_key(),
                signature,
            },
        }
    }

    /// Proposal hash.
    pub fn hash(&self) -> Hash {
        self.fact.hash()
    }

    /// Signature and proposer match.
    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), ValidationError> {
        if self.sign.node != self.fact.proposer {
            return Err(ValidationError::invalid(
                "proposal",
                "signer is not the proposer",
            ));
        }
        if !self
            .sign
            .signer
            .verify(&proposal_message(network_id, &self.hash()), &self.sign.signature)
        {
            return Err(ValidationError::Signature {
                what: "proposal",
                node: self.sign.node.clone(),
            });
        }
        Ok(())
    }
}
