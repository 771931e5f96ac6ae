//! Block states and suffrage proofs.

use crate::{
    BlockMap, FixedTreeProof, Hash, Height, NetworkId, Node, Suffrage, ValidationError, Voteproof,
};
use serde::{Deserialize, Serialize};

/// Key of the suffrage state.
pub const SUFFRAGE_STATE_KEY: &str = "suffrage";

/// Value stored under a state key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum StateValue {
    /// Consensus nodes effective from `height + 1`.
    Suffrage {
        /// Members.
        nodes: Vec<Node>,
    },
    /// Opaque application data.
    Data(String),
}

/// A state written by a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Key.
    pub key: String,
    /// Value.
    pub value: StateValue,
    /// Height of the block that wrote it.
    pub height: Height,
    /// Hash of the previous version of this state.
    pub previous: Option<Hash>,
    /// Operations that produced it.
    pub operations: Vec<Hash>,
}

impl State {
    /// Content hash; the leaf hash in the states tree.
    pub fn hash(&self) -> Hash {
        Hash::of_json(b"state", self)
    }

    /// Whether this state holds the suffrage.
    pub fn is_suffrage_state(&self) -> bool {
        self.key == SUFFRAGE_STATE_KEY && matches!(self.value, StateValue::Suffrage { .. })
    }

    /// Suffrage held by a suffrage state.
    pub fn suffrage(&self) -> Option<Result<Suffrage, ValidationError>> {
        match &self.value {
            StateValue::Suffrage { nodes } => Some(Suffrage::new(nodes.clone())),
            StateValue::Data(_) => None,
        }
    }
}

/// Proof that a suffrage state was committed by a finalized block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuffrageProof {
    /// Block map of the block that wrote the state.
    pub map: BlockMap,
    /// The suffrage state.
    pub state: State,
    /// Inclusion proof of the state in the states tree.
    pub proof: FixedTreeProof,
    /// ACCEPT voteproof that finalized the block.
    pub voteproof: Voteproof,
}

impl SuffrageProof {
    /// Height of the block.
    pub fn height(&self) -> Height {
        self.map.height()
    }

    /// Suffrage carried by the state.
    pub fn suffrage(&self) -> Result<Suffrage, ValidationError> {
        self.state
            .suffrage()
            .unwrap_or_else(|| Err(ValidationError::invalid("suffrage proof", "not suffrage state")))
    }

    /// Map, proof linkage and voteproof.
    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), ValidationError> {
        self.map.is_valid(network_id)?;
        self.voteproof.is_valid(network_id)?;

        if !self.state.is_suffrage_state() {
            return Err(ValidationError::invalid("suffrage proof", "not suffrage state"));
        }
        if self.proof.node.key != self.state.key || self.proof.node.hash != self.state.hash() {
            return Err(ValidationError::invalid("suffrage proof", "proof is not for state"));
        }
        let Some(root) = self.map.manifest.states_tree else {
            return Err(ValidationError::invalid("suffrage proof", "empty states tree"));
        };
        if !self.proof.verify(&root) {
            return Err(ValidationError::invalid("suffrage proof", "proof does not verify"));
        }

        match (&self.voteproof, self.voteproof.majority()) {
            (Voteproof::Accept(_), Some(majority))
                if majority.new_block() == Some(self.map.manifest.hash()) =>
            {
                Ok(())
            }
            _ => Err(ValidationError::invalid(
                "suffrage proof",
                "voteproof does not finalize block",
            )),
        }
    }
}
