//! Ballot gossip message.

use crate::NetworkMessage;
use isaac_types::Ballot;
use serde::{Deserialize, Serialize};

/// A ballot broadcast to the consensus nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BallotGossip {
    /// The ballot being gossiped
    pub ballot: Ballot,
}

impl BallotGossip {
    /// Create a new ballot gossip message.
    pub fn new(ballot: Ballot) -> Self {
        Self { ballot }
    }

    /// Get the inner ballot.
    pub fn ballot(&self) -> &Ballot {
        &self.ballot
    }

    /// Consume and return the inner ballot.
    pub fn into_ballot(self) -> Ballot {
        self.ballot
    }
}

impl NetworkMessage for BallotGossip {
    fn message_type_id() -> &'static str {
        "isaac.ballot"
    }
}
