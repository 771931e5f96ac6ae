//! Messages exchanged by the handover brokers.
//!
//! X (the node leaving consensus) streams its voteproofs to Y (the node
//! taking over). Y answers each with a challenge proving it reached the same
//! state, and announces when it is ready. Once Y has proven itself often
//! enough, X sends `Finish` with the INIT voteproof Y starts consensus from.

use crate::NetworkMessage;
use isaac_types::{BlockMap, ProposalSignFact, StagePoint, Voteproof};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// New broker id.
pub fn new_handover_id() -> String {
    Ulid::new().to_string()
}

/// A handover message; `id` is the broker session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoverMessage {
    /// Broker id (ULID).
    pub id: String,
    /// Payload.
    pub body: HandoverBody,
}

impl HandoverMessage {
    /// Create a message for broker `id`.
    pub fn new(id: impl Into<String>, body: HandoverBody) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Kind name, also used as the frame header.
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

impl NetworkMessage for HandoverMessage {
    fn message_type_id() -> &'static str {
        "handover.message"
    }
}

/// Data X forwards to Y.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HandoverData {
    /// A voteproof X received.
    Voteproof(Voteproof),
    /// The proposal of the INIT voteproof just sent.
    Proposal(ProposalSignFact),
}

/// Payload of a handover message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum HandoverBody {
    /// Y is synced up to `point` and ready to take over.
    Ready { point: StagePoint },

    /// X's answer to `Ready`.
    ReadyResponse {
        point: StagePoint,
        ok: bool,
        err: Option<String>,
    },

    /// X stops consensus; Y starts from `voteproof`.
    Finish {
        voteproof: Option<Voteproof>,
        proposal: Option<ProposalSignFact>,
    },

    /// The sender canceled its broker.
    Cancel { err: Option<String> },

    /// Data from X.
    Data(HandoverData),

    /// Y processed the voteproof at `point`.
    ChallengeStagePoint { point: StagePoint },

    /// Y saved the block finalized at `point`.
    ChallengeBlockMap { point: StagePoint, map: BlockMap },

    /// X's answer to a challenge.
    ChallengeResponse {
        point: StagePoint,
        ok: bool,
        err: Option<String>,
    },
}

impl HandoverBody {
    /// Kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            HandoverBody::Ready { .. } => "ready",
            HandoverBody::ReadyResponse { .. } => "ready_response",
            HandoverBody::Finish { .. } => "finish",
            HandoverBody::Cancel { .. } => "cancel",
            HandoverBody::Data(_) => "data",
            HandoverBody::ChallengeStagePoint { .. } => "challenge_stage_point",
            HandoverBody::ChallengeBlockMap { .. } => "challenge_block_map",
            HandoverBody::ChallengeResponse { .. } => "challenge_response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_ulids() {
        let a = new_handover_id();
        let b = new_handover_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
        assert!(Ulid::from_string(&a).is_ok());
    }
}
