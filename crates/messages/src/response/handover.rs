//! Handover negotiation responses.

use crate::NetworkMessage;
use serde::{Deserialize, Serialize};

/// Answer to start and check requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverAckResponse {
    /// Whether the request was accepted.
    pub ok: bool,
    /// Why it was not.
    pub err: Option<String>,
}

impl HandoverAckResponse {
    /// Accepted.
    pub fn ok() -> Self {
        Self { ok: true, err: None }
    }

    /// Rejected with a reason.
    pub fn rejected(err: impl Into<String>) -> Self {
        Self {
            ok: false,
            err: Some(err.into()),
        }
    }
}

impl NetworkMessage for HandoverAckResponse {
    fn message_type_id() -> &'static str {
        "handover.ack.response"
    }
}

/// Answer to [`AskHandoverRequest`](crate::AskHandoverRequest).
///
/// When X is not in consensus it answers with an empty `id` and
/// `can_move_consensus`, and Y joins consensus without a handover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskHandoverResponse {
    /// Id of X's broker; empty without a handover.
    pub id: String,
    /// Y may enter consensus directly.
    pub can_move_consensus: bool,
}

impl NetworkMessage for AskHandoverResponse {
    fn message_type_id() -> &'static str {
        "handover.ask.response"
    }
}
