//! Outbound message types for network communication.

use isaac_messages::{BallotGossip, HandoverMessage};
use isaac_types::ConnInfo;

/// Outbound network messages.
///
/// These are the messages that a node can send to other nodes.
/// The membership layer handles the actual network I/O.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    // ═══════════════════════════════════════════════════════════════════════
    // Consensus Messages
    // ═══════════════════════════════════════════════════════════════════════
    /// Ballot broadcast to every consensus node.
    Ballot(Box<BallotGossip>),

    // ═══════════════════════════════════════════════════════════════════════
    // Handover Messages
    // ═══════════════════════════════════════════════════════════════════════
    /// Point-to-point message between the handover brokers.
    Handover {
        /// Peer the message is for.
        to: ConnInfo,
        /// Message.
        message: Box<HandoverMessage>,
    },
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Ballot(_) => "Ballot",
            OutboundMessage::Handover { .. } => "Handover",
        }
    }

    /// Check if this is broadcast rather than sent to one peer.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, OutboundMessage::Ballot(_))
    }
}
