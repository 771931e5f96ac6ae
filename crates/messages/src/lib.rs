//! Network messages for the ISAAC consensus protocol.
//!
//! - [`gossip`]: ballots broadcast to every consensus node
//! - [`handover`]: point-to-point messages between the handover brokers
//! - [`request`] / [`response`]: handover negotiation calls
//! - [`codec`]: framed encoding of handover messages

pub mod codec;
pub mod gossip;
pub mod handover;
pub mod request;
pub mod response;

// Re-export commonly used types
pub use codec::{decode_handover, encode_handover, CodecError, HANDOVER_FRAME_VERSION};
pub use gossip::BallotGossip;
pub use handover::{new_handover_id, HandoverBody, HandoverData, HandoverMessage};
pub use request::{AskHandoverRequest, CheckHandoverRequest, StartHandoverRequest};
pub use response::{AskHandoverResponse, HandoverAckResponse};

/// Message routed by a stable type id.
pub trait NetworkMessage {
    /// Wire type id.
    fn message_type_id() -> &'static str;
}

/// Type-safe request/response pairing.
pub trait Request: NetworkMessage {
    /// Response the peer answers with.
    type Response: NetworkMessage;
}
