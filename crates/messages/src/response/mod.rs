//! Responses to request messages.

mod handover;

pub use handover::{AskHandoverResponse, HandoverAckResponse};
