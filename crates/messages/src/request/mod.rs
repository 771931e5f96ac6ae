//! Request messages sent to a single peer.

mod handover;

pub use handover::{AskHandoverRequest, CheckHandoverRequest, StartHandoverRequest};
