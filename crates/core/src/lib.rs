//! Capabilities the ISAAC consensus core consumes.
//!
//! The ballotbox, the state machine, the handover brokers and the block
//! pipeline all lean on collaborators they do not implement: an encoder, a
//! proposal processor, a suffrage lookup, a membership layer that can deliver
//! messages, and a block syncer. This crate names those seams.
//!
//! # Seams
//!
//! - [`Encoder`]: marshals values for disk and wire ([`JsonEncoder`])
//! - [`ProposalProcessor`] / [`ProcessorFactory`]: turn a proposal into a
//!   manifest, then save the block once the ACCEPT vote finishes
//! - [`ProposalSelector`]: picks the proposal for a point
//! - [`SuffrageProvider`]: consensus nodes voting at a height
//! - [`MessageSender`]: delivers [`OutboundMessage`]s to the membership layer
//! - [`Syncer`]: catches the local node up to a target height

mod encoder;
mod error;
mod message;
mod traits;

pub use encoder::{EncodeError, Encoder, JsonEncoder};
pub use error::{ProcessorError, SendError, SuffrageError, SyncerError};
pub use message::OutboundMessage;
pub use traits::{
    MessageSender, ProcessorFactory, ProposalProcessor, ProposalSelector, StaticSuffrage,
    SuffrageProvider, Syncer,
};
