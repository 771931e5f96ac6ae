//! Handover of the consensus seat between two processes of one node.

mod gate;
mod x;
mod y;

pub use gate::{AddSyncSource, HandoverGate, HandoverTransport, IsJoinedMemberlist};
pub use x::{CheckIsReady, HandoverXBroker, WhenCanceled};
pub use y::{HandoverYBroker, WhenFinished, WhenNewProposal, WhenNewVoteproof};
