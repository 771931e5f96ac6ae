//! ISAAC node.
//!
//! Composes the voting core into a running node:
//!
//! - [`States`]: the state machine (booting, joining, consensus, syncing,
//!   handover, broken, stopped) driven by voteproofs
//! - [`BallotBroadcaster`]: signs nothing, but votes and repeats what the
//!   handlers sign
//! - [`MimicBallots`]: keeps a non-voting node from looking stopped
//! - [`handover`]: moves the consensus seat of one identity to a new process

mod broadcaster;
mod config;
mod error;
pub mod handover;
mod mimic;
mod states;

pub use broadcaster::{
    ballot_timer, BallotBroadcaster, TIMER_ACCEPT_BALLOT, TIMER_INIT_BALLOT,
    TIMER_SUFFRAGE_CONFIRM_BALLOT,
};
pub use config::HandoverConfig;
pub use error::{HandoverError, StatesError};
pub use handover::{HandoverGate, HandoverTransport, HandoverXBroker, HandoverYBroker};
pub use mimic::MimicBallots;
pub use states::{
    NewSyncer, StateType, States, StatesArgs, SwitchContext, WhenNewBlockConfirmed,
    WhenNewBlockSaved,
};
