//! ISAAC voting.
//!
//! This crate turns signed ballots into voteproofs and drives proposal
//! processing:
//!
//! - [`Ballotbox`] collects ballots per stage-point and emits voteproofs in
//!   strictly increasing last-point order
//! - [`BallotStuckResolver`] requests missing ballots and, when nodes stay
//!   silent, builds stuck voteproofs that expel them
//! - [`ProposalProcessors`] runs the one active proposal processor with
//!   retries
//! - [`LastVoteproofsHandler`] filters stale voteproofs for the state machine
//!
//! Everything is parameterized by [`IsaacParams`].

mod ballotbox;
mod config;
mod last_voteproofs;
mod processor;
mod stuck;
mod vote_records;

pub use ballotbox::{Ballotbox, BallotboxError};
pub use config::IsaacParams;
pub use last_voteproofs::{LastVoteproofs, LastVoteproofsHandler};
pub use processor::ProposalProcessors;
pub use stuck::{BallotStuckResolver, RequestMissingBallots};
