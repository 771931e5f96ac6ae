//! Core types for ISAAC consensus.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - **Primitives**: [`Hash`], [`KeyPair`], [`PublicKey`], [`Signature`]
//! - **Positions**: [`Height`], [`Round`], [`Point`], [`Stage`], [`StagePoint`], [`LastPoint`]
//! - **Voting**: [`BallotFact`], [`BallotSignFact`], [`Ballot`], [`Voteproof`], [`Threshold`]
//! - **Membership**: [`Suffrage`], [`ExpelOperation`]
//! - **Blocks**: [`Manifest`], [`BlockMap`], [`BlockItemType`], [`FixedTree`], [`SuffrageProof`]

mod ballot;
mod block;
mod crypto;
mod error;
mod fixedtree;
mod hash;
mod identifiers;
mod local;
mod operation;
mod point;
pub mod signing;
mod state;
mod suffrage;
mod threshold;
mod voteproof;

pub use ballot::{AcceptBallotFact, Ballot, BallotFact, BallotSignFact, InitBallotFact};
pub use block::{BlockItemType, BlockMap, BlockMapItem, Manifest};
pub use crypto::{KeyPair, PublicKey, Signature};
pub use error::ValidationError;
pub use fixedtree::{FixedTree, FixedTreeNode, FixedTreeProof, FIXED_TREE_HINT};
pub use hash::{Hash, HexError};
pub use identifiers::{ConnInfo, Height, NetworkId, NodeAddress, Round};
pub use local::LocalNode;
pub use operation::{Operation, ProposalFact, ProposalSignFact};
pub use point::{LastPoint, Point, Stage, StagePoint};
pub use state::{State, StateValue, SuffrageProof, SUFFRAGE_STATE_KEY};
pub use suffrage::{ExpelFact, ExpelOperation, Node, NodeSign, Suffrage};
pub use threshold::{Threshold, VoteDecision, VoteResult};
pub use voteproof::{now_millis, Voteproof, VoteproofBody, VoteproofKind};
