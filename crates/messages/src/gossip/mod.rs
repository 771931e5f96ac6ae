//! Gossip messages broadcast to multiple peers.

mod ballot;

pub use ballot::BallotGossip;
