//! State machine and handover errors.

use crate::StateType;
use isaac_bft::BallotboxError;
use isaac_core::{ProcessorError, SendError, SuffrageError, SyncerError};
use isaac_storage::DatabaseError;
use isaac_types::ValidationError;
use isaac_util::TimerError;

/// Errors raised while handling states. A handler error moves the node to
/// `Broken`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatesError {
    /// The event loop is not running.
    #[error("states stopped")]
    Stopped,

    #[error("states already started")]
    AlreadyStarted,

    /// A switch the machine never allows.
    #[error("wrong switch from {from} to {to}")]
    WrongSwitch { from: StateType, to: StateType },

    /// The suffrage of a height the node must vote at is unknown.
    #[error("unknown suffrage at height {0}")]
    UnknownSuffrage(i64),

    #[error("processor: {0}")]
    Processor(#[from] ProcessorError),

    #[error("database: {0}")]
    Database(#[from] DatabaseError),

    #[error("syncer: {0}")]
    Syncer(#[from] SyncerError),

    #[error("suffrage: {0}")]
    Suffrage(#[from] SuffrageError),

    #[error("send: {0}")]
    Send(#[from] SendError),

    #[error("timer: {0}")]
    Timer(#[from] TimerError),

    #[error("ballotbox: {0}")]
    Ballotbox(#[from] BallotboxError),

    #[error("handover: {0}")]
    Handover(#[from] HandoverError),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Handover failures, in three tiers: `Ignore` keeps the broker state,
/// `Reset` clears the ready progress, `Canceled` terminates the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandoverError {
    #[error("handover canceled: {0}")]
    Canceled(String),

    #[error("handover message ignored: {0}")]
    Ignore(String),

    #[error("handover reset: {0}")]
    Reset(String),

    /// A gatekeeping check refused to start or accept a handover.
    #[error("handover not allowed: {0}")]
    NotAllowed(String),

    #[error("handover send: {0}")]
    Send(#[from] SendError),

    /// The peer could not be asked.
    #[error("handover request: {0}")]
    Request(String),
}

impl HandoverError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, HandoverError::Canceled(_))
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self, HandoverError::Ignore(_))
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, HandoverError::Reset(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers() {
        assert!(HandoverError::Canceled("x".into()).is_canceled());
        assert!(HandoverError::Ignore("x".into()).is_ignore());
        assert!(HandoverError::Reset("x".into()).is_reset());
        assert!(!HandoverError::Reset("x".into()).is_canceled());

        let e = StatesError::from(HandoverError::Canceled("peer left".into()));
        assert_eq!(e.to_string(), "handover: handover canceled: peer left");
    }
}
