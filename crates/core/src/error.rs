//! Errors returned through the capability traits.

use isaac_types::{ConnInfo, Height, ValidationError};

/// Proposal processor failures, matched by kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// `save` was called for a proposal that never went through `process`.
    /// The node votes a not-processed ACCEPT fact instead of retrying.
    #[error("proposal processor not processed")]
    NotProposalProcessorProcessed,

    /// The proposal had no operations to execute.
    #[error("proposal processor empty operations")]
    EmptyOperations,

    /// The block was already saved; treated as success.
    #[error("processor already saved")]
    AlreadySaved,

    /// Processing was canceled.
    #[error("processor canceled")]
    Canceled,

    /// Persisting failed in a way a retry cannot fix.
    #[error("stop processing retry: {0}")]
    StopProcessingRetry(String),

    /// Requested value does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient failure; the caller may retry.
    #[error("{0}")]
    Retry(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl ProcessorError {
    /// Whether retrying the call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessorError::Retry(_))
    }
}

/// Message delivery failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("unknown peer, {0}")]
    UnknownPeer(ConnInfo),

    #[error("send closed")]
    Closed,

    #[error("send: {0}")]
    Failed(String),
}

/// Suffrage lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SuffrageError {
    #[error("suffrage lookup at {height}: {reason}")]
    Lookup { height: Height, reason: String },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Syncer failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncerError {
    #[error("syncer canceled")]
    Canceled,

    #[error("syncer: {0}")]
    Failed(String),
}
