//! Validation errors for protocol types.

use crate::NodeAddress;

/// Errors returned by `is_valid` checks on protocol types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A structural check failed.
    #[error("invalid {what}: {reason}")]
    Invalid {
        /// Kind of value that failed.
        what: &'static str,
        /// Why it failed.
        reason: String,
    },

    /// A signature did not verify.
    #[error("invalid signature of {what} by {node}")]
    Signature {
        /// Kind of value that was signed.
        what: &'static str,
        /// Node that claims to have signed it.
        node: NodeAddress,
    },

    /// Signer is not part of the suffrage.
    #[error("node {0} is not in suffrage")]
    NotInSuffrage(NodeAddress),
}

impl ValidationError {
    /// Shorthand for [`ValidationError::Invalid`].
    pub fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            what,
            reason: reason.into(),
        }
    }
}
